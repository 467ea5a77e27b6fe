//! Voice bridge daemon entry point: loads configuration, starts the SIP/RTP
//! endpoint, wires the Call Orchestrator, and serves the REST + WebSocket
//! control plane.

mod admission;
mod ai;
mod api;
mod call;
mod config;
mod expert;
mod hub;
mod orchestrator;
mod queue;
mod sip;
mod tools;

mod audio;

use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{error, info, warn};

use admission::{AdmissionFilter, Cidr};
use config::{DaemonConfig, PersistedConfig};
use expert::{ExpertClient, KnowledgeBase, ModelCatalog};
use hub::EventHub;
use orchestrator::{CallOrchestrator, OrchestratorConfig};
use sip::SipConfig;
use tools::catalog::CatalogStore;
use tools::order::Order;
use tools::ProductDomain;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = match DaemonConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "missing required configuration");
            std::process::exit(1);
        }
    };

    let persisted = PersistedConfig::load(&config.config_path);

    let admission = Arc::new(build_admission_filter(&config));

    let catalogs = match CatalogStore::load(&config.catalog_root) {
        Ok(store) => Arc::new(Mutex::new(store)),
        Err(err) => {
            error!(error = %err, path = %config.catalog_root.display(), "failed to load product catalog index");
            std::process::exit(2);
        }
    };

    let knowledge = Arc::new(KnowledgeBase::load(&config.knowledge_root));

    let expert = Arc::new(ExpertClient::new(
        config.openai_api_base.clone(),
        config.openai_api_key.clone(),
        model_catalog_from_persisted(&persisted),
        persisted.expert_config.min_confidence,
        catalogs.clone(),
        knowledge,
        default_expert_instructions(),
    ));

    let hub = Arc::new(EventHub::new());
    let order = Arc::new(Mutex::new(None::<Order>));

    let (sip_handle, sip_events) = match sip::start(SipConfig {
        registrar: config.sip_server.clone(),
        sip_port: config.sip_port,
        user: config.sip_user.clone(),
        password: config.sip_password.clone(),
    })
    .await
    {
        Ok(pair) => pair,
        Err(err) => {
            error!(error = %err, "failed to start SIP endpoint");
            std::process::exit(1);
        }
    };

    let orchestrator_config = OrchestratorConfig {
        ws_base_url: config.realtime_ws_base_url.clone(),
        openai_api_key: config.openai_api_key.clone(),
        voice: config.realtime_voice.clone(),
        tool_schema: tools::tool_schema(),
        domains: default_product_domains(),
    };

    let initial_model = persisted.model.clone();
    let orchestrator = CallOrchestrator::start(
        sip_handle,
        admission.clone(),
        catalogs.clone(),
        expert.clone(),
        hub.clone(),
        order.clone(),
        orchestrator_config,
        initial_model,
        default_ai_instructions(),
        sip_events,
    );

    let state = api::AppState {
        orchestrator,
        hub,
        expert,
        admission,
        order,
        config_path: config.config_path.clone(),
        persisted: Arc::new(Mutex::new(persisted)),
    };

    let addr = format!("{}:{}", config.api_host, config.api_port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(error = %err, %addr, "failed to bind control API listener");
            std::process::exit(1);
        }
    };

    info!(%addr, "control API listening");
    if let Err(err) = axum::serve(listener, api::router(state)).await {
        error!(error = %err, "control API server stopped unexpectedly");
        std::process::exit(1);
    }
}

fn build_admission_filter(config: &DaemonConfig) -> AdmissionFilter {
    let mut networks = Vec::new();
    for raw in &config.allowed_networks {
        match Cidr::from_str(raw) {
            Ok(cidr) => networks.push(cidr),
            Err(err) => warn!(network = %raw, error = %err, "skipping invalid CIDR in ALLOWED_NETWORKS"),
        }
    }
    let public_server_ip = config.public_server_ip.as_deref().and_then(|ip| Ipv4Addr::from_str(ip).ok());
    AdmissionFilter::new(networks, public_server_ip, config.provider_hostname.clone())
}

/// Sort the persisted enabled-models list into the expert's role slots by
/// name convention (mini/nano => small, o-series => reasoning, everything
/// else => large standard). There is no separate per-role configuration
/// surface, so this is a heuristic rather than an explicit mapping.
fn model_catalog_from_persisted(persisted: &PersistedConfig) -> ModelCatalog {
    let mut catalog = ModelCatalog {
        small_model: None,
        small_reasoning_model: None,
        large_reasoning_model: None,
        pro_reasoning_model: None,
        large_standard: Some(persisted.expert_config.default_model.clone()),
    };
    for model in &persisted.expert_config.enabled_models {
        let lower = model.to_ascii_lowercase();
        if lower.contains("pro") {
            catalog.pro_reasoning_model.get_or_insert_with(|| model.clone());
        } else if lower.contains("o1") || lower.contains("o3") {
            catalog.large_reasoning_model.get_or_insert_with(|| model.clone());
        } else if lower.contains("mini") || lower.contains("nano") {
            catalog.small_model.get_or_insert_with(|| model.clone());
        } else {
            catalog.large_standard.get_or_insert_with(|| model.clone());
        }
    }
    catalog
}

fn default_expert_instructions() -> String {
    "Beantworte technische Rückfragen praezise und nenne Artikelnummern, wenn bekannt.".to_string()
}

fn default_ai_instructions() -> String {
    "Du bist ein freundlicher Telefonassistent fuer einen SHK-Grosshandel. Sprich Deutsch, \
     halte Antworten kurz und frage gezielt nach, wenn eine Bestellung mehrdeutig ist."
        .to_string()
}

/// Product domains the catalog tools switch between, keyed by the keywords
/// a caller's utterance is most likely to contain. Mirrors the SHK product
/// taxonomy a wholesale catalog for this business is organized around.
fn default_product_domains() -> Vec<ProductDomain> {
    fn words(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    vec![
        ProductDomain {
            name: "Rohrsysteme und Pressfittings".to_string(),
            keywords: words(&[
                "pressfitting", "press", "temponox", "sanpress", "profipress", "megapress",
                "prestabo", "mapress", "mepla", "bogen", "muffe", "rohr", "fitting",
                "verschraubung", "uebergangsstueck", "reduzierstueck", "flansch", "t-stueck",
                "kupfer", "edelstahl", "rotguss", "viega", "geberit",
            ]),
            instructions: "Rohrsysteme: Rp = Innengewinde, R = Aussengewinde, G = flachdichtend. \
                Temponox ist Edelstahl fuer Heizung, Sanpress Kupfer fuer Trinkwasser, \
                Profipress Kupfer fuer Heizung, Megapress Stahl mit Gewinde. \
                Immer System, Produkttyp, Dimension und Gewindeart erfragen."
                .to_string(),
            preferred_catalogs: words(&[
                "edelstahl_press", "cu_press", "viega", "viega_profipress", "viega_sanpress",
                "viega_megapress", "geberit_mapress", "geberit_mepla",
            ]),
        },
        ProductDomain {
            name: "Sanitaerarmaturen".to_string(),
            keywords: words(&[
                "armatur", "wasserhahn", "mischer", "einhebel", "zweigriff", "thermostat",
                "brause", "waschtischarmatur", "kartusche", "strahlregler", "grohe",
                "hansgrohe", "hansa", "kludi", "dornbracht", "keuco",
            ]),
            instructions: "Armaturen: Einhebelmischer, Zweigriffarmatur, Thermostat oder \
                Selbstschluss unterscheiden; Aufputz vs. Unterputz abfragen. \
                'Waschtisch' allein ist mehrdeutig (Armatur oder Becken) -> immer nachfragen."
                .to_string(),
            preferred_catalogs: words(&[
                "grohe", "hansgrohe", "hansa", "kludi", "dornbracht", "keuco", "schell",
            ]),
        },
        ProductDomain {
            name: "Sanitaerkeramik und Bad".to_string(),
            keywords: words(&[
                "wc", "toilette", "tiefspueler", "wandhaengend", "waschtisch", "waschbecken",
                "badewanne", "wanne", "duschwanne", "dusche", "spuelkasten",
                "duravit", "villeroy", "ideal", "keramag", "laufen", "kaldewei", "bette",
            ]),
            instructions: "Keramik: Tiefspueler ist Standard in Deutschland, Spuelrandlos \
                erleichtert Reinigung. Bei Spuelkaesten Unterputz vs. Aufputz klaeren. \
                Waschtische nach Moebel-, Aufsatz- oder Einbauwaschtisch unterscheiden."
                .to_string(),
            preferred_catalogs: words(&[
                "duravit", "villeroy_boch", "ideal_standard", "keramag", "laufen", "kaldewei",
                "bette", "geberit", "tece", "koralle", "hoesch",
            ]),
        },
        ProductDomain {
            name: "Heizung und Kessel".to_string(),
            keywords: words(&[
                "kessel", "heizkessel", "brennwert", "therme", "gaskessel", "oelkessel",
                "waermepumpe", "luft-wasser", "sole-wasser", "brenner", "viessmann",
                "buderus", "vaillant", "wolf", "junkers", "weishaupt", "broetje",
            ]),
            instructions: "Heizung: Brennwertkessel nutzt Abgaswaerme und ist am effizientesten. \
                Bei Waermepumpen Luft-Wasser vs. Sole-Wasser unterscheiden. Leistung in kW \
                erfragen; bei Ersatzteilen den Geraetetyp/die Artikelnummer."
                .to_string(),
            preferred_catalogs: words(&[
                "viessmann", "buderus", "vaillant", "wolf_heizung", "junkers", "weishaupt",
                "broetje", "heizung_komplett",
            ]),
        },
        ProductDomain {
            name: "Heizkoerper und Flaechenheizung".to_string(),
            keywords: words(&[
                "heizkoerper", "radiator", "kompaktheizkoerper", "badheizkoerper",
                "fussbodenheizung", "wandheizung", "thermostatventil", "thermostatkopf",
                "kermi", "purmo", "zehnder",
            ]),
            instructions: "Heizkoerper: Typ 10/11/20/21/22/33 gibt Bautiefe und Konvektoren an. \
                Masse als Hoehe x Laenge angeben. Thermostatventile sind nicht \
                herstellerkompatibel; Kv-Wert und Fuehlerart erfragen."
                .to_string(),
            preferred_catalogs: words(&[
                "kermi", "purmo", "zehnder", "oventrop", "danfoss", "heimeier",
                "heizung_komplett",
            ]),
        },
        ProductDomain {
            name: "Pumpen und Regelungstechnik".to_string(),
            keywords: words(&[
                "pumpe", "umwaelzpumpe", "heizungspumpe", "zirkulationspumpe",
                "druckerhoehungspumpe", "stellantrieb", "mischer", "grundfos", "wilo", "ksb",
            ]),
            instructions: "Pumpen: Foerderhoehe in Metern, Volumenstrom in m3/h. \
                Grundfos-Serien Alpha/Magna, Wilo-Serien Stratos/Yonos. \
                Einbaulaenge (130mm/180mm) und Anschluss erfragen."
                .to_string(),
            preferred_catalogs: words(&[
                "grundfos", "wilo", "oventrop", "danfoss", "honeywell", "resideo",
            ]),
        },
        ProductDomain {
            name: "Werkzeuge und Maschinen".to_string(),
            keywords: words(&[
                "presse", "pressmaschine", "pressbacke", "rohrzange", "rohrabschneider",
                "gewindeschneider", "akkuschrauber", "winkelschleifer", "rothenberger", "rems",
                "ridgid", "knipex", "makita", "milwaukee", "bosch", "metabo", "hilti",
            ]),
            instructions: "Werkzeuge: Pressbacken-Kontur muss zum System passen (V-Kontur fuer \
                Viega/Geberit Mapress, M-Kontur fuer Geberit Mepla). Bei Akkuwerkzeug \
                Spannung und Akku-System erfragen."
                .to_string(),
            preferred_catalogs: words(&[
                "rothenberger", "rems", "ridgid", "knipex", "wera", "wiha", "makita",
                "milwaukee", "bosch_werkzeug", "metabo", "hilti",
            ]),
        },
        ProductDomain {
            name: "Wasseraufbereitung und Filter".to_string(),
            keywords: words(&[
                "filter", "wasserfilter", "rueckspuelfilter", "enthaertung", "enthaerter",
                "dosierung", "bwt", "gruenbeck", "judo", "syr",
            ]),
            instructions: "Wasseraufbereitung: Rueckspuelfilter vs. Wechselfilter unterscheiden. \
                Enthaerter arbeiten per Ionenaustausch und regenerieren mit Salz. \
                Anwendung und Anschlussgroesse erfragen."
                .to_string(),
            preferred_catalogs: words(&["bwt", "gruenbeck", "judo", "syr", "kemper", "honeywell"]),
        },
        ProductDomain {
            name: "Warmwasserbereitung".to_string(),
            keywords: words(&[
                "speicher", "warmwasserspeicher", "boiler", "durchlauferhitzer",
                "stiebel", "eltron", "aeg", "clage",
            ]),
            instructions: "Warmwasser: Durchlauferhitzer elektronisch oder hydraulisch, meist \
                400V Drehstrom. Speicher nach Klein-, Wand- oder Standspeicher unterscheiden; \
                indirekt beheizte Speicher haben einen Waermetauscher."
                .to_string(),
            preferred_catalogs: words(&["stiebel_eltron", "aeg", "clage", "vaillant", "buderus"]),
        },
    ]
}
