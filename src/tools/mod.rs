//! C5 — Tool Dispatcher: executes AI-invoked tool calls against the
//! catalog/order/expert backend and always returns a string, even on
//! failure (§4.5, §7: "the assistant must never see a raw exception").

pub mod catalog;
pub mod order;

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

use self::catalog::CatalogStore;
use self::order::Order;
use crate::expert::{ExpertClient, ExpertRequest, Urgency};

#[derive(Debug, Error)]
enum ToolError {
    #[error("missing required argument: {0}")]
    MissingArgument(&'static str),
    #[error("catalog error: {0}")]
    Catalog(#[from] catalog::CatalogError),
    #[error("malformed arguments: {0}")]
    MalformedArguments(#[from] serde_json::Error),
}

/// One product domain: a coarse category that selects specialist
/// instructions and preferred catalogs.
#[derive(Debug, Clone)]
pub struct ProductDomain {
    pub name: String,
    pub keywords: Vec<String>,
    pub instructions: String,
    pub preferred_catalogs: Vec<String>,
}

/// Request to re-issue `session.update` to C4 with new instructions,
/// emitted by the dispatcher (which runs on a worker, never on the
/// WebSocket read path) and applied by the orchestrator.
#[derive(Debug, Clone)]
pub struct DomainSwitch {
    pub domain_name: String,
    pub instructions: String,
}

pub struct ToolDispatcher {
    catalogs: Arc<Mutex<CatalogStore>>,
    order: Arc<Mutex<Option<Order>>>,
    expert: Arc<ExpertClient>,
    domains: Vec<ProductDomain>,
    active_catalogs: Mutex<HashSet<String>>,
    domain_switch_tx: mpsc::UnboundedSender<DomainSwitch>,
}

impl ToolDispatcher {
    pub fn new(
        catalogs: Arc<Mutex<CatalogStore>>,
        order: Arc<Mutex<Option<Order>>>,
        expert: Arc<ExpertClient>,
        domains: Vec<ProductDomain>,
        domain_switch_tx: mpsc::UnboundedSender<DomainSwitch>,
    ) -> Self {
        Self {
            catalogs,
            order,
            expert,
            domains,
            active_catalogs: Mutex::new(HashSet::new()),
            domain_switch_tx,
        }
    }

    /// Reset the active-catalog set; called on call end (§4.5).
    pub fn reset_call_state(&self) {
        self.active_catalogs.lock().clear();
    }

    /// Dispatch a named tool call with JSON arguments. Always returns a
    /// string, never propagates an error to the caller.
    pub async fn dispatch(&self, name: &str, arguments_json: &str) -> String {
        let result = match name {
            "find_product_catalog" => self.find_product_catalog(arguments_json),
            "show_manufacturers" => Ok(self.show_manufacturers()),
            "search_in_catalog" => self.search_in_catalog(arguments_json),
            "show_product_details" => self.show_product_details(arguments_json),
            "order_add" => self.order_add(arguments_json),
            "show_order" => Ok(self.show_order()),
            "ask_expert" => return self.ask_expert(arguments_json).await,
            "switch_product_domain" => self.switch_product_domain(arguments_json),
            other => return format!("Unknown function: {other}"),
        };

        match result {
            Ok(text) => text,
            Err(err) => {
                tracing::warn!(tool = name, error = %err, "tool dispatch failed");
                "Ich hatte gerade ein Problem damit, das nachzuschauen.".to_string()
            }
        }
    }

    fn find_product_catalog(&self, arguments_json: &str) -> Result<String, ToolError> {
        let args: Value = serde_json::from_str(arguments_json)?;
        let query = args["query"]
            .as_str()
            .ok_or(ToolError::MissingArgument("query"))?;

        if let Some(domain) = self.match_domain(query) {
            let _ = self.domain_switch_tx.send(DomainSwitch {
                domain_name: domain.name.clone(),
                instructions: domain.instructions.clone(),
            });
            for key in &domain.preferred_catalogs {
                self.active_catalogs.lock().insert(key.clone());
            }
        }

        let mut catalogs = self.catalogs.lock();
        let suggestions = catalogs.suggest_catalogs(query, 3);
        let mut lines = Vec::new();
        for key in &suggestions {
            if catalogs.ensure_loaded(key).is_ok() {
                self.active_catalogs.lock().insert(key.clone());
                for hit in catalogs.search(key, query).into_iter().take(5) {
                    lines.push(format!("{} | Art: {}", hit.display_name(), hit.artikel));
                }
            }
        }
        if lines.is_empty() {
            Ok("Dazu habe ich leider nichts im Katalog gefunden.".to_string())
        } else {
            Ok(lines.join("\n"))
        }
    }

    fn show_manufacturers(&self) -> String {
        let catalogs = self.catalogs.lock();
        let mut by_category: std::collections::BTreeMap<String, Vec<String>> = Default::default();
        for m in catalogs.manufacturers() {
            by_category
                .entry(m.category)
                .or_default()
                .push(format!("{} ({} Produkte)", m.key, m.product_count));
        }
        by_category
            .into_iter()
            .map(|(category, keys)| format!("{category}:\n  {}", keys.join("\n  ")))
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    fn search_in_catalog(&self, arguments_json: &str) -> Result<String, ToolError> {
        let args: Value = serde_json::from_str(arguments_json)?;
        let key = args["key"].as_str().ok_or(ToolError::MissingArgument("key"))?;
        let query = args["query"].as_str().ok_or(ToolError::MissingArgument("query"))?;

        let mut catalogs = self.catalogs.lock();
        catalogs.ensure_loaded(key)?;
        self.active_catalogs.lock().insert(key.to_string());

        let mut lines: Vec<String> = catalogs
            .search(key, query)
            .into_iter()
            .take(15)
            .map(|r| format!("- {} | Art: {}", r.display_name(), r.artikel))
            .collect();

        if lines.is_empty() {
            // Fallback: try the keyword-suggested catalogs for the same query (§11).
            let fallback_keys = catalogs.suggest_catalogs(query, 3);
            for fallback_key in fallback_keys {
                if fallback_key == key {
                    continue;
                }
                if catalogs.ensure_loaded(&fallback_key).is_ok() {
                    for r in catalogs.search(&fallback_key, query).into_iter().take(15 - lines.len()) {
                        lines.push(format!("- {} | Art: {}", r.display_name(), r.artikel));
                    }
                }
                if lines.len() >= 15 {
                    break;
                }
            }
        }

        if lines.is_empty() {
            Ok("Keine Treffer gefunden.".to_string())
        } else {
            Ok(lines.join("\n"))
        }
    }

    fn show_product_details(&self, arguments_json: &str) -> Result<String, ToolError> {
        let args: Value = serde_json::from_str(arguments_json)?;
        let article_nr = args["article_nr"]
            .as_str()
            .ok_or(ToolError::MissingArgument("article_nr"))?;

        let catalogs = self.catalogs.lock();
        match catalogs.find_by_article(article_nr) {
            Some(record) => Ok(format!(
                "Bezeichnung: {}\nArtikelnummer: {}\nEAN: {}\nEinheit: {}\nPreis: {}",
                record.display_name(),
                record.artikel,
                record.ean,
                record.einheit,
                record.preis.map(|p| format!("{p:.2}")).unwrap_or_else(|| "n/a".to_string())
            )),
            None => Ok(format!("Kein Produkt mit Artikelnummer {article_nr} gefunden.")),
        }
    }

    fn order_add(&self, arguments_json: &str) -> Result<String, ToolError> {
        let args: Value = serde_json::from_str(arguments_json)?;
        let article = args["article"].as_str().ok_or(ToolError::MissingArgument("article"))?;
        let quantity = args["menge"].as_u64().ok_or(ToolError::MissingArgument("menge"))? as u32;
        let product_name = args["produktname"].as_str().unwrap_or(article);

        let mut order = self.order.lock();
        match order.as_mut() {
            Some(order) => {
                order.add(article, quantity, product_name);
                Ok(format!("{quantity}x {product_name} notiert."))
            }
            None => Ok("Es gibt aktuell keine aktive Bestellung.".to_string()),
        }
    }

    fn show_order(&self) -> String {
        match self.order.lock().as_ref() {
            Some(order) => order.render(),
            None => "Es gibt aktuell keine aktive Bestellung.".to_string(),
        }
    }

    async fn ask_expert(&self, arguments_json: &str) -> String {
        let args: Value = match serde_json::from_str(arguments_json) {
            Ok(v) => v,
            Err(_) => return "Das habe ich nicht ganz verstanden.".to_string(),
        };
        let question = args["question"].as_str().unwrap_or_default().to_string();
        let urgency = match args["urgency"].as_str() {
            Some("fast") => Urgency::Fast,
            Some("thorough") => Urgency::Thorough,
            _ => Urgency::Normal,
        };
        let context = args["context"].as_str().unwrap_or_default().to_string();

        let response = self
            .expert
            .ask(ExpertRequest {
                question,
                context,
                urgency,
            })
            .await;
        response.answer
    }

    fn switch_product_domain(&self, arguments_json: &str) -> Result<String, ToolError> {
        let args: Value = serde_json::from_str(arguments_json)?;
        let name = args["domain"].as_str().ok_or(ToolError::MissingArgument("domain"))?;

        let domain = self
            .domains
            .iter()
            .find(|d| d.name == name)
            .ok_or(ToolError::MissingArgument("domain"))?;

        let _ = self.domain_switch_tx.send(DomainSwitch {
            domain_name: domain.name.clone(),
            instructions: domain.instructions.clone(),
        });
        for key in &domain.preferred_catalogs {
            self.active_catalogs.lock().insert(key.clone());
        }
        Ok(format!("Domäne gewechselt zu {}.", domain.name))
    }

    fn match_domain(&self, query: &str) -> Option<&ProductDomain> {
        let query_lower = query.to_ascii_lowercase();
        self.domains
            .iter()
            .find(|d| d.keywords.iter().any(|kw| query_lower.contains(kw.as_str())))
    }
}

/// Function-calling schema for the realtime session (§4.5's 8 named tools).
pub fn tool_schema() -> Vec<Value> {
    let tools: &[(&str, &[(&str, &str)])] = &[
        ("find_product_catalog", &[("query", "string")]),
        ("show_manufacturers", &[]),
        ("search_in_catalog", &[("key", "string"), ("query", "string")]),
        ("show_product_details", &[("article_nr", "string")]),
        ("order_add", &[("article", "string"), ("menge", "integer"), ("produktname", "string")]),
        ("show_order", &[]),
        ("ask_expert", &[("question", "string"), ("context", "string"), ("urgency", "string")]),
        ("switch_product_domain", &[("domain", "string")]),
    ];

    tools
        .iter()
        .map(|(name, params)| {
            let properties: serde_json::Map<String, Value> = params
                .iter()
                .map(|(param_name, param_type)| ((*param_name).to_string(), json_type(param_type)))
                .collect();
            let required: Vec<&str> = params.iter().map(|(n, _)| *n).collect();
            serde_json::json!({
                "type": "function",
                "name": name,
                "parameters": {
                    "type": "object",
                    "properties": Value::Object(properties),
                    "required": required,
                }
            })
        })
        .collect()
}

fn json_type(name: &str) -> Value {
    serde_json::json!({"type": name})
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expert::ModelCatalog;

    fn dispatcher() -> (ToolDispatcher, mpsc::UnboundedReceiver<DomainSwitch>) {
        let dir = tempfile::tempdir().unwrap().into_path();
        std::fs::write(
            dir.join("_index.json"),
            r#"[{"key":"viega","file":"viega.json","category":"rohrsysteme"}]"#,
        )
        .unwrap();
        std::fs::write(
            dir.join("_keywords.json"),
            r#"{"profipress":{"catalogs":[{"key":"viega","count":12}]}}"#,
        )
        .unwrap();
        std::fs::write(
            dir.join("viega.json"),
            r#"[{"Artikel":"294540","Bezeichnung 1":"Profipress Bogen","Bezeichnung 2":"90° 22mm","EAN":"123"}]"#,
        )
        .unwrap();

        let catalogs = Arc::new(Mutex::new(CatalogStore::load(dir).unwrap()));
        let order = Arc::new(Mutex::new(Some(Order::new("sip:caller@x".into()))));
        let knowledge_dir = tempfile::tempdir().unwrap().into_path();
        let expert = Arc::new(ExpertClient::new(
            "https://example.invalid".to_string(),
            "key".to_string(),
            ModelCatalog {
                small_model: Some("gpt-4o-mini".to_string()),
                small_reasoning_model: None,
                large_reasoning_model: None,
                pro_reasoning_model: None,
                large_standard: None,
            },
            0.6,
            catalogs.clone(),
            Arc::new(crate::expert::KnowledgeBase::load(knowledge_dir)),
            String::new(),
        ));
        let (tx, rx) = mpsc::unbounded_channel();
        (
            ToolDispatcher::new(catalogs, order, expert, Vec::new(), tx),
            rx,
        )
    }

    #[tokio::test]
    async fn unknown_tool_returns_marker_string() {
        let (dispatcher, _rx) = dispatcher();
        let result = dispatcher.dispatch("does_not_exist", "{}").await;
        assert_eq!(result, "Unknown function: does_not_exist");
    }

    #[tokio::test]
    async fn order_add_then_show_order_reflects_quantity() {
        let (dispatcher, _rx) = dispatcher();
        dispatcher
            .dispatch("order_add", r#"{"article":"294540","menge":10,"produktname":"Profipress Bogen 90° 22mm"}"#)
            .await;
        let shown = dispatcher.dispatch("show_order", "{}").await;
        assert!(shown.contains("10x Profipress Bogen 90° 22mm"));
    }

    #[tokio::test]
    async fn order_add_twice_consolidates() {
        let (dispatcher, _rx) = dispatcher();
        dispatcher
            .dispatch("order_add", r#"{"article":"294540","menge":10,"produktname":"X"}"#)
            .await;
        dispatcher
            .dispatch("order_add", r#"{"article":"294540","menge":5,"produktname":"X"}"#)
            .await;
        let shown = dispatcher.dispatch("show_order", "{}").await;
        assert!(shown.contains("15x X"));
    }

    #[tokio::test]
    async fn malformed_arguments_yield_human_string_not_panic() {
        let (dispatcher, _rx) = dispatcher();
        let result = dispatcher.dispatch("order_add", "not json").await;
        assert_eq!(result, "Ich hatte gerade ein Problem damit, das nachzuschauen.");
    }

    #[tokio::test]
    async fn caller_lookup_then_order_reflects_in_show_order() {
        let (dispatcher, mut rx) = dispatcher();

        let lookup = dispatcher
            .dispatch("find_product_catalog", r#"{"query":"Profipress Bogen 22"}"#)
            .await;
        assert!(lookup.contains("294540"));
        assert!(rx.try_recv().is_err(), "no domain configured, no switch expected");

        let ack = dispatcher
            .dispatch(
                "order_add",
                r#"{"article":"294540","menge":10,"produktname":"Profipress Bogen 90° 22mm"}"#,
            )
            .await;
        assert!(ack.contains("10x"));

        let shown = dispatcher.dispatch("show_order", "{}").await;
        assert!(shown.contains("294540"));
        assert!(shown.contains("10"));
    }

    #[tokio::test]
    async fn search_in_catalog_finds_product() {
        let (dispatcher, _rx) = dispatcher();
        let result = dispatcher
            .dispatch("search_in_catalog", r#"{"key":"viega","query":"Profipress"}"#)
            .await;
        assert!(result.contains("294540"));
    }
}
