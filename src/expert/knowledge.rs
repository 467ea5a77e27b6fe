//! Local knowledge-base and standards lookup (§4.6): a keyword-scored search
//! over a structured knowledge JSON file, a substring search over a norms
//! index, and a flat `dokumente/<id>.pdf` directory the PDF-attachment tools
//! read from. Loaded once at startup, same shape as `tools::catalog::CatalogStore`.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::Value;

struct Topic {
    bereich_name: String,
    name: String,
    text_lower: String,
    sources: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct NormRule {
    #[serde(default)]
    regel: String,
    #[serde(default)]
    inhalt: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct Norm {
    #[serde(default)]
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    titel: String,
    #[serde(default)]
    beschreibung: String,
    #[serde(default)]
    wichtige_regeln: Vec<NormRule>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct NormenIndex {
    #[serde(default)]
    normen: Vec<Norm>,
}

pub struct FachwissenHit {
    pub bereich_name: String,
    pub thema_name: String,
    pub relevanz: f32,
    pub quellen: Vec<String>,
}

pub struct NormHit {
    pub id: String,
    pub titel: String,
    pub matched_regeln: Vec<(String, String)>,
}

/// Read-only knowledge base: missing or malformed source files degrade to an
/// empty index rather than failing startup, since the knowledge base only
/// supplements the expert assistant.
pub struct KnowledgeBase {
    documents_dir: PathBuf,
    topics: Vec<Topic>,
    normen: Vec<Norm>,
}

impl KnowledgeBase {
    pub fn load(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            documents_dir: root.join("dokumente"),
            topics: load_fachwissen(&root.join("_shk_fachwissen.json")),
            normen: load_normen(&root.join("_normen_index.json")),
        }
    }

    pub fn document_path(&self, dokument_id: &str) -> Option<PathBuf> {
        let path = self.documents_dir.join(format!("{dokument_id}.pdf"));
        path.is_file().then_some(path)
    }

    /// Keyword-overlap search: how many of the query's normalized words
    /// appear in a topic's serialized text, ranked by that fraction.
    pub fn search_fachwissen(&self, query: &str, top_n: usize) -> Vec<FachwissenHit> {
        let words = normalize_query(query);
        if words.is_empty() {
            return Vec::new();
        }
        let mut hits: Vec<FachwissenHit> = self
            .topics
            .iter()
            .filter_map(|topic| {
                let matches = words.iter().filter(|w| topic.text_lower.contains(w.as_str())).count();
                if matches == 0 {
                    return None;
                }
                Some(FachwissenHit {
                    bereich_name: topic.bereich_name.clone(),
                    thema_name: topic.name.clone(),
                    relevanz: matches as f32 / words.len() as f32,
                    quellen: topic.sources.clone(),
                })
            })
            .collect();
        hits.sort_by(|a, b| b.relevanz.partial_cmp(&a.relevanz).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(top_n);
        hits
    }

    /// Substring search over norm name/title/description and each norm's
    /// individual rules.
    pub fn search_normen(&self, query: &str, top_n: usize) -> Vec<NormHit> {
        let query_lower = query.to_ascii_lowercase();
        if query_lower.is_empty() {
            return Vec::new();
        }
        let mut hits = Vec::new();
        for norm in &self.normen {
            let header_match = norm.name.to_ascii_lowercase().contains(&query_lower)
                || norm.titel.to_ascii_lowercase().contains(&query_lower)
                || norm.beschreibung.to_ascii_lowercase().contains(&query_lower);
            let matched_regeln: Vec<(String, String)> = norm
                .wichtige_regeln
                .iter()
                .filter(|r| {
                    r.regel.to_ascii_lowercase().contains(&query_lower)
                        || r.inhalt.to_ascii_lowercase().contains(&query_lower)
                })
                .map(|r| (r.regel.clone(), r.inhalt.clone()))
                .collect();
            if header_match || !matched_regeln.is_empty() {
                hits.push(NormHit {
                    id: norm.id.clone(),
                    titel: if norm.titel.is_empty() { norm.name.clone() } else { norm.titel.clone() },
                    matched_regeln,
                });
            }
            if hits.len() >= top_n {
                break;
            }
        }
        hits
    }
}

fn normalize_query(query: &str) -> Vec<String> {
    query
        .replace(['-', '_'], " ")
        .to_ascii_lowercase()
        .split_whitespace()
        .map(|s| s.to_string())
        .collect()
}

fn load_fachwissen(path: &Path) -> Vec<Topic> {
    let Ok(contents) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    let Ok(root) = serde_json::from_str::<Value>(&contents) else {
        tracing::warn!(path = %path.display(), "malformed knowledge base file, ignoring");
        return Vec::new();
    };
    let Some(bereiche) = root.get("bereiche").and_then(Value::as_object) else {
        return Vec::new();
    };

    let mut topics = Vec::new();
    for (bereich_key, bereich_data) in bereiche {
        let bereich_name = bereich_data
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or(bereich_key)
            .to_string();
        let Some(themen) = bereich_data.get("themen").and_then(Value::as_object) else {
            continue;
        };
        for (thema_key, thema_data) in themen {
            let name = thema_data
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or(thema_key)
                .to_string();
            let mut sources = Vec::new();
            collect_sources(thema_data, &mut sources);
            topics.push(Topic {
                bereich_name: bereich_name.clone(),
                name,
                text_lower: thema_data.to_string().to_ascii_lowercase(),
                sources,
            });
        }
    }
    topics
}

/// Recursively pull every `"quelle"` string out of a nested knowledge entry.
fn collect_sources(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::Object(map) => {
            for (key, v) in map {
                if key == "quelle" {
                    if let Some(s) = v.as_str() {
                        out.push(s.to_string());
                    }
                } else {
                    collect_sources(v, out);
                }
            }
        }
        Value::Array(items) => items.iter().for_each(|item| collect_sources(item, out)),
        _ => {}
    }
}

fn load_normen(path: &Path) -> Vec<Norm> {
    let Ok(contents) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    match serde_json::from_str::<NormenIndex>(&contents) {
        Ok(index) => index.normen,
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "malformed norms index, ignoring");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_fixture(dir: &Path) {
        std::fs::write(
            dir.join("_shk_fachwissen.json"),
            r#"{
                "bereiche": {
                    "trinkwasser": {
                        "name": "Trinkwasserinstallation",
                        "themen": {
                            "werkstoffe": {
                                "name": "Zugelassene Werkstoffe",
                                "zugelassen": ["Edelstahl", "PE-Xa"],
                                "quelle": "DIN 1988-200"
                            }
                        }
                    }
                }
            }"#,
        )
        .unwrap();
        std::fs::write(
            dir.join("_normen_index.json"),
            r#"{
                "normen": [
                    {
                        "id": "din_1988",
                        "name": "DIN 1988",
                        "titel": "Technische Regeln fuer Trinkwasser-Installationen",
                        "beschreibung": "Regelt Planung und Betrieb von Trinkwasseranlagen.",
                        "wichtige_regeln": [
                            {"regel": "Ruhezeiten", "inhalt": "Stagnation vermeiden."}
                        ]
                    }
                ]
            }"#,
        )
        .unwrap();
        std::fs::create_dir(dir.join("dokumente")).unwrap();
        std::fs::write(dir.join("dokumente").join("din_1988.pdf"), b"%PDF-1.4 test").unwrap();
    }

    #[test]
    fn search_fachwissen_finds_topic_by_keyword() {
        let dir = tempfile::tempdir().unwrap();
        write_fixture(dir.path());
        let kb = KnowledgeBase::load(dir.path());

        let hits = kb.search_fachwissen("edelstahl trinkwasser", 5);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].thema_name, "Zugelassene Werkstoffe");
        assert_eq!(hits[0].quellen, vec!["DIN 1988-200".to_string()]);
    }

    #[test]
    fn search_fachwissen_with_no_overlap_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        write_fixture(dir.path());
        let kb = KnowledgeBase::load(dir.path());
        assert!(kb.search_fachwissen("heizkessel wartung", 5).is_empty());
    }

    #[test]
    fn search_normen_matches_rule_text() {
        let dir = tempfile::tempdir().unwrap();
        write_fixture(dir.path());
        let kb = KnowledgeBase::load(dir.path());

        let hits = kb.search_normen("stagnation", 5);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "din_1988");
        assert_eq!(hits[0].matched_regeln.len(), 1);
    }

    #[test]
    fn document_path_resolves_existing_pdf_only() {
        let dir = tempfile::tempdir().unwrap();
        write_fixture(dir.path());
        let kb = KnowledgeBase::load(dir.path());

        assert!(kb.document_path("din_1988").is_some());
        assert!(kb.document_path("does_not_exist").is_none());
    }

    #[test]
    fn missing_source_files_degrade_to_empty_index() {
        let dir = tempfile::tempdir().unwrap();
        let kb = KnowledgeBase::load(dir.path());
        assert!(kb.search_fachwissen("irgendetwas", 5).is_empty());
        assert!(kb.search_normen("irgendetwas", 5).is_empty());
        assert!(kb.document_path("x").is_none());
    }
}
