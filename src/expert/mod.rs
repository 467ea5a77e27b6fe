//! C6 — Expert Client: synchronous request/response to a slower reasoning
//! model, with confidence gating and PDF attachment support.

mod knowledge;

use std::sync::Arc;
use std::time::Instant;

use base64::Engine;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

pub use knowledge::KnowledgeBase;

use crate::tools::catalog::CatalogStore;

const DEFLECTION_TEMPLATE: &str =
    "Das muss ich erst mit einem Kollegen abklären, bevor ich Ihnen eine verbindliche Antwort geben kann.";
const MAX_TOOL_ITERATIONS: u32 = 4;
const MAX_COMPLETION_TOKENS_TEXT: u32 = 1000;
const MAX_COMPLETION_TOKENS_DOCS: u32 = 1500;

#[derive(Debug, Error)]
pub enum ExpertError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("no model configured for urgency {0:?}")]
    NoModelAvailable(Urgency),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    Fast,
    Normal,
    Thorough,
}

#[derive(Debug, Clone)]
pub struct ExpertRequest {
    pub question: String,
    pub context: String,
    pub urgency: Urgency,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExpertResponse {
    pub answer: String,
    pub confidence: f32,
    pub reasoning: String,
    pub article_numbers: Vec<String>,
    pub model_used: String,
    pub latency_ms: u64,
    pub success: bool,
}

/// Model slots the expert can be routed to, keyed by role (§4.6).
#[derive(Debug, Clone)]
pub struct ModelCatalog {
    pub small_model: Option<String>,
    pub small_reasoning_model: Option<String>,
    pub large_reasoning_model: Option<String>,
    pub pro_reasoning_model: Option<String>,
    pub large_standard: Option<String>,
}

impl ModelCatalog {
    fn select(&self, urgency: Urgency) -> Option<&str> {
        let candidates: &[&Option<String>] = match urgency {
            Urgency::Fast => &[&self.small_model, &self.small_reasoning_model],
            Urgency::Thorough => &[
                &self.large_reasoning_model,
                &self.pro_reasoning_model,
                &self.large_standard,
            ],
            Urgency::Normal => &[
                &self.small_reasoning_model,
                &self.large_standard,
                &self.small_model,
            ],
        };
        candidates.iter().find_map(|c| c.as_deref())
    }
}

#[derive(Debug, Deserialize)]
struct StructuredAnswer {
    answer: String,
    confidence: f32,
    #[serde(default)]
    reasoning: String,
    #[serde(default)]
    article_numbers: Vec<String>,
}

pub struct ExpertClient {
    http: reqwest::Client,
    api_base: String,
    api_key: String,
    models: ModelCatalog,
    min_confidence: Mutex<f32>,
    catalogs: Arc<Mutex<CatalogStore>>,
    knowledge: Arc<KnowledgeBase>,
    instructions: Mutex<String>,
    total_queries: std::sync::atomic::AtomicU64,
    successful_queries: std::sync::atomic::AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExpertStats {
    pub total_queries: u64,
    pub successful_queries: u64,
}

impl ExpertClient {
    pub fn new(
        api_base: String,
        api_key: String,
        models: ModelCatalog,
        min_confidence: f32,
        catalogs: Arc<Mutex<CatalogStore>>,
        knowledge: Arc<KnowledgeBase>,
        instructions: String,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_base,
            api_key,
            models,
            min_confidence: Mutex::new(min_confidence),
            catalogs,
            knowledge,
            instructions: Mutex::new(instructions),
            total_queries: std::sync::atomic::AtomicU64::new(0),
            successful_queries: std::sync::atomic::AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> ExpertStats {
        ExpertStats {
            total_queries: self.total_queries.load(std::sync::atomic::Ordering::Relaxed),
            successful_queries: self.successful_queries.load(std::sync::atomic::Ordering::Relaxed),
        }
    }

    pub fn set_min_confidence(&self, value: f32) {
        *self.min_confidence.lock() = value;
    }

    pub fn set_instructions(&self, value: String) {
        *self.instructions.lock() = value;
    }

    pub fn instructions(&self) -> String {
        self.instructions.lock().clone()
    }

    /// Ask the expert. Never returns an error to the caller's tool-call path
    /// (§4.6, §7: "the tool dispatcher still returns a string — never an
    /// error to the assistant") — network failures are folded into a
    /// low-confidence response instead.
    pub async fn ask(&self, request: ExpertRequest) -> ExpertResponse {
        self.total_queries.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let started = Instant::now();
        let Some(model) = self.models.select(request.urgency) else {
            return self.deflect("kein-modell".to_string(), started.elapsed().as_millis() as u64, 0.0);
        };

        let response = match self.run_tool_loop(model, &request, MAX_COMPLETION_TOKENS_TEXT).await {
            Ok(structured) => self.finalize(structured, model.to_string(), started.elapsed().as_millis() as u64),
            Err(err) => {
                tracing::warn!(error = %err, "expert call failed");
                self.deflect(model.to_string(), started.elapsed().as_millis() as u64, 0.0)
            }
        };
        if response.success {
            self.successful_queries.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
        response
    }

    fn finalize(&self, structured: StructuredAnswer, model: String, latency_ms: u64) -> ExpertResponse {
        let threshold = *self.min_confidence.lock();
        let success = structured.confidence >= threshold;
        if success {
            ExpertResponse {
                answer: structured.answer,
                confidence: structured.confidence,
                reasoning: structured.reasoning,
                article_numbers: structured.article_numbers,
                model_used: model,
                latency_ms,
                success: true,
            }
        } else {
            ExpertResponse {
                answer: DEFLECTION_TEMPLATE.to_string(),
                confidence: structured.confidence,
                reasoning: structured.reasoning,
                article_numbers: structured.article_numbers,
                model_used: model,
                latency_ms,
                success: false,
            }
        }
    }

    fn deflect(&self, model: String, latency_ms: u64, confidence: f32) -> ExpertResponse {
        ExpertResponse {
            answer: DEFLECTION_TEMPLATE.to_string(),
            confidence,
            reasoning: String::new(),
            article_numbers: Vec::new(),
            model_used: model,
            latency_ms,
            success: false,
        }
    }

    /// The expert may tool-call iteratively (search_products,
    /// load_manufacturer_catalog, load_product_documentation,
    /// search_knowledge_base, load_standards_document, show_manufacturers)
    /// before producing its final structured JSON.
    async fn run_tool_loop(
        &self,
        model: &str,
        request: &ExpertRequest,
        max_tokens: u32,
    ) -> Result<StructuredAnswer, ExpertError> {
        let mut messages = vec![
            json!({"role": "system", "content": self.instructions()}),
            json!({"role": "user", "content": format!("{}\n\nKontext: {}", request.question, request.context)}),
        ];
        let mut max_tokens = max_tokens;

        for _ in 0..MAX_TOOL_ITERATIONS {
            let body = json!({
                "model": model,
                "messages": messages,
                "response_format": {"type": "json_object"},
                "max_completion_tokens": max_tokens,
                "tools": expert_tool_schema(),
            });

            let response: Value = self
                .http
                .post(format!("{}/chat/completions", self.api_base))
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()
                .await?
                .json()
                .await?;

            let choice = &response["choices"][0]["message"];
            if let Some(tool_calls) = choice.get("tool_calls").and_then(|v| v.as_array()) {
                if !tool_calls.is_empty() {
                    messages.push(choice.clone());
                    for call in tool_calls {
                        let name = call["function"]["name"].as_str().unwrap_or_default();
                        let args = call["function"]["arguments"].as_str().unwrap_or("{}");
                        let outcome = self.execute_expert_tool(name, args).await;
                        messages.push(json!({
                            "role": "tool",
                            "tool_call_id": call["id"],
                            "content": outcome.text(),
                        }));
                        // A fetched document is attached as a follow-up multimodal
                        // user message, not as the tool-result string itself, and
                        // bumps the budget to the larger documentation-analysis one.
                        if let ToolOutcome::WithAttachment { filename, base64_pdf, .. } = &outcome {
                            max_tokens = max_tokens.max(MAX_COMPLETION_TOKENS_DOCS);
                            messages.push(json!({
                                "role": "user",
                                "content": [
                                    {"type": "text", "text": format!("Anbei das angeforderte Dokument {filename}.")},
                                    {
                                        "type": "file",
                                        "file": {
                                            "filename": filename,
                                            "file_data": format!("data:application/pdf;base64,{base64_pdf}"),
                                        },
                                    },
                                ],
                            }));
                        }
                    }
                    continue;
                }
            }

            let content = choice["content"].as_str().unwrap_or_default();
            return Ok(parse_structured_answer(content));
        }

        Ok(StructuredAnswer {
            answer: "Ich konnte keine abschließende Antwort finden.".to_string(),
            confidence: 0.3,
            reasoning: "tool loop exceeded max iterations".to_string(),
            article_numbers: Vec::new(),
        })
    }

    async fn execute_expert_tool(&self, name: &str, args_json: &str) -> ToolOutcome {
        let args: Value = serde_json::from_str(args_json).unwrap_or(json!({}));
        match name {
            "show_manufacturers" => {
                let catalogs = self.catalogs.lock();
                let listing: Vec<String> = catalogs
                    .manufacturers()
                    .into_iter()
                    .map(|m| format!("{} ({})", m.key, m.category))
                    .collect();
                ToolOutcome::Text(listing.join("\n"))
            }
            "search_products" | "load_manufacturer_catalog" => {
                let key = args["key"].as_str().or_else(|| args["manufacturer"].as_str());
                let query = args["query"].as_str().unwrap_or_default();
                let mut catalogs = self.catalogs.lock();
                if let Some(key) = key {
                    if catalogs.ensure_loaded(key).is_ok() {
                        let hits = catalogs.search(key, query);
                        return ToolOutcome::Text(
                            hits.iter()
                                .take(15)
                                .map(|r| format!("{} | Art: {}", r.display_name(), r.artikel))
                                .collect::<Vec<_>>()
                                .join("\n"),
                        );
                    }
                }
                ToolOutcome::Text("keine Treffer".to_string())
            }
            "load_product_documentation" => {
                let article_nr = args["article_nr"].as_str().unwrap_or_default();
                if article_nr.is_empty() {
                    return ToolOutcome::Text("Fehler: keine Artikelnummer angegeben.".to_string());
                }
                match self.knowledge.document_path(article_nr) {
                    Some(path) => self.attach_pdf(&path, &format!("{article_nr}.pdf"), format!(
                        "Dokumentation fuer Artikel {article_nr} gefunden, siehe Anhang."
                    )),
                    None => ToolOutcome::Text(format!("keine Dokumentation fuer Artikel {article_nr} verfuegbar")),
                }
            }
            "search_knowledge_base" => {
                let query = args["query"].as_str().unwrap_or_default();
                let hits = self.knowledge.search_fachwissen(query, 3);
                if hits.is_empty() {
                    return ToolOutcome::Text("keine Treffer in der Wissensbasis".to_string());
                }
                let text = hits
                    .iter()
                    .map(|hit| {
                        let quelle = hit
                            .quellen
                            .first()
                            .map(|q| format!(" (Quelle: {q})"))
                            .unwrap_or_default();
                        format!(
                            "{} / {}: Relevanz {:.0}%{quelle}",
                            hit.bereich_name,
                            hit.thema_name,
                            hit.relevanz * 100.0
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n");
                ToolOutcome::Text(text)
            }
            "load_standards_document" => {
                let query = args["norm"].as_str().or_else(|| args["query"].as_str()).unwrap_or_default();
                let hits = self.knowledge.search_normen(query, 3);
                let Some(first) = hits.first() else {
                    return ToolOutcome::Text("keine Treffer in der Wissensbasis".to_string());
                };
                let summary = hits
                    .iter()
                    .map(|hit| {
                        let regeln: Vec<String> = hit
                            .matched_regeln
                            .iter()
                            .map(|(regel, inhalt)| format!("  - {regel}: {inhalt}"))
                            .collect();
                        if regeln.is_empty() {
                            format!("{}: {}", hit.id, hit.titel)
                        } else {
                            format!("{}: {}\n{}", hit.id, hit.titel, regeln.join("\n"))
                        }
                    })
                    .collect::<Vec<_>>()
                    .join("\n\n");
                match self.knowledge.document_path(&first.id) {
                    Some(path) => self.attach_pdf(&path, &format!("{}.pdf", first.id), summary),
                    None => ToolOutcome::Text(summary),
                }
            }
            other => ToolOutcome::Text(format!("Unknown function: {other}")),
        }
    }

    fn attach_pdf(&self, path: &std::path::Path, filename: &str, text: String) -> ToolOutcome {
        match std::fs::read(path) {
            Ok(bytes) => ToolOutcome::WithAttachment {
                text,
                filename: filename.to_string(),
                base64_pdf: base64::engine::general_purpose::STANDARD.encode(bytes),
            },
            Err(err) => ToolOutcome::Text(format!("Dokument gefunden, aber nicht lesbar: {err}")),
        }
    }
}

/// Result of a single tool call: either plain text for the tool-result
/// message, or text plus a PDF to attach as a follow-up multimodal message.
enum ToolOutcome {
    Text(String),
    WithAttachment {
        text: String,
        filename: String,
        base64_pdf: String,
    },
}

impl ToolOutcome {
    fn text(&self) -> &str {
        match self {
            ToolOutcome::Text(text) => text,
            ToolOutcome::WithAttachment { text, .. } => text,
        }
    }
}

fn parse_structured_answer(content: &str) -> StructuredAnswer {
    match serde_json::from_str::<StructuredAnswer>(content) {
        Ok(answer) => answer,
        Err(_) => StructuredAnswer {
            answer: content.to_string(),
            confidence: 0.5,
            reasoning: String::new(),
            article_numbers: Vec::new(),
        },
    }
}

fn expert_tool_schema() -> Vec<Value> {
    let tools = [
        "show_manufacturers",
        "search_products",
        "load_manufacturer_catalog",
        "load_product_documentation",
        "search_knowledge_base",
        "load_standards_document",
    ];
    tools
        .iter()
        .map(|name| {
            json!({
                "type": "function",
                "function": {
                    "name": name,
                    "parameters": {"type": "object", "properties": {}},
                }
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_selection_prefers_small_for_fast() {
        let catalog = ModelCatalog {
            small_model: Some("gpt-4o-mini".to_string()),
            small_reasoning_model: Some("o3-mini".to_string()),
            large_reasoning_model: Some("o1".to_string()),
            pro_reasoning_model: Some("o1-pro".to_string()),
            large_standard: Some("gpt-4o".to_string()),
        };
        assert_eq!(catalog.select(Urgency::Fast), Some("gpt-4o-mini"));
        assert_eq!(catalog.select(Urgency::Thorough), Some("o1"));
    }

    #[test]
    fn model_selection_falls_back_when_preferred_missing() {
        let catalog = ModelCatalog {
            small_model: None,
            small_reasoning_model: Some("o3-mini".to_string()),
            large_reasoning_model: None,
            pro_reasoning_model: None,
            large_standard: Some("gpt-4o".to_string()),
        };
        assert_eq!(catalog.select(Urgency::Fast), Some("o3-mini"));
        assert_eq!(catalog.select(Urgency::Thorough), Some("gpt-4o"));
    }

    #[test]
    fn parse_structured_answer_falls_back_on_bad_json() {
        let answer = parse_structured_answer("not json");
        assert_eq!(answer.confidence, 0.5);
        assert_eq!(answer.answer, "not json");
    }

    #[test]
    fn low_confidence_answer_is_deflected() {
        let client = ExpertClient::new(
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
            Arc::new(Mutex::new(test_catalog_store())),
            Arc::new(test_knowledge_base()),
            "instructions".to_string(),
        );
        let structured = StructuredAnswer {
            answer: "Ja, fuer Trinkwasser zugelassen.".to_string(),
            confidence: 0.45,
            reasoning: "unsicher".to_string(),
            article_numbers: vec![],
        };
        let response = client.finalize(structured, "gpt-4o-mini".to_string(), 10);
        assert!(!response.success);
        assert_eq!(response.answer, DEFLECTION_TEMPLATE);
        assert!((response.confidence - 0.45).abs() < f32::EPSILON);
    }

    fn test_catalog_store() -> CatalogStore {
        let dir = tempfile::tempdir().unwrap().into_path();
        std::fs::write(dir.join("_index.json"), "[]").unwrap();
        std::fs::write(dir.join("_keywords.json"), "{}").unwrap();
        CatalogStore::load(dir).unwrap()
    }

    fn test_knowledge_base() -> KnowledgeBase {
        KnowledgeBase::load(tempfile::tempdir().unwrap().into_path())
    }

    fn test_client_with_knowledge(knowledge: KnowledgeBase) -> ExpertClient {
        ExpertClient::new(
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
            Arc::new(Mutex::new(test_catalog_store())),
            Arc::new(knowledge),
            "instructions".to_string(),
        )
    }

    #[test]
    fn uncertain_water_safety_answer_is_deflected_not_spoken_verbatim() {
        let client = ExpertClient::new(
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
            Arc::new(Mutex::new(test_catalog_store())),
            Arc::new(test_knowledge_base()),
            "instructions".to_string(),
        );
        let structured = StructuredAnswer {
            answer: "Ja, Megapress ist fuer Trinkwasser zugelassen.".to_string(),
            confidence: 0.45,
            reasoning: "unsicher, Normauslegung variiert nach Region".to_string(),
            article_numbers: vec![],
        };
        let response = client.finalize(structured, "gpt-4o-mini".to_string(), 42);
        assert!(!response.success);
        assert_eq!(response.answer, DEFLECTION_TEMPLATE);
        assert!((response.confidence - 0.45).abs() < 0.01);
        assert_ne!(response.answer, "Ja, Megapress ist fuer Trinkwasser zugelassen.");
    }

    #[test]
    fn parse_structured_answer_decodes_valid_json() {
        let raw = r#"{"answer":"Ja, zulaessig","confidence":0.9,"reasoning":"DIN 1988","article_numbers":["123"]}"#;
        let answer = parse_structured_answer(raw);
        assert_eq!(answer.answer, "Ja, zulaessig");
        assert_eq!(answer.confidence, 0.9);
    }

    fn knowledge_base_with_document(root: &std::path::Path, dokument_id: &str) -> KnowledgeBase {
        std::fs::write(
            root.join("_shk_fachwissen.json"),
            format!(
                r#"{{"bereiche":{{"trinkwasser":{{"name":"Trinkwasser","themen":{{"werkstoffe":{{
                    "name":"Zugelassene Werkstoffe","zugelassen":["Edelstahl"],"quelle":"{dokument_id}"
                }}}}}}}}}}"#
            ),
        )
        .unwrap();
        std::fs::write(
            root.join("_normen_index.json"),
            format!(
                r#"{{"normen":[{{"id":"{dokument_id}","name":"{dokument_id}","titel":"Testnorm",
                "beschreibung":"Testbeschreibung","wichtige_regeln":[{{"regel":"Stagnation","inhalt":"vermeiden"}}]}}]}}"#
            ),
        )
        .unwrap();
        std::fs::create_dir(root.join("dokumente")).unwrap();
        std::fs::write(root.join("dokumente").join(format!("{dokument_id}.pdf")), b"%PDF-1.4 test").unwrap();
        KnowledgeBase::load(root)
    }

    #[tokio::test]
    async fn load_product_documentation_attaches_pdf_when_found() {
        let dir = tempfile::tempdir().unwrap();
        let knowledge = knowledge_base_with_document(dir.path(), "294540");
        let client = test_client_with_knowledge(knowledge);

        let outcome = client
            .execute_expert_tool("load_product_documentation", r#"{"article_nr":"294540"}"#)
            .await;
        match outcome {
            ToolOutcome::WithAttachment { filename, base64_pdf, .. } => {
                assert_eq!(filename, "294540.pdf");
                assert!(!base64_pdf.is_empty());
            }
            ToolOutcome::Text(text) => panic!("expected attachment, got text: {text}"),
        }
    }

    #[tokio::test]
    async fn load_product_documentation_reports_missing_article() {
        let client = test_client_with_knowledge(test_knowledge_base());
        let outcome = client
            .execute_expert_tool("load_product_documentation", r#"{"article_nr":"999999"}"#)
            .await;
        assert_eq!(outcome.text(), "keine Dokumentation fuer Artikel 999999 verfuegbar");
    }

    #[tokio::test]
    async fn search_knowledge_base_finds_matching_topic() {
        let dir = tempfile::tempdir().unwrap();
        let knowledge = knowledge_base_with_document(dir.path(), "din_1988");
        let client = test_client_with_knowledge(knowledge);

        let outcome = client
            .execute_expert_tool("search_knowledge_base", r#"{"query":"edelstahl trinkwasser"}"#)
            .await;
        assert!(outcome.text().contains("Zugelassene Werkstoffe"));
        assert!(outcome.text().contains("din_1988"));
    }

    #[tokio::test]
    async fn load_standards_document_attaches_matching_norm_pdf() {
        let dir = tempfile::tempdir().unwrap();
        let knowledge = knowledge_base_with_document(dir.path(), "din_1988");
        let client = test_client_with_knowledge(knowledge);

        let outcome = client
            .execute_expert_tool("load_standards_document", r#"{"norm":"stagnation"}"#)
            .await;
        match outcome {
            ToolOutcome::WithAttachment { text, filename, .. } => {
                assert_eq!(filename, "din_1988.pdf");
                assert!(text.contains("Stagnation"));
            }
            ToolOutcome::Text(text) => panic!("expected attachment, got text: {text}"),
        }
    }

    #[tokio::test]
    async fn load_standards_document_with_no_match_reports_no_hits() {
        let client = test_client_with_knowledge(test_knowledge_base());
        let outcome = client
            .execute_expert_tool("load_standards_document", r#"{"norm":"nichts passt"}"#)
            .await;
        assert_eq!(outcome.text(), "keine Treffer in der Wissensbasis");
    }
}
