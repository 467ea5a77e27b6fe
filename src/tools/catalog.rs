//! Read-only catalog data (§6): an `_index.json` enumerating catalog files,
//! a `_keywords.json` inverted index, and per-manufacturer catalog files of
//! product records. Loaded once at startup; no lock needed afterward.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog file not found: {0}")]
    NotFound(String),
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed catalog json in {path}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProductRecord {
    #[serde(rename = "Artikel")]
    pub artikel: String,
    #[serde(rename = "Bezeichnung 1", default)]
    pub bezeichnung_1: String,
    #[serde(rename = "Bezeichnung 2", default)]
    pub bezeichnung_2: String,
    #[serde(rename = "EAN", default)]
    pub ean: String,
    #[serde(default)]
    pub einheit: String,
    #[serde(default)]
    pub preis: Option<f64>,
}

impl ProductRecord {
    pub fn display_name(&self) -> String {
        if self.bezeichnung_2.is_empty() {
            self.bezeichnung_1.clone()
        } else {
            format!("{} {}", self.bezeichnung_1, self.bezeichnung_2)
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct IndexEntry {
    key: String,
    file: String,
    #[serde(default)]
    category: String,
}

#[derive(Debug, Clone, Deserialize)]
struct KeywordEntry {
    #[serde(default)]
    catalogs: Vec<KeywordCatalogHit>,
}

#[derive(Debug, Clone, Deserialize)]
struct KeywordCatalogHit {
    key: String,
    count: u32,
}

/// The full read-only catalog store: index, keyword index, and lazily
/// loaded per-manufacturer catalogs.
pub struct CatalogStore {
    root: PathBuf,
    index: Vec<IndexEntry>,
    keywords: HashMap<String, Vec<KeywordCatalogHit>>,
    loaded: HashMap<String, Vec<ProductRecord>>,
}

pub struct ManufacturerListing {
    pub category: String,
    pub key: String,
    pub product_count: usize,
}

impl CatalogStore {
    pub fn load(root: impl Into<PathBuf>) -> Result<Self, CatalogError> {
        let root = root.into();
        let index: Vec<IndexEntry> = read_json(&root.join("_index.json"))?;
        let keywords_raw: HashMap<String, KeywordEntry> = read_json(&root.join("_keywords.json"))?;
        let keywords = keywords_raw
            .into_iter()
            .map(|(word, entry)| (word, entry.catalogs))
            .collect();

        Ok(Self {
            root,
            index,
            keywords,
            loaded: HashMap::new(),
        })
    }

    fn catalog_file(&self, key: &str) -> Option<&str> {
        self.index.iter().find(|e| e.key == key).map(|e| e.file.as_str())
    }

    /// Load (and cache) a catalog by key.
    pub fn ensure_loaded(&mut self, key: &str) -> Result<(), CatalogError> {
        if self.loaded.contains_key(key) {
            return Ok(());
        }
        let file = self
            .catalog_file(key)
            .ok_or_else(|| CatalogError::NotFound(key.to_string()))?
            .to_string();
        let records: Vec<ProductRecord> = read_json(&self.root.join(&file))?;
        self.loaded.insert(key.to_string(), records);
        Ok(())
    }

    /// Keyword lookup: candidate catalog keys for a query, ranked by
    /// summed occurrence count across the query's normalized words.
    pub fn suggest_catalogs(&self, query: &str, top_n: usize) -> Vec<String> {
        let mut scores: HashMap<&str, u32> = HashMap::new();
        for word in normalize(query) {
            if let Some(hits) = self.keywords.get(&word) {
                for hit in hits {
                    *scores.entry(hit.key.as_str()).or_insert(0) += hit.count;
                }
            }
        }
        let mut ranked: Vec<(&str, u32)> = scores.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1));
        ranked.into_iter().take(top_n).map(|(k, _)| k.to_string()).collect()
    }

    pub fn manufacturers(&self) -> Vec<ManufacturerListing> {
        self.index
            .iter()
            .map(|entry| ManufacturerListing {
                category: entry.category.clone(),
                key: entry.key.clone(),
                product_count: self.loaded.get(&entry.key).map(|v| v.len()).unwrap_or(0),
            })
            .collect()
    }

    /// Search a loaded catalog's records by substring match on the
    /// display name or article number.
    pub fn search(&self, key: &str, query: &str) -> Vec<&ProductRecord> {
        let query_lower = query.to_ascii_lowercase();
        self.loaded
            .get(key)
            .map(|records| {
                records
                    .iter()
                    .filter(|r| {
                        r.display_name().to_ascii_lowercase().contains(&query_lower)
                            || r.artikel.to_ascii_lowercase().contains(&query_lower)
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn find_by_article(&self, article_nr: &str) -> Option<&ProductRecord> {
        self.loaded
            .values()
            .flat_map(|records| records.iter())
            .find(|r| r.artikel == article_nr)
    }
}

fn normalize(query: &str) -> Vec<String> {
    query
        .to_ascii_lowercase()
        .split_whitespace()
        .map(|s| s.to_string())
        .collect()
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, CatalogError> {
    let contents = std::fs::read_to_string(path).map_err(|source| CatalogError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&contents).map_err(|source| CatalogError::Malformed {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_fixture(dir: &Path) {
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
        let mut f = std::fs::File::create(dir.join("viega.json")).unwrap();
        write!(
            f,
            r#"[{{"Artikel":"294540","Bezeichnung 1":"Profipress Bogen","Bezeichnung 2":"90° 22mm","EAN":"123"}}]"#
        )
        .unwrap();
    }

    #[test]
    fn suggests_catalog_by_keyword() {
        let dir = tempfile::tempdir().unwrap();
        write_fixture(dir.path());
        let store = CatalogStore::load(dir.path()).unwrap();
        let suggestions = store.suggest_catalogs("profipress bogen 22", 5);
        assert_eq!(suggestions, vec!["viega".to_string()]);
    }

    #[test]
    fn search_finds_loaded_product() {
        let dir = tempfile::tempdir().unwrap();
        write_fixture(dir.path());
        let mut store = CatalogStore::load(dir.path()).unwrap();
        store.ensure_loaded("viega").unwrap();
        let hits = store.search("viega", "Profipress");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].artikel, "294540");
    }

    #[test]
    fn find_by_article_across_loaded_catalogs() {
        let dir = tempfile::tempdir().unwrap();
        write_fixture(dir.path());
        let mut store = CatalogStore::load(dir.path()).unwrap();
        store.ensure_loaded("viega").unwrap();
        let record = store.find_by_article("294540").unwrap();
        assert_eq!(record.display_name(), "Profipress Bogen 90° 22mm");
    }

    #[test]
    fn unloaded_catalog_search_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        write_fixture(dir.path());
        let store = CatalogStore::load(dir.path()).unwrap();
        assert!(store.search("viega", "Profipress").is_empty());
    }
}
