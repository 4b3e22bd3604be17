//! Source documents and the document store.
//!
//! A document is either a plain text file or a pre-parsed directory
//! produced by an upstream parsing step (`text.txt`, optional `pages/`,
//! `tables.json`, `metadata.json`). Documents are immutable once loaded.

use crate::error::{HarnessError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// A table extracted during document parsing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedTable {
    /// 1-indexed page the table was found on.
    pub page: usize,
    /// Row-major cell data.
    pub data: Vec<Vec<Option<String>>>,
}

/// A single source document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    /// Unique identifier (file stem or directory name).
    pub id: String,
    /// Full extracted text.
    pub text: String,
    /// Per-page text, when the parser preserved page boundaries.
    #[serde(default)]
    pub pages: Vec<String>,
    /// Tables extracted by the parser, when available.
    #[serde(default)]
    pub tables: Vec<ParsedTable>,
    /// Parser metadata (parser name, page count, ...).
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// Original path (if loaded from disk).
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl Document {
    /// Create a document from raw text content.
    pub fn from_text(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            pages: Vec::new(),
            tables: Vec::new(),
            metadata: HashMap::new(),
            path: None,
        }
    }

    /// Load a plain text file as a single document.
    pub fn from_text_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| HarnessError::io(path, e))?;

        let id = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("untitled")
            .to_string();

        Ok(Self {
            id,
            text,
            pages: Vec::new(),
            tables: Vec::new(),
            metadata: HashMap::new(),
            path: Some(path.to_path_buf()),
        })
    }

    /// Load a pre-parsed document directory.
    ///
    /// Expected layout: `text.txt` (required), `pages/page_*.txt`,
    /// `tables.json`, `metadata.json` (all optional).
    pub fn from_parsed_dir(dir: &Path) -> Result<Self> {
        let text_path = dir.join("text.txt");
        if !text_path.exists() {
            return Err(HarnessError::DocumentNotFound(text_path));
        }

        let text =
            std::fs::read_to_string(&text_path).map_err(|e| HarnessError::io(&text_path, e))?;

        let id = dir
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("untitled")
            .to_string();

        let mut pages = Vec::new();
        let pages_dir = dir.join("pages");
        if pages_dir.is_dir() {
            let mut page_files: Vec<PathBuf> = std::fs::read_dir(&pages_dir)
                .map_err(|e| HarnessError::io(&pages_dir, e))?
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.path())
                .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("txt"))
                .collect();
            page_files.sort();
            for page_path in page_files {
                let content = std::fs::read_to_string(&page_path)
                    .map_err(|e| HarnessError::io(&page_path, e))?;
                pages.push(content);
            }
        }

        let tables_path = dir.join("tables.json");
        let tables = if tables_path.exists() {
            let content = std::fs::read_to_string(&tables_path)
                .map_err(|e| HarnessError::io(&tables_path, e))?;
            serde_json::from_str(&content)?
        } else {
            Vec::new()
        };

        let metadata_path = dir.join("metadata.json");
        let metadata = if metadata_path.exists() {
            let content = std::fs::read_to_string(&metadata_path)
                .map_err(|e| HarnessError::io(&metadata_path, e))?;
            serde_json::from_str(&content)?
        } else {
            HashMap::new()
        };

        Ok(Self {
            id,
            text,
            pages,
            tables,
            metadata,
            path: Some(dir.to_path_buf()),
        })
    }

    /// Character length of the full text.
    pub fn char_count(&self) -> usize {
        self.text.chars().count()
    }

    /// Approximate token count (words / 0.75).
    pub fn estimated_tokens(&self) -> usize {
        let word_count = self.text.split_whitespace().count();
        (word_count as f64 / 0.75) as usize
    }
}

/// In-memory lookup over a loaded document corpus.
#[derive(Debug, Default)]
pub struct DocumentStore {
    documents: HashMap<String, Document>,
    /// Insertion order, for stable listings.
    order: Vec<String>,
}

impl DocumentStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load all documents from a corpus directory.
    ///
    /// Plain `.txt`/`.md` files become single documents; subdirectories
    /// containing a `text.txt` are loaded as pre-parsed documents.
    pub fn load_dir(dir: &Path) -> Result<Self> {
        if !dir.is_dir() {
            return Err(HarnessError::DocumentNotFound(dir.to_path_buf()));
        }

        let mut entries: Vec<PathBuf> = std::fs::read_dir(dir)
            .map_err(|e| HarnessError::io(dir, e))?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .collect();
        entries.sort();

        let mut store = Self::new();
        for path in entries {
            if path.is_dir() {
                if path.join("text.txt").exists() {
                    store.insert(Document::from_parsed_dir(&path)?)?;
                }
            } else if matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("txt") | Some("md")
            ) {
                store.insert(Document::from_text_file(&path)?)?;
            }
        }

        if store.is_empty() {
            return Err(HarnessError::EmptyCorpus(dir.to_path_buf()));
        }

        Ok(store)
    }

    /// Add a document. Duplicate ids are a configuration error.
    pub fn insert(&mut self, document: Document) -> Result<()> {
        if self.documents.contains_key(&document.id) {
            return Err(HarnessError::Config(format!(
                "Duplicate document id '{}'",
                document.id
            )));
        }
        self.order.push(document.id.clone());
        self.documents.insert(document.id.clone(), document);
        Ok(())
    }

    /// Look up a document by id.
    pub fn get(&self, id: &str) -> Option<&Document> {
        self.documents.get(id)
    }

    /// Look up a document by id, failing with a config error when absent.
    pub fn require(&self, id: &str) -> Result<&Document> {
        self.get(id)
            .ok_or_else(|| HarnessError::Config(format!("Unknown document id '{}'", id)))
    }

    /// Document ids in load order.
    pub fn ids(&self) -> &[String] {
        &self.order
    }

    /// Number of documents.
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    /// Check if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_document_from_text() {
        let doc = Document::from_text("s1-filing", "This is the content.");
        assert_eq!(doc.id, "s1-filing");
        assert!(doc.path.is_none());
        assert!(doc.pages.is_empty());
    }

    #[test]
    fn test_load_dir_mixed_layout() {
        let dir = TempDir::new().unwrap();

        std::fs::write(dir.path().join("proxy.txt"), "Proxy statement text.").unwrap();

        let parsed = dir.path().join("merger-agreement");
        std::fs::create_dir_all(parsed.join("pages")).unwrap();
        std::fs::write(parsed.join("text.txt"), "Page one.\n\nPage two.").unwrap();
        std::fs::write(parsed.join("pages").join("page_001.txt"), "Page one.").unwrap();
        std::fs::write(parsed.join("pages").join("page_002.txt"), "Page two.").unwrap();
        std::fs::write(
            parsed.join("tables.json"),
            r#"[{"page": 2, "data": [["Shares", "10"], [null, "20"]]}]"#,
        )
        .unwrap();

        let store = DocumentStore::load_dir(dir.path()).unwrap();
        assert_eq!(store.len(), 2);

        let doc = store.require("merger-agreement").unwrap();
        assert_eq!(doc.pages.len(), 2);
        assert_eq!(doc.tables.len(), 1);
        assert_eq!(doc.tables[0].page, 2);

        assert!(store.get("proxy").is_some());
        assert!(store.get("missing").is_none());
    }

    #[test]
    fn test_load_dir_empty_is_error() {
        let dir = TempDir::new().unwrap();
        let result = DocumentStore::load_dir(dir.path());
        assert!(matches!(result, Err(HarnessError::EmptyCorpus(_))));
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let mut store = DocumentStore::new();
        store.insert(Document::from_text("a", "one")).unwrap();
        let result = store.insert(Document::from_text("a", "two"));
        assert!(matches!(result, Err(HarnessError::Config(_))));
    }
}
