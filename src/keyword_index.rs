use std::{
    collections::{BTreeMap, HashSet},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    data_dir::write_atomically,
    error::{Error, Result},
};

/// Term-frequency saturation.
pub const K1: f64 = 1.5;
/// Document-length normalization.
pub const B: f64 = 0.75;

const FORMAT_VERSION: u32 = 1;

/// Fitted Okapi BM25 statistics over a tokenized corpus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bm25Model {
    pub k1: f64,
    pub b: f64,
    pub avgdl: f64,
    /// Token count per document, in corpus order.
    pub doc_len: Vec<u32>,
    /// Term frequencies per document, in corpus order.
    pub doc_freqs: Vec<BTreeMap<String, u32>>,
    pub idf: BTreeMap<String, f64>,
}

impl Bm25Model {
    /// Fit the model; `None` for an empty corpus.
    pub fn fit(corpus: &[Vec<String>]) -> Option<Self> {
        if corpus.is_empty() {
            return None;
        }

        let mut doc_len = Vec::with_capacity(corpus.len());
        let mut doc_freqs = Vec::with_capacity(corpus.len());
        let mut containing: BTreeMap<String, u32> = BTreeMap::new();

        for tokens in corpus {
            let mut freqs: BTreeMap<String, u32> = BTreeMap::new();
            for token in tokens {
                *freqs.entry(token.clone()).or_default() += 1;
            }
            for term in freqs.keys() {
                *containing.entry(term.clone()).or_default() += 1;
            }
            doc_len.push(tokens.len() as u32);
            doc_freqs.push(freqs);
        }

        let total: u64 = doc_len.iter().map(|&l| u64::from(l)).sum();
        let n = corpus.len() as f64;
        let avgdl = total as f64 / n;
        let idf = containing
            .into_iter()
            .map(|(term, df)| {
                let df = f64::from(df);
                (term, (1.0 + (n - df + 0.5) / (df + 0.5)).ln())
            })
            .collect();

        Some(Self {
            k1: K1,
            b: B,
            avgdl,
            doc_len,
            doc_freqs,
            idf,
        })
    }

    /// BM25 score of every document for `query_tokens`, in corpus order.
    pub fn scores(&self, query_tokens: &[String]) -> Vec<f64> {
        let mut scores = vec![0.0; self.doc_freqs.len()];
        for token in query_tokens {
            let Some(&idf) = self.idf.get(token) else {
                continue;
            };
            for (i, freqs) in self.doc_freqs.iter().enumerate() {
                let Some(&tf) = freqs.get(token) else {
                    continue;
                };
                let tf = f64::from(tf);
                let dl = f64::from(self.doc_len[i]);
                let norm = if self.avgdl > 0.0 {
                    1.0 - self.b + self.b * dl / self.avgdl
                } else {
                    1.0
                };
                scores[i] += idf * tf * (self.k1 + 1.0) / (tf + self.k1 * norm);
            }
        }
        scores
    }
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    model: Option<Bm25Model>,
    documents: Vec<String>,
    doc_ids: Vec<String>,
}

/// BM25 keyword index over OCR text, keyed by image path.
///
/// Documents added with [`add_document`](Self::add_document) only become
/// searchable after [`rebuild_index`](Self::rebuild_index).
#[derive(Debug, Clone, Default)]
pub struct KeywordIndex {
    file: Option<PathBuf>,
    documents: Vec<String>,
    doc_ids: Vec<String>,
    model: Option<Bm25Model>,
}

/// Lowercase and split on whitespace.
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

impl KeywordIndex {
    /// An index that is never persisted.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load the index at `path`, or start an empty one bound to `path` if it
    /// has never been saved.
    pub fn open(path: &Path) -> Result<Self> {
        match Self::load(path) {
            Err(e) if e.is_not_found() => {
                debug!(file = %path.display(), "starting empty keyword index");
                Ok(Self {
                    file: Some(path.to_path_buf()),
                    ..Self::default()
                })
            }
            other => other,
        }
    }

    /// Load a saved index; [`Error::NotFound`] if it was never written.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound {
                    kind: "keyword index",
                    name: path.display().to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        };

        let snapshot: Snapshot = serde_json::from_slice(&bytes)?;
        if snapshot.version != FORMAT_VERSION {
            return Err(Error::Format {
                kind: "keyword index",
                reason: format!("unsupported version {}", snapshot.version),
            });
        }
        if snapshot.documents.len() != snapshot.doc_ids.len() {
            return Err(Error::Format {
                kind: "keyword index",
                reason: "document and id lists differ in length".to_string(),
            });
        }

        Ok(Self {
            file: Some(path.to_path_buf()),
            documents: snapshot.documents,
            doc_ids: snapshot.doc_ids,
            model: snapshot.model,
        })
    }

    /// Persist documents, ids and the fitted model as one unit. A no-op for
    /// in-memory indexes.
    pub fn save(&self) -> Result<()> {
        let Some(file) = &self.file else {
            return Ok(());
        };
        let snapshot = Snapshot {
            version: FORMAT_VERSION,
            model: self.model.clone(),
            documents: self.documents.clone(),
            doc_ids: self.doc_ids.clone(),
        };
        write_atomically(file, &serde_json::to_vec(&snapshot)?)?;
        info!(documents = self.len(), file = %file.display(), "keyword index saved");
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.doc_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.doc_ids.is_empty()
    }

    pub fn doc_ids(&self) -> &[String] {
        &self.doc_ids
    }

    /// Add or replace a document. Empty and whitespace-only text is ignored.
    pub fn add_document(&mut self, doc_id: &str, text: &str) {
        if text.trim().is_empty() {
            return;
        }
        match self.doc_ids.iter().position(|id| id == doc_id) {
            Some(idx) => self.documents[idx] = text.to_string(),
            None => {
                self.doc_ids.push(doc_id.to_string());
                self.documents.push(text.to_string());
            }
        }
    }

    /// Remove one document. Search returns nothing until the next
    /// [`rebuild_index`](Self::rebuild_index).
    pub fn remove_document(&mut self, doc_id: &str) -> bool {
        let Some(idx) = self.doc_ids.iter().position(|id| id == doc_id) else {
            return false;
        };
        self.doc_ids.remove(idx);
        self.documents.remove(idx);
        self.model = None;
        true
    }

    /// Re-tokenize every document and refit the ranking statistics.
    pub fn rebuild_index(&mut self) {
        let corpus: Vec<Vec<String>> =
            self.documents.iter().map(|d| tokenize(d)).collect();
        self.model = Bm25Model::fit(&corpus);
        debug!(documents = self.documents.len(), "keyword index rebuilt");
    }

    /// Drop documents whose id is not in `keep` and refit. Returns the number
    /// of documents removed.
    pub fn remove_stale(&mut self, keep: &HashSet<&str>) -> usize {
        let before = self.doc_ids.len();
        let (doc_ids, documents): (Vec<_>, Vec<_>) = std::mem::take(&mut self.doc_ids)
            .into_iter()
            .zip(std::mem::take(&mut self.documents))
            .filter(|(id, _)| keep.contains(id.as_str()))
            .unzip();
        self.doc_ids = doc_ids;
        self.documents = documents;

        let removed = before - self.doc_ids.len();
        if removed > 0 {
            self.rebuild_index();
        }
        removed
    }

    /// Ids of documents scoring strictly above `threshold`, best first.
    /// Equal scores keep insertion order; at most `top_k` ids.
    pub fn search(&self, query: &str, top_k: usize, threshold: f64) -> Vec<String> {
        let Some(model) = &self.model else {
            return Vec::new();
        };

        let scores = model.scores(&tokenize(query));
        let mut hits: Vec<(usize, f64)> = scores
            .into_iter()
            .enumerate()
            .filter(|&(_, score)| score > threshold)
            .collect();
        hits.sort_by(|a, b| {
            b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal)
        });

        hits.into_iter()
            .filter_map(|(i, _)| self.doc_ids.get(i).cloned())
            .take(top_k)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pets() -> KeywordIndex {
        let mut index = KeywordIndex::in_memory();
        index.add_document("1.jpg", "cat on a mat");
        index.add_document("2.jpg", "dog in the park");
        index.rebuild_index();
        index
    }

    #[test]
    fn finds_matching_document() {
        assert_eq!(pets().search("cat", 10, 0.0), vec!["1.jpg"]);
    }

    #[test]
    fn query_is_case_insensitive() {
        assert_eq!(pets().search("DOG", 10, 0.0), vec!["2.jpg"]);
    }

    #[test]
    fn unknown_terms_match_nothing() {
        assert!(pets().search("giraffe", 10, 0.0).is_empty());
    }

    #[test]
    fn not_searchable_before_rebuild() {
        let mut index = KeywordIndex::in_memory();
        index.add_document("1.jpg", "cat on a mat");
        assert!(index.search("cat", 10, 0.0).is_empty());

        index.rebuild_index();
        assert_eq!(index.search("cat", 10, 0.0), vec!["1.jpg"]);
    }

    #[test]
    fn removed_document_disappears_after_rebuild() {
        let mut index = pets();
        assert!(index.remove_document("1.jpg"));
        assert!(!index.remove_document("1.jpg"));
        index.rebuild_index();

        assert!(index.search("cat", 10, 0.0).is_empty());
        assert_eq!(index.search("dog", 10, 0.0), vec!["2.jpg"]);
    }

    #[test]
    fn skips_blank_text() {
        let mut index = KeywordIndex::in_memory();
        index.add_document("1.jpg", "");
        index.add_document("2.jpg", "   \n\t");
        assert!(index.is_empty());
    }

    #[test]
    fn add_replaces_on_matching_id() {
        let mut index = pets();
        index.add_document("1.jpg", "bird on a wire");
        index.rebuild_index();

        assert_eq!(index.len(), 2);
        assert!(index.search("cat", 10, 0.0).is_empty());
        assert_eq!(index.search("bird", 10, 0.0), vec!["1.jpg"]);
    }

    #[test]
    fn results_sorted_by_score() {
        let mut index = KeywordIndex::in_memory();
        index.add_document("once.jpg", "cat with a very long caption about other things");
        index.add_document("twice.jpg", "cat cat");
        index.add_document("none.jpg", "dog");
        index.rebuild_index();

        assert_eq!(index.search("cat", 10, 0.0), vec!["twice.jpg", "once.jpg"]);
    }

    #[test]
    fn ties_keep_insertion_order() {
        let mut index = KeywordIndex::in_memory();
        index.add_document("b.jpg", "sunset beach");
        index.add_document("a.jpg", "sunset beach");
        index.add_document("c.jpg", "mountain");
        index.rebuild_index();

        assert_eq!(index.search("sunset", 10, 0.0), vec!["b.jpg", "a.jpg"]);
    }

    #[test]
    fn threshold_is_strict_and_top_k_bounds() {
        let index = pets();
        let model = index.model.as_ref().unwrap();
        let cat_score = model.scores(&tokenize("cat"))[0];

        assert!(index.search("cat", 10, cat_score).is_empty());
        assert_eq!(index.search("cat", 10, cat_score - 1e-9), vec!["1.jpg"]);
        assert!(index.search("cat dog", 1, 0.0).len() <= 1);
        assert!(index.search("cat", 0, 0.0).is_empty());
    }

    #[test]
    fn rebuild_with_no_documents_clears_model() {
        let mut index = pets();
        index.remove_stale(&HashSet::new());
        assert!(index.is_empty());
        assert!(index.model.is_none());
        assert!(index.search("cat", 10, 0.0).is_empty());
    }

    #[test]
    fn remove_stale_keeps_current_ids() {
        let mut index = pets();
        let keep: HashSet<&str> = ["2.jpg"].into_iter().collect();

        assert_eq!(index.remove_stale(&keep), 1);
        assert_eq!(index.doc_ids(), ["2.jpg".to_string()]);
        assert_eq!(index.search("dog", 10, 0.0), vec!["2.jpg"]);
    }

    #[test]
    fn save_and_load_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("keyword_index.json");

        let mut index = KeywordIndex::open(&path).unwrap();
        assert!(index.is_empty());
        index.add_document("1.jpg", "cat on a mat");
        index.add_document("2.jpg", "dog in the park");
        index.rebuild_index();
        index.save().unwrap();

        let loaded = KeywordIndex::load(&path).unwrap();
        assert_eq!(loaded.doc_ids(), index.doc_ids());
        let (saved, restored) = (index.model.unwrap(), loaded.model.clone().unwrap());
        assert_eq!(restored.doc_freqs, saved.doc_freqs);
        assert_eq!(restored.doc_len, saved.doc_len);
        assert_eq!(loaded.search("cat", 10, 0.0), vec!["1.jpg"]);
    }

    #[test]
    fn load_missing_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let err = KeywordIndex::load(&tmp.path().join("nope.json")).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn unknown_version_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("keyword_index.json");
        std::fs::write(
            &path,
            r#"{"version":99,"model":null,"documents":[],"doc_ids":[]}"#,
        )
        .unwrap();

        let err = KeywordIndex::load(&path).unwrap_err();
        assert!(matches!(err, Error::Format { .. }));
    }

    #[test]
    fn idf_is_positive_for_common_terms() {
        let corpus = vec![tokenize("cat"), tokenize("cat"), tokenize("cat dog")];
        let model = Bm25Model::fit(&corpus).unwrap();
        assert!(model.idf["cat"] > 0.0);
        assert!(model.idf["dog"] > model.idf["cat"]);
    }
}
