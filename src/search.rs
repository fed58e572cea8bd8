use std::{collections::HashSet, path::Path};

use tracing::{debug, warn};

use crate::{
    error::{Error, Result},
    face_gallery::{FaceGallery, search_face_by_name},
    keyword_index::KeywordIndex,
    path_index::PathIndex,
    provider::Providers,
    vector_db::{Collection, VectorDb},
};

/// Prefix routing a query to the keyword index over OCR text.
pub const KEYWORD_PREFIX: char = '|';
/// Prefix routing a query to image-to-image search.
pub const IMAGE_PREFIX: char = '#';

pub const DEFAULT_TOP_K: usize = 10;
/// Default similarity floor for vector searches.
pub const DEFAULT_VECTOR_THRESHOLD: f32 = 0.3;
/// Default score floor for keyword searches.
pub const DEFAULT_KEYWORD_THRESHOLD: f32 = 0.0;

/// Which store answers a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    /// BM25 over OCR text.
    Keyword,
    /// Text-to-image similarity over the image collection.
    Semantic,
    /// Image-to-image similarity; the body is a path to an example image.
    Image,
    /// Text similarity over the OCR-text collection.
    OcrSemantic,
    /// Identity search, optionally fused with a semantic context.
    Face,
}

impl QueryKind {
    pub fn as_str(self) -> &'static str {
        match self {
            QueryKind::Keyword => "keyword",
            QueryKind::Semantic => "semantic",
            QueryKind::Image => "image",
            QueryKind::OcrSemantic => "ocr-semantic",
            QueryKind::Face => "face",
        }
    }

    /// Threshold used when the caller does not give one.
    pub fn default_threshold(self) -> f32 {
        match self {
            QueryKind::Keyword => DEFAULT_KEYWORD_THRESHOLD,
            _ => DEFAULT_VECTOR_THRESHOLD,
        }
    }
}

impl std::fmt::Display for QueryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A routed query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub kind: QueryKind,
    pub body: String,
}

impl Query {
    /// Route a raw query by its prefix: `|` keyword, `#` image, otherwise
    /// semantic. Only the first marker is stripped, along with surrounding
    /// whitespace.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim_start();
        let (kind, body) = if let Some(rest) = raw.strip_prefix(KEYWORD_PREFIX) {
            (QueryKind::Keyword, rest)
        } else if let Some(rest) = raw.strip_prefix(IMAGE_PREFIX) {
            (QueryKind::Image, rest)
        } else {
            (QueryKind::Semantic, raw)
        };
        Self::new(kind, body)
    }

    /// Build a query of an explicit kind.
    pub fn new(kind: QueryKind, body: &str) -> Result<Self> {
        let body = body.trim();
        if body.is_empty() {
            return Err(Error::Query("empty query".to_string()));
        }
        Ok(Self {
            kind,
            body: body.to_string(),
        })
    }
}

/// `find <name> [activity]`, parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaceQuery {
    pub name: String,
    pub activity: Option<String>,
}

/// Parse an identity query.
///
/// Recognizes `find <name> <activity>` and `find <name>` anywhere in the
/// lowercased query; otherwise the whole query is taken as the name.
pub fn parse_face_query(query: &str) -> FaceQuery {
    let lower = query.trim().to_lowercase();

    if let Some((name, activity)) = match_find(&lower, true) {
        return FaceQuery {
            name,
            activity,
        };
    }
    if let Some((name, _)) = match_find(&lower, false) {
        return FaceQuery {
            name,
            activity: None,
        };
    }
    FaceQuery {
        name: lower,
        activity: None,
    }
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Leftmost `find\s+(\w+)` match, additionally requiring `\s+(.+)` after the
/// name when `with_activity` is set.
fn match_find(
    text: &str,
    with_activity: bool,
) -> Option<(String, Option<String>)> {
    for (start, _) in text.match_indices("find") {
        let rest = &text[start + "find".len()..];
        let after_ws = rest.trim_start();
        if after_ws.len() == rest.len() {
            continue;
        }
        let name_len = after_ws
            .find(|c: char| !is_word_char(c))
            .unwrap_or(after_ws.len());
        if name_len == 0 {
            continue;
        }
        let name = &after_ws[..name_len];
        if !with_activity {
            return Some((name.to_string(), None));
        }

        let tail = &after_ws[name_len..];
        let activity = tail.trim_start();
        if activity.len() == tail.len() {
            continue;
        }
        let activity = activity.lines().next().unwrap_or_default();
        if activity.is_empty() {
            continue;
        }
        return Some((name.to_string(), Some(activity.to_string())));
    }
    None
}

/// Face-match order, restricted to `semantic`, at most `top_k` long.
pub fn fuse_ordered(
    face_matches: &[String],
    semantic: &HashSet<String>,
    top_k: usize,
) -> Vec<String> {
    face_matches
        .iter()
        .filter(|path| semantic.contains(*path))
        .take(top_k)
        .cloned()
        .collect()
}

/// Per-query limits.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchParams {
    pub top_k: usize,
    /// `None` uses the query kind's default.
    pub threshold: Option<f32>,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            top_k: DEFAULT_TOP_K,
            threshold: None,
        }
    }
}

/// Answers queries against the persisted stores.
pub struct QueryEngine<'a> {
    pub vector_db: &'a VectorDb,
    pub keyword: &'a KeywordIndex,
    pub path_index: &'a PathIndex,
    /// `None` when no gallery has been built yet.
    pub gallery: Option<&'a FaceGallery>,
    pub providers: Providers<'a>,
}

impl<'a> QueryEngine<'a> {
    /// Parse `raw` by prefix and run it.
    pub fn search(&self, raw: &str, params: SearchParams) -> Result<Vec<String>> {
        let query = Query::parse(raw)?;
        self.run(&query, params)
    }

    pub fn run(&self, query: &Query, params: SearchParams) -> Result<Vec<String>> {
        let threshold = params
            .threshold
            .unwrap_or_else(|| query.kind.default_threshold());
        debug!(kind = %query.kind, top_k = params.top_k, threshold, "running query");

        match query.kind {
            QueryKind::Keyword => Ok(self.keyword_search(
                &query.body,
                params.top_k,
                threshold,
            )),
            QueryKind::Semantic => {
                self.semantic_search(&query.body, params.top_k, threshold)
            }
            QueryKind::Image => self.image_search(
                Path::new(&query.body),
                params.top_k,
                threshold,
            ),
            QueryKind::OcrSemantic => {
                self.ocr_semantic_search(&query.body, params.top_k, threshold)
            }
            QueryKind::Face => {
                self.face_search(&query.body, params.top_k, threshold)
            }
        }
    }

    pub fn keyword_search(
        &self,
        text: &str,
        top_k: usize,
        threshold: f32,
    ) -> Vec<String> {
        self.keyword.search(text, top_k, f64::from(threshold))
    }

    /// Text-to-image similarity.
    pub fn semantic_search(
        &self,
        text: &str,
        top_k: usize,
        threshold: f32,
    ) -> Result<Vec<String>> {
        let embedding = self
            .providers
            .text()?
            .embed_text(text)
            .map_err(|e| query_failed("embed query text", e))?;
        self.vector_search(Collection::Image, &embedding, top_k, threshold)
    }

    /// Image-to-image similarity against an example image.
    pub fn image_search(
        &self,
        example: &Path,
        top_k: usize,
        threshold: f32,
    ) -> Result<Vec<String>> {
        let embedding = self
            .providers
            .image()?
            .embed_image(example)
            .map_err(|e| query_failed("embed example image", e))?;
        self.vector_search(Collection::Image, &embedding, top_k, threshold)
    }

    /// Text similarity over OCR text.
    pub fn ocr_semantic_search(
        &self,
        text: &str,
        top_k: usize,
        threshold: f32,
    ) -> Result<Vec<String>> {
        let embedding = self
            .providers
            .ocr_text()?
            .embed_text(text)
            .map_err(|e| query_failed("embed query text", e))?;
        self.vector_search(Collection::Text, &embedding, top_k, threshold)
    }

    /// Identity search. With an activity, face matches are intersected with
    /// the semantic hits for the activity, keeping face-match order.
    pub fn face_search(
        &self,
        query: &str,
        top_k: usize,
        threshold: f32,
    ) -> Result<Vec<String>> {
        let FaceQuery { name, activity } = parse_face_query(query);

        let Some(gallery) = self.gallery else {
            warn!("face gallery has not been built");
            return Ok(Vec::new());
        };
        let encoder = self.providers.faces()?;
        let candidates = self.path_index.load()?;
        let face_matches =
            search_face_by_name(&name, gallery, &candidates.paths, encoder);
        debug!(name = %name, matches = face_matches.len(), "face stage done");

        let Some(activity) = activity else {
            return Ok(face_matches.into_iter().take(top_k).collect());
        };
        if face_matches.is_empty() {
            return Ok(face_matches);
        }

        let embedding = self
            .providers
            .text()?
            .embed_text(&activity)
            .map_err(|e| query_failed("embed query text", e))?;
        let semantic: HashSet<String> = self
            .vector_search(
                Collection::Image,
                &embedding,
                top_k.saturating_mul(2),
                threshold,
            )?
            .into_iter()
            .collect();

        Ok(fuse_ordered(&face_matches, &semantic, top_k))
    }

    /// Nearest neighbours with similarity (`1 - distance`) above
    /// `threshold`, nearest first.
    fn vector_search(
        &self,
        collection: Collection,
        embedding: &[f32],
        n_results: usize,
        threshold: f32,
    ) -> Result<Vec<String>> {
        let hits = self.vector_db.query(collection, embedding, n_results)?;
        Ok(hits
            .into_iter()
            .filter(|hit| hit.similarity() > threshold)
            .map(|hit| hit.id)
            .collect())
    }
}

impl std::fmt::Debug for QueryEngine<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryEngine")
            .field("gallery", &self.gallery.map(FaceGallery::len))
            .field("providers", &self.providers)
            .finish_non_exhaustive()
    }
}

fn query_failed(what: &str, e: Error) -> Error {
    Error::Query(format!("could not {what}: {e}"))
}

/// Format results for human-readable terminal output.
pub fn format_human(results: &[String]) {
    if results.is_empty() {
        println!("No results found.");
        return;
    }

    for (i, path) in results.iter().enumerate() {
        println!("{:>3}. {path}", i + 1);
    }
    println!("\n{} result(s)", results.len());
}

/// Format results as JSON output.
pub fn format_json(results: &[String], query: &Query) -> Result<()> {
    let value = serde_json::json!({
        "query": query.body,
        "kind": query.kind.as_str(),
        "result_count": results.len(),
        "results": results,
    });
    println!("{}", serde_json::to_string(&value)?);
    Ok(())
}

/// Format results as plain file paths (one per line).
pub fn format_files(results: &[String]) {
    for path in results {
        println!("{path}");
    }
}
