//! Feature provider seams.
//!
//! Neural inference (image/text encoders, OCR, face descriptors) lives
//! outside this crate. Callers hand implementations to the indexer and the
//! query engine explicitly; nothing here is loaded into global state, so
//! tests can pass deterministic stubs.
//!
//! Providers are invoked one item at a time from a single thread; they are
//! not required to be `Sync`.

use std::path::Path;

use crate::error::{Error, Result};

/// Produces an embedding for an image file.
pub trait ImageEmbedder {
    fn embed_image(&self, path: &Path) -> Result<Vec<f32>>;
}

/// Produces an embedding for free text, in the same space as the image
/// embedder when used for text-to-image search.
pub trait TextEmbedder {
    fn embed_text(&self, text: &str) -> Result<Vec<f32>>;
}

/// Extracts raw text from an image; `None` when no text was detected.
pub trait TextRecognizer {
    fn ocr(&self, path: &Path) -> Result<Option<String>>;
}

/// Extracts one descriptor per face found in an image, primary face first.
pub trait FaceEncoder {
    fn face_descriptors(&self, path: &Path) -> Result<Vec<Vec<f32>>>;
}

/// The set of providers available to one invocation.
///
/// Any provider may be absent. Indexing requires the image embedder;
/// OCR-derived stores are only filled when both the recognizer and the OCR
/// text embedder are present.
#[derive(Clone, Copy, Default)]
pub struct Providers<'a> {
    pub image: Option<&'a dyn ImageEmbedder>,
    /// Encoder used for text-to-image queries.
    pub text: Option<&'a dyn TextEmbedder>,
    /// Encoder used for OCR text, both at index and query time. Falls back
    /// to `text` when unset.
    pub ocr_text: Option<&'a dyn TextEmbedder>,
    pub recognizer: Option<&'a dyn TextRecognizer>,
    pub faces: Option<&'a dyn FaceEncoder>,
}

impl<'a> Providers<'a> {
    pub fn image(&self) -> Result<&'a dyn ImageEmbedder> {
        self.image.ok_or_else(|| missing("image embedder"))
    }

    pub fn text(&self) -> Result<&'a dyn TextEmbedder> {
        self.text.ok_or_else(|| missing("text embedder"))
    }

    pub fn ocr_text(&self) -> Result<&'a dyn TextEmbedder> {
        self.ocr_text
            .or(self.text)
            .ok_or_else(|| missing("OCR text embedder"))
    }

    pub fn faces(&self) -> Result<&'a dyn FaceEncoder> {
        self.faces.ok_or_else(|| missing("face encoder"))
    }

    /// True when no provider at all is linked.
    pub fn is_empty(&self) -> bool {
        self.image.is_none()
            && self.text.is_none()
            && self.ocr_text.is_none()
            && self.recognizer.is_none()
            && self.faces.is_none()
    }
}

impl std::fmt::Debug for Providers<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Providers")
            .field("image", &self.image.is_some())
            .field("text", &self.text.is_some())
            .field("ocr_text", &self.ocr_text.is_some())
            .field("recognizer", &self.recognizer.is_some())
            .field("faces", &self.faces.is_some())
            .finish()
    }
}

fn missing(what: &str) -> Error {
    Error::Query(format!("no {what} is available"))
}
