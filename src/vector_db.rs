use std::{collections::HashMap, path::Path};

use redb::{
    Database,
    ReadableDatabase,
    ReadableTable,
    ReadableTableMetadata,
    TableDefinition,
};
use tracing::warn;

use crate::error::{Error, Result};

const IMAGE_VECTORS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("image_embeddings");
const TEXT_VECTORS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("ocr_text_embeddings");
/// Path -> file mtime (nanoseconds) recorded when the path was last embedded.
const INDEX_STATE: TableDefinition<&str, u64> =
    TableDefinition::new("index_state");
/// Collection name -> fixed vector dimension.
const DIMENSIONS: TableDefinition<&str, u32> =
    TableDefinition::new("dimensions");

/// Header size: 4 bytes dimension.
const HEADER_SIZE: usize = 4;

/// One of the two vector collections, both keyed by canonical path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    /// Image embeddings.
    Image,
    /// Text embeddings of the OCR text found in each image.
    Text,
}

impl Collection {
    pub const ALL: [Collection; 2] = [Collection::Image, Collection::Text];

    pub fn name(self) -> &'static str {
        match self {
            Collection::Image => "image",
            Collection::Text => "ocr_text",
        }
    }

    fn table(self) -> TableDefinition<'static, &'static str, &'static [u8]> {
        match self {
            Collection::Image => IMAGE_VECTORS,
            Collection::Text => TEXT_VECTORS,
        }
    }
}

/// Everything produced for one image in an indexing pass.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedImage {
    pub path: String,
    pub mtime: u64,
    pub image: Vec<f32>,
    /// `None` when the image carries no usable OCR text; any previous text
    /// vector for the path is dropped.
    pub text: Option<Vec<f32>>,
}

/// A nearest-neighbour hit.
#[derive(Debug, Clone, PartialEq)]
pub struct Neighbor {
    pub id: String,
    /// Cosine distance, `1 - cosine_similarity`.
    pub distance: f32,
}

impl Neighbor {
    pub fn similarity(&self) -> f32 {
        1.0 - self.distance
    }
}

/// Stores the image and OCR-text embedding collections plus the per-path
/// index state used for change detection.
///
/// Binary format per vector:
/// - 4 bytes: dimension D (u32 LE)
/// - D * 4 bytes: f32 LE values
pub struct VectorDb {
    db: Database,
}

impl VectorDb {
    /// Open or create the vector database, returning a handle that serves
    /// both collections.
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path)?;

        let txn = db.begin_write()?;
        txn.open_table(IMAGE_VECTORS)?;
        txn.open_table(TEXT_VECTORS)?;
        txn.open_table(INDEX_STATE)?;
        txn.open_table(DIMENSIONS)?;
        txn.commit()?;

        Ok(Self { db })
    }

    /// The fixed dimension of `collection`, once the first vector is stored.
    pub fn dimension(&self, collection: Collection) -> Result<Option<usize>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(DIMENSIONS)?;
        Ok(table
            .get(collection.name())?
            .map(|v| v.value() as usize))
    }

    /// Insert or wholesale-replace one vector.
    pub fn upsert(
        &self,
        collection: Collection,
        id: &str,
        embedding: &[f32],
    ) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut dims = txn.open_table(DIMENSIONS)?;
            check_dimension(&mut dims, collection, embedding.len())?;
            let mut table = txn.open_table(collection.table())?;
            table.insert(id, encode(embedding).as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Store a batch of indexing results in a single transaction: image
    /// vector, text vector (or its removal) and the recorded mtime.
    ///
    /// A dimension mismatch aborts the whole batch.
    pub fn store_indexed(&self, entries: &[IndexedImage]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let txn = self.db.begin_write()?;
        {
            let mut dims = txn.open_table(DIMENSIONS)?;
            let mut images = txn.open_table(IMAGE_VECTORS)?;
            let mut texts = txn.open_table(TEXT_VECTORS)?;
            let mut state = txn.open_table(INDEX_STATE)?;

            for entry in entries {
                let path = entry.path.as_str();
                check_dimension(&mut dims, Collection::Image, entry.image.len())?;
                images.insert(path, encode(&entry.image).as_slice())?;

                match &entry.text {
                    Some(text) => {
                        check_dimension(&mut dims, Collection::Text, text.len())?;
                        texts.insert(path, encode(text).as_slice())?;
                    }
                    None => {
                        texts.remove(path)?;
                    }
                }
                state.insert(path, entry.mtime)?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    /// Retrieve one vector.
    pub fn get(
        &self,
        collection: Collection,
        id: &str,
    ) -> Result<Option<Vec<f32>>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(collection.table())?;
        let Some(guard) = table.get(id)? else {
            return Ok(None);
        };
        Ok(decode(guard.value()))
    }

    /// List all stored ids of a collection, in key order.
    pub fn list_ids(&self, collection: Collection) -> Result<Vec<String>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(collection.table())?;
        let mut result = Vec::new();
        for entry in table.iter()? {
            let (k, _) = entry?;
            result.push(k.value().to_string());
        }
        Ok(result)
    }

    pub fn count(&self, collection: Collection) -> Result<u64> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(collection.table())?;
        Ok(table.len()?)
    }

    /// Remove multiple vectors in a single transaction, returning how many
    /// were present.
    pub fn remove_ids(
        &self,
        collection: Collection,
        ids: &[String],
    ) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let txn = self.db.begin_write()?;
        let mut removed = 0;
        {
            let mut table = txn.open_table(collection.table())?;
            for id in ids {
                if table.remove(id.as_str())?.is_some() {
                    removed += 1;
                }
            }
        }
        txn.commit()?;
        Ok(removed)
    }

    /// Path -> mtime recorded at the last successful embedding.
    pub fn index_state(&self) -> Result<HashMap<String, u64>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(INDEX_STATE)?;
        let mut result = HashMap::new();
        for entry in table.iter()? {
            let (k, v) = entry?;
            result.insert(k.value().to_string(), v.value());
        }
        Ok(result)
    }

    /// Forget recorded state for paths that are no longer indexed.
    pub fn remove_index_state(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(INDEX_STATE)?;
            for id in ids {
                table.remove(id.as_str())?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    /// Exhaustive nearest-neighbour search by cosine distance.
    ///
    /// Returns at most `n_results` hits, nearest first; equal distances keep
    /// key order.
    pub fn query(
        &self,
        collection: Collection,
        embedding: &[f32],
        n_results: usize,
    ) -> Result<Vec<Neighbor>> {
        if n_results == 0 {
            return Ok(Vec::new());
        }
        if let Some(expected) = self.dimension(collection)?
            && expected != embedding.len()
        {
            return Err(Error::Dimension {
                collection: collection.name(),
                expected,
                actual: embedding.len(),
            });
        }

        let txn = self.db.begin_read()?;
        let table = txn.open_table(collection.table())?;
        let mut hits = Vec::new();
        for entry in table.iter()? {
            let (k, v) = entry?;
            let id = k.value();
            let Some(stored) = decode(v.value()) else {
                warn!(collection = collection.name(), id, "skipping undecodable vector");
                continue;
            };
            hits.push(Neighbor {
                id: id.to_string(),
                distance: 1.0 - cosine_similarity(embedding, &stored),
            });
        }

        hits.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(n_results);
        Ok(hits)
    }
}

impl std::fmt::Debug for VectorDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorDb").finish_non_exhaustive()
    }
}

/// Cosine similarity; 0 when either vector has zero norm.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let (mut dot, mut norm_a, mut norm_b) = (0.0f32, 0.0f32, 0.0f32);
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom == 0.0 { 0.0 } else { dot / denom }
}

fn check_dimension(
    dims: &mut redb::Table<'_, &'static str, u32>,
    collection: Collection,
    actual: usize,
) -> Result<()> {
    if actual == 0 {
        return Err(Error::Format {
            kind: "embedding",
            reason: format!("empty vector for {} collection", collection.name()),
        });
    }
    let stored = dims.get(collection.name())?.map(|v| v.value() as usize);
    match stored {
        Some(expected) if expected != actual => Err(Error::Dimension {
            collection: collection.name(),
            expected,
            actual,
        }),
        Some(_) => Ok(()),
        None => {
            dims.insert(collection.name(), actual as u32)?;
            Ok(())
        }
    }
}

fn encode(data: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(HEADER_SIZE + std::mem::size_of_val(data));
    bytes.extend_from_slice(&(data.len() as u32).to_le_bytes());
    bytes.extend_from_slice(bytemuck::cast_slice(data));
    bytes
}

fn decode(bytes: &[u8]) -> Option<Vec<f32>> {
    let header: [u8; HEADER_SIZE] = bytes.get(..HEADER_SIZE)?.try_into().ok()?;
    let dimension = u32::from_le_bytes(header) as usize;
    let body = &bytes[HEADER_SIZE..];
    if body.len() != dimension * 4 {
        return None;
    }
    // Values may be unaligned inside the page, so decode per element.
    Some(
        body.chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    )
}
