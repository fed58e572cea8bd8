use std::{collections::HashSet, path::Path};

use tracing::{debug, info, warn};

use crate::{
    error::{Error, Result},
    incremental::{PendingImage, diff_index, stale_ids},
    keyword_index::KeywordIndex,
    ocr_text::clean_batch,
    path_index::PathRecords,
    provider::{ImageEmbedder, Providers, TextEmbedder, TextRecognizer},
    vector_db::{Collection, IndexedImage, VectorDb},
    workers::WorkerPool,
};

/// Number of images written to the vector database per transaction.
pub const BATCH_SIZE: usize = 64;

/// Outcome of an indexing pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexReport {
    /// Images embedded and stored in this pass.
    pub indexed: usize,
    /// Of those, images that also got an OCR text vector.
    pub text_indexed: usize,
    /// Images skipped because their vectors are current.
    pub up_to_date: usize,
    /// Images left unindexed because a provider failed; retried next pass.
    pub failed: usize,
}

/// Ids removed by [`clean_index`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub image_pruned: usize,
    pub text_pruned: usize,
    pub keyword_pruned: usize,
}

impl PruneReport {
    pub fn total(&self) -> usize {
        self.image_pruned + self.text_pruned + self.keyword_pruned
    }
}

/// OCR half of the provider set; only used when both parts are present.
struct OcrStage<'a> {
    recognizer: &'a dyn TextRecognizer,
    embedder: &'a dyn TextEmbedder,
}

/// Vector lengths accepted per collection during one pass. Seeded from the
/// database and fixed by the first vector when a collection is empty.
#[derive(Debug, Default)]
struct Dimensions {
    image: Option<usize>,
    text: Option<usize>,
}

impl Dimensions {
    fn load(vector_db: &VectorDb) -> Result<Self> {
        Ok(Self {
            image: vector_db.dimension(Collection::Image)?,
            text: vector_db.dimension(Collection::Text)?,
        })
    }

    fn check(&mut self, collection: Collection, vector: &[f32]) -> Result<()> {
        if vector.is_empty() {
            return Err(Error::Format {
                kind: "embedding",
                reason: format!("empty vector for {} collection", collection.name()),
            });
        }
        let slot = match collection {
            Collection::Image => &mut self.image,
            Collection::Text => &mut self.text,
        };
        match *slot {
            Some(expected) if expected != vector.len() => Err(Error::Dimension {
                collection: collection.name(),
                expected,
                actual: vector.len(),
            }),
            Some(_) => Ok(()),
            None => {
                *slot = Some(vector.len());
                Ok(())
            }
        }
    }
}

/// Embed every path in `records` that is new or changed since the last
/// pass, storing image vectors, OCR text vectors and keyword documents.
///
/// Providers are called one item at a time. A failure for one image,
/// including a vector of the wrong length, is logged and counted; the rest
/// of the batch continues. The keyword index is saved after every stored
/// batch so it never lags behind the recorded index state.
pub fn index_images(
    vector_db: &VectorDb,
    keyword: &mut KeywordIndex,
    records: &PathRecords,
    providers: Providers<'_>,
    pool: &WorkerPool,
) -> Result<IndexReport> {
    let image = providers.image.ok_or_else(|| {
        Error::Config("indexing requires an image embedder".to_string())
    })?;
    let ocr = match (providers.recognizer, providers.ocr_text().ok()) {
        (Some(recognizer), Some(embedder)) => Some(OcrStage {
            recognizer,
            embedder,
        }),
        _ => {
            debug!("OCR providers unavailable; indexing images only");
            None
        }
    };

    let diff = diff_index(vector_db, records)?;
    let mut report = IndexReport {
        up_to_date: diff.up_to_date,
        ..IndexReport::default()
    };
    info!(
        pending = diff.pending.len(),
        up_to_date = diff.up_to_date,
        "indexing images"
    );

    let mut dims = Dimensions::load(vector_db)?;
    for chunk in diff.pending.chunks(BATCH_SIZE) {
        let embedded =
            embed_chunk(chunk, image, ocr.as_ref(), &mut dims, pool, &mut report);
        if embedded.is_empty() {
            continue;
        }

        let entries: Vec<IndexedImage> =
            embedded.iter().map(|(entry, _)| entry.clone()).collect();
        vector_db.store_indexed(&entries)?;

        let mut keyword_dirty = false;
        for (entry, text) in &embedded {
            match text {
                Some(text) => {
                    keyword.add_document(&entry.path, text);
                    keyword_dirty = true;
                }
                None => keyword_dirty |= keyword.remove_document(&entry.path),
            }
        }
        if keyword_dirty {
            keyword.rebuild_index();
            keyword.save()?;
        }

        report.indexed += entries.len();
        report.text_indexed +=
            entries.iter().filter(|e| e.text.is_some()).count();
        debug!(stored = entries.len(), "batch stored");
    }

    info!(
        indexed = report.indexed,
        text_indexed = report.text_indexed,
        up_to_date = report.up_to_date,
        failed = report.failed,
        "indexing done"
    );
    Ok(report)
}

/// Run the providers over one chunk, returning the stored entry and cleaned
/// OCR text for every image that succeeded.
fn embed_chunk(
    chunk: &[PendingImage],
    image: &dyn ImageEmbedder,
    ocr: Option<&OcrStage<'_>>,
    dims: &mut Dimensions,
    pool: &WorkerPool,
    report: &mut IndexReport,
) -> Vec<(IndexedImage, Option<String>)> {
    let mut embedded = Vec::with_capacity(chunk.len());
    let mut raw_text = Vec::with_capacity(chunk.len());

    for pending in chunk {
        let path = Path::new(&pending.path);
        let vector = match image
            .embed_image(path)
            .and_then(|v| dims.check(Collection::Image, &v).map(|()| v))
        {
            Ok(vector) => vector,
            Err(e) => {
                warn!(path = %pending.path, error = %e, "could not embed image");
                report.failed += 1;
                continue;
            }
        };
        let text = match ocr.map(|stage| stage.recognizer.ocr(path)) {
            None => None,
            Some(Ok(text)) => text,
            Some(Err(e)) => {
                warn!(path = %pending.path, error = %e, "could not read text from image");
                report.failed += 1;
                continue;
            }
        };
        embedded.push(IndexedImage {
            path: pending.path.clone(),
            mtime: pending.mtime,
            image: vector,
            text: None,
        });
        raw_text.push(text);
    }

    let Some(stage) = ocr else {
        return embedded.into_iter().map(|entry| (entry, None)).collect();
    };

    let cleaned = clean_batch(pool, raw_text);
    let mut result = Vec::with_capacity(embedded.len());
    for (mut entry, text) in embedded.into_iter().zip(cleaned) {
        if let Some(text) = &text {
            let vector = stage
                .embedder
                .embed_text(text)
                .and_then(|v| dims.check(Collection::Text, &v).map(|()| v));
            match vector {
                Ok(vector) => entry.text = Some(vector),
                Err(e) => {
                    warn!(path = %entry.path, error = %e, "could not embed OCR text");
                    report.failed += 1;
                    continue;
                }
            }
        }
        result.push((entry, text));
    }
    result
}

/// Remove every stored id that is absent from `current_paths`, from both
/// vector collections, the index state and the keyword index.
pub fn clean_index(
    vector_db: &VectorDb,
    keyword: &mut KeywordIndex,
    current_paths: &[String],
) -> Result<PruneReport> {
    let current: HashSet<&str> =
        current_paths.iter().map(String::as_str).collect();
    let stale = stale_ids(vector_db, &current)?;

    let report = PruneReport {
        image_pruned: vector_db.remove_ids(Collection::Image, &stale)?,
        text_pruned: vector_db.remove_ids(Collection::Text, &stale)?,
        keyword_pruned: keyword.remove_stale(&current),
    };
    vector_db.remove_index_state(&stale)?;
    if report.keyword_pruned > 0 {
        keyword.save()?;
    }

    info!(
        image_pruned = report.image_pruned,
        text_pruned = report.text_pruned,
        keyword_pruned = report.keyword_pruned,
        "stale entries pruned"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use std::{cell::Cell, collections::HashMap};

    use super::*;

    /// Embeds by file name; names listed in `broken` fail.
    #[derive(Default)]
    struct Stub {
        vectors: HashMap<String, Vec<f32>>,
        text: HashMap<String, String>,
        broken: Vec<String>,
        image_calls: Cell<usize>,
    }

    impl Stub {
        fn file(path: &Path) -> String {
            path.file_name().unwrap().to_string_lossy().to_string()
        }
    }

    impl ImageEmbedder for Stub {
        fn embed_image(&self, path: &Path) -> Result<Vec<f32>> {
            self.image_calls.set(self.image_calls.get() + 1);
            let file = Self::file(path);
            if self.broken.contains(&file) {
                return Err(Error::provider(file, "decoder crashed"));
            }
            Ok(self.vectors.get(&file).cloned().unwrap_or(vec![0.5, 0.5]))
        }
    }

    impl TextRecognizer for Stub {
        fn ocr(&self, path: &Path) -> Result<Option<String>> {
            Ok(self.text.get(&Self::file(path)).cloned())
        }
    }

    impl TextEmbedder for Stub {
        fn embed_text(&self, text: &str) -> Result<Vec<f32>> {
            Ok(vec![text.len() as f32, 1.0, 0.0])
        }
    }

    struct Fixture {
        tmp: tempfile::TempDir,
        vector_db: VectorDb,
        pool: WorkerPool,
    }

    fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let vector_db = VectorDb::open(&tmp.path().join("vectors.redb")).unwrap();
        Fixture {
            tmp,
            vector_db,
            pool: WorkerPool::new(Some(2)).unwrap(),
        }
    }

    impl Fixture {
        fn files(&self, names: &[&str]) -> PathRecords {
            let paths: Vec<String> = names
                .iter()
                .map(|name| {
                    let path = self.tmp.path().join(name);
                    std::fs::write(&path, b"img").unwrap();
                    path.to_string_lossy().to_string()
                })
                .collect();
            PathRecords {
                fingerprints: vec![0; paths.len()],
                paths,
            }
        }
    }

    fn providers(stub: &Stub) -> Providers<'_> {
        Providers {
            image: Some(stub),
            ocr_text: Some(stub),
            recognizer: Some(stub),
            ..Providers::default()
        }
    }

    #[test]
    fn indexes_images_and_ocr_text() {
        let fx = fixture();
        let records = fx.files(&["a.jpg", "b.jpg"]);
        let stub = Stub {
            text: [("a.jpg".to_string(), "Receipt total 42".to_string())]
                .into_iter()
                .collect(),
            ..Stub::default()
        };
        let mut keyword = KeywordIndex::in_memory();

        let report =
            index_images(&fx.vector_db, &mut keyword, &records, providers(&stub), &fx.pool)
                .unwrap();

        assert_eq!(report.indexed, 2);
        assert_eq!(report.text_indexed, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(fx.vector_db.count(Collection::Image).unwrap(), 2);
        assert_eq!(fx.vector_db.list_ids(Collection::Text).unwrap(), vec![records.paths[0].clone()]);
        assert_eq!(keyword.search("receipt", 10, 0.0), vec![records.paths[0].clone()]);
    }

    #[test]
    fn second_pass_is_a_no_op() {
        let fx = fixture();
        let records = fx.files(&["a.jpg", "b.jpg"]);
        let stub = Stub::default();
        let mut keyword = KeywordIndex::in_memory();

        index_images(&fx.vector_db, &mut keyword, &records, providers(&stub), &fx.pool)
            .unwrap();
        let calls = stub.image_calls.get();
        let report =
            index_images(&fx.vector_db, &mut keyword, &records, providers(&stub), &fx.pool)
                .unwrap();

        assert_eq!(report.indexed, 0);
        assert_eq!(report.up_to_date, 2);
        assert_eq!(stub.image_calls.get(), calls);
    }

    #[test]
    fn failed_image_is_skipped_and_retried() {
        let fx = fixture();
        let records = fx.files(&["good.jpg", "bad.jpg"]);
        let mut stub = Stub {
            broken: vec!["bad.jpg".to_string()],
            ..Stub::default()
        };
        let mut keyword = KeywordIndex::in_memory();

        let report =
            index_images(&fx.vector_db, &mut keyword, &records, providers(&stub), &fx.pool)
                .unwrap();
        assert_eq!((report.indexed, report.failed), (1, 1));

        stub.broken.clear();
        let report =
            index_images(&fx.vector_db, &mut keyword, &records, providers(&stub), &fx.pool)
                .unwrap();
        assert_eq!((report.indexed, report.up_to_date), (1, 1));
    }

    #[test]
    fn wrong_dimension_fails_one_item_and_keeps_the_rest() {
        let fx = fixture();
        let names: Vec<String> =
            (0..BATCH_SIZE + 6).map(|i| format!("img{i:03}.jpg")).collect();
        let name_refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let records = fx.files(&name_refs);
        let mut stub = Stub {
            vectors: [("img010.jpg".to_string(), vec![1.0, 0.0, 0.0])]
                .into_iter()
                .collect(),
            text: names
                .iter()
                .map(|name| (name.clone(), "receipt total".to_string()))
                .collect(),
            ..Stub::default()
        };
        let keyword_file = fx.tmp.path().join("keyword_index.json");
        let mut keyword = KeywordIndex::open(&keyword_file).unwrap();

        let report =
            index_images(&fx.vector_db, &mut keyword, &records, providers(&stub), &fx.pool)
                .unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.indexed, names.len() - 1);
        assert_eq!(fx.vector_db.dimension(Collection::Image).unwrap(), Some(2));

        let reopened = KeywordIndex::open(&keyword_file).unwrap();
        assert_eq!(reopened.len(), names.len() - 1);
        assert_eq!(reopened.search("receipt", 1000, 0.0).len(), names.len() - 1);

        stub.vectors.clear();
        let mut keyword = reopened;
        let report =
            index_images(&fx.vector_db, &mut keyword, &records, providers(&stub), &fx.pool)
                .unwrap();
        assert_eq!((report.indexed, report.up_to_date), (1, names.len() - 1));
        let reopened = KeywordIndex::open(&keyword_file).unwrap();
        assert_eq!(reopened.len(), names.len());
    }

    #[test]
    fn empty_vector_is_counted_as_failure() {
        let fx = fixture();
        let records = fx.files(&["a.jpg", "blank.jpg"]);
        let stub = Stub {
            vectors: [("blank.jpg".to_string(), Vec::new())].into_iter().collect(),
            ..Stub::default()
        };
        let mut keyword = KeywordIndex::in_memory();

        let report =
            index_images(&fx.vector_db, &mut keyword, &records, providers(&stub), &fx.pool)
                .unwrap();
        assert_eq!((report.indexed, report.failed), (1, 1));
        assert_eq!(fx.vector_db.list_ids(Collection::Image).unwrap(), vec![records.paths[0].clone()]);
    }

    #[test]
    fn junk_ocr_text_is_not_indexed() {
        let fx = fixture();
        let records = fx.files(&["noise.jpg"]);
        let stub = Stub {
            text: [("noise.jpg".to_string(), "| ~ x".to_string())]
                .into_iter()
                .collect(),
            ..Stub::default()
        };
        let mut keyword = KeywordIndex::in_memory();

        let report =
            index_images(&fx.vector_db, &mut keyword, &records, providers(&stub), &fx.pool)
                .unwrap();
        assert_eq!((report.indexed, report.text_indexed), (1, 0));
        assert!(keyword.is_empty());
    }

    #[test]
    fn requires_image_embedder() {
        let fx = fixture();
        let records = fx.files(&["a.jpg"]);
        let mut keyword = KeywordIndex::in_memory();

        let err = index_images(
            &fx.vector_db,
            &mut keyword,
            &records,
            Providers::default(),
            &fx.pool,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn clean_index_prunes_only_stale_ids() {
        let fx = fixture();
        fx.vector_db.upsert(Collection::Image, "/x.jpg", &[1.0, 0.0]).unwrap();
        fx.vector_db.upsert(Collection::Image, "/y.jpg", &[0.0, 1.0]).unwrap();
        fx.vector_db.upsert(Collection::Image, "/z.jpg", &[1.0, 1.0]).unwrap();
        fx.vector_db.upsert(Collection::Text, "/z.jpg", &[1.0]).unwrap();
        let mut keyword = KeywordIndex::in_memory();
        keyword.add_document("/z.jpg", "gone forever");
        keyword.add_document("/x.jpg", "still here");
        keyword.rebuild_index();

        let current = vec!["/x.jpg".to_string(), "/y.jpg".to_string()];
        let report = clean_index(&fx.vector_db, &mut keyword, &current).unwrap();

        assert_eq!(
            report,
            PruneReport {
                image_pruned: 1,
                text_pruned: 1,
                keyword_pruned: 1,
            }
        );
        assert_eq!(fx.vector_db.list_ids(Collection::Image).unwrap(), current);
        assert!(fx.vector_db.list_ids(Collection::Text).unwrap().is_empty());
        assert_eq!(keyword.doc_ids(), ["/x.jpg".to_string()]);

        let again = clean_index(&fx.vector_db, &mut keyword, &current).unwrap();
        assert_eq!(again.total(), 0);
    }
}
