//! End-to-end operations over the persisted stores: scan the configured
//! directories into the path index, then bring the vector and keyword
//! indexes in line with it.

use std::{path::PathBuf, sync::Arc, time::Duration};

use tracing::{info, warn};

use crate::{
    config_db::ScanConfig,
    data_dir::DataDir,
    error::Result,
    face_gallery::FaceGallery,
    indexing::{self, IndexReport, PruneReport},
    keyword_index::KeywordIndex,
    path_index::PathIndex,
    provider::Providers,
    vector_db::VectorDb,
    walker::DirectoryScanner,
    workers::WorkerPool,
};

/// Outcome of [`scan_and_save`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanReport {
    /// Paths written to the path index.
    pub paths: usize,
    pub elapsed: Duration,
    pub backend: &'static str,
}

/// Outcome of [`build_index`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildReport {
    pub indexed: usize,
    pub text_indexed: usize,
    pub up_to_date: usize,
    pub failed: usize,
    pub pruned: PruneReport,
}

impl BuildReport {
    fn new(index: IndexReport, pruned: PruneReport) -> Self {
        Self {
            indexed: index.indexed,
            text_indexed: index.text_indexed,
            up_to_date: index.up_to_date,
            failed: index.failed,
            pruned,
        }
    }
}

/// The stores owned by one data directory.
#[derive(Debug)]
pub struct Stores {
    pub vector_db: VectorDb,
    pub keyword: KeywordIndex,
    pub path_index: PathIndex,
}

impl Stores {
    pub fn open(data_dir: &DataDir) -> Result<Self> {
        Ok(Self {
            vector_db: VectorDb::open(&data_dir.vectors_db())?,
            keyword: KeywordIndex::open(&data_dir.keyword_index())?,
            path_index: PathIndex::new(data_dir.path_index()),
        })
    }
}

/// Scan the configured directories and overwrite the path index with the
/// result. Fingerprints are computed when `deep_scan` is set.
pub fn scan_and_save(
    config: &ScanConfig,
    path_index: &PathIndex,
    pool: Arc<WorkerPool>,
) -> Result<ScanReport> {
    let scanner =
        DirectoryScanner::new(config.method, &config.extensions, pool.clone());
    let outcome = scanner.scan(&config.include, &config.exclude)?;
    let paths = path_index.save(&outcome.paths, config.deep_scan, &pool)?;

    Ok(ScanReport {
        paths,
        elapsed: outcome.elapsed,
        backend: scanner.backend_name(),
    })
}

/// Embed new and changed paths from the path index, then prune ids that
/// are no longer in it.
///
/// Fails with [`Error::NotFound`](crate::Error::NotFound) when no scan has
/// been saved yet.
pub fn build_index(
    stores: &mut Stores,
    providers: Providers<'_>,
    pool: &WorkerPool,
) -> Result<BuildReport> {
    let records = stores.path_index.load()?;
    let index = indexing::index_images(
        &stores.vector_db,
        &mut stores.keyword,
        &records,
        providers,
        pool,
    )?;
    let pruned = prune(stores)?;
    Ok(BuildReport::new(index, pruned))
}

/// Prune stale ids against the saved path index without embedding anything.
pub fn prune(stores: &mut Stores) -> Result<PruneReport> {
    let records = stores.path_index.load()?;
    indexing::clean_index(&stores.vector_db, &mut stores.keyword, &records.paths)
}

/// Delete the vector database, keyword index and path index so the next
/// scan and index start from nothing. Settings and the face gallery are
/// kept. Returns the files that existed and were removed.
pub fn reset(data_dir: &DataDir) -> Result<Vec<PathBuf>> {
    let mut removed = Vec::new();
    for file in [
        data_dir.vectors_db(),
        data_dir.keyword_index(),
        data_dir.path_index(),
    ] {
        match std::fs::remove_file(&file) {
            Ok(()) => {
                info!(file = %file.display(), "removed");
                removed.push(file);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(removed)
}

/// Load the face gallery, treating a gallery that was never built as
/// absent.
pub fn load_gallery(data_dir: &DataDir) -> Result<Option<FaceGallery>> {
    match FaceGallery::load(&data_dir.face_gallery()) {
        Ok(gallery) => {
            info!(faces = gallery.len(), "face gallery loaded");
            Ok(Some(gallery))
        }
        Err(e) if e.is_not_found() => {
            warn!("no face gallery found");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}
