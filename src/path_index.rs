use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
};

use rayon::prelude::*;
use tracing::{info, warn};

use crate::{
    data_dir::write_atomically,
    error::{Error, Result},
    walker::normalize_path_str,
    workers::WorkerPool,
};

const HEADER: [&str; 2] = ["path", "average"];

/// The authoritative set of scanned image paths, as loaded from disk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathRecords {
    pub paths: Vec<String>,
    /// Parallel to `paths`; 0 when no fingerprint was computed.
    pub fingerprints: Vec<i64>,
}

impl PathRecords {
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, i64)> {
        self.paths
            .iter()
            .map(String::as_str)
            .zip(self.fingerprints.iter().copied())
    }
}

/// Flat `path,average` CSV holding the latest scan. Every `save` replaces
/// the whole file.
#[derive(Debug, Clone)]
pub struct PathIndex {
    file: PathBuf,
}

impl PathIndex {
    pub fn new(file: impl Into<PathBuf>) -> Self {
        Self { file: file.into() }
    }

    pub fn file(&self) -> &Path {
        &self.file
    }

    pub fn exists(&self) -> bool {
        self.file.is_file()
    }

    /// Overwrite the index with `paths`.
    ///
    /// Paths are normalized to forward slashes, deduplicated and sorted.
    /// With `compute_fingerprint`, each image's fingerprint is computed on
    /// the worker pool; unreadable images get 0. Returns the number of
    /// records written.
    pub fn save(
        &self,
        paths: &[String],
        compute_fingerprint: bool,
        pool: &WorkerPool,
    ) -> Result<usize> {
        let paths: Vec<String> = paths
            .iter()
            .map(|p| normalize_path_str(p))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let fingerprints: Vec<i64> = if compute_fingerprint {
            pool.install(|| {
                paths
                    .par_iter()
                    .map(|path| match fingerprint(Path::new(path)) {
                        Ok(value) => value,
                        Err(e) => {
                            warn!(path = %path, error = %e, "could not fingerprint image");
                            0
                        }
                    })
                    .collect()
            })
        } else {
            vec![0; paths.len()]
        };

        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.write_record(HEADER)?;
        for (path, average) in paths.iter().zip(&fingerprints) {
            writer.write_record([path.as_str(), &average.to_string()])?;
        }
        let bytes = writer.into_inner().map_err(|e| e.into_error())?;
        write_atomically(&self.file, &bytes)?;

        info!(
            records = paths.len(),
            fingerprinted = compute_fingerprint,
            file = %self.file.display(),
            "path index saved"
        );
        Ok(paths.len())
    }

    /// Read every record back.
    ///
    /// Returns [`Error::NotFound`] when the index has never been written,
    /// so callers can trigger a first-run scan.
    pub fn load(&self) -> Result<PathRecords> {
        let file = match std::fs::File::open(&self.file) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound {
                    kind: "path index",
                    name: self.file.display().to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        };

        let mut reader = csv::Reader::from_reader(file);
        let mut records = PathRecords::default();
        for row in reader.records() {
            let row = row?;
            let Some(path) = row.get(0) else {
                continue;
            };
            if path.is_empty() {
                continue;
            }
            let average = row
                .get(1)
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(0);
            records.paths.push(path.to_string());
            records.fingerprints.push(average);
        }
        Ok(records)
    }
}

/// Mean of the image's first color channel (red for RGB images, luma for
/// grayscale ones), truncated to an integer.
pub fn fingerprint(path: &Path) -> Result<i64> {
    let img = image::open(path)?;
    let rgba = img.to_rgba8();
    let pixels = u64::from(rgba.width()) * u64::from(rgba.height());
    if pixels == 0 {
        return Ok(0);
    }
    let total: u64 = rgba.pixels().map(|p| u64::from(p.0[0])).sum();
    Ok((total / pixels) as i64)
}
