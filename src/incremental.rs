use std::{collections::HashSet, path::Path, time::SystemTime};

use crate::{
    error::Result,
    path_index::PathRecords,
    vector_db::{Collection, VectorDb},
};

/// A path from the path index that needs (re-)embedding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingImage {
    pub path: String,
    pub mtime: u64,
}

/// Result of comparing the path index against the vector database.
#[derive(Debug, Default)]
pub struct DiffResult {
    /// Paths that are new or whose file changed since it was embedded.
    pub pending: Vec<PendingImage>,
    /// Paths whose stored vectors are current.
    pub up_to_date: usize,
}

/// File modification time in nanoseconds since the epoch; 0 when the file
/// cannot be stat'ed.
pub fn file_mtime(path: &Path) -> u64 {
    let nanos = std::fs::metadata(path)
        .and_then(|m| m.modified())
        .unwrap_or(SystemTime::UNIX_EPOCH)
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    u64::try_from(nanos).unwrap_or(u64::MAX)
}

/// Compare the current path index against what the vector database holds.
///
/// A path is up to date when it has an image vector and the mtime recorded
/// at embedding time matches the file's current mtime.
pub fn diff_index(
    vector_db: &VectorDb,
    records: &PathRecords,
) -> Result<DiffResult> {
    let state = vector_db.index_state()?;
    let embedded: HashSet<String> =
        vector_db.list_ids(Collection::Image)?.into_iter().collect();

    let mut result = DiffResult::default();
    let mut seen = HashSet::with_capacity(records.len());

    for path in &records.paths {
        if !seen.insert(path.as_str()) {
            continue;
        }
        let mtime = file_mtime(Path::new(path));
        let fresh = embedded.contains(path)
            && state.get(path).is_some_and(|stored| *stored == mtime);
        if fresh {
            result.up_to_date += 1;
        } else {
            result.pending.push(PendingImage {
                path: path.clone(),
                mtime,
            });
        }
    }

    Ok(result)
}

/// Ids present in either collection (or the index state) that are not in
/// `current`, sorted and deduplicated.
pub fn stale_ids(
    vector_db: &VectorDb,
    current: &HashSet<&str>,
) -> Result<Vec<String>> {
    let mut stale = std::collections::BTreeSet::new();
    for collection in Collection::ALL {
        for id in vector_db.list_ids(collection)? {
            if !current.contains(id.as_str()) {
                stale.insert(id);
            }
        }
    }
    for id in vector_db.index_state()?.into_keys() {
        if !current.contains(id.as_str()) {
            stale.insert(id);
        }
    }
    Ok(stale.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector_db::IndexedImage;

    fn test_db() -> (tempfile::TempDir, VectorDb) {
        let tmp = tempfile::tempdir().unwrap();
        let db = VectorDb::open(&tmp.path().join("vectors.redb")).unwrap();
        (tmp, db)
    }

    fn records(paths: &[&str]) -> PathRecords {
        PathRecords {
            paths: paths.iter().map(|p| p.to_string()).collect(),
            fingerprints: vec![0; paths.len()],
        }
    }

    fn touch(dir: &Path, name: &str) -> String {
        let path = dir.join(name);
        std::fs::write(&path, b"x").unwrap();
        path.to_string_lossy().to_string()
    }

    #[test]
    fn everything_pending_on_first_run() {
        let (tmp, db) = test_db();
        let a = touch(tmp.path(), "a.jpg");
        let b = touch(tmp.path(), "b.jpg");

        let diff = diff_index(&db, &records(&[&a, &b])).unwrap();
        assert_eq!(diff.pending.len(), 2);
        assert_eq!(diff.up_to_date, 0);
    }

    #[test]
    fn embedded_with_matching_mtime_is_up_to_date() {
        let (tmp, db) = test_db();
        let a = touch(tmp.path(), "a.jpg");
        let b = touch(tmp.path(), "b.jpg");

        db.store_indexed(&[IndexedImage {
            path: a.clone(),
            mtime: file_mtime(Path::new(&a)),
            image: vec![1.0],
            text: None,
        }])
        .unwrap();

        let diff = diff_index(&db, &records(&[&a, &b])).unwrap();
        assert_eq!(diff.up_to_date, 1);
        assert_eq!(diff.pending.len(), 1);
        assert_eq!(diff.pending[0].path, b);
    }

    #[test]
    fn changed_mtime_is_pending() {
        let (tmp, db) = test_db();
        let a = touch(tmp.path(), "a.jpg");
        let current = file_mtime(Path::new(&a));

        db.store_indexed(&[IndexedImage {
            path: a.clone(),
            mtime: current.wrapping_sub(100),
            image: vec![1.0],
            text: None,
        }])
        .unwrap();

        let diff = diff_index(&db, &records(&[&a])).unwrap();
        assert_eq!(diff.pending.len(), 1);
        assert_eq!(diff.pending[0].mtime, current);
    }

    #[test]
    fn ids_missing_from_records_are_stale() {
        let (_tmp, db) = test_db();
        db.upsert(Collection::Image, "/kept.jpg", &[1.0]).unwrap();
        db.upsert(Collection::Image, "/gone.jpg", &[1.0]).unwrap();
        db.upsert(Collection::Text, "/text-only.jpg", &[1.0]).unwrap();

        let current: HashSet<&str> = ["/kept.jpg"].into_iter().collect();
        assert_eq!(
            stale_ids(&db, &current).unwrap(),
            vec!["/gone.jpg", "/text-only.jpg"]
        );
    }

    #[test]
    fn mtime_keeps_sub_second_precision() {
        let (tmp, _db) = test_db();
        let a = touch(tmp.path(), "a.jpg");
        let stamp = SystemTime::UNIX_EPOCH
            + std::time::Duration::new(1_700_000_000, 250_000_000);
        std::fs::File::options()
            .write(true)
            .open(&a)
            .unwrap()
            .set_modified(stamp)
            .unwrap();

        assert_eq!(file_mtime(Path::new(&a)), 1_700_000_000_250_000_000);
    }

    #[test]
    fn rewrite_within_the_same_second_is_pending() {
        let (tmp, db) = test_db();
        let a = touch(tmp.path(), "a.jpg");
        let file = std::fs::File::options().write(true).open(&a).unwrap();
        let second = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_700_000_000);

        file.set_modified(second + std::time::Duration::from_millis(100))
            .unwrap();
        db.store_indexed(&[IndexedImage {
            path: a.clone(),
            mtime: file_mtime(Path::new(&a)),
            image: vec![1.0],
            text: None,
        }])
        .unwrap();
        file.set_modified(second + std::time::Duration::from_millis(900))
            .unwrap();

        let diff = diff_index(&db, &records(&[&a])).unwrap();
        assert_eq!(diff.pending.len(), 1);
        assert_eq!(diff.up_to_date, 0);
    }

    #[test]
    fn missing_file_has_zero_mtime() {
        assert_eq!(file_mtime(Path::new("/definitely/not/here.jpg")), 0);
    }
}
