use std::{
    collections::BTreeSet,
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
    time::{Duration, Instant},
};

use rayon::prelude::*;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::{
    error::{Error, Result},
    workers::WorkerPool,
};

/// Image extensions recognized when no explicit list is configured.
pub const DEFAULT_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "bmp"];

/// Which traversal backend a scan uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ScanMethod {
    /// Single-threaded recursive `read_dir` walk.
    #[default]
    Default,
    /// `walkdir` traversal fanned out over the worker pool.
    Parallel,
    /// Pick `Parallel` when more than one core is available.
    Auto,
}

impl ScanMethod {
    /// Resolve `Auto` against the number of available cores.
    pub fn resolve(self, cores: usize) -> ScanMethod {
        match self {
            ScanMethod::Auto if cores > 1 => ScanMethod::Parallel,
            ScanMethod::Auto => ScanMethod::Default,
            other => other,
        }
    }
}

impl FromStr for ScanMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "default" | "portable" => Ok(ScanMethod::Default),
            "parallel" => Ok(ScanMethod::Parallel),
            "auto" => Ok(ScanMethod::Auto),
            other => Err(Error::Config(format!(
                "scan_method must be 'default', 'parallel' or 'auto', got '{other}'"
            ))),
        }
    }
}

impl fmt::Display for ScanMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScanMethod::Default => "default",
            ScanMethod::Parallel => "parallel",
            ScanMethod::Auto => "auto",
        };
        f.write_str(name)
    }
}

/// Result of a directory scan.
#[derive(Debug, Clone, Default)]
pub struct ScanOutcome {
    /// Normalized, sorted, deduplicated image paths.
    pub paths: Vec<String>,
    pub elapsed: Duration,
}

/// Exclusion and extension rules shared by every backend.
#[derive(Debug, Clone)]
pub struct ScanFilter {
    exclude: Vec<PathBuf>,
    extensions: Vec<String>,
}

impl ScanFilter {
    pub fn new(exclude: &[PathBuf], extensions: &[String]) -> Self {
        let exclude = exclude
            .iter()
            .map(|dir| dir.canonicalize().unwrap_or_else(|_| dir.clone()))
            .collect();
        Self {
            exclude,
            extensions: normalize_extensions(extensions),
        }
    }

    /// True if `path` is an exclude directory or lies beneath one.
    pub fn is_excluded(&self, path: &Path) -> bool {
        self.exclude.iter().any(|dir| path.starts_with(dir))
    }

    /// True if `path` names an image file that should be reported.
    pub fn accepts(&self, path: &Path) -> bool {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        // macOS resource forks carry image extensions but no image data.
        if name.starts_with("._") {
            return false;
        }
        let matches_ext = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| {
                let ext = ext.to_ascii_lowercase();
                self.extensions.iter().any(|e| *e == ext)
            });
        matches_ext && !self.is_excluded(path)
    }
}

/// A traversal strategy. Both implementations must report the same set of
/// files for the same tree; ordering is fixed up by [`DirectoryScanner`].
pub trait WalkBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Collect every accepted file under `root`, never descending into
    /// excluded directories. Unreadable directories are logged and skipped.
    fn walk(&self, root: &Path, filter: &ScanFilter) -> Vec<PathBuf>;
}

/// Recursive `read_dir` walk on the calling thread.
#[derive(Debug, Default)]
pub struct PortableWalker;

impl WalkBackend for PortableWalker {
    fn name(&self) -> &'static str {
        "default"
    }

    fn walk(&self, root: &Path, filter: &ScanFilter) -> Vec<PathBuf> {
        let mut results = Vec::new();
        if !filter.is_excluded(root) {
            walk_dir(root, filter, &mut results);
        }
        results
    }
}

fn walk_dir(current: &Path, filter: &ScanFilter, results: &mut Vec<PathBuf>) {
    let entries = match std::fs::read_dir(current) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(dir = %current.display(), error = %e, "skipping unreadable directory");
            return;
        }
    };

    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(dir = %current.display(), error = %e, "skipping unreadable entry");
                continue;
            }
        };
        let path = entry.path();
        let Ok(file_type) = entry.file_type() else {
            continue;
        };

        if file_type.is_dir() {
            if !filter.is_excluded(&path) {
                walk_dir(&path, filter, results);
            }
        } else if file_type.is_symlink() {
            // Directory symlinks are not followed (cycle prevention).
            if path.is_file() && filter.accepts(&path) {
                results.push(path);
            }
        } else if file_type.is_file() && filter.accepts(&path) {
            results.push(path);
        }
    }
}

/// `walkdir` traversal with per-entry filtering spread over the worker pool.
pub struct ParallelWalker {
    pool: Arc<WorkerPool>,
}

impl ParallelWalker {
    pub fn new(pool: Arc<WorkerPool>) -> Self {
        Self { pool }
    }
}

impl WalkBackend for ParallelWalker {
    fn name(&self) -> &'static str {
        "parallel"
    }

    fn walk(&self, root: &Path, filter: &ScanFilter) -> Vec<PathBuf> {
        let entries = WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| {
                !(e.file_type().is_dir() && filter.is_excluded(e.path()))
            });

        self.pool.install(|| {
            entries
                .par_bridge()
                .filter_map(|entry| match entry {
                    Ok(entry) => {
                        let ft = entry.file_type();
                        let is_file = ft.is_file()
                            || (ft.is_symlink() && entry.path().is_file());
                        (is_file && filter.accepts(entry.path()))
                            .then(|| entry.into_path())
                    }
                    Err(e) => {
                        warn!(error = %e, "skipping unreadable directory");
                        None
                    }
                })
                .collect()
        })
    }
}

/// Scans include directories for image files through a swappable backend.
pub struct DirectoryScanner {
    backend: Box<dyn WalkBackend>,
    extensions: Vec<String>,
}

impl DirectoryScanner {
    /// Build a scanner for `method`, resolving `Auto` by probing the core
    /// count.
    pub fn new(
        method: ScanMethod,
        extensions: &[String],
        pool: Arc<WorkerPool>,
    ) -> Self {
        let backend: Box<dyn WalkBackend> =
            match method.resolve(num_cpus::get()) {
                ScanMethod::Parallel => Box::new(ParallelWalker::new(pool)),
                _ => Box::new(PortableWalker),
            };
        Self::with_backend(backend, extensions)
    }

    pub fn with_backend(
        backend: Box<dyn WalkBackend>,
        extensions: &[String],
    ) -> Self {
        let extensions = if extensions.is_empty() {
            DEFAULT_EXTENSIONS.iter().map(|e| e.to_string()).collect()
        } else {
            extensions.to_vec()
        };
        Self {
            backend,
            extensions,
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Walk every include directory, skipping excluded subtrees, and return
    /// the normalized, deduplicated list of image paths.
    ///
    /// An empty include set is a configuration error. Include roots that do
    /// not exist are logged and skipped.
    pub fn scan(
        &self,
        include: &[PathBuf],
        exclude: &[PathBuf],
    ) -> Result<ScanOutcome> {
        if include.is_empty() {
            return Err(Error::Config(
                "no include directories configured".into(),
            ));
        }

        let start = Instant::now();
        let filter = ScanFilter::new(exclude, &self.extensions);
        let mut found = BTreeSet::new();

        for dir in include {
            let root = match dir.canonicalize() {
                Ok(root) if root.is_dir() => root,
                Ok(_) => {
                    warn!(dir = %dir.display(), "include path is not a directory");
                    continue;
                }
                Err(e) => {
                    warn!(dir = %dir.display(), error = %e, "skipping missing include directory");
                    continue;
                }
            };
            let files = self.backend.walk(&root, &filter);
            debug!(dir = %root.display(), count = files.len(), "walked include directory");
            found.extend(files.iter().map(|p| normalize_path(p)));
        }

        let outcome = ScanOutcome {
            paths: found.into_iter().collect(),
            elapsed: start.elapsed(),
        };
        info!(
            backend = self.backend.name(),
            images = outcome.paths.len(),
            elapsed_ms = outcome.elapsed.as_millis() as u64,
            "scan complete"
        );
        Ok(outcome)
    }
}

impl fmt::Debug for DirectoryScanner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectoryScanner")
            .field("backend", &self.backend.name())
            .field("extensions", &self.extensions)
            .finish()
    }
}

/// Render a path with forward slashes, dropping the Windows verbatim prefix
/// that `canonicalize` adds.
pub fn normalize_path(path: &Path) -> String {
    normalize_path_str(&path.to_string_lossy())
}

pub fn normalize_path_str(path: &str) -> String {
    let normalized = path.replace('\\', "/");
    match normalized.strip_prefix("//?/") {
        Some(rest) => rest.to_string(),
        None => normalized,
    }
}

fn normalize_extensions(extensions: &[String]) -> Vec<String> {
    extensions
        .iter()
        .map(|e| e.trim().trim_start_matches('.').to_ascii_lowercase())
        .filter(|e| !e.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> Arc<WorkerPool> {
        Arc::new(WorkerPool::new(Some(2)).unwrap())
    }

    fn scanners() -> Vec<DirectoryScanner> {
        vec![
            DirectoryScanner::with_backend(Box::new(PortableWalker), &[]),
            DirectoryScanner::with_backend(
                Box::new(ParallelWalker::new(pool())),
                &[],
            ),
        ]
    }

    fn touch(path: &Path) {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, b"x").unwrap();
    }

    fn canonical(dir: &Path) -> String {
        normalize_path(&dir.canonicalize().unwrap())
    }

    #[test]
    fn finds_only_recognized_extensions() {
        let tmp = tempfile::tempdir().unwrap();
        touch(&tmp.path().join("a.jpg"));
        touch(&tmp.path().join("b.PNG"));
        touch(&tmp.path().join("c.gif"));
        touch(&tmp.path().join("notes.txt"));
        touch(&tmp.path().join("sub/deep/d.bmp"));
        touch(&tmp.path().join("sub/e.jpeg"));

        let root = canonical(tmp.path());
        let expected = vec![
            format!("{root}/a.jpg"),
            format!("{root}/b.PNG"),
            format!("{root}/c.gif"),
            format!("{root}/sub/deep/d.bmp"),
            format!("{root}/sub/e.jpeg"),
        ];

        for scanner in scanners() {
            let outcome =
                scanner.scan(&[tmp.path().to_path_buf()], &[]).unwrap();
            assert_eq!(outcome.paths, expected, "{}", scanner.backend_name());
        }
    }

    #[test]
    fn does_not_descend_into_excluded_directories() {
        let tmp = tempfile::tempdir().unwrap();
        touch(&tmp.path().join("keep.jpg"));
        touch(&tmp.path().join("skip/drop.jpg"));
        touch(&tmp.path().join("skip/nested/drop2.png"));

        let root = canonical(tmp.path());
        for scanner in scanners() {
            let outcome = scanner
                .scan(
                    &[tmp.path().to_path_buf()],
                    &[tmp.path().join("skip")],
                )
                .unwrap();
            assert_eq!(outcome.paths, vec![format!("{root}/keep.jpg")]);
        }
    }

    #[test]
    fn excluded_include_root_yields_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        touch(&tmp.path().join("a.jpg"));

        for scanner in scanners() {
            let outcome = scanner
                .scan(&[tmp.path().to_path_buf()], &[tmp.path().to_path_buf()])
                .unwrap();
            assert!(outcome.paths.is_empty());
        }
    }

    #[test]
    fn overlapping_includes_are_deduplicated() {
        let tmp = tempfile::tempdir().unwrap();
        touch(&tmp.path().join("top.jpg"));
        touch(&tmp.path().join("inner/nested.png"));

        let root = canonical(tmp.path());
        for scanner in scanners() {
            let outcome = scanner
                .scan(
                    &[
                        tmp.path().to_path_buf(),
                        tmp.path().join("inner"),
                        tmp.path().to_path_buf(),
                    ],
                    &[],
                )
                .unwrap();
            assert_eq!(
                outcome.paths,
                vec![
                    format!("{root}/inner/nested.png"),
                    format!("{root}/top.jpg"),
                ]
            );
        }
    }

    #[test]
    fn skips_resource_fork_files() {
        let tmp = tempfile::tempdir().unwrap();
        touch(&tmp.path().join("._photo.jpg"));
        touch(&tmp.path().join("photo.jpg"));

        for scanner in scanners() {
            let outcome =
                scanner.scan(&[tmp.path().to_path_buf()], &[]).unwrap();
            assert_eq!(outcome.paths.len(), 1);
            assert!(outcome.paths[0].ends_with("/photo.jpg"));
        }
    }

    #[test]
    fn backends_skip_a_root_they_cannot_read() {
        let tmp = tempfile::tempdir().unwrap();
        let filter = ScanFilter::new(&[], &["jpg".to_string()]);
        let gone = tmp.path().join("vanished");

        let backends: Vec<Box<dyn WalkBackend>> =
            vec![Box::new(PortableWalker), Box::new(ParallelWalker::new(pool()))];
        for backend in backends {
            assert!(backend.walk(&gone, &filter).is_empty(), "{}", backend.name());
        }
    }

    #[cfg(unix)]
    #[test]
    fn unreadable_subdirectory_is_skipped() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        touch(&tmp.path().join("ok.jpg"));
        touch(&tmp.path().join("locked/inside.jpg"));
        let locked = tmp.path().join("locked");
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o000))
            .unwrap();
        // Permission bits do not apply to root.
        let readable = std::fs::read_dir(&locked).is_ok();

        let root = canonical(tmp.path());
        let mut expected = vec![format!("{root}/ok.jpg")];
        if readable {
            expected.insert(0, format!("{root}/locked/inside.jpg"));
        }
        let results: Vec<_> = scanners()
            .iter()
            .map(|scanner| scanner.scan(&[tmp.path().to_path_buf()], &[]))
            .collect();
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o755))
            .unwrap();

        for outcome in results {
            assert_eq!(outcome.unwrap().paths, expected);
        }
    }

    #[cfg(unix)]
    #[test]
    fn backends_agree_on_symlinks() {
        let tmp = tempfile::tempdir().unwrap();
        touch(&tmp.path().join("real/a.jpg"));
        std::os::unix::fs::symlink(tmp.path().join("real"), tmp.path().join("linked"))
            .unwrap();
        std::os::unix::fs::symlink(
            tmp.path().join("real/a.jpg"),
            tmp.path().join("alias.jpg"),
        )
        .unwrap();
        std::os::unix::fs::symlink(
            tmp.path().join("missing.jpg"),
            tmp.path().join("dangling.jpg"),
        )
        .unwrap();

        let root = canonical(tmp.path());
        let expected = vec![format!("{root}/alias.jpg"), format!("{root}/real/a.jpg")];
        for scanner in scanners() {
            let outcome = scanner.scan(&[tmp.path().to_path_buf()], &[]).unwrap();
            assert_eq!(outcome.paths, expected, "{}", scanner.backend_name());
        }
    }

    #[test]
    fn empty_include_set_is_config_error() {
        let scanner =
            DirectoryScanner::with_backend(Box::new(PortableWalker), &[]);
        let err = scanner.scan(&[], &[]).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn missing_include_directory_is_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        touch(&tmp.path().join("a.jpg"));

        let scanner =
            DirectoryScanner::with_backend(Box::new(PortableWalker), &[]);
        let outcome = scanner
            .scan(
                &[tmp.path().join("does-not-exist"), tmp.path().to_path_buf()],
                &[],
            )
            .unwrap();
        assert_eq!(outcome.paths.len(), 1);
    }

    #[test]
    fn custom_extensions_are_case_insensitive() {
        let tmp = tempfile::tempdir().unwrap();
        touch(&tmp.path().join("a.webp"));
        touch(&tmp.path().join("b.jpg"));

        let scanner = DirectoryScanner::with_backend(
            Box::new(PortableWalker),
            &[".WEBP".to_string()],
        );
        let outcome = scanner.scan(&[tmp.path().to_path_buf()], &[]).unwrap();
        assert_eq!(outcome.paths.len(), 1);
        assert!(outcome.paths[0].ends_with("a.webp"));
    }

    #[test]
    fn scan_method_parsing() {
        assert_eq!("default".parse::<ScanMethod>().unwrap(), ScanMethod::Default);
        assert_eq!(
            "Parallel".parse::<ScanMethod>().unwrap(),
            ScanMethod::Parallel
        );
        assert_eq!("auto".parse::<ScanMethod>().unwrap(), ScanMethod::Auto);
        assert!(matches!(
            "Everything".parse::<ScanMethod>(),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn auto_resolves_by_core_count() {
        assert_eq!(ScanMethod::Auto.resolve(1), ScanMethod::Default);
        assert_eq!(ScanMethod::Auto.resolve(8), ScanMethod::Parallel);
        assert_eq!(ScanMethod::Default.resolve(8), ScanMethod::Default);
    }

    #[test]
    fn normalize_replaces_backslashes() {
        assert_eq!(normalize_path_str(r"C:\photos\a.jpg"), "C:/photos/a.jpg");
        assert_eq!(normalize_path_str(r"\\?\C:\photos\a.jpg"), "C:/photos/a.jpg");
        assert_eq!(normalize_path_str("/home/me/a.jpg"), "/home/me/a.jpg");
    }
}
