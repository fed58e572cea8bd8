use std::{path::Path, sync::Arc};

use clap::Parser;
use pixseek::{
    ConfigDb,
    DataDir,
    Error,
    FaceGallery,
    Result,
    ScanConfig,
    WorkerPool,
    config_db::{DirRole, validate_setting},
    face_gallery,
    pipeline::{self, Stores},
    provider::Providers,
    search::{self, Query, QueryEngine, QueryKind, SearchParams},
    vector_db::Collection,
    walker::normalize_path,
};
use tracing_subscriber::EnvFilter;

mod cli;

use cli::{Cli, Command, ConfigAction, DirAction, FacesAction};

fn init_tracing(verbose: u8, quiet: bool) {
    let filter = if let Ok(env) = std::env::var("PIXSEEK_LOG") {
        EnvFilter::new(env)
    } else if quiet {
        EnvFilter::new("warn")
    } else {
        match verbose {
            0 => EnvFilter::new("info"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

/// Feature providers compiled into this binary. Neural inference is not
/// bundled, so commands that need it fail with an explicit error.
fn linked_providers() -> Providers<'static> {
    Providers::default()
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    let data_dir = DataDir::resolve(cli.data_dir.as_deref())?;
    let config_db = ConfigDb::open(&data_dir.config_db())?;

    match cli.command {
        Command::Dir { action } => match action {
            DirAction::Add { path, exclude } => {
                dir_add(&config_db, &path, exclude)?;
            }
            DirAction::Remove { path } => {
                dir_remove(&config_db, &path)?;
            }
            DirAction::List { json } => {
                dir_list(&config_db, json)?;
            }
        },
        Command::Config { action } => match action {
            ConfigAction::Set { key, value } => {
                validate_setting(&key, &value)?;
                config_db.set_setting(&key, value.trim())?;
                println!("Set {key} = {}", value.trim());
            }
            ConfigAction::Show { json } => {
                config_show(&config_db, json)?;
            }
        },
        Command::Scan => {
            cmd_scan(&config_db, &data_dir)?;
        }
        Command::Index { scan } => {
            cmd_index(&config_db, &data_dir, scan)?;
        }
        Command::Prune => {
            let mut stores = Stores::open(&data_dir)?;
            let report = pipeline::prune(&mut stores).map_err(needs_scan)?;
            println!(
                "Pruned {} image, {} text and {} keyword entries",
                report.image_pruned, report.text_pruned, report.keyword_pruned
            );
        }
        Command::Reset => {
            let removed = pipeline::reset(&data_dir)?;
            if removed.is_empty() {
                println!("No index to delete.");
            } else {
                for file in &removed {
                    println!("Deleted {}", file.display());
                }
            }
        }
        Command::Search(args) => {
            cmd_search(&data_dir, &args)?;
        }
        Command::Faces { action } => match action {
            FacesAction::Encode { dir } => {
                let encoder = linked_providers().faces()?;
                let gallery = face_gallery::encode_faces(&dir, encoder)?;
                gallery.save(&data_dir.face_gallery())?;
                println!("Encoded {} face(s)", gallery.len());
            }
            FacesAction::List { json } => {
                let gallery =
                    pipeline::load_gallery(&data_dir)?.unwrap_or_default();
                faces_list(&gallery, json)?;
            }
            FacesAction::Remove { name } => {
                faces_remove(&data_dir, &name)?;
            }
        },
        Command::Status(args) => {
            cmd_status(&config_db, &data_dir, args.json)?;
        }
        Command::Completions(args) => {
            args.generate();
        }
    }

    Ok(())
}

fn dir_add(config_db: &ConfigDb, path: &Path, exclude: bool) -> Result<()> {
    let role = if exclude {
        DirRole::Exclude
    } else {
        DirRole::Include
    };
    let resolved = match path.canonicalize() {
        Ok(abs) if abs.is_dir() => abs,
        Ok(_) => {
            return Err(Error::Config(format!(
                "not a directory: {}",
                path.display()
            )));
        }
        // Exclusions may name directories that do not exist yet.
        Err(_) if exclude => path.to_path_buf(),
        Err(_) => {
            return Err(Error::Config(format!(
                "directory does not exist: {}",
                path.display()
            )));
        }
    };

    let key = normalize_path(&resolved);
    config_db.set_directory(&key, role)?;
    println!("Added {} directory {key}", role.as_str());
    Ok(())
}

fn dir_remove(config_db: &ConfigDb, path: &Path) -> Result<()> {
    let candidates = [
        normalize_path(path),
        path.canonicalize()
            .map(|p| normalize_path(&p))
            .unwrap_or_default(),
    ];
    for key in candidates.iter().filter(|k| !k.is_empty()) {
        if config_db.remove_directory(key)? {
            println!("Removed directory {key}");
            return Ok(());
        }
    }
    Err(Error::NotFound {
        kind: "directory",
        name: path.display().to_string(),
    })
}

fn dir_list(config_db: &ConfigDb, json: bool) -> Result<()> {
    let dirs = config_db.list_directories()?;

    if json {
        let entries: Vec<_> = dirs
            .iter()
            .map(|(path, role)| {
                serde_json::json!({ "path": path, "role": role.as_str() })
            })
            .collect();
        println!("{}", serde_json::to_string(&entries)?);
    } else if dirs.is_empty() {
        println!("No directories configured.");
    } else {
        for (path, role) in &dirs {
            println!("{}\t{path}", role.as_str());
        }
    }
    Ok(())
}

fn config_show(config_db: &ConfigDb, json: bool) -> Result<()> {
    let config = ScanConfig::from_db(config_db)?;

    if json {
        let value = serde_json::json!({
            "include": config.include,
            "exclude": config.exclude,
            "scan_method": config.method.to_string(),
            "deep_scan": config.deep_scan,
            "extensions": config.extensions,
            "max_workers": config.max_workers,
        });
        println!("{}", serde_json::to_string(&value)?);
    } else {
        println!("scan_method: {}", config.method);
        println!("deep_scan: {}", config.deep_scan);
        println!("extensions: {}", config.extensions.join(","));
        match config.max_workers {
            Some(n) => println!("max_workers: {n}"),
            None => println!("max_workers: (all cores)"),
        }
        println!("include: {}", config.include.len());
        println!("exclude: {}", config.exclude.len());
    }
    Ok(())
}

fn cmd_scan(config_db: &ConfigDb, data_dir: &DataDir) -> Result<()> {
    let config = ScanConfig::from_db(config_db)?;
    let pool = Arc::new(WorkerPool::new(config.max_workers)?);
    let path_index = pixseek::PathIndex::new(data_dir.path_index());
    scan(&config, &path_index, pool)
}

fn scan(
    config: &ScanConfig,
    path_index: &pixseek::PathIndex,
    pool: Arc<WorkerPool>,
) -> Result<()> {
    let report = pipeline::scan_and_save(config, path_index, pool)?;
    println!(
        "Saved {} image path(s) in {:.2}s ({} scanner)",
        report.paths,
        report.elapsed.as_secs_f64(),
        report.backend
    );
    Ok(())
}

fn cmd_index(config_db: &ConfigDb, data_dir: &DataDir, rescan: bool) -> Result<()> {
    let config = ScanConfig::from_db(config_db)?;
    let pool = Arc::new(WorkerPool::new(config.max_workers)?);
    let mut stores = Stores::open(data_dir)?;

    if rescan {
        scan(&config, &stores.path_index, pool.clone())?;
    }
    let report = pipeline::build_index(&mut stores, linked_providers(), &pool)
        .map_err(needs_scan)?;
    println!(
        "Indexed {} image(s) ({} with text), {} up to date, {} failed, {} pruned",
        report.indexed,
        report.text_indexed,
        report.up_to_date,
        report.failed,
        report.pruned.total()
    );
    Ok(())
}

fn cmd_search(data_dir: &DataDir, args: &cli::SearchArgs) -> Result<()> {
    let stores = Stores::open(data_dir)?;
    let gallery = if args.face {
        pipeline::load_gallery(data_dir)?
    } else {
        None
    };

    let query = if args.face {
        Query::new(QueryKind::Face, &args.query)?
    } else if args.ocr {
        Query::new(QueryKind::OcrSemantic, &args.query)?
    } else {
        Query::parse(&args.query)?
    };
    let params = SearchParams {
        top_k: args.count,
        threshold: args.threshold,
    };

    let engine = QueryEngine {
        vector_db: &stores.vector_db,
        keyword: &stores.keyword,
        path_index: &stores.path_index,
        gallery: gallery.as_ref(),
        providers: linked_providers(),
    };
    let results = engine.run(&query, params).map_err(needs_scan)?;

    if args.json {
        search::format_json(&results, &query)?;
    } else if args.files {
        search::format_files(&results);
    } else {
        search::format_human(&results);
    }
    Ok(())
}

fn faces_list(gallery: &FaceGallery, json: bool) -> Result<()> {
    let names: Vec<&str> = gallery.names().collect();
    if json {
        println!("{}", serde_json::to_string(&names)?);
    } else if names.is_empty() {
        println!("No known faces.");
    } else {
        for name in names {
            println!("{name}");
        }
    }
    Ok(())
}

fn faces_remove(data_dir: &DataDir, name: &str) -> Result<()> {
    let path = data_dir.face_gallery();
    let mut gallery = FaceGallery::load(&path)?;
    if !gallery.remove(name) {
        return Err(Error::NotFound {
            kind: "face",
            name: name.to_string(),
        });
    }
    gallery.save(&path)?;
    println!("Removed face '{name}'");
    Ok(())
}

fn cmd_status(
    config_db: &ConfigDb,
    data_dir: &DataDir,
    json: bool,
) -> Result<()> {
    let dirs = config_db.list_directories()?;
    let include = dirs.iter().filter(|(_, r)| *r == DirRole::Include).count();
    let exclude = dirs.len() - include;
    let stores = Stores::open(data_dir)?;
    let paths = match stores.path_index.load() {
        Ok(records) => Some(records.len()),
        Err(e) if e.is_not_found() => None,
        Err(e) => return Err(e),
    };
    let images = stores.vector_db.count(Collection::Image)?;
    let texts = stores.vector_db.count(Collection::Text)?;
    let keywords = stores.keyword.len();
    let faces = pipeline::load_gallery(data_dir)?.map_or(0, |g| g.len());

    if json {
        let value = serde_json::json!({
            "data_dir": data_dir.root(),
            "include_dirs": include,
            "exclude_dirs": exclude,
            "scanned_paths": paths,
            "image_vectors": images,
            "text_vectors": texts,
            "keyword_documents": keywords,
            "faces": faces,
        });
        println!("{}", serde_json::to_string(&value)?);
    } else {
        println!("Data directory: {}", data_dir.root().display());
        println!("Directories: {include} included, {exclude} excluded");
        match paths {
            Some(n) => println!("Scanned paths: {n}"),
            None => println!("Scanned paths: (never scanned)"),
        }
        println!("Image vectors: {images}");
        println!("Text vectors: {texts}");
        println!("Keyword documents: {keywords}");
        println!("Known faces: {faces}");
    }
    Ok(())
}

/// Point the user at `scan` when the path index has never been written.
fn needs_scan(e: Error) -> Error {
    match e {
        Error::NotFound {
            kind: "path index", ..
        } => Error::Config(
            "no scan has been saved yet; run `pixseek scan` or \
             `pixseek index --scan` first"
                .to_string(),
        ),
        other => other,
    }
}
