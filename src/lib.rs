//! pixseek - multi-modal search over a local image collection.
//!
//! pixseek scans configured directories for images, embeds them (and any
//! text found in them) through externally supplied feature providers, and
//! answers keyword, text-to-image, image-to-image and face-identity
//! queries.
//!
//! # Quick start
//!
//! ```no_run
//! use pixseek::{ConfigDb, DataDir, ScanConfig, WorkerPool};
//! use pixseek::pipeline::{self, Stores};
//! use pixseek::provider::Providers;
//! use pixseek::search::{QueryEngine, SearchParams};
//! use std::sync::Arc;
//!
//! let data_dir = DataDir::resolve(None).unwrap();
//! let config_db = ConfigDb::open(&data_dir.config_db()).unwrap();
//! let config = ScanConfig::from_db(&config_db).unwrap();
//! let pool = Arc::new(WorkerPool::new(config.max_workers).unwrap());
//!
//! let mut stores = Stores::open(&data_dir).unwrap();
//! pipeline::scan_and_save(&config, &stores.path_index, pool.clone()).unwrap();
//!
//! // Plug in real encoders here; keyword search works without them.
//! let providers = Providers::default();
//! let _ = pipeline::build_index(&mut stores, providers, &pool);
//!
//! let engine = QueryEngine {
//!     vector_db: &stores.vector_db,
//!     keyword: &stores.keyword,
//!     path_index: &stores.path_index,
//!     gallery: None,
//!     providers,
//! };
//! for path in engine.search("|invoice", SearchParams::default()).unwrap() {
//!     println!("{path}");
//! }
//! ```

pub mod config_db;
pub mod data_dir;
pub mod error;
pub mod face_gallery;
pub mod incremental;
pub mod indexing;
pub mod keyword_index;
pub mod ocr_text;
pub mod path_index;
pub mod pipeline;
pub mod provider;
pub mod search;
pub mod vector_db;
pub mod walker;
pub mod workers;

pub use config_db::{ConfigDb, ScanConfig};
pub use data_dir::DataDir;
pub use error::{Error, Result};
pub use face_gallery::FaceGallery;
pub use keyword_index::KeywordIndex;
pub use path_index::PathIndex;
pub use vector_db::VectorDb;
pub use walker::DirectoryScanner;
pub use workers::WorkerPool;
