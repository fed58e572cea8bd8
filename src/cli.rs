use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;

#[derive(Debug, Parser)]
#[command(
    name = "pixseek",
    about = "Multi-modal search over your local image collection"
)]
pub struct Cli {
    /// Override the XDG data directory
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Increase log verbosity (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Manage the directories that are scanned
    Dir {
        #[command(subcommand)]
        action: DirAction,
    },
    /// Show or change scan settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Scan configured directories and rewrite the path index
    Scan,
    /// Embed new and changed images, then prune stale entries
    Index {
        /// Rescan the configured directories first
        #[arg(long)]
        scan: bool,
    },
    /// Remove index entries for files that are no longer on disk
    Prune,
    /// Delete the vector, keyword and path indexes (settings and faces are
    /// kept)
    Reset,
    /// Search indexed images
    Search(SearchArgs),
    /// Manage the known-faces gallery
    Faces {
        #[command(subcommand)]
        action: FacesAction,
    },
    /// Show system status and statistics
    Status(StatusArgs),
    /// Generate shell completions
    #[command(hide = true)]
    Completions(CompletionsArgs),
}

// -- Directory subcommands --

#[derive(Debug, Subcommand)]
pub enum DirAction {
    /// Add a directory to scan, or to skip with --exclude
    Add {
        /// Path to the directory
        path: PathBuf,
        /// Never descend into this directory
        #[arg(long)]
        exclude: bool,
    },
    /// Forget a directory
    Remove {
        /// Path as it was added
        path: PathBuf,
    },
    /// List configured directories
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

// -- Config subcommands --

#[derive(Debug, Subcommand)]
pub enum ConfigAction {
    /// Persist a setting (scan_method, deep_scan, extensions, max_workers)
    Set {
        key: String,
        value: String,
    },
    /// Show the effective scan configuration
    Show {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

// -- Faces subcommands --

#[derive(Debug, Subcommand)]
pub enum FacesAction {
    /// Build the gallery from labeled reference images
    Encode {
        /// Directory of `<name>.jpg` reference images
        dir: PathBuf,
    },
    /// List known names
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Forget a known name
    Remove {
        name: String,
    },
}

// -- Search --

#[derive(Debug, Parser)]
pub struct SearchArgs {
    /// The search query (`|text` for OCR keywords, `#path` for similar
    /// images)
    pub query: String,

    /// Number of results to return
    #[arg(short = 'n', long, default_value = "10")]
    pub count: usize,

    /// Minimum score; defaults depend on the search mode
    #[arg(long)]
    pub threshold: Option<f32>,

    /// Treat the query as `find <name> [activity]`
    #[arg(long, conflicts_with = "ocr")]
    pub face: bool,

    /// Semantic search over OCR text instead of image content
    #[arg(long)]
    pub ocr: bool,

    /// Output results as JSON
    #[arg(long)]
    pub json: bool,

    /// Output only file paths (one per line)
    #[arg(long)]
    pub files: bool,
}

// -- Status --

#[derive(Debug, Parser)]
pub struct StatusArgs {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Completions --

#[derive(Debug, Parser)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    #[arg(value_enum)]
    pub shell: Shell,
}

impl CompletionsArgs {
    /// Generate shell completions and print to stdout.
    pub fn generate(&self) {
        let mut cmd = Cli::command();
        clap_complete::generate(
            self.shell,
            &mut cmd,
            "pixseek",
            &mut std::io::stdout(),
        );
    }
}
