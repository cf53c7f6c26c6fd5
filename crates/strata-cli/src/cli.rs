use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "strata",
    about = "Strata -- layered content-addressable filesystem engine",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Directory holding objects, refs and `strata.toml`
    #[arg(long, global = true, default_value = ".strata")]
    pub root: PathBuf,

    /// Configuration file, instead of `<root>/strata.toml`
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// Create a Strata root with a default configuration
    Init(InitArgs),
    /// Import a host directory as a layer
    Import(ImportArgs),
    /// Stack a new layer on a target from individual edits
    Apply(ApplyArgs),
    /// List a directory of a target's merged view
    Ls(LsArgs),
    /// Print a file of a target's merged view
    Cat(CatArgs),
    /// Show which layer provides a path
    Stat(StatArgs),
    /// Show the layer chain below a target
    Chain(ChainArgs),
    /// List or materialize a target's merged view
    Export(ExportArgs),
    /// Create, list, or delete refs
    Tag(TagArgs),
    /// List registered layers
    Layers(LayersArgs),
    /// Reclaim layers and blobs no ref reaches
    Gc(GcArgs),
    /// Show engine counters
    Stats(StatsArgs),
    /// Show the effective configuration
    Config(ConfigArgs),
}

#[derive(Args)]
pub struct InitArgs {
    /// Overwrite an existing `strata.toml`
    #[arg(long)]
    pub force: bool,
}

#[derive(Args)]
pub struct ImportArgs {
    pub dir: PathBuf,
    /// Layer to stack the import on (ref, digest or prefix)
    #[arg(short, long)]
    pub parent: Option<String>,
    /// Point this ref at the new layer
    #[arg(short, long)]
    pub tag: Option<String>,
}

#[derive(Args)]
pub struct ApplyArgs {
    /// Base layer (ref, digest or prefix); empty chain if omitted
    pub base: Option<String>,
    /// Write a host file into the layer
    #[arg(long = "write", value_name = "PATH=FILE")]
    pub writes: Vec<String>,
    /// Append a host file to a path
    #[arg(long = "append", value_name = "PATH=FILE")]
    pub appends: Vec<String>,
    #[arg(long = "mkdir", value_name = "PATH")]
    pub mkdirs: Vec<String>,
    #[arg(long = "delete", value_name = "PATH")]
    pub deletes: Vec<String>,
    /// Mark a file executable
    #[arg(long = "chmod-x", value_name = "PATH")]
    pub executables: Vec<String>,
    /// Point this ref at the committed layer
    #[arg(short, long)]
    pub tag: Option<String>,
    /// Abandon the edits if they take longer than this
    #[arg(long, value_name = "MS")]
    pub timeout_ms: Option<u64>,
}

#[derive(Args)]
pub struct LsArgs {
    pub target: String,
    #[arg(default_value = "/")]
    pub path: String,
    /// Show mode, size and providing layer
    #[arg(short, long)]
    pub long: bool,
}

#[derive(Args)]
pub struct CatArgs {
    pub target: String,
    pub path: String,
}

#[derive(Args)]
pub struct StatArgs {
    pub target: String,
    pub path: String,
}

#[derive(Args)]
pub struct ChainArgs {
    pub target: String,
}

#[derive(Args)]
pub struct ExportArgs {
    pub target: String,
    /// Write the view into this directory instead of listing it
    #[arg(short, long)]
    pub out: Option<PathBuf>,
}

#[derive(Args)]
pub struct TagArgs {
    pub name: Option<String>,
    /// Layer the ref points at (ref, digest or prefix)
    pub target: Option<String>,
    #[arg(short = 'd', long)]
    pub delete: bool,
}

#[derive(Args)]
pub struct LayersArgs {
    /// Only layers without children
    #[arg(long)]
    pub tips: bool,
}

#[derive(Args)]
pub struct GcArgs {
    /// Report what would be unregistered without changing anything
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Args)]
pub struct StatsArgs {}

#[derive(Args)]
pub struct ConfigArgs {}
