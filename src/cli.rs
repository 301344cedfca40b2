use clap::{Args, Parser, Subcommand, ValueHint};
use std::path::PathBuf;

/// GOL tool CLI (argument schema only)
#[derive(Parser, Debug)]
#[command(name = "gol", version, about, propagate_version = true)]
pub struct Cli {
    /// Increase output verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress progress output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Answer yes to all prompts
    #[arg(short = 'Y', long = "yes", global = true)]
    pub yes: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Build a GOL from an .osm.pbf source file
    Build(BuildArgs),

    /// Show information about a GOL
    Info(InfoArgs),

    /// Check the structural integrity of a GOL
    Check(CheckArgs),
}

#[derive(Args, Debug)]
pub struct BuildArgs {
    /// Output GOL file (".gol" appended if missing)
    #[arg(value_hint = ValueHint::FilePath)]
    pub gol: PathBuf,

    /// Source .osm.pbf file
    #[arg(value_hint = ValueHint::FilePath)]
    pub source: PathBuf,

    /// Zoom levels of the tile pyramid (default: 0/2/4/6/8/10/12)
    #[arg(short = 'l', long)]
    pub levels: Option<String>,

    /// Maximum number of tiles (1 - 8000000)
    #[arg(short = 'm', long)]
    pub max_tiles: Option<i64>,

    /// Minimum node count in a tile to avoid consolidation
    #[arg(short = 'n', long)]
    pub min_tile_density: Option<i64>,

    /// Maximum number of strings in the global string table (256 - 65533)
    #[arg(long)]
    pub max_strings: Option<i64>,

    /// Minimum usage count for a string to enter the global string table
    #[arg(long)]
    pub min_string_usage: Option<i64>,

    /// Rules that decide whether a closed way or relation is an area
    #[arg(long)]
    pub areas: Option<String>,

    /// Keys to consider for tag-based indexing ("/" groups categories)
    #[arg(long)]
    pub indexed_keys: Option<String>,

    /// Maximum number of key-based sub-indexes (0 - 30)
    #[arg(long)]
    pub max_key_indexes: Option<i64>,

    /// Minimum number of features in a key index
    #[arg(long)]
    pub key_index_min_features: Option<i64>,

    /// Maximum items per R-tree branch (4 - 255)
    #[arg(short = 'r', long)]
    pub rtree_branch_size: Option<i64>,

    /// Include IDs of all way-nodes
    #[arg(short = 'w', long)]
    pub waynode_ids: bool,

    /// Enable incremental updates (implies --waynode-ids, keeps indexes)
    #[arg(short = 'u', long)]
    pub updatable: bool,

    /// Keep the work directory after the build
    #[arg(long)]
    pub keep_work: bool,

    /// Number of worker threads (0 = number of cores)
    #[arg(long, default_value_t = 0)]
    pub threads: usize,
}

#[derive(Args, Debug)]
pub struct InfoArgs {
    /// GOL file to inspect
    #[arg(value_hint = ValueHint::FilePath)]
    pub gol: PathBuf,
}

#[derive(Args, Debug)]
pub struct CheckArgs {
    /// GOL file to check
    #[arg(value_hint = ValueHint::FilePath)]
    pub gol: PathBuf,
}
