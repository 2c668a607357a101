//! The command-line surface: one mode flag among seven, plus a positional
//! archive path and a variable number of positional paths. Mirrors the
//! reference `CIBReadArgs`'s mutual-exclusion table, but expressed as a
//! clap `ArgGroup` rather than a hand-rolled bitmask.
use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "cib", version, about = "Pack, inspect and unpack .cib archives")]
#[command(group(clap::ArgGroup::new("mode").required(true).args(["create", "append", "extract", "delete", "query", "metadata", "print"])))]
pub struct Cli {
    /// Create a new archive from PATHS.
    #[arg(short = 'c', long)]
    pub create: bool,

    /// Append/update PATHS in an existing archive.
    #[arg(short = 'a', long)]
    pub append: bool,

    /// Extract PATHS (or everything, if none given) from the archive.
    #[arg(short = 'x', long)]
    pub extract: bool,

    /// Delete PATHS from the archive.
    #[arg(short = 'd', long)]
    pub delete: bool,

    /// Report whether each of PATHS exists in the archive.
    #[arg(short = 'q', long)]
    pub query: bool,

    /// Print every entry's stat metadata.
    #[arg(short = 'm', long = "metadata")]
    pub metadata: bool,

    /// Print the archive's directory structure.
    #[arg(short = 'p', long = "print")]
    pub print: bool,

    /// Compress file contents with gzip (valid only with -c/-a).
    #[arg(short = 'j', long, conflicts_with_all = ["extract", "delete", "query", "metadata", "print"])]
    pub compress: bool,

    #[arg(short = 'v', long)]
    pub verbose: bool,

    /// The .cib archive to operate on.
    pub archive: PathBuf,

    /// Paths to insert, extract, delete or query.
    pub paths: Vec<PathBuf>,
}
