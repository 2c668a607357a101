//! Error taxonomy: the diagnostics `ops` and `collab` raise for a bad path,
//! a compression failure, or a refused operation. Per-path errors here are
//! recoverable by construction — callers log and skip the offending path
//! (§7 "local recovery") rather than abort the whole operation.
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CibError {
    #[error("path {0} does not exist")]
    PathDoesNotExist(PathBuf),

    #[error("{path} is not a subdirectory of {base_dir}")]
    NotUnderBaseDir { path: PathBuf, base_dir: PathBuf },

    #[error("path {0} does not exist inside the archive")]
    PathNotFoundInArchive(String),

    #[error("entity defined by path {0} cannot be inserted")]
    CannotInsertPath(PathBuf),

    #[error("cannot delete '.'")]
    CannotDeleteRoot,

    #[error("cannot compress file {0}, insertion failed")]
    CannotCompress(PathBuf),
}
