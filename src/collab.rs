//! C9 — collaborators: host-filesystem introspection and the gzip/gunzip
//! compression helpers. Kept separate from the archive's own on-disk logic
//! so the operations in `ops` stay about *what* to insert or extract, not
//! *how* to read the host filesystem or spawn processes.
use std::ffi::CString;
use std::fs::Metadata;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use nix::sys::wait::waitpid;
use nix::unistd::{dup2, execvp, fork, getpid, ForkResult, Pid};

use crate::error::CibError;
use crate::format::{mode_class, EntryRaw, ModeClass};

/// `lstat`-equivalent: never follows a trailing symlink.
pub fn stat(path: &Path) -> Result<Metadata> {
    std::fs::symlink_metadata(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            CibError::PathDoesNotExist(path.to_path_buf()).into()
        } else {
            anyhow::Error::new(e).context(format!("stat {}", path.display()))
        }
    })
}

pub fn entry_mode_class(meta: &Metadata) -> ModeClass {
    mode_class(meta.mode())
}

/// Captures the stat subset an Entry record stores (§3): uid/gid/mode and
/// the three POSIX timestamps, truncated to u32 the way the on-disk format
/// requires.
pub fn to_entry(meta: &Metadata) -> EntryRaw {
    let mut e = EntryRaw::zeroed();
    e.uid = meta.uid().to_le_bytes();
    e.gid = meta.gid().to_le_bytes();
    e.mode = meta.mode().to_le_bytes();
    e.created = (meta.ctime().max(0) as u32).to_le_bytes();
    e.modified = (meta.mtime().max(0) as u32).to_le_bytes();
    e.accessed = (meta.atime().max(0) as u32).to_le_bytes();
    e
}

/// Lists a directory's immediate children, sorted by name so traversal
/// order is deterministic across runs.
pub fn list_dir(path: &Path) -> Result<Vec<PathBuf>> {
    let mut entries: Vec<PathBuf> = std::fs::read_dir(path)
        .with_context(|| format!("reading directory {}", path.display()))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .collect();
    entries.sort();
    Ok(entries)
}

pub fn create_dir(path: &Path) -> Result<()> {
    match std::fs::create_dir(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(e).with_context(|| format!("creating directory {}", path.display())),
    }
}

pub fn create_dir_all(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path).with_context(|| format!("creating directory {}", path.display()))
}

/// A handle to child processes forked for compression/decompression,
/// joined exactly once at the enclosing operation's return path (§5, §9's
/// redesign note: an explicit handle rather than a bare counter).
#[derive(Default)]
pub struct PendingChildren(Vec<Pid>);

impl PendingChildren {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, pid: Pid) {
        self.0.push(pid);
    }

    pub fn wait_all(&mut self) -> Result<()> {
        for pid in self.0.drain(..) {
            waitpid(pid, None).with_context(|| format!("waiting for child process {pid}"))?;
        }
        Ok(())
    }
}

impl Drop for PendingChildren {
    fn drop(&mut self) {
        // Best-effort: an error path that skips the explicit wait_all()
        // call must still not leave zombies behind.
        let _ = self.wait_all();
    }
}

/// Re-execs the current child process image as `cmd`, never returning.
/// Built from an `execute`-constructed `Command` so the argv the reference
/// implementation hardcodes (`gzip -f -c`, `gunzip -f`) lives in one place.
fn exec_command(cmd: &std::process::Command) -> ! {
    let program = cmd.get_program().as_bytes();
    let prog = CString::new(program).expect("program name has no NUL bytes");
    let mut argv = vec![prog.clone()];
    argv.extend(
        cmd.get_args()
            .map(|a| CString::new(a.as_bytes()).expect("argument has no NUL bytes")),
    );
    let _ = execvp(&prog, &argv);
    std::process::exit(127);
}

fn compressed_temp_path(path: &Path, pid: Pid) -> PathBuf {
    path.parent()
        .unwrap_or_else(|| Path::new("."))
        .join(pid.to_string())
}

/// Forks a child that compresses `path` with gzip, writing the compressed
/// bytes to a temp file named after the child's own pid inside `path`'s
/// parent directory — the reference implementation's naming convention.
/// Returns the temp file's path (computable in the parent immediately,
/// since `fork` hands back the child's pid synchronously) and the child's
/// pid; callers must join that pid through a `PendingChildren` barrier
/// before reading the temp file.
///
/// Between `fork` and `exec` the child only opens its output file and
/// `dup2`s it onto fd 1 — anything more is unsound to run post-fork in a
/// multi-threaded process.
pub fn spawn_compress(path: &Path) -> Result<(PathBuf, Pid)> {
    match unsafe { fork() }.context("forking compression child")? {
        ForkResult::Parent { child } => Ok((compressed_temp_path(path, child), child)),
        ForkResult::Child => {
            let output = compressed_temp_path(path, getpid());
            let file = match std::fs::File::create(&output) {
                Ok(f) => f,
                Err(_) => std::process::exit(1),
            };
            if dup2(file.as_raw_fd(), 1).is_err() {
                std::process::exit(1);
            }
            let mut cmd = execute::command!("gzip -f -c");
            cmd.arg(path);
            exec_command(&cmd);
        }
    }
}

/// Forks a child that decompresses the `.gz` file at `gz_path` in place
/// (`gunzip -f` drops the suffix on success). Returns the child's pid.
pub fn spawn_decompress(gz_path: &Path) -> Result<Pid> {
    match unsafe { fork() }.context("forking decompression child")? {
        ForkResult::Parent { child } => Ok(child),
        ForkResult::Child => {
            let mut cmd = execute::command!("gunzip -f");
            cmd.arg(gz_path);
            exec_command(&cmd);
        }
    }
}
