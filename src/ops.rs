//! C8 — archive operations: the seven verbs the CLI exposes, each opening
//! (or creating) the archive, doing its work through C1–C7, and delegating
//! host-filesystem and compression work to C9.
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use is_terminal::IsTerminal;
use log::{info, warn};

use crate::collab::{self, PendingChildren};
use crate::data_alloc;
use crate::entries;
use crate::error::CibError;
use crate::format::{mode_class, EntryId, EntryRaw, MdBlockId, ModeClass, DATA_BLOCK_SIZE, MD_BLOCK_SIZE};
use crate::header::{self, Header};
use crate::mapping::Mapping;
use crate::node_pool;
use crate::nodechain;
use crate::path;

/// Lexically collapses `.`/`..` components without touching the
/// filesystem (mirrors the reference `RealPath`'s `strtok`-based scan).
fn real_path(path: &Path) -> PathBuf {
    let mut stack: Vec<Component> = Vec::new();
    for comp in path.components() {
        match comp {
            Component::ParentDir => {
                stack.pop();
            }
            Component::CurDir => {}
            other => stack.push(other),
        }
    }
    stack.into_iter().collect()
}

/// Expresses a host path (absolute or cwd-relative) relative to
/// `base_dir`, rejecting anything outside it (`CreateRelativePath`,
/// `cli_utils.c`).
fn normalize_relative(path: &Path, base_dir: &Path) -> Result<PathBuf> {
    let full = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .context("reading current directory")?
            .join(path)
    };
    let real = real_path(&full);
    let rel = real.strip_prefix(base_dir).map_err(|_| CibError::NotUnderBaseDir {
        path: real.clone(),
        base_dir: base_dir.to_path_buf(),
    })?;
    Ok(if rel.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        rel.to_path_buf()
    })
}

/// Opens an existing archive, re-deriving the header's true size from its
/// variable-length `base_dir` field (the file is first mapped whole so
/// that field is readable at all, then remapped to the real split).
fn open_archive(path: &Path) -> Result<Mapping> {
    let mut mapping = Mapping::open_existing(path)?;
    let file_len = std::fs::metadata(path)
        .with_context(|| format!("reading metadata of {}", path.display()))?
        .len();
    mapping.remap(file_len, 0, 0)?;
    let data_size = Header::data_size(mapping.header());
    let md_size = Header::md_size(mapping.header());
    let base_dir = Header::base_dir(mapping.header());
    let header_size = Header::needed_size(&base_dir);
    mapping.remap(header_size, data_size, md_size)?;
    Ok(mapping)
}

/// Walks `rel`'s path components under `base_dir`/cwd, inserting every
/// ancestor as a bare directory if it doesn't exist yet, then inserts the
/// final component with its real content (`CIBRecInsertEntry`).
fn insert_path_tree(
    mapping: &mut Mapping,
    rel: &Path,
    compress: bool,
    children: &mut PendingChildren,
    pending_compressed: &mut Vec<(EntryId, PathBuf)>,
) -> Result<()> {
    let components: Vec<&std::ffi::OsStr> = rel
        .components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s),
            _ => None,
        })
        .collect();
    let Some((leaf, ancestors)) = components.split_last() else {
        return Ok(());
    };

    let mut current_id: EntryId = 0;
    let mut current_host = PathBuf::new();
    for comp in ancestors {
        current_host.push(comp);
        let meta = collab::stat(&current_host)?;
        if collab::entry_mode_class(&meta) != ModeClass::Dir {
            return Err(CibError::CannotInsertPath(current_host.clone()).into());
        }
        let entry = collab::to_entry(&meta);
        let (id, inserted) = path::update(mapping, &entry, &comp.to_string_lossy(), current_id)?;
        if !inserted {
            return Err(CibError::CannotInsertPath(current_host.clone()).into());
        }
        current_id = id;
    }

    current_host.push(leaf);
    insert_entry_tree(
        mapping,
        current_id,
        leaf,
        &current_host,
        compress,
        children,
        pending_compressed,
    )?;
    Ok(())
}

/// Inserts one host filesystem entry (and, if it's a directory, its whole
/// subtree) under `parent_id` (`CIBInsertDirectory`). Compressed files are
/// not read into DATA here: the compression child is only spawned, and
/// `(entry_id, temp_path)` is recorded for the caller to finish after the
/// operation's single wait-for-all-children barrier.
fn insert_entry_tree(
    mapping: &mut Mapping,
    parent_id: EntryId,
    name: &std::ffi::OsStr,
    host_path: &Path,
    compress: bool,
    children: &mut PendingChildren,
    pending_compressed: &mut Vec<(EntryId, PathBuf)>,
) -> Result<EntryId> {
    let meta = collab::stat(host_path)?;
    let entry = collab::to_entry(&meta);
    let (id, inserted) = path::update(mapping, &entry, &name.to_string_lossy(), parent_id)?;
    if !inserted {
        return Err(CibError::CannotInsertPath(host_path.to_path_buf()).into());
    }

    match collab::entry_mode_class(&meta) {
        ModeClass::Dir => {
            for child_path in collab::list_dir(host_path)? {
                let Some(child_name) = child_path.file_name().map(|n| n.to_owned()) else {
                    continue;
                };
                if let Err(e) = insert_entry_tree(
                    mapping,
                    id,
                    &child_name,
                    &child_path,
                    compress,
                    children,
                    pending_compressed,
                ) {
                    warn!("skipping {}: {e:#}", child_path.display());
                }
            }
        }
        ModeClass::Symlink => {
            let block = data_alloc::insert_link(mapping, host_path)?;
            entries::set_pointer(mapping, id, block);
        }
        ModeClass::File => {
            if compress {
                let (temp, pid) = collab::spawn_compress(host_path)
                    .map_err(|_| CibError::CannotCompress(host_path.to_path_buf()))?;
                children.push(pid);
                pending_compressed.push((id, temp));
            } else {
                let block = data_alloc::insert_file(mapping, host_path, false)?;
                entries::set_pointer(mapping, id, block);
            }
        }
    }
    Ok(id)
}

/// Reads back every compressed payload once its child has exited and
/// writes it into DATA, deleting the pid-named temp file afterward.
fn finish_compressed_inserts(mapping: &mut Mapping, pending: Vec<(EntryId, PathBuf)>) -> Result<()> {
    for (id, temp) in pending {
        let block = data_alloc::insert_file(mapping, &temp, true)?;
        entries::set_pointer(mapping, id, block);
        let _ = std::fs::remove_file(&temp);
    }
    Ok(())
}

fn init_fresh_archive(mapping: &mut Mapping, base_dir_str: &str) -> Result<()> {
    let header_size = Header::needed_size(base_dir_str);
    mapping.remap(header_size, DATA_BLOCK_SIZE as u64, 2 * MD_BLOCK_SIZE as u64)?;
    Header::init(mapping.header_mut(), base_dir_str);
    data_alloc::init(mapping, 1);
    Header::set_list_blocks(mapping.header_mut(), 1);
    entries::init_list_blocks(mapping, 1);
    node_pool::init(mapping, 0);

    let root_meta = collab::stat(Path::new("."))?;
    let root_entry = collab::to_entry(&root_meta);
    entries::init_root(mapping, &root_entry);
    let root_block = node_pool::request(mapping)?;
    nodechain::init(mapping, root_block, 0, 0);
    entries::set_pointer(mapping, 0, root_block as u64);
    Ok(())
}

/// Creates a new archive holding `paths`, relative to the current
/// directory (which becomes the archive's `base_dir`).
pub fn create(archive_path: &Path, paths: &[PathBuf], compress: bool) -> Result<()> {
    info!("create {} ({} paths)", archive_path.display(), paths.len());
    let base_dir = std::env::current_dir().context("reading current directory")?;
    let mut mapping = Mapping::create(archive_path)?;
    init_fresh_archive(&mut mapping, &base_dir.to_string_lossy())?;

    let mut children = PendingChildren::new();
    let mut pending_compressed = Vec::new();
    for path in paths {
        let result = normalize_relative(path, &base_dir)
            .and_then(|rel| insert_path_tree(&mut mapping, &rel, compress, &mut children, &mut pending_compressed));
        if let Err(e) = result {
            warn!("skipping {}: {e:#}", path.display());
        }
    }
    children.wait_all()?;
    finish_compressed_inserts(&mut mapping, pending_compressed)?;
    data_alloc::remove_trailing_free_chunk(&mut mapping)?;
    mapping.sync()?;
    Ok(())
}

/// Appends/updates `paths` in an existing archive, relative to its stored
/// `base_dir` (the process chdir's there first, matching `CIBAppend`).
pub fn append(archive_path: &Path, paths: &[PathBuf], compress: bool) -> Result<()> {
    info!("append {} ({} paths)", archive_path.display(), paths.len());
    let mut mapping = open_archive(archive_path)?;
    let base_dir = PathBuf::from(header::read_base_dir(&mapping));
    std::env::set_current_dir(&base_dir)
        .with_context(|| format!("changing directory to {}", base_dir.display()))?;

    let root_meta = collab::stat(Path::new("."))?;
    let root_entry = collab::to_entry(&root_meta);
    path::update(&mut mapping, &root_entry, ".", 0)?;

    let mut children = PendingChildren::new();
    let mut pending_compressed = Vec::new();
    for path in paths {
        let result = normalize_relative(path, &base_dir)
            .and_then(|rel| insert_path_tree(&mut mapping, &rel, compress, &mut children, &mut pending_compressed));
        if let Err(e) = result {
            warn!("skipping {}: {e:#}", path.display());
        }
    }
    children.wait_all()?;
    finish_compressed_inserts(&mut mapping, pending_compressed)?;
    data_alloc::remove_trailing_free_chunk(&mut mapping)?;
    mapping.sync()?;
    Ok(())
}

/// Deletes `paths` from the archive. Refuses to delete `.` (scenario 6).
pub fn delete(archive_path: &Path, paths: &[PathBuf]) -> Result<()> {
    info!("delete {} ({} paths)", archive_path.display(), paths.len());
    let mut mapping = open_archive(archive_path)?;
    let base_dir = PathBuf::from(header::read_base_dir(&mapping));

    for path in paths {
        if let Err(e) = delete_one(&mut mapping, path, &base_dir) {
            warn!("{e:#}");
        }
    }

    loop {
        let before = mapping.data_size();
        data_alloc::remove_trailing_free_chunk(&mut mapping)?;
        if mapping.data_size() == before {
            break;
        }
    }
    mapping.sync()?;
    Ok(())
}

fn delete_one(mapping: &mut Mapping, path: &Path, base_dir: &Path) -> Result<()> {
    let rel = normalize_relative(path, base_dir)?;
    let rel_str = rel.to_string_lossy().into_owned();
    if rel_str == "." {
        return Err(CibError::CannotDeleteRoot.into());
    }

    let (parent_path, leaf) = path::split_parent_leaf(&rel_str);
    let (parent_id, parent_found) = path::resolve(mapping, 0, &parent_path);
    if !parent_found {
        return Err(CibError::PathNotFoundInArchive(rel_str).into());
    }
    let (entry_id, found) = path::resolve(mapping, parent_id, &leaf);
    if !found {
        return Err(CibError::PathNotFoundInArchive(rel_str).into());
    }
    path::delete(mapping, entry_id, parent_id)
}

/// Extracts the archive's contents into the current directory: everything
/// under root if `paths` is empty, otherwise just the named paths.
pub fn extract(archive_path: &Path, paths: &[PathBuf]) -> Result<()> {
    info!("extract {} ({} paths)", archive_path.display(), paths.len());
    let mapping = open_archive(archive_path)?;
    let mut children = PendingChildren::new();

    if paths.is_empty() {
        extract_rec(&mapping, 0, Path::new("."), &mut children)?;
    } else {
        for path in paths {
            if let Err(e) = extract_one(&mapping, path, &mut children) {
                warn!("skipping {}: {e:#}", path.display());
            }
        }
    }
    children.wait_all()?;
    Ok(())
}

fn extract_one(mapping: &Mapping, path: &Path, children: &mut PendingChildren) -> Result<()> {
    let path_str = path.to_string_lossy();
    let (id, found) = path::resolve(mapping, 0, &path_str);
    if !found {
        return Err(CibError::PathNotFoundInArchive(path_str.into_owned()).into());
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        collab::create_dir_all(parent)?;
    }
    extract_rec(mapping, id, path, children)
}

fn extract_rec(mapping: &Mapping, entry_id: EntryId, dest: &Path, children: &mut PendingChildren) -> Result<()> {
    let entry = entries::read_entry(mapping, entry_id);
    match mode_class(entry.mode()) {
        ModeClass::Dir => {
            collab::create_dir(dest)?;
            for (child_id, name) in nodechain::list(mapping, entry.pointer() as MdBlockId) {
                let name = String::from_utf8_lossy(&name).into_owned();
                extract_rec(mapping, child_id, &dest.join(name), children)?;
            }
        }
        ModeClass::Symlink => data_alloc::extract_link(mapping, entry.pointer(), dest)?,
        ModeClass::File => {
            let zipped = data_alloc::extract_file(mapping, entry.pointer(), dest)?;
            if zipped {
                let mut gz = dest.as_os_str().to_owned();
                gz.push(".gz");
                children.push(collab::spawn_decompress(Path::new(&gz))?);
            }
        }
    }
    Ok(())
}

/// Prints whether each of `paths` exists in the archive, as a colored
/// `EntryId`/`Path` table when stdout is a terminal.
pub fn query(archive_path: &Path, paths: &[PathBuf]) -> Result<()> {
    let mapping = open_archive(archive_path)?;
    let color = std::io::stdout().is_terminal();

    println!("{:<12}{}", "ENTRY ID", "PATH");
    for path in paths {
        let (id, found) = path::resolve(&mapping, 0, &path.to_string_lossy());
        let id_str = if found { id.to_string() } else { "-".to_string() };
        if color {
            let ansi = if found { "\x1b[32m" } else { "\x1b[31m" };
            println!("{ansi}{:<12}{}\x1b[0m", id_str, path.display());
        } else {
            println!("{:<12}{}", id_str, path.display());
        }
    }
    Ok(())
}

fn mode_string(mode: u32) -> String {
    let type_char = match mode_class(mode) {
        ModeClass::Dir => 'd',
        ModeClass::Symlink => 'l',
        ModeClass::File => '-',
    };
    const PERMS: [(u32, char); 9] = [
        (libc::S_IRUSR, 'r'),
        (libc::S_IWUSR, 'w'),
        (libc::S_IXUSR, 'x'),
        (libc::S_IRGRP, 'r'),
        (libc::S_IWGRP, 'w'),
        (libc::S_IXGRP, 'x'),
        (libc::S_IROTH, 'r'),
        (libc::S_IWOTH, 'w'),
        (libc::S_IXOTH, 'x'),
    ];
    let mut s = String::with_capacity(10);
    s.push(type_char);
    for (bit, ch) in PERMS {
        s.push(if mode & bit != 0 { ch } else { '-' });
    }
    s
}

/// Prints the directory tree, indented, with a `drwxrwxrwx`-style mode
/// string per entry (`CIBListPrintStructure`).
pub fn print_structure(archive_path: &Path) -> Result<()> {
    let mapping = open_archive(archive_path)?;
    print_structure_rec(&mapping, 0, ".", 0);
    Ok(())
}

fn print_structure_rec(mapping: &Mapping, entry_id: EntryId, name: &str, depth: usize) {
    let entry = entries::read_entry(mapping, entry_id);
    println!("{}{} {}", "  ".repeat(depth), mode_string(entry.mode()), name);
    if mode_class(entry.mode()) == ModeClass::Dir {
        for (child_id, child_name) in nodechain::list(mapping, entry.pointer() as MdBlockId) {
            let child_name = String::from_utf8_lossy(&child_name).into_owned();
            print_structure_rec(mapping, child_id, &child_name, depth + 1);
        }
    }
}

/// Prints every entry's raw stat fields (`CIBListPrintEntriesMetadata`),
/// discovered by walking the directory tree from root — §8's P6 guarantees
/// every non-root entry has exactly one parent slot, so the tree walk
/// reaches everything a raw bitmap scan would.
pub fn print_metadata(archive_path: &Path) -> Result<()> {
    let mapping = open_archive(archive_path)?;
    println!(
        "{:<10}{:<6}{:<6}{:<12}{:<12}{:<12}{}",
        "ID", "UID", "GID", "CREATED", "MODIFIED", "ACCESSED", "MODE"
    );
    print_metadata_rec(&mapping, 0);
    Ok(())
}

fn print_metadata_rec(mapping: &Mapping, entry_id: EntryId) {
    let entry: EntryRaw = entries::read_entry(mapping, entry_id);
    println!(
        "{:<10}{:<6}{:<6}{:<12}{:<12}{:<12}{}",
        entry_id,
        entry.uid(),
        entry.gid(),
        entry.created(),
        entry.modified(),
        entry.accessed(),
        mode_string(entry.mode())
    );
    if mode_class(entry.mode()) == ModeClass::Dir {
        for (child_id, _) in nodechain::list(mapping, entry.pointer() as MdBlockId) {
            print_metadata_rec(mapping, child_id);
        }
    }
}
