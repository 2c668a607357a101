//! C7 — path resolver/updater: walks POSIX-style `/`-separated paths,
//! relative to a starting entry id, through C5's entry table and C6's
//! node chains.
use anyhow::Result;

use crate::data_alloc;
use crate::entries;
use crate::format::{mode_class, EntryId, EntryRaw, MdBlockId, ModeClass};
use crate::header::Header;
use crate::mapping::Mapping;
use crate::nodechain;
use crate::node_pool;

fn split_components(path: &str) -> Vec<&str> {
    path.split('/').filter(|c| !c.is_empty()).collect()
}

fn is_dir(entry: &EntryRaw) -> bool {
    mode_class(entry.mode()) == ModeClass::Dir
}

/// Resolves `path` relative to `start_id`. `""`, `"."` and `"/"` resolve to
/// `start_id` itself. Each intermediate component must name a directory;
/// the final component may name anything.
pub fn resolve(mapping: &Mapping, start_id: EntryId, path: &str) -> (EntryId, bool) {
    if path.is_empty() || path == "." || path == "/" {
        return (start_id, true);
    }

    let components = split_components(path);
    let mut current_id = start_id;
    let mut current = entries::read_entry(mapping, current_id);

    for comp in &components {
        if !is_dir(&current) {
            return (0, false);
        }
        let (id, found) = nodechain::lookup(mapping, current.pointer() as MdBlockId, comp.as_bytes());
        if !found {
            return (0, false);
        }
        current_id = id;
        current = entries::read_entry(mapping, current_id);
    }
    (current_id, true)
}

pub(crate) fn split_parent_leaf(path: &str) -> (String, String) {
    match path.trim_end_matches('/').rsplit_once('/') {
        Some((parent, leaf)) => {
            let parent = if parent.is_empty() { "/" } else { parent };
            (parent.to_string(), leaf.to_string())
        }
        None => (".".to_string(), path.to_string()),
    }
}

/// Inserts `entry_id` as `name` under directory `parent_id`'s node chain,
/// allocating a fresh node chain head if `entry_id` is itself a directory.
pub fn insert_under_dir(
    mapping: &mut Mapping,
    entry_id: EntryId,
    parent_id: EntryId,
    name: &[u8],
) -> Result<()> {
    let parent = entries::read_entry(mapping, parent_id);
    nodechain::insert(mapping, parent.pointer() as MdBlockId, entry_id, name)?;

    let entry = entries::read_entry(mapping, entry_id);
    if is_dir(&entry) {
        let block = node_pool::request(mapping)?;
        nodechain::init(mapping, block, parent_id, entry_id);
        entries::set_pointer(mapping, entry_id, block as u64);
    }
    Ok(())
}

/// Inserts or updates the entry named by the last component of `path`,
/// relative to `start_id`. Returns `(entry_id, inserted)`; `inserted` is
/// `false` only on a diagnosed failure (bad parent, mode-class mismatch).
pub fn update(
    mapping: &mut Mapping,
    entry: &EntryRaw,
    path: &str,
    start_id: EntryId,
) -> Result<(EntryId, bool)> {
    let (parent_path, leaf) = split_parent_leaf(path);
    let (parent_id, parent_found) = resolve(mapping, start_id, &parent_path);

    if !parent_found || !is_dir(&entries::read_entry(mapping, parent_id)) {
        log::error!("path {path}: parent is not a directory or does not exist");
        return Ok((0, false));
    }

    let (existing_id, exists) = resolve(mapping, parent_id, &leaf);

    if !exists {
        let new_id = entries::alloc_slot(mapping)?;
        entries::write_entry(mapping, new_id, entry);
        insert_under_dir(mapping, new_id, parent_id, leaf.as_bytes())?;
        return Ok((new_id, true));
    }

    let existing = entries::read_entry(mapping, existing_id);
    if mode_class(existing.mode()) != mode_class(entry.mode()) {
        log::error!("path {path}: cannot update a directory with a file or vice versa");
        return Ok((0, false));
    }
    entries::update_metadata(mapping, existing_id, entry);
    Ok((existing_id, true))
}

/// Deletes every child reachable from directory `entry_id`'s node chain,
/// recursively. The directory's own node-chain blocks are not reclaimed:
/// METADATA may grow but never shrinks below its used prefix.
fn delete_dir_children(mapping: &mut Mapping, entry_id: EntryId) -> Result<()> {
    let entry = entries::read_entry(mapping, entry_id);
    let children = nodechain::list(mapping, entry.pointer() as MdBlockId);
    for (child_id, _name) in children {
        delete(mapping, child_id, entry_id)?;
    }
    Ok(())
}

/// Deletes the entry `entry_id` (found as a child of `parent_id`). If it
/// names a directory, every descendant is deleted first.
pub fn delete(mapping: &mut Mapping, entry_id: EntryId, parent_id: EntryId) -> Result<()> {
    let entry = entries::read_entry(mapping, entry_id);

    if is_dir(&entry) {
        delete_dir_children(mapping, entry_id)?;
    } else {
        data_alloc::delete(mapping, entry.pointer())?;
    }

    let parent = entries::read_entry(mapping, parent_id);
    nodechain::remove(mapping, parent.pointer() as MdBlockId, entry_id);

    entries::free_slot(mapping, entry_id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::DATA_BLOCK_SIZE;
    use tempfile::tempdir;

    fn fresh_archive() -> Mapping {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.cib");
        std::mem::forget(dir);
        let mut m = Mapping::create(&path).unwrap();
        m.remap(64, DATA_BLOCK_SIZE as u64, 2 * DATA_BLOCK_SIZE as u64)
            .unwrap();
        data_alloc::init(&mut m, 1);
        node_pool::init(&mut m, 0);
        Header::set_list_blocks(m.header_mut(), 1);
        entries::init_list_blocks(&mut m, 1);

        let mut root = EntryRaw::zeroed();
        root.mode = (libc::S_IFDIR | 0o755).to_le_bytes();
        entries::init_root(&mut m, &root);
        let block = node_pool::request(&mut m).unwrap();
        nodechain::init(&mut m, block, 0, 0);
        entries::set_pointer(&mut m, 0, block as u64);
        m
    }

    #[test]
    fn resolve_root_dot_and_slash() {
        let m = fresh_archive();
        assert_eq!(resolve(&m, 0, "."), (0, true));
        assert_eq!(resolve(&m, 0, "/"), (0, true));
        assert_eq!(resolve(&m, 0, ""), (0, true));
    }

    #[test]
    fn update_inserts_then_resolves_new_entry() {
        let mut m = fresh_archive();
        let mut file = EntryRaw::zeroed();
        file.mode = (libc::S_IFREG | 0o644).to_le_bytes();

        let (id, inserted) = update(&mut m, &file, "hello.txt", 0).unwrap();
        assert!(inserted);
        assert_eq!(resolve(&m, 0, "hello.txt"), (id, true));
    }

    #[test]
    fn update_rejects_mode_class_mismatch() {
        let mut m = fresh_archive();
        let mut file = EntryRaw::zeroed();
        file.mode = (libc::S_IFREG | 0o644).to_le_bytes();
        update(&mut m, &file, "a", 0).unwrap();

        let mut dir = EntryRaw::zeroed();
        dir.mode = (libc::S_IFDIR | 0o755).to_le_bytes();
        let (_, inserted) = update(&mut m, &dir, "a", 0).unwrap();
        assert!(!inserted);
    }

    #[test]
    fn delete_removes_entry_from_parent() {
        let mut m = fresh_archive();
        let mut file = EntryRaw::zeroed();
        file.mode = (libc::S_IFREG | 0o644).to_le_bytes();
        let (id, _) = update(&mut m, &file, "a", 0).unwrap();

        delete(&mut m, id, 0).unwrap();
        assert_eq!(resolve(&m, 0, "a"), (0, false));
    }
}
