//! C6 — the directory node chain: a doubly-linked list of metadata blocks,
//! each holding up to 3 `(name, entry_id)` child records for one directory.
use zerocopy::{AsBytes, FromBytes};

use crate::format::{EntryId, MdBlockId, NodeBlockRaw};
use crate::header::Header;
use crate::layout;
use crate::mapping::Mapping;
use crate::node_pool;
use anyhow::Result;

fn list_blocks(mapping: &Mapping) -> u32 {
    Header::list_blocks(mapping.header())
}

fn read_node(mapping: &Mapping, block: MdBlockId) -> NodeBlockRaw {
    let off = layout::node_block_offset(block, list_blocks(mapping));
    NodeBlockRaw::read_from(layout::md_block(mapping.md(), off).as_slice())
        .expect("node block is exactly 1024 bytes")
}

fn write_node(mapping: &mut Mapping, block: MdBlockId, node: &NodeBlockRaw) {
    let off = layout::node_block_offset(block, list_blocks(mapping));
    node.write_to(layout::md_block_mut(mapping.md_mut(), off).as_mut_slice())
        .expect("node block is exactly 1024 bytes");
}

pub fn init(mapping: &mut Mapping, block: MdBlockId, parent: EntryId, self_id: EntryId) {
    write_node(mapping, block, &NodeBlockRaw::empty(self_id, parent));
}

/// Inserts `(entry_id, name)` into the chain starting at `block`, creating
/// a new node block if every block in the chain is full.
pub fn insert(mapping: &mut Mapping, block: MdBlockId, entry_id: EntryId, name: &[u8]) -> Result<()> {
    let mut node = read_node(mapping, block);

    if node.count() == 3 && !has_next(&node) {
        let new_block = node_pool::request(mapping)?;
        node = read_node(mapping, block); // request() may have grown METADATA
        init(mapping, new_block, node.parent(), node.self_id());

        set_previous(mapping, new_block, block);
        set_next(mapping, block, new_block);

        insert(mapping, new_block, entry_id, name)?;
    } else if has_next(&node) {
        let next = node.next();
        insert(mapping, next, entry_id, name)?;
    } else {
        for slot in 0..NodeBlockRaw::SLOTS {
            if node.slot_entry(slot) == 0 {
                node.set_count(node.count() + 1);
                node.set_slot_entry(slot, entry_id);
                node.set_slot_name(slot, name);
                write_node(mapping, block, &node);
                break;
            }
        }
    }
    Ok(())
}

fn has_next(node: &NodeBlockRaw) -> bool {
    node.next_flag != 0
}
fn has_previous(node: &NodeBlockRaw) -> bool {
    node.previous_flag != 0
}

fn set_previous(mapping: &mut Mapping, block: MdBlockId, previous: MdBlockId) {
    let mut node = read_node(mapping, block);
    node.set_previous(previous);
    node.previous_flag = 1;
    write_node(mapping, block, &node);
}

fn set_next(mapping: &mut Mapping, block: MdBlockId, next: MdBlockId) {
    let mut node = read_node(mapping, block);
    node.set_next(next);
    node.next_flag = 1;
    write_node(mapping, block, &node);
}

/// Looks up `name` (with `.`/`..` special-cased) under the chain starting
/// at `block`. Returns `(entry_id, found)`.
pub fn lookup(mapping: &Mapping, block: MdBlockId, name: &[u8]) -> (EntryId, bool) {
    let node = read_node(mapping, block);
    if name == b"." {
        return (node.self_id(), true);
    }
    if name == b".." {
        return (node.parent(), true);
    }
    if node.count() > 0 {
        for slot in 0..NodeBlockRaw::SLOTS {
            if node.slot_name(slot) == name {
                return (node.slot_entry(slot), true);
            }
        }
    }
    if has_next(&node) {
        return lookup(mapping, node.next(), name);
    }
    (0, false)
}

/// Removes the entry chain node holding `entry_id`, starting the scan at
/// the chain's first block.
pub fn remove(mapping: &mut Mapping, block: MdBlockId, entry_id: EntryId) {
    let mut node = read_node(mapping, block);
    for slot in 0..NodeBlockRaw::SLOTS {
        if node.slot_entry(slot) == entry_id {
            node.set_slot_entry(slot, 0);
            node.set_slot_name(slot, b"");
            node.set_count(node.count() - 1);
            let should_delete = node.count() == 0 && (has_previous(&node) || has_next(&node));
            write_node(mapping, block, &node);
            if should_delete {
                delete_node_block(mapping, block);
            }
            return;
        }
    }
    if has_next(&node) {
        remove(mapping, node.next(), entry_id);
    }
}

/// Unlinks `block` from its chain and returns it to the node-block pool,
/// unless it is the chain's sole block.
fn delete_node_block(mapping: &mut Mapping, block: MdBlockId) {
    let node = read_node(mapping, block);

    if has_previous(&node) {
        let mut previous = read_node(mapping, node.previous());
        previous.set_next(node.next());
        previous.next_flag = node.next_flag;
        write_node(mapping, node.previous(), &previous);
        node_pool::insert(mapping, block);
    } else if has_next(&node) {
        let next_block = node.next();
        let mut next = read_node(mapping, next_block);
        next.previous_flag = 0;
        write_node(mapping, next_block, &next);

        // Copy the (now-patched) successor's content into this block, so
        // the chain's head entry id never changes.
        write_node(mapping, block, &next);

        if has_next(&next) {
            let mut next_next = read_node(mapping, next.next());
            next_next.set_previous(block);
            write_node(mapping, next.next(), &next_next);
        }
        node_pool::insert(mapping, next_block);
    }
}

/// Emits every non-empty `(entry_id, name)` slot reachable from `block`.
pub fn list(mapping: &Mapping, block: MdBlockId) -> Vec<(EntryId, Vec<u8>)> {
    let mut out = Vec::new();
    let mut current = block;
    loop {
        let node = read_node(mapping, current);
        for slot in 0..NodeBlockRaw::SLOTS {
            if node.slot_entry(slot) != 0 {
                out.push((node.slot_entry(slot), node.slot_name(slot).to_vec()));
            }
        }
        if has_next(&node) {
            current = node.next();
        } else {
            break;
        }
    }
    out
}
