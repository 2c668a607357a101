//! C5 — the entry table: a flat array of metadata list blocks indexed
//! through a hierarchical ("nest level") bitmap tree so that slot
//! allocation/free is `O(log₆₄ N)` instead of a linear scan.
//!
//! List blocks are grouped into sets of 64. The physical block that holds
//! the fullness bitmap for a level-`k` set is `first_of_set + k` — at
//! `k == 0` that's the set's own first block, reusing its `list_block_bitmap`
//! field; deeper levels reuse the same field on a block that otherwise also
//! holds ordinary entries. This mirrors the reference allocator exactly.
use anyhow::Result;
use zerocopy::{AsBytes, FromBytes};

use crate::bitmap;
use crate::format::{EntryRaw, ListBlockRaw, MdBlockId, LIST_ENTRIES_PER_BLOCK};
use crate::header::Header;
use crate::layout;
use crate::mapping::Mapping;
use crate::node_pool;

fn read_list_block(mapping: &Mapping, block: MdBlockId) -> ListBlockRaw {
    let off = layout::list_block_offset(block);
    ListBlockRaw::read_from(layout::md_block(mapping.md(), off).as_slice())
        .expect("list block is exactly 1024 bytes")
}

fn write_list_block(mapping: &mut Mapping, block: MdBlockId, lb: &ListBlockRaw) {
    let off = layout::list_block_offset(block);
    lb.write_to(layout::md_block_mut(mapping.md_mut(), off).as_mut_slice())
        .expect("list block is exactly 1024 bytes");
}

/// Allocates a free entry slot, growing the list-block region as needed.
/// Returns the new entry id.
pub fn alloc_slot(mapping: &mut Mapping) -> Result<u64> {
    let nest_level = Header::nest_level(mapping.header());
    let list_blocks = Header::list_blocks(mapping.header());
    let (id, full) = alloc_rec(mapping, list_blocks, 0, nest_level)?;

    if full {
        let new_level = nest_level + 1;
        Header::set_nest_level(mapping.header_mut(), new_level);
        let mut head = read_list_block(mapping, new_level as u32);
        head.set_list_block_bitmap(1);
        write_list_block(mapping, new_level as u32, &head);
    }
    Header::set_list_entries(mapping.header_mut(), Header::list_entries(mapping.header()) + 1);
    Ok(id)
}

fn alloc_rec(
    mapping: &mut Mapping,
    mut list_blocks: u32,
    first_of_set: u32,
    nest_level: u8,
) -> Result<(u64, bool)> {
    if nest_level == 0 {
        let mut head = read_list_block(mapping, first_of_set);
        let mut insert_block = first_of_set + bitmap::find_zero_bit(head.list_block_bitmap());

        if insert_block == list_blocks {
            node_pool::grow_list_blocks(mapping, 1)?;
            list_blocks += 1;
            head = read_list_block(mapping, first_of_set);
            insert_block = first_of_set + bitmap::find_zero_bit(head.list_block_bitmap());
        }

        let mut insert_list = read_list_block(mapping, insert_block);
        let index = bitmap::find_zero_bit(insert_list.bitmap() as u64) as u32;

        insert_list.set_count(insert_list.count() + 1);
        insert_list.set_bitmap(insert_list.bitmap() | (1u32 << index));

        let full = if insert_list.bitmap() == u32::MAX {
            head.set_list_block_bitmap(bitmap::set_bit(
                head.list_block_bitmap(),
                insert_block - first_of_set,
            ));
            let now_full = bitmap::is_full(head.list_block_bitmap());
            write_list_block(mapping, first_of_set, &head);
            now_full
        } else {
            false
        };
        write_list_block(mapping, insert_block, &insert_list);

        let id = insert_block as u64 * LIST_ENTRIES_PER_BLOCK + index as u64;
        return Ok((id, full));
    }

    let mut head = read_list_block(mapping, first_of_set + nest_level as u32);
    let index = bitmap::find_zero_bit(head.list_block_bitmap()) as u32;

    let target_set = first_of_set + (index << (6 * nest_level));
    let target_block = target_set + nest_level as u32 - 1;

    if target_set == list_blocks {
        node_pool::grow_list_blocks(mapping, 1)?;
        list_blocks += 1;
        head = read_list_block(mapping, first_of_set + nest_level as u32);
    }

    let diff = if target_block >= list_blocks {
        target_block - list_blocks + 1
    } else {
        0
    };
    let (id, child_full) = alloc_rec(mapping, list_blocks, target_set, nest_level - 1 - diff as u8)?;

    let full = if child_full {
        let mut head2 = read_list_block(mapping, first_of_set + nest_level as u32);
        head2.set_list_block_bitmap(bitmap::set_bit(head2.list_block_bitmap(), index));
        let now_full = bitmap::is_full(head2.list_block_bitmap());
        write_list_block(mapping, first_of_set + nest_level as u32, &head2);
        now_full
    } else {
        false
    };
    let _ = head;
    Ok((id, full))
}

/// Clears `entry_id`'s slot bit and walks up the levels clearing parent
/// bits if the slot's list block was previously full (§4.5 `free_slot`).
pub fn free_slot(mapping: &mut Mapping, entry_id: u64) {
    let block = (entry_id / LIST_ENTRIES_PER_BLOCK) as u32;
    let index = (entry_id % LIST_ENTRIES_PER_BLOCK) as u32;

    let mut list = read_list_block(mapping, block);
    if list.bitmap() == u32::MAX {
        update_group_bitmap(mapping, block, 0, Header::nest_level(mapping.header()));
        list = read_list_block(mapping, block);
    }
    list.set_bitmap(list.bitmap() & !(1u32 << index));
    list.set_count(list.count() - 1);
    list.entries[index as usize] = EntryRaw::zeroed();
    write_list_block(mapping, block, &list);

    Header::set_list_entries(mapping.header_mut(), Header::list_entries(mapping.header()) - 1);
}

fn update_group_bitmap(mapping: &mut Mapping, inserted_block: u32, nest_level: u8, max_nest: u8) {
    let first_of_set = inserted_block & !((64u32 << (6 * nest_level)) - 1);
    let pos_in_set = inserted_block - first_of_set;

    let mut head = read_list_block(mapping, first_of_set + nest_level as u32);
    let subset = pos_in_set >> (6 * nest_level);

    if bitmap::is_full(head.list_block_bitmap()) && nest_level < max_nest {
        update_group_bitmap(mapping, inserted_block, nest_level + 1, max_nest);
        head = read_list_block(mapping, first_of_set + nest_level as u32);
    }

    head.set_list_block_bitmap(bitmap::clear_bit(head.list_block_bitmap(), subset));
    write_list_block(mapping, first_of_set + nest_level as u32, &head);
}

pub fn read_entry(mapping: &Mapping, entry_id: u64) -> EntryRaw {
    let block = (entry_id / LIST_ENTRIES_PER_BLOCK) as u32;
    let index = (entry_id % LIST_ENTRIES_PER_BLOCK) as usize;
    read_list_block(mapping, block).entries[index]
}

pub fn write_entry(mapping: &mut Mapping, entry_id: u64, entry: &EntryRaw) {
    let block = (entry_id / LIST_ENTRIES_PER_BLOCK) as u32;
    let index = (entry_id % LIST_ENTRIES_PER_BLOCK) as usize;
    let mut lb = read_list_block(mapping, block);
    lb.entries[index] = *entry;
    write_list_block(mapping, block, &lb);
}

pub fn set_pointer(mapping: &mut Mapping, entry_id: u64, pointer: u64) {
    let mut e = read_entry(mapping, entry_id);
    e.set_pointer(pointer);
    write_entry(mapping, entry_id, &e);
}

/// Overwrites an entry's metadata fields in place, preserving `pointer`.
pub fn update_metadata(mapping: &mut Mapping, entry_id: u64, new_entry: &EntryRaw) {
    let existing = read_entry(mapping, entry_id);
    let mut merged = *new_entry;
    merged.set_pointer(existing.pointer());
    write_entry(mapping, entry_id, &merged);
}

/// Initializes list blocks `1..list_blocks` as empty (block 0 is left for
/// `init_root` to fill, mirroring the reference `MDInit`/`CIBListInit`
/// split).
pub fn init_list_blocks(mapping: &mut Mapping, list_blocks: u32) {
    for i in 1..list_blocks {
        write_list_block(mapping, i, &ListBlockRaw::empty());
    }
}

pub fn init_root(mapping: &mut Mapping, root: &EntryRaw) {
    let mut list = ListBlockRaw::empty();
    list.set_bitmap(list.bitmap() | 1);
    list.set_count(1);
    list.entries[0] = *root;
    write_list_block(mapping, 0, &list);
    Header::set_list_entries(mapping.header_mut(), 1);
}
