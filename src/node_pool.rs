//! C4 — the node-block free pool: a fixed-size block allocator for
//! directory node blocks, backed by a ring-buffer array plus an overflow
//! singly-linked list, both living in metadata block 0.
use anyhow::Result;
use zerocopy::{AsBytes, FromBytes};

use crate::format::{
    FreeNodeOverflowRaw, FreeNodePoolRaw, MdBlockId, FREE_NODE_ARRAY_MAX, MD_BLOCK_SIZE,
};
use crate::header::Header;
use crate::layout::{self, list_blocks_count};
use crate::mapping::Mapping;

fn pool(mapping: &Mapping) -> FreeNodePoolRaw {
    FreeNodePoolRaw::read_from(layout::md_block(mapping.md(), layout::free_pool_offset()).as_slice())
        .expect("free node pool block is exactly one metadata block")
}

fn write_pool(mapping: &mut Mapping, pool: &FreeNodePoolRaw) {
    let off = layout::free_pool_offset();
    pool.write_to(layout::md_block_mut(mapping.md_mut(), off).as_mut_slice())
        .expect("free node pool block is exactly one metadata block");
}

fn overflow_cell(mapping: &Mapping, block: MdBlockId) -> FreeNodeOverflowRaw {
    let list_blocks = list_blocks_count(mapping);
    let off = layout::node_block_offset(block, list_blocks);
    FreeNodeOverflowRaw::read_from(layout::md_block(mapping.md(), off).as_slice())
        .expect("metadata block is exactly 1024 bytes")
}

fn write_overflow_cell(mapping: &mut Mapping, block: MdBlockId, cell: &FreeNodeOverflowRaw) {
    let list_blocks = list_blocks_count(mapping);
    let off = layout::node_block_offset(block, list_blocks);
    cell.write_to(layout::md_block_mut(mapping.md_mut(), off).as_mut_slice())
        .expect("metadata block is exactly 1024 bytes");
}

pub fn init(mapping: &mut Mapping, node_blocks: u32) {
    write_pool(mapping, &FreeNodePoolRaw::empty());
    insert_range(mapping, 0, node_blocks);
}

fn insert_range(mapping: &mut Mapping, start: MdBlockId, count: u32) {
    for i in 0..count {
        insert(mapping, start + i);
    }
}

/// Requests a free node block, growing METADATA by one block if the pool
/// is empty.
pub fn request(mapping: &mut Mapping) -> Result<MdBlockId> {
    let mut p = pool(mapping);
    if p.arr_count > 0 {
        let idx = p.arr_start as usize;
        let block = p.array_at(idx);
        p.arr_start = ((idx + 1) % FREE_NODE_ARRAY_MAX) as u8;
        p.arr_count -= 1;
        p.set_total_free(p.total_free() - 1);
        write_pool(mapping, &p);
        return Ok(block);
    }
    if p.header() != 0 || overflow_head_flagged(mapping, &p) {
        let head = p.header();
        let cell = overflow_cell(mapping, head);
        p.set_header(cell.next());
        p.set_total_free(p.total_free() - 1);
        write_pool(mapping, &p);
        return Ok(head);
    }
    // Pool is fully exhausted: grow METADATA by one block (§4.4).
    grow_node_blocks(mapping, 1)?;
    request(mapping)
}

/// Distinguishes "header == 0 because empty" from "header == 0 because
/// block 0 (the pool header itself) is a legitimate overflow head" — block
/// 0 is never a valid node block, so `header == 0` unambiguously means
/// "no overflow list".
fn overflow_head_flagged(_mapping: &Mapping, p: &FreeNodePoolRaw) -> bool {
    p.header() != 0
}

pub fn insert(mapping: &mut Mapping, block: MdBlockId) {
    let mut p = pool(mapping);
    if (p.arr_count as usize) < FREE_NODE_ARRAY_MAX {
        let idx = (p.arr_start as usize + p.arr_count as usize) % FREE_NODE_ARRAY_MAX;
        p.set_array_at(idx, block);
        p.arr_count += 1;
    } else {
        let cell = FreeNodeOverflowRaw::new(p.header(), p.header() != 0);
        write_overflow_cell(mapping, block, &cell);
        p.set_header(block);
    }
    p.set_total_free(p.total_free() + 1);
    write_pool(mapping, &p);
}

/// Extends METADATA by `n` blocks, inserting each as free (§4.4).
pub fn grow_node_blocks(mapping: &mut Mapping, n: u32) -> Result<()> {
    let list_blocks = list_blocks_count(mapping);
    let old_node_blocks =
        ((mapping.md_size() as usize / MD_BLOCK_SIZE) - 1 - list_blocks as usize) as u32;
    let new_md_size = mapping.md_size() + n as u64 * MD_BLOCK_SIZE as u64;
    mapping.remap(mapping.header_size(), mapping.data_size(), new_md_size)?;
    insert_range(mapping, old_node_blocks, n);
    Ok(())
}

/// Extends METADATA by `n` blocks and shifts the node-block region right
/// by `n` blocks so the list-block region can grow at its end (§4.4).
pub fn grow_list_blocks(mapping: &mut Mapping, n: u32) -> Result<()> {
    let old_list_blocks = Header::list_blocks(mapping.header());
    let shift_bytes = n as usize * MD_BLOCK_SIZE;
    let node_region_start = layout::node_block_region_offset(old_list_blocks);
    let node_region_len = mapping.md().len() - node_region_start;

    let new_md_size = mapping.md_size() + shift_bytes as u64;
    mapping.remap(mapping.header_size(), mapping.data_size(), new_md_size)?;

    let md = mapping.md_mut();
    md.copy_within(
        node_region_start..node_region_start + node_region_len,
        node_region_start + shift_bytes,
    );
    Header::set_list_blocks(mapping.header_mut(), old_list_blocks + n);

    for i in 0..n {
        let off = layout::list_block_offset(old_list_blocks + i);
        let empty = crate::format::ListBlockRaw::empty();
        empty
            .write_to(layout::md_block_mut(mapping.md_mut(), off).as_mut_slice())
            .expect("list block is exactly 1024 bytes");
    }
    Ok(())
}
