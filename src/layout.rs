//! Block-index arithmetic shared by C4/C5/C6: where a given metadata block
//! number lives inside the METADATA region's byte buffer.
use crate::format::{MdBlockId, MD_BLOCK_SIZE};
use crate::header::Header;
use crate::mapping::Mapping;

pub const FREE_LIST_BLOCK: MdBlockId = 0;
pub const CIB_LIST_BLOCK: MdBlockId = 1;

pub fn list_block_offset(block_num: MdBlockId) -> usize {
    (CIB_LIST_BLOCK as usize + block_num as usize) * MD_BLOCK_SIZE
}

pub fn node_block_offset(block_num: MdBlockId, list_blocks: u32) -> usize {
    (CIB_LIST_BLOCK as usize + block_num as usize + list_blocks as usize) * MD_BLOCK_SIZE
}

pub fn free_pool_offset() -> usize {
    FREE_LIST_BLOCK as usize * MD_BLOCK_SIZE
}

pub fn md_block<'a>(md: &'a [u8], offset: usize) -> &'a [u8; MD_BLOCK_SIZE] {
    (&md[offset..offset + MD_BLOCK_SIZE]).try_into().unwrap()
}

pub fn md_block_mut<'a>(md: &'a mut [u8], offset: usize) -> &'a mut [u8; MD_BLOCK_SIZE] {
    (&mut md[offset..offset + MD_BLOCK_SIZE]).try_into().unwrap()
}

pub fn list_blocks_count(mapping: &Mapping) -> u32 {
    Header::list_blocks(mapping.header())
}

pub fn node_block_region_offset(list_blocks: u32) -> usize {
    node_block_offset(0, list_blocks)
}
