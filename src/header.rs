//! C2 — typed accessors over the header region.
use crate::format::HEADER_FIXED_SIZE;
use crate::mapping::Mapping;

/// Reads/writes the fixed-offset header fields directly; `base_dir` is a
/// variable-length NUL-terminated string stored right after them.
pub struct Header;

const OFF_DATA_SIZE: usize = 0;
const OFF_MD_SIZE: usize = 8;
const OFF_LIST_ENTRIES: usize = 16;
const OFF_LIST_BLOCKS: usize = 24;
const OFF_FREE_NODE_BLOCKS: usize = 28;
const OFF_NEST_LEVEL: usize = 32;
const OFF_BASE_DIR: usize = HEADER_FIXED_SIZE;

impl Header {
    /// `header_size = max(sizeof(fixed fields), 33 + len(base_dir) + 1)`.
    pub fn needed_size(base_dir: &str) -> u64 {
        (HEADER_FIXED_SIZE + base_dir.len() + 1).max(HEADER_FIXED_SIZE) as u64
    }

    pub fn init(buf: &mut [u8], base_dir: &str) {
        Self::set_data_size(buf, 0);
        Self::set_md_size(buf, 0);
        Self::set_list_entries(buf, 0);
        Self::set_list_blocks(buf, 0);
        Self::set_free_node_blocks(buf, 0);
        Self::set_nest_level(buf, 0);
        Self::set_base_dir(buf, base_dir);
    }

    pub fn data_size(buf: &[u8]) -> u64 {
        u64::from_le_bytes(buf[OFF_DATA_SIZE..OFF_DATA_SIZE + 8].try_into().unwrap())
    }
    pub fn set_data_size(buf: &mut [u8], v: u64) {
        buf[OFF_DATA_SIZE..OFF_DATA_SIZE + 8].copy_from_slice(&v.to_le_bytes());
    }

    pub fn md_size(buf: &[u8]) -> u64 {
        u64::from_le_bytes(buf[OFF_MD_SIZE..OFF_MD_SIZE + 8].try_into().unwrap())
    }
    pub fn set_md_size(buf: &mut [u8], v: u64) {
        buf[OFF_MD_SIZE..OFF_MD_SIZE + 8].copy_from_slice(&v.to_le_bytes());
    }

    pub fn list_entries(buf: &[u8]) -> u64 {
        u64::from_le_bytes(
            buf[OFF_LIST_ENTRIES..OFF_LIST_ENTRIES + 8]
                .try_into()
                .unwrap(),
        )
    }
    pub fn set_list_entries(buf: &mut [u8], v: u64) {
        buf[OFF_LIST_ENTRIES..OFF_LIST_ENTRIES + 8].copy_from_slice(&v.to_le_bytes());
    }

    pub fn list_blocks(buf: &[u8]) -> u32 {
        u32::from_le_bytes(
            buf[OFF_LIST_BLOCKS..OFF_LIST_BLOCKS + 4]
                .try_into()
                .unwrap(),
        )
    }
    pub fn set_list_blocks(buf: &mut [u8], v: u32) {
        buf[OFF_LIST_BLOCKS..OFF_LIST_BLOCKS + 4].copy_from_slice(&v.to_le_bytes());
    }

    pub fn free_node_blocks(buf: &[u8]) -> u32 {
        u32::from_le_bytes(
            buf[OFF_FREE_NODE_BLOCKS..OFF_FREE_NODE_BLOCKS + 4]
                .try_into()
                .unwrap(),
        )
    }
    pub fn set_free_node_blocks(buf: &mut [u8], v: u32) {
        buf[OFF_FREE_NODE_BLOCKS..OFF_FREE_NODE_BLOCKS + 4].copy_from_slice(&v.to_le_bytes());
    }

    pub fn nest_level(buf: &[u8]) -> u8 {
        buf[OFF_NEST_LEVEL]
    }
    pub fn set_nest_level(buf: &mut [u8], v: u8) {
        buf[OFF_NEST_LEVEL] = v;
    }

    pub fn base_dir(buf: &[u8]) -> String {
        let raw = &buf[OFF_BASE_DIR..];
        let len = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        String::from_utf8_lossy(&raw[..len]).into_owned()
    }
    pub fn set_base_dir(buf: &mut [u8], base_dir: &str) {
        let bytes = base_dir.as_bytes();
        let end = OFF_BASE_DIR + bytes.len();
        buf[OFF_BASE_DIR..end].copy_from_slice(bytes);
        buf[end] = 0;
    }
}

/// Convenience wrapper bound to a live `Mapping`'s header bytes.
pub fn needed_header_size(base_dir: &str) -> u64 {
    Header::needed_size(base_dir)
}

pub fn read_base_dir(mapping: &Mapping) -> String {
    Header::base_dir(mapping.header())
}
