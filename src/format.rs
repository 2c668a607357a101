//! On-disk layout: the fixed-size records that make up the header, metadata
//! and data regions of a `.cib` archive. See README in `cib_struct.h` et al.
//! for the reference byte layout this mirrors.
use zerocopy::{AsBytes, FromBytes, Unaligned};

pub const MD_BLOCK_SIZE: usize = 1024;
pub const DATA_BLOCK_SIZE: usize = 1024;

/// Entries packed per metadata list block.
pub const LIST_ENTRIES_PER_BLOCK: u64 = 31;
/// Slot 31 of every list block's bitmap is a permanent sentinel.
pub const LIST_BLOCK_SENTINEL_BIT: u32 = 31;
/// A list block's slot bitmap with every real slot (0..=30) and the
/// sentinel bit (31) set: the "block is full" value.
pub const LIST_BLOCK_FULL_BITMAP: u32 = u32::MAX;

/// Ring-buffer capacity of the node-block free pool (C4).
pub const FREE_NODE_ARRAY_MAX: usize = 253;
/// Ring-buffer capacity of the data free index (C3).
pub const DATA_FREE_ARRAY_MAX: usize = 63;

/// Header fixed fields occupy exactly this many bytes before `base_dir`.
pub const HEADER_FIXED_SIZE: usize = 33;
/// Scratch capacity reserved for `base_dir` in the in-memory header view.
pub const HEADER_BASE_DIR_CAP: usize = 4096;

/// `FILE_EXTRA_DATA` in the reference implementation: bytes of chunk header
/// overhead counted against a payload when sizing a new chunk.
pub const FILE_EXTRA_DATA: u64 = 32;
/// Trailing slack block every chunk reserves purely to host its boundary tag.
pub const EXTRA_BLOCKS_NEEDED: u64 = 1;

pub type EntryId = u64;
/// Index of a 1024-byte block within the METADATA region.
pub type MdBlockId = u32;
/// Index of a 1024-byte block within the DATA region.
pub type DataBlockId = u64;

/// One 32-byte entry record. `pointer`'s meaning depends on `mode`.
#[repr(C)]
#[derive(Clone, Copy, Debug, AsBytes, FromBytes, Unaligned, PartialEq, Eq)]
pub struct EntryRaw {
    pub uid: [u8; 4],
    pub gid: [u8; 4],
    pub mode: [u8; 4],
    pub created: [u8; 4],
    pub modified: [u8; 4],
    pub accessed: [u8; 4],
    pub pointer: [u8; 8],
}

impl EntryRaw {
    pub const SIZE: usize = 32;

    pub fn zeroed() -> Self {
        Self {
            uid: [0; 4],
            gid: [0; 4],
            mode: [0; 4],
            created: [0; 4],
            modified: [0; 4],
            accessed: [0; 4],
            pointer: [0; 8],
        }
    }

    pub fn uid(&self) -> u32 {
        u32::from_le_bytes(self.uid)
    }
    pub fn gid(&self) -> u32 {
        u32::from_le_bytes(self.gid)
    }
    pub fn mode(&self) -> u32 {
        u32::from_le_bytes(self.mode)
    }
    pub fn created(&self) -> u32 {
        u32::from_le_bytes(self.created)
    }
    pub fn modified(&self) -> u32 {
        u32::from_le_bytes(self.modified)
    }
    pub fn accessed(&self) -> u32 {
        u32::from_le_bytes(self.accessed)
    }
    pub fn pointer(&self) -> u64 {
        u64::from_le_bytes(self.pointer)
    }
    pub fn set_pointer(&mut self, p: u64) {
        self.pointer = p.to_le_bytes();
    }
}

/// Coarse mode class an entry can be: used to validate mode-class matches
/// on update (§4.7) without pulling in the full POSIX mode-bit semantics.
#[derive(Clone, Copy, Debug, PartialEq, Eq, num_enum::TryFromPrimitive, num_enum::IntoPrimitive)]
#[repr(u32)]
pub enum ModeClass {
    File = 0,
    Dir = 1,
    Symlink = 2,
}

pub const S_IFMT: u32 = libc::S_IFMT;
pub const S_IFDIR: u32 = libc::S_IFDIR;
pub const S_IFLNK: u32 = libc::S_IFLNK;
pub const S_IFREG: u32 = libc::S_IFREG;

pub fn mode_class(mode: u32) -> ModeClass {
    match mode & S_IFMT {
        S_IFDIR => ModeClass::Dir,
        S_IFLNK => ModeClass::Symlink,
        _ => ModeClass::File,
    }
}

/// A metadata list block: 31 entries plus the bitmap index over them.
#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes, Unaligned)]
pub struct ListBlockRaw {
    pub count: [u8; 4],
    pub bitmap: [u8; 4],
    pub entries: [EntryRaw; 31],
    pub list_block_bitmap: [u8; 8],
    pub padding: [u8; 16],
}

impl ListBlockRaw {
    pub const SIZE: usize = MD_BLOCK_SIZE;

    pub fn count(&self) -> u32 {
        u32::from_le_bytes(self.count)
    }
    pub fn set_count(&mut self, v: u32) {
        self.count = v.to_le_bytes();
    }
    pub fn bitmap(&self) -> u32 {
        u32::from_le_bytes(self.bitmap)
    }
    pub fn set_bitmap(&mut self, v: u32) {
        self.bitmap = v.to_le_bytes();
    }
    pub fn list_block_bitmap(&self) -> u64 {
        u64::from_le_bytes(self.list_block_bitmap)
    }
    pub fn set_list_block_bitmap(&mut self, v: u64) {
        self.list_block_bitmap = v.to_le_bytes();
    }

    /// A freshly allocated list block: empty, sentinel bit 31 set.
    pub fn empty() -> Self {
        let mut b = Self {
            count: [0; 4],
            bitmap: [0; 4],
            entries: [EntryRaw::zeroed(); 31],
            list_block_bitmap: [0; 8],
            padding: [0; 16],
        };
        b.set_bitmap(1u32 << LIST_BLOCK_SENTINEL_BIT);
        b
    }
}

const _ASSERT_LIST_BLOCK_SIZE: [u8; MD_BLOCK_SIZE] = [0; std::mem::size_of::<ListBlockRaw>()];

/// One directory node block: up to 3 `(name, entry_id)` child slots plus
/// chain linkage.
#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes, Unaligned)]
pub struct NodeBlockRaw {
    pub name: [[u8; 256]; 3],
    pub entry: [[u8; 8]; 3],
    pub count: [u8; 4],
    pub self_id: [u8; 4],
    pub parent: [u8; 4],
    pub next: [u8; 4],
    pub previous: [u8; 4],
    pub next_flag: u8,
    pub previous_flag: u8,
    pub padding: [u8; 210],
}

const _ASSERT_NODE_BLOCK_SIZE: [u8; MD_BLOCK_SIZE] = [0; std::mem::size_of::<NodeBlockRaw>()];

impl NodeBlockRaw {
    pub const SIZE: usize = MD_BLOCK_SIZE;
    pub const SLOTS: usize = 3;

    pub fn empty(self_id: EntryId, parent: EntryId) -> Self {
        let mut b = Self {
            name: [[0; 256]; 3],
            entry: [[0; 8]; 3],
            count: [0; 4],
            self_id: (self_id as u32).to_le_bytes(),
            parent: (parent as u32).to_le_bytes(),
            next: [0; 4],
            previous: [0; 4],
            next_flag: 0,
            previous_flag: 0,
            padding: [0; 210],
        };
        b.set_count(0);
        b
    }

    pub fn count(&self) -> u32 {
        u32::from_le_bytes(self.count)
    }
    pub fn set_count(&mut self, v: u32) {
        self.count = v.to_le_bytes();
    }
    pub fn self_id(&self) -> EntryId {
        u32::from_le_bytes(self.self_id) as EntryId
    }
    pub fn parent(&self) -> EntryId {
        u32::from_le_bytes(self.parent) as EntryId
    }
    pub fn next(&self) -> MdBlockId {
        u32::from_le_bytes(self.next)
    }
    pub fn set_next(&mut self, v: MdBlockId) {
        self.next = v.to_le_bytes();
    }
    pub fn previous(&self) -> MdBlockId {
        u32::from_le_bytes(self.previous)
    }
    pub fn set_previous(&mut self, v: MdBlockId) {
        self.previous = v.to_le_bytes();
    }
    pub fn slot_entry(&self, slot: usize) -> EntryId {
        u64::from_le_bytes(self.entry[slot])
    }
    pub fn set_slot_entry(&mut self, slot: usize, id: EntryId) {
        self.entry[slot] = id.to_le_bytes();
    }
    pub fn slot_name(&self, slot: usize) -> &[u8] {
        let raw = &self.name[slot];
        let len = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        &raw[..len]
    }
    pub fn set_slot_name(&mut self, slot: usize, name: &[u8]) {
        let raw = &mut self.name[slot];
        *raw = [0u8; 256];
        let n = name.len().min(255);
        raw[..n].copy_from_slice(&name[..n]);
    }
}

/// Free-node-block pool header, lives at metadata block 0.
#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes, Unaligned)]
pub struct FreeNodePoolRaw {
    pub total_free: [u8; 4],
    pub header: [u8; 4],
    pub array: [[u8; 4]; FREE_NODE_ARRAY_MAX],
    pub arr_start: u8,
    pub arr_count: u8,
    pub padding: [u8; 2],
}

const _ASSERT_FREE_NODE_POOL_SIZE: [u8; MD_BLOCK_SIZE] =
    [0; std::mem::size_of::<FreeNodePoolRaw>()];

impl FreeNodePoolRaw {
    pub fn empty() -> Self {
        Self {
            total_free: [0; 4],
            header: [0; 4],
            array: [[0; 4]; FREE_NODE_ARRAY_MAX],
            arr_start: 0,
            arr_count: 0,
            padding: [0; 2],
        }
    }
    pub fn total_free(&self) -> u32 {
        u32::from_le_bytes(self.total_free)
    }
    pub fn set_total_free(&mut self, v: u32) {
        self.total_free = v.to_le_bytes();
    }
    pub fn header(&self) -> MdBlockId {
        u32::from_le_bytes(self.header)
    }
    pub fn set_header(&mut self, v: MdBlockId) {
        self.header = v.to_le_bytes();
    }
    pub fn array_at(&self, i: usize) -> MdBlockId {
        u32::from_le_bytes(self.array[i])
    }
    pub fn set_array_at(&mut self, i: usize, v: MdBlockId) {
        self.array[i] = v.to_le_bytes();
    }
}

/// An overflow free-node cell: an entire metadata block reused as a
/// singly-linked-list node. Only the first 5 bytes are meaningful.
#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes, Unaligned)]
pub struct FreeNodeOverflowRaw {
    pub next: [u8; 4],
    pub next_flag: u8,
    pub padding: [u8; 1019],
}

const _ASSERT_FREE_NODE_OVERFLOW_SIZE: [u8; MD_BLOCK_SIZE] =
    [0; std::mem::size_of::<FreeNodeOverflowRaw>()];

impl FreeNodeOverflowRaw {
    pub fn new(next: MdBlockId, next_flag: bool) -> Self {
        Self {
            next: next.to_le_bytes(),
            next_flag: next_flag as u8,
            padding: [0; 1019],
        }
    }
    pub fn next(&self) -> MdBlockId {
        u32::from_le_bytes(self.next)
    }
    pub fn next_flag(&self) -> bool {
        self.next_flag != 0
    }
}

/// One `(first_block, block_count)` pair in the data free index.
#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes, Unaligned)]
pub struct DataFreeEntryRaw {
    pub first_block: [u8; 8],
    pub block_count: [u8; 8],
}

impl DataFreeEntryRaw {
    pub fn new(first_block: DataBlockId, block_count: u64) -> Self {
        Self {
            first_block: first_block.to_le_bytes(),
            block_count: block_count.to_le_bytes(),
        }
    }
    pub fn first_block(&self) -> DataBlockId {
        u64::from_le_bytes(self.first_block)
    }
    pub fn block_count(&self) -> u64 {
        u64::from_le_bytes(self.block_count)
    }
}

/// Data free index header, lives at data block 0.
#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes, Unaligned)]
pub struct DataFreeListRaw {
    pub arr_start: u8,
    pub arr_count: u8,
    pub list_flag: u8,
    pub padding0: u8,
    pub list_head: [u8; 8],
    pub array: [DataFreeEntryRaw; DATA_FREE_ARRAY_MAX],
    pub padding: [u8; 4],
}

const _ASSERT_DATA_FREE_LIST_SIZE: [u8; DATA_BLOCK_SIZE] =
    [0; std::mem::size_of::<DataFreeListRaw>()];

impl DataFreeListRaw {
    pub fn empty() -> Self {
        Self {
            arr_start: 0,
            arr_count: 0,
            list_flag: 0,
            padding0: 0,
            list_head: [0; 8],
            array: [DataFreeEntryRaw::new(0, 0); DATA_FREE_ARRAY_MAX],
            padding: [0; 4],
        }
    }
    pub fn list_head(&self) -> DataBlockId {
        u64::from_le_bytes(self.list_head)
    }
    pub fn set_list_head(&mut self, v: DataBlockId) {
        self.list_head = v.to_le_bytes();
    }
}

/// First block of a chunk currently in use (`used == 1`).
#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes, Unaligned)]
pub struct UsedChunkHeaderRaw {
    pub used: u8,
    pub zipped: u8,
    pub padding: [u8; 6],
    pub blocks: [u8; 8],
    pub size: [u8; 8],
    pub data: [u8; 1000],
}

const _ASSERT_USED_CHUNK_SIZE: [u8; DATA_BLOCK_SIZE] =
    [0; std::mem::size_of::<UsedChunkHeaderRaw>()];

impl UsedChunkHeaderRaw {
    pub const DATA_CAP: usize = 1000;

    pub fn new(blocks: u64, size: u64, zipped: bool) -> Self {
        Self {
            used: 1,
            zipped: zipped as u8,
            padding: [0; 6],
            blocks: blocks.to_le_bytes(),
            size: size.to_le_bytes(),
            data: [0; 1000],
        }
    }
    pub fn blocks(&self) -> u64 {
        u64::from_le_bytes(self.blocks)
    }
    pub fn size(&self) -> u64 {
        u64::from_le_bytes(self.size)
    }
    pub fn zipped(&self) -> bool {
        self.zipped != 0
    }
}

/// First block of a chunk currently free (`used == 0`).
#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes, Unaligned)]
pub struct FreeChunkHeaderRaw {
    pub used: u8,
    pub next_flag: u8,
    pub previous_flag: u8,
    pub padding: [u8; 5],
    pub block_count: [u8; 8],
    pub previous_block: [u8; 8],
    pub next_block: [u8; 8],
    pub padding2: [u8; 992],
}

const _ASSERT_FREE_CHUNK_SIZE: [u8; DATA_BLOCK_SIZE] =
    [0; std::mem::size_of::<FreeChunkHeaderRaw>()];

impl FreeChunkHeaderRaw {
    pub fn new(block_count: u64) -> Self {
        Self {
            used: 0,
            next_flag: 0,
            previous_flag: 0,
            padding: [0; 5],
            block_count: block_count.to_le_bytes(),
            previous_block: [0; 8],
            next_block: [0; 8],
            padding2: [0; 992],
        }
    }
    pub fn block_count(&self) -> u64 {
        u64::from_le_bytes(self.block_count)
    }
    pub fn set_block_count(&mut self, v: u64) {
        self.block_count = v.to_le_bytes();
    }
    pub fn next_block(&self) -> DataBlockId {
        u64::from_le_bytes(self.next_block)
    }
    pub fn set_next_block(&mut self, v: DataBlockId) {
        self.next_block = v.to_le_bytes();
    }
    pub fn previous_block(&self) -> DataBlockId {
        u64::from_le_bytes(self.previous_block)
    }
    pub fn set_previous_block(&mut self, v: DataBlockId) {
        self.previous_block = v.to_le_bytes();
    }
    pub fn next_flag(&self) -> bool {
        self.next_flag != 0
    }
    pub fn set_next_flag(&mut self, v: bool) {
        self.next_flag = v as u8;
    }
    pub fn previous_flag(&self) -> bool {
        self.previous_flag != 0
    }
    pub fn set_previous_flag(&mut self, v: bool) {
        self.previous_flag = v as u8;
    }
}
