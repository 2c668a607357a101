//! C3 — the data-chunk allocator.
//!
//! The DATA region is split into 1024-byte blocks. Contiguous runs of
//! blocks form chunks, each tagged "used" or "free" in its first byte;
//! the last 8 bytes of a chunk hold its own block count as a boundary tag,
//! which lets a neighbor being freed cheaply discover the chunk's extent
//! without walking the free index. Free chunks are tracked by a best-fit
//! index: a small descending-by-size array plus an overflow doubly-linked
//! list once the array fills up.
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use anyhow::{Context, Result};
use zerocopy::{AsBytes, FromBytes};

use crate::format::{
    DataBlockId, DataFreeEntryRaw, DataFreeListRaw, FreeChunkHeaderRaw, UsedChunkHeaderRaw,
    DATA_BLOCK_SIZE, DATA_FREE_ARRAY_MAX, EXTRA_BLOCKS_NEEDED, FILE_EXTRA_DATA,
};
use crate::header::Header;
use crate::mapping::Mapping;

const FREE_LIST_BLOCK: DataBlockId = 0;
/// Offset of the `data` payload within a used chunk's first block.
const USED_HEADER_SIZE: usize = 24;

fn chunk_offset(block: DataBlockId) -> usize {
    block as usize * DATA_BLOCK_SIZE
}

fn free_list(mapping: &Mapping) -> DataFreeListRaw {
    let off = chunk_offset(FREE_LIST_BLOCK);
    DataFreeListRaw::read_from(&mapping.data()[off..off + DATA_BLOCK_SIZE])
        .expect("data free list is exactly one data block")
}

fn write_free_list(mapping: &mut Mapping, list: &DataFreeListRaw) {
    let off = chunk_offset(FREE_LIST_BLOCK);
    list.write_to(&mut mapping.data_mut()[off..off + DATA_BLOCK_SIZE])
        .expect("data free list is exactly one data block");
}

fn is_used(mapping: &Mapping, block: DataBlockId) -> bool {
    mapping.data()[chunk_offset(block)] != 0
}

fn read_free_chunk(mapping: &Mapping, block: DataBlockId) -> FreeChunkHeaderRaw {
    let off = chunk_offset(block);
    FreeChunkHeaderRaw::read_from(&mapping.data()[off..off + DATA_BLOCK_SIZE])
        .expect("data block is exactly 1024 bytes")
}

fn write_free_chunk(mapping: &mut Mapping, block: DataBlockId, chunk: &FreeChunkHeaderRaw) {
    let off = chunk_offset(block);
    chunk
        .write_to(&mut mapping.data_mut()[off..off + DATA_BLOCK_SIZE])
        .expect("data block is exactly 1024 bytes");
}

fn write_tail_tag(mapping: &mut Mapping, chunk_end: DataBlockId, block_count: u64) {
    let off = chunk_offset(chunk_end) - 8;
    mapping.data_mut()[off..off + 8].copy_from_slice(&block_count.to_le_bytes());
}

/// Reads the block count of the chunk that ends immediately before `block`.
fn tail_tag_before(mapping: &Mapping, block: DataBlockId) -> u64 {
    let off = chunk_offset(block) - 8;
    u64::from_le_bytes(mapping.data()[off..off + 8].try_into().unwrap())
}

fn init_free_chunk(mapping: &mut Mapping, start: DataBlockId, block_count: u64) {
    write_free_chunk(mapping, start, &FreeChunkHeaderRaw::new(block_count));
    write_tail_tag(mapping, start + block_count, block_count);
}

fn chunk_next(mapping: &Mapping, block: DataBlockId) -> Option<DataBlockId> {
    let c = read_free_chunk(mapping, block);
    c.next_flag().then(|| c.next_block())
}
fn chunk_previous(mapping: &Mapping, block: DataBlockId) -> Option<DataBlockId> {
    let c = read_free_chunk(mapping, block);
    c.previous_flag().then(|| c.previous_block())
}
fn chunk_set_next(mapping: &mut Mapping, block: DataBlockId, next: DataBlockId) {
    let mut c = read_free_chunk(mapping, block);
    c.set_next_flag(true);
    c.set_next_block(next);
    write_free_chunk(mapping, block, &c);
}
fn chunk_set_previous(mapping: &mut Mapping, block: DataBlockId, previous: DataBlockId) {
    let mut c = read_free_chunk(mapping, block);
    c.set_previous_flag(true);
    c.set_previous_block(previous);
    write_free_chunk(mapping, block, &c);
}
fn chunk_remove_next(mapping: &mut Mapping, block: DataBlockId) {
    let mut c = read_free_chunk(mapping, block);
    c.set_next_flag(false);
    write_free_chunk(mapping, block, &c);
}
fn chunk_remove_previous(mapping: &mut Mapping, block: DataBlockId) {
    let mut c = read_free_chunk(mapping, block);
    c.set_previous_flag(false);
    write_free_chunk(mapping, block, &c);
}

/// Inserts the chunk `[start, start+blocks_count)` into the free index,
/// keeping the array sorted in descending order by size and overflowing
/// into the doubly-linked list once the array is full.
pub fn insert_chunk(mapping: &mut Mapping, start: DataBlockId, blocks_count: u64) {
    init_free_chunk(mapping, start, blocks_count);
    let mut list = free_list(mapping);

    let mut index = None;
    for i in 0..list.arr_count as usize {
        let iter = (list.arr_start as usize + i) % DATA_FREE_ARRAY_MAX;
        if blocks_count > list.array[iter].block_count() {
            index = Some(iter);
            break;
        }
    }
    let array_has_room = (list.arr_count as usize) < DATA_FREE_ARRAY_MAX;

    match (index, array_has_room) {
        (None, true) => {
            let idx = (list.arr_count as usize + list.arr_start as usize) % DATA_FREE_ARRAY_MAX;
            list.array[idx] = DataFreeEntryRaw::new(start, blocks_count);
            list.arr_count += 1;
            write_free_list(mapping, &list);
        }
        (Some(index), true) => {
            let last_index = (list.arr_start as usize + list.arr_count as usize - 1
                + DATA_FREE_ARRAY_MAX)
                % DATA_FREE_ARRAY_MAX;
            let mut i = (last_index + 1) % DATA_FREE_ARRAY_MAX;
            while i != index {
                let previous = (i + DATA_FREE_ARRAY_MAX - 1) % DATA_FREE_ARRAY_MAX;
                list.array[i] = list.array[previous];
                i = previous;
            }
            list.array[index] = DataFreeEntryRaw::new(start, blocks_count);
            list.arr_count += 1;
            write_free_list(mapping, &list);
        }
        (None, false) => {
            if list.list_flag == 0 {
                list.list_flag = 1;
                list.set_list_head(start);
                write_free_list(mapping, &list);
            } else {
                let mut iter = list.list_head();
                let mut last = iter;
                loop {
                    let current = read_free_chunk(mapping, iter);
                    if blocks_count >= current.block_count() {
                        chunk_set_next(mapping, start, iter);
                        let previous = chunk_previous(mapping, iter);
                        chunk_set_previous(mapping, iter, start);
                        if let Some(previous) = previous {
                            chunk_set_previous(mapping, start, previous);
                            chunk_set_next(mapping, previous, start);
                        } else {
                            let mut list = free_list(mapping);
                            list.set_list_head(start);
                            write_free_list(mapping, &list);
                        }
                        return;
                    }
                    last = iter;
                    match chunk_next(mapping, iter) {
                        Some(next) => iter = next,
                        None => break,
                    }
                }
                chunk_set_next(mapping, last, start);
                chunk_set_previous(mapping, start, last);
            }
        }
        (Some(index), false) => {
            let last_index = (list.arr_start as usize + list.arr_count as usize - 1
                + DATA_FREE_ARRAY_MAX)
                % DATA_FREE_ARRAY_MAX;
            if list.list_flag == 1 {
                chunk_set_next(mapping, list.array[last_index].first_block(), list.list_head());
                chunk_set_previous(mapping, list.list_head(), list.array[last_index].first_block());
                list = free_list(mapping);
            }
            list.set_list_head(list.array[last_index].first_block());
            list.list_flag = 1;

            let mut i = last_index;
            while i != index {
                let previous = (i + DATA_FREE_ARRAY_MAX - 1) % DATA_FREE_ARRAY_MAX;
                list.array[i] = list.array[previous];
                i = previous;
            }
            list.array[index] = DataFreeEntryRaw::new(start, blocks_count);
            write_free_list(mapping, &list);
        }
    }
}

/// Removes the free chunk starting at `start` from the free index. `start`
/// must currently be tracked as free.
pub fn remove_chunk(mapping: &mut Mapping, start: DataBlockId) {
    let mut list = free_list(mapping);

    if list.arr_count <= 1 {
        list.arr_count = 0;
        write_free_list(mapping, &list);
        return;
    }

    let mut index = None;
    for i in 0..list.arr_count as usize {
        let iter = (list.arr_start as usize + i) % DATA_FREE_ARRAY_MAX;
        if list.array[iter].first_block() == start {
            index = Some(iter);
            break;
        }
    }

    if let Some(index) = index {
        let last_index =
            (list.arr_start as usize + list.arr_count as usize - 1 + DATA_FREE_ARRAY_MAX)
                % DATA_FREE_ARRAY_MAX;
        let mut i = index;
        while i != last_index {
            let next = (i + 1) % DATA_FREE_ARRAY_MAX;
            list.array[i] = list.array[next];
            i = next;
        }

        if list.list_flag == 0 {
            list.arr_count -= 1;
            write_free_list(mapping, &list);
        } else {
            let head = list.list_head();
            let head_chunk = read_free_chunk(mapping, head);
            list.array[last_index] = DataFreeEntryRaw::new(head, head_chunk.block_count());
            write_free_list(mapping, &list);

            match chunk_next(mapping, head) {
                Some(next) => {
                    chunk_remove_previous(mapping, next);
                    let mut list = free_list(mapping);
                    list.set_list_head(next);
                    write_free_list(mapping, &list);
                }
                None => {
                    let mut list = free_list(mapping);
                    list.list_flag = 0;
                    write_free_list(mapping, &list);
                }
            }
        }
    } else if list.list_flag == 1 {
        let previous = chunk_previous(mapping, start);
        let next = chunk_next(mapping, start);
        match (previous, next) {
            (Some(p), Some(n)) => {
                chunk_set_next(mapping, p, n);
                chunk_set_previous(mapping, n, p);
            }
            (Some(p), None) => chunk_remove_next(mapping, p),
            (None, Some(n)) => {
                chunk_remove_previous(mapping, n);
                list.set_list_head(n);
                write_free_list(mapping, &list);
            }
            (None, None) => {
                list.list_flag = 0;
                write_free_list(mapping, &list);
            }
        }
    }
}

fn grow_data_region(mapping: &mut Mapping, block_count: u64) -> Result<DataBlockId> {
    let new_chunk = mapping.data_size() / DATA_BLOCK_SIZE as u64;
    let extra_bytes = block_count * DATA_BLOCK_SIZE as u64;
    let new_data_size = mapping.data_size() + extra_bytes;
    mapping.remap(mapping.header_size(), new_data_size, mapping.md_size())?;
    mapping.shift_md(extra_bytes as i64);
    Header::set_data_size(mapping.header_mut(), new_data_size);
    Ok(new_chunk)
}

/// Best-fit allocation of `block_count` contiguous blocks, growing the
/// DATA region (and shifting METADATA past it) if no chunk is big enough.
pub fn request_chunk(mapping: &mut Mapping, block_count: u64) -> Result<DataBlockId> {
    let list = free_list(mapping);
    let best_fits = list.arr_count > 0
        && list.array[list.arr_start as usize].block_count() >= block_count;

    if !best_fits {
        return grow_data_region(mapping, block_count);
    }

    let mut previous = 0usize;
    let mut current = 1usize;
    while current < list.arr_count as usize {
        let index = (list.arr_start as usize + current) % DATA_FREE_ARRAY_MAX;
        if list.array[index].block_count() < block_count {
            break;
        }
        current += 1;
        previous += 1;
    }

    let target_index = (list.arr_start as usize + previous) % DATA_FREE_ARRAY_MAX;
    let target = list.array[target_index].first_block();
    let target_blocks = list.array[target_index].block_count();

    remove_chunk(mapping, target);
    if target_blocks != block_count {
        insert_chunk(mapping, target + block_count, target_blocks - block_count);
    }
    Ok(target)
}

/// Scans the free index for a chunk that reaches the end of the DATA
/// region and, if found, shrinks the region to drop it.
pub fn remove_trailing_free_chunk(mapping: &mut Mapping) -> Result<()> {
    let list = free_list(mapping);
    let data_blocks = mapping.data_size() / DATA_BLOCK_SIZE as u64;

    let mut found = None;
    for i in 0..list.arr_count as usize {
        let index = (list.arr_start as usize + i) % DATA_FREE_ARRAY_MAX;
        let entry = list.array[index];
        if entry.first_block() + entry.block_count() == data_blocks {
            found = Some(entry.first_block());
            break;
        }
    }
    if found.is_none() && list.list_flag == 1 {
        let mut current = list.list_head();
        loop {
            let chunk = read_free_chunk(mapping, current);
            if current + chunk.block_count() == data_blocks {
                found = Some(current);
                break;
            }
            match chunk_next(mapping, current) {
                Some(next) => current = next,
                None => break,
            }
        }
    }

    let Some(last) = found else { return Ok(()) };
    remove_chunk(mapping, last);

    // The bytes between `last` and the old data/metadata boundary are
    // about to be truncated away, so snapshot METADATA into owned memory
    // first and write it back once the smaller mapping is established:
    // unlike growth, a shrink cannot shift bytes in place because the
    // source range no longer exists after `remap` truncates the file.
    let md_bytes = mapping.md().to_vec();
    let new_data_size = last * DATA_BLOCK_SIZE as u64;
    mapping.remap(mapping.header_size(), new_data_size, mapping.md_size())?;
    mapping.md_mut().copy_from_slice(&md_bytes);
    Header::set_data_size(mapping.header_mut(), new_data_size);
    Ok(())
}

/// Initializes the DATA region to hold `blocks` blocks, with blocks
/// `1..blocks` forming one free chunk (block 0 is the free-index header).
pub fn init(mapping: &mut Mapping, blocks: u64) {
    write_free_list(mapping, &DataFreeListRaw::empty());
    if blocks > 1 {
        insert_chunk(mapping, 1, blocks - 1);
    }
    Header::set_data_size(mapping.header_mut(), blocks * DATA_BLOCK_SIZE as u64);
}

/// Marks the trailing `blocks` blocks of an already-grown DATA region as
/// one new free chunk.
pub fn insert_free_blocks(mapping: &mut Mapping, blocks: u64) {
    if blocks > 0 {
        let data_blocks = mapping.data_size() / DATA_BLOCK_SIZE as u64;
        insert_chunk(mapping, data_blocks - blocks, blocks);
    }
}

/// Blocks needed to hold `size` bytes of payload plus its chunk header
/// and boundary tag, rounded up.
pub fn calculate_needed_blocks(size: u64) -> u64 {
    let padded = size + FILE_EXTRA_DATA;
    (padded / DATA_BLOCK_SIZE as u64) + u64::from(padded % DATA_BLOCK_SIZE as u64 > 0)
}

fn write_used_chunk_header(mapping: &mut Mapping, block: DataBlockId, blocks: u64, size: u64, zipped: bool) {
    let header = UsedChunkHeaderRaw::new(blocks, size, zipped);
    let off = chunk_offset(block);
    mapping.data_mut()[off..off + USED_HEADER_SIZE].copy_from_slice(&header.as_bytes()[..USED_HEADER_SIZE]);
}

fn read_used_chunk_header(mapping: &Mapping, block: DataBlockId) -> (bool, u64, u64) {
    let off = chunk_offset(block);
    let bytes = &mapping.data()[off..off + USED_HEADER_SIZE];
    let zipped = bytes[1] != 0;
    let blocks = u64::from_le_bytes(bytes[8..16].try_into().unwrap());
    let size = u64::from_le_bytes(bytes[16..24].try_into().unwrap());
    (zipped, blocks, size)
}

/// Copies `data` into a freshly allocated chunk, marking it zipped if
/// requested. Returns the chunk's first block id.
pub fn insert_bytes(mapping: &mut Mapping, data: &[u8], zipped: bool) -> Result<DataBlockId> {
    let size = data.len() as u64;
    let required_blocks = calculate_needed_blocks(size) + EXTRA_BLOCKS_NEEDED;

    let block = request_chunk(mapping, required_blocks)?;
    write_used_chunk_header(mapping, block, required_blocks, size, zipped);

    let off = chunk_offset(block) + USED_HEADER_SIZE;
    mapping.data_mut()[off..off + data.len()].copy_from_slice(data);
    write_tail_tag(mapping, block + required_blocks, required_blocks);
    Ok(block)
}

/// Reads a host file's contents into the archive's DATA region.
pub fn insert_file(mapping: &mut Mapping, path: &Path, zipped: bool) -> Result<DataBlockId> {
    let data = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    insert_bytes(mapping, &data, zipped)
}

/// Reads a host symlink's target into the archive's DATA region.
pub fn insert_link(mapping: &mut Mapping, path: &Path) -> Result<DataBlockId> {
    let target = std::fs::read_link(path).with_context(|| format!("reading link {}", path.display()))?;
    insert_bytes(mapping, target.as_os_str().as_bytes(), false)
}

/// Frees the chunk starting at `block`, coalescing with an adjacent free
/// chunk on either side.
pub fn delete(mapping: &mut Mapping, block: DataBlockId) -> Result<()> {
    let (_, blocks, _) = read_used_chunk_header(mapping, block);
    let mut new_chunk_size = blocks;
    let mut start = block;

    let data_blocks = mapping.data_size() / DATA_BLOCK_SIZE as u64;
    if block + blocks < data_blocks {
        let next_id = block + blocks;
        if !is_used(mapping, next_id) {
            let next = read_free_chunk(mapping, next_id);
            new_chunk_size += next.block_count();
            remove_chunk(mapping, next_id);
        }
    }

    if block > 1 {
        let previous_blocks = tail_tag_before(mapping, block);
        let previous_id = block - previous_blocks;
        if !is_used(mapping, previous_id) {
            let previous = read_free_chunk(mapping, previous_id);
            new_chunk_size += previous.block_count();
            remove_chunk(mapping, previous_id);
            start = previous_id;
        }
    }

    insert_chunk(mapping, start, new_chunk_size);
    Ok(())
}

/// Writes the file stored in the chunk at `block` out to `dest`. If the
/// payload is zipped, writes it to `dest` with a `.gz` suffix and returns
/// `true` so the caller can spawn `gunzip` (§C9's job, not this module's).
pub fn extract_file(mapping: &Mapping, block: DataBlockId, dest: &Path) -> Result<bool> {
    let (zipped, _, size) = read_used_chunk_header(mapping, block);
    let real_path = if zipped && size != 0 {
        let mut s = dest.as_os_str().to_owned();
        s.push(".gz");
        std::path::PathBuf::from(s)
    } else {
        dest.to_path_buf()
    };

    if size == 0 {
        std::fs::File::create(&real_path)
            .with_context(|| format!("creating {}", real_path.display()))?;
        return Ok(false);
    }

    let off = chunk_offset(block) + USED_HEADER_SIZE;
    let data = &mapping.data()[off..off + size as usize];
    std::fs::write(&real_path, data)
        .with_context(|| format!("writing {}", real_path.display()))?;
    Ok(zipped)
}

/// Recreates the symlink stored in the chunk at `block` at `dest`.
pub fn extract_link(mapping: &Mapping, block: DataBlockId, dest: &Path) -> Result<()> {
    let (_, _, size) = read_used_chunk_header(mapping, block);
    let off = chunk_offset(block) + USED_HEADER_SIZE;
    let target_bytes = &mapping.data()[off..off + size as usize];
    let target = std::ffi::OsStr::from_bytes(target_bytes);

    if dest.symlink_metadata().is_ok() {
        std::fs::remove_file(dest).with_context(|| format!("replacing {}", dest.display()))?;
    }
    std::os::unix::fs::symlink(target, dest)
        .with_context(|| format!("creating symlink {}", dest.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn fresh(data_blocks: u64) -> Mapping {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.cib");
        std::mem::forget(dir); // keep the tempdir alive for the test's duration
        let mut m = Mapping::create(&path).unwrap();
        m.remap(64, data_blocks * DATA_BLOCK_SIZE as u64, DATA_BLOCK_SIZE as u64).unwrap();
        init(&mut m, data_blocks);
        m
    }

    #[test]
    fn insert_then_delete_reclaims_the_chunk() {
        let mut m = fresh(16);
        let payload = b"hello cib".to_vec();
        let block = insert_bytes(&mut m, &payload, false).unwrap();
        assert!(is_used(&m, block));

        delete(&mut m, block).unwrap();
        assert!(!is_used(&m, block));
    }

    #[test]
    fn adjacent_frees_coalesce_into_one_chunk() {
        let mut m = fresh(32);
        let a = insert_bytes(&mut m, &[1u8; 10], false).unwrap();
        let b = insert_bytes(&mut m, &[2u8; 10], false).unwrap();

        delete(&mut m, a).unwrap();
        delete(&mut m, b).unwrap();

        let list = free_list(&m);
        assert_eq!(list.arr_count, 1);
    }

    #[test]
    fn request_chunk_grows_data_region_when_exhausted() {
        let mut m = fresh(2);
        let before = m.data_size();
        let block = request_chunk(&mut m, 8).unwrap();
        assert!(m.data_size() > before);
        assert_eq!(block, before / DATA_BLOCK_SIZE as u64);
    }
}
