//! Read-only file mapping used for the local copy of the runtime metadata.
//!
//! The metadata blob is immutable for the target's whole lifetime, so once a
//! local mapping exists it is a safe, fast substitute for remote reads of
//! that region. Unlike remote memory, the mapping is a trusted local asset;
//! accessors still bounds-check and return `None` so a truncated file can
//! never cause an out-of-range access.

use std::fs::File;
use std::io;
use std::path::Path;

use bytemuck::AnyBitPattern;
use memmap2::Mmap;

/// Size of a hardware page; mapped region sizes are rounded up to this.
const PAGE_SIZE: usize = 0x1000;

pub struct MetadataView {
    map: Mmap,
}

impl MetadataView {
    /// Maps a file read-only.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        // Safety: the mapping is read-only and the metadata file is never
        // modified while the game that shipped it is installed.
        let map = unsafe { Mmap::map(&file)? };
        Ok(MetadataView { map })
    }

    /// Logical size of the mapped file in bytes.
    pub fn size(&self) -> usize {
        self.map.len()
    }

    /// Size of the page-rounded backing mapping. This is what a remote
    /// mapping of the same file occupies, so it is the value to compare
    /// against the remote region size.
    pub fn mapped_size(&self) -> usize {
        self.size().div_ceil(PAGE_SIZE) * PAGE_SIZE
    }

    /// Returns `len` bytes starting at `offset`, if fully in range.
    pub fn bytes(&self, offset: usize, len: usize) -> Option<&[u8]> {
        let end = offset.checked_add(len)?;
        self.map.get(offset..end)
    }

    /// Returns everything from `offset` to the end of the file.
    pub fn suffix(&self, offset: usize) -> Option<&[u8]> {
        self.map.get(offset..)
    }

    /// Reads a plain-data value at a byte offset.
    pub fn read<T: AnyBitPattern>(&self, offset: usize) -> Option<T> {
        let bytes = self.bytes(offset, std::mem::size_of::<T>())?;
        Some(bytemuck::pod_read_unaligned(bytes))
    }
}
