//! Local view of the runtime's global-metadata.dat.
//!
//! The metadata blob is loaded by the target once and never changes, so a
//! read-only mapping of the same file is an exact substitute for remote
//! reads of that region. This module owns header validation and the string
//! table; the remote-pointer translation that ties the mapping to the
//! target's address space lives in [`super::reader`].

use std::path::Path;

use memchr::memchr;

use super::structs::GlobalMetadataHeader;
use crate::error::{Error, Result};
use crate::metadata_view::MetadataView;

/// Magic number at the start of global-metadata.dat.
const METADATA_SANITY: u32 = 0xFAB11BAF;

/// Oldest metadata format with the header layout this engine reads.
const MIN_METADATA_VERSION: i32 = 29;

/// Hard limit for identifier lengths in C#, used to bound string scans over
/// untrusted offsets.
pub const MAX_IDENT_LEN: usize = 512;

pub struct Metadata {
    view: MetadataView,
    header: GlobalMetadataHeader,
}

impl Metadata {
    /// Maps the metadata file and parses its header. Validation is a
    /// separate step so a caller can report size mismatches first.
    pub fn open(path: &Path) -> Result<Self> {
        let view = MetadataView::open(path)
            .map_err(|_| Error::RuntimeStructure("couldn't map global-metadata.dat"))?;
        let header = view
            .read::<GlobalMetadataHeader>(0)
            .ok_or(Error::RuntimeStructure("global-metadata.dat is truncated"))?;
        Ok(Metadata { view, header })
    }

    /// Checks the header magic and format version.
    pub fn validate(&self) -> Result<()> {
        if self.header.sanity != METADATA_SANITY {
            return Err(Error::RuntimeStructure("invalid metadata magic"));
        }
        if self.header.version < MIN_METADATA_VERSION {
            return Err(Error::RuntimeStructure("unsupported metadata version"));
        }
        Ok(())
    }

    pub fn view(&self) -> &MetadataView {
        &self.view
    }

    pub fn header(&self) -> &GlobalMetadataHeader {
        &self.header
    }

    pub fn version(&self) -> i32 {
        self.header.version
    }

    /// Gets an identifier from the metadata string table.
    ///
    /// The index is bounds-checked against the table size recorded in the
    /// header; the scan for the terminator never runs past `max_len` bytes
    /// even when no terminator exists in range.
    pub fn string_by_index(&self, index: u32, max_len: usize) -> Option<&str> {
        let table_size = usize::try_from(self.header.string_size).ok()?;
        if index as usize >= table_size {
            return None;
        }
        let table_offset = usize::try_from(self.header.string_offset).ok()?;
        self.str_at_offset(table_offset + index as usize, max_len)
    }

    /// Reads a NUL-terminated string at a byte offset into the mapping,
    /// capped at `max_len`. A missing terminator within the cap yields the
    /// capped prefix; non-UTF-8 data yields `None`.
    pub fn str_at_offset(&self, offset: usize, max_len: usize) -> Option<&str> {
        let tail = self.view.suffix(offset)?;
        let window = &tail[..max_len.min(tail.len())];
        let len = memchr(0, window).unwrap_or(window.len());
        std::str::from_utf8(&window[..len]).ok()
    }
}
