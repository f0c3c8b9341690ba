//! Class-anchor resolution: cache, revalidate, scan.
//!
//! Bootstrapping starts with zero known addresses. The runtime keeps a
//! pointer to every initialized class instance somewhere in GameAssembly's
//! `.data` section, so a class can be located by scanning that section and
//! heuristically recognizing the structures those pointers lead to. The
//! scan is the expensive path (the section is several megabytes and every
//! plausible word costs a heuristic evaluation), which is why the byte
//! offsets it produces are persisted and revalidated on the next run
//! instead of being rediscovered.

use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use log::{debug, info};

use crate::error::{Error, Result};
use crate::il2cpp::{Il2CppId, Il2CppReader};
use crate::pe;
use crate::remote::{MemorySource, RemotePtr};

/// How much of the module head to fetch when looking for the section table.
const PE_HEADER_PROBE_SIZE: usize = 0x1000;

/// Section of GameAssembly that holds the runtime's static data, including
/// the class-instance pointers the scan is after.
const STATIC_DATA_SECTION: &[u8] = b".data";

/// A structural anchor: the module-relative location of a pointer to one
/// specific class instance.
#[derive(Debug, Clone)]
pub struct ClassAnchor {
    /// Expected identity of the class behind the anchor.
    pub id: Il2CppId<'static>,
    /// Byte offset of the instance pointer from the module base; 0 while
    /// unresolved.
    pub module_offset: u64,
    /// The class instance itself, dereferenced this run; null while
    /// unresolved.
    pub class_ptr: RemotePtr,
    /// Whether this anchor was discovered by scanning this run (as opposed
    /// to revalidated out of the cache).
    pub fresh: bool,
}

impl ClassAnchor {
    pub fn new(id: Il2CppId<'static>) -> Self {
        ClassAnchor {
            id,
            module_offset: 0,
            class_ptr: RemotePtr::NULL,
            fresh: false,
        }
    }

    pub fn is_resolved(&self) -> bool {
        !self.class_ptr.is_null()
    }
}

/// The persisted form of a set of anchors: one little-endian `u64`
/// module-relative offset per anchor, written verbatim. There is no version
/// header; a stale record simply fails revalidation.
pub struct OffsetCache {
    path: PathBuf,
}

impl OffsetCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        OffsetCache { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads exactly `count` offsets, or nothing if the file is absent,
    /// unreadable or the wrong size.
    pub fn load(&self, count: usize) -> Option<Vec<u64>> {
        let mut file = fs::File::open(&self.path).ok()?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes).ok()?;
        if bytes.len() != count * 8 {
            return None;
        }
        Some(
            bytes
                .chunks_exact(8)
                .map(|chunk| bytemuck::pod_read_unaligned::<u64>(chunk))
                .collect(),
        )
    }

    pub fn store(&self, offsets: &[u64]) -> io::Result<()> {
        let mut file = fs::File::create(&self.path)?;
        for offset in offsets {
            file.write_all(&offset.to_le_bytes())?;
        }
        Ok(())
    }
}

/// Resolves every anchor, preferring cached offsets over scanning.
///
/// Cached offsets are accepted only if dereferencing them against the
/// *current* module base yields a structure with the expected identity; a
/// mismatch invalidates that anchor alone. Whatever remains unresolved is
/// searched for in a single pass over the static-data section. Any anchor
/// still unresolved afterwards fails the whole resolution — the caller may
/// retry later, the target may simply not have finished loading.
pub fn resolve_class_anchors<S: MemorySource>(
    reader: &mut Il2CppReader<S>,
    anchors: &mut [ClassAnchor],
    cached: Option<&[u64]>,
) -> Result<()> {
    if let Some(cached) = cached {
        revalidate_cached(reader, anchors, cached);
    }

    if anchors.iter().any(|anchor| !anchor.is_resolved()) {
        scan_static_section(reader, anchors)?;
    }

    if let Some(missing) = anchors.iter().find(|anchor| !anchor.is_resolved()) {
        debug!("no anchor found for class '{}'", missing.id.name);
        return Err(Error::RuntimeStructure(
            "a required class anchor stayed unresolved after a full scan",
        ));
    }
    Ok(())
}

fn revalidate_cached<S: MemorySource>(
    reader: &mut Il2CppReader<S>,
    anchors: &mut [ClassAnchor],
    cached: &[u64],
) {
    let base = reader.game_assembly_base();
    for (anchor, &offset) in anchors.iter_mut().zip(cached) {
        if offset == 0 {
            continue;
        }
        let Ok(class_ptr) = reader.memory().read::<RemotePtr>(base.offset(offset)) else {
            debug!("cached anchor for '{}' no longer dereferences", anchor.id.name);
            continue;
        };
        if reader.class_has_id(class_ptr, anchor.id) {
            debug!("cached anchor for '{}' revalidated", anchor.id.name);
            anchor.module_offset = offset;
            anchor.class_ptr = class_ptr;
        } else {
            debug!("cached anchor for '{}' failed the identity check", anchor.id.name);
        }
    }
}

/// The expensive path: bulk-read the whole static-data section once, then
/// walk it at pointer-aligned strides, putting every plausible word through
/// the class heuristic until all anchors are found or the section ends.
fn scan_static_section<S: MemorySource>(
    reader: &mut Il2CppReader<S>,
    anchors: &mut [ClassAnchor],
) -> Result<()> {
    let base = reader.game_assembly_base();

    let mut header = vec![0u8; PE_HEADER_PROBE_SIZE];
    reader.memory().read_raw(base, &mut header)?;
    let section = pe::find_section(&header, STATIC_DATA_SECTION)
        .ok_or(Error::RuntimeStructure(".data section not found in GameAssembly"))?;

    info!(
        "scanning {} KiB of GameAssembly .data for class anchors",
        section.size_of_raw_data / 1024
    );

    let mut data = vec![0u8; section.size_of_raw_data as usize];
    reader
        .memory()
        .read_raw(base.offset(section.virtual_address as u64), &mut data)?;

    for (offset, candidate) in candidate_pointers(&data) {
        if anchors.iter().all(ClassAnchor::is_resolved) {
            break;
        }
        let Some(id) = reader.heuristic_class_check(candidate) else {
            continue;
        };
        if let Some(anchor) = anchors
            .iter_mut()
            .find(|anchor| !anchor.is_resolved() && anchor.id == id)
        {
            debug!(
                "found class '{}' at module offset {:#x}",
                anchor.id.name,
                section.virtual_address as u64 + offset
            );
            anchor.module_offset = section.virtual_address as u64 + offset;
            anchor.class_ptr = candidate;
            anchor.fresh = true;
        }
    }
    Ok(())
}

/// Yields `(byte_offset, value)` for every pointer-aligned word in the
/// buffer that could plausibly be a user-space pointer. The plausibility
/// filter runs locally and discards almost everything before any remote
/// read happens.
fn candidate_pointers(data: &[u8]) -> impl Iterator<Item = (u64, RemotePtr)> + '_ {
    data.chunks_exact(8).enumerate().filter_map(|(index, chunk)| {
        let value = RemotePtr(bytemuck::pod_read_unaligned::<u64>(chunk));
        value
            .is_plausible()
            .then_some((index as u64 * 8, value))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::*;

    const NETWORK: Il2CppId<'static> = Il2CppId::new("Network", "");
    const PLAYER_SPOT: Il2CppId<'static> = Il2CppId::new("PlayerSpot", "");

    const MODULE_BASE: u64 = 0x1_4000_0000;
    const DATA_SECTION_VA: u64 = 0x2000;

    /// Builds a module image with a 1000-slot .data section and plants the
    /// given `(slot, value)` words in it.
    fn build_module(mem: &mut FakeMemory, slots: &[(usize, u64)]) {
        let section_size = 1000 * 8;
        // The scan fetches a whole page of header, so pad out to one.
        let mut header = build_pe_header(&[
            (b".text", 0x1000, 0x1000),
            (b".data", DATA_SECTION_VA as u32, section_size as u32),
        ]);
        header.resize(0x1000, 0);
        mem.put(MODULE_BASE, &header);
        let mut data = vec![0u8; section_size];
        for &(slot, value) in slots {
            data[slot * 8..slot * 8 + 8].copy_from_slice(&value.to_le_bytes());
        }
        mem.put(MODULE_BASE + DATA_SECTION_VA, &data);
    }

    #[test]
    fn candidate_pointers_filter_and_offsets() {
        let mut data = vec![0u8; 5 * 8];
        data[8..16].copy_from_slice(&0x7000_0000u64.to_le_bytes());
        data[24..32].copy_from_slice(&(1u64 << 60).to_le_bytes());
        let found: Vec<_> = candidate_pointers(&data).collect();
        assert_eq!(found, vec![(8, RemotePtr(0x7000_0000))]);
    }

    #[test]
    fn scan_finds_the_single_crafted_slot() {
        let mut mem = FakeMemory::new();
        let class_ptr = 0x5000_0000u64;
        mem.put(
            class_ptr,
            &class_bytes(META_BASE + STR_PLAYER_SPOT, META_BASE + STR_EMPTY),
        );
        // Slot 37 holds the class; other plausible slots lead nowhere or to
        // a structure that fails the double-descriptor gate.
        let mut not_a_class = class_bytes(META_BASE + STR_PLAYER_SPOT, META_BASE + STR_EMPTY);
        not_a_class[40..44].copy_from_slice(&pack_type_bits(0, crate::il2cpp::TypeCode::STRING).to_le_bytes());
        let decoy_ptr = 0x5800_0000u64;
        mem.put(decoy_ptr, &not_a_class);
        build_module(
            &mut mem,
            &[(5, 0x4141_0000), (37, class_ptr), (101, decoy_ptr)],
        );

        let mut reader = standard_reader_with_base(mem, MODULE_BASE);
        let mut anchors = [ClassAnchor::new(PLAYER_SPOT)];
        resolve_class_anchors(&mut reader, &mut anchors, None).unwrap();

        assert_eq!(anchors[0].module_offset, DATA_SECTION_VA + 37 * 8);
        assert_eq!(anchors[0].class_ptr, RemotePtr(class_ptr));
        assert!(anchors[0].fresh);
    }

    #[test]
    fn unresolvable_anchor_is_a_structural_error() {
        let mut mem = FakeMemory::new();
        build_module(&mut mem, &[]);
        let mut reader = standard_reader_with_base(mem, MODULE_BASE);
        let mut anchors = [ClassAnchor::new(NETWORK)];
        assert!(matches!(
            resolve_class_anchors(&mut reader, &mut anchors, None),
            Err(Error::RuntimeStructure(_))
        ));
    }

    #[test]
    fn valid_cache_skips_the_scan() {
        let mut mem = FakeMemory::new();
        let class_ptr = 0x5000_0000u64;
        mem.put(
            class_ptr,
            &class_bytes(META_BASE + STR_NETWORK, META_BASE + STR_EMPTY),
        );
        // No PE header in memory: a scan attempt would error out, proving
        // the cached path never goes there.
        let anchor_offset = 0x2345u64;
        mem.put_u64(MODULE_BASE + anchor_offset, class_ptr);

        let mut reader = standard_reader_with_base(mem, MODULE_BASE);
        let mut anchors = [ClassAnchor::new(NETWORK)];
        resolve_class_anchors(&mut reader, &mut anchors, Some(&[anchor_offset])).unwrap();

        assert_eq!(anchors[0].module_offset, anchor_offset);
        assert_eq!(anchors[0].class_ptr, RemotePtr(class_ptr));
        assert!(!anchors[0].fresh);
    }

    #[test]
    fn stale_cache_entry_invalidates_only_that_anchor() {
        let mut mem = FakeMemory::new();
        let network_ptr = 0x5000_0000u64;
        let player_spot_ptr = 0x5010_0000u64;
        mem.put(
            network_ptr,
            &class_bytes(META_BASE + STR_NETWORK, META_BASE + STR_EMPTY),
        );
        mem.put(
            player_spot_ptr,
            &class_bytes(META_BASE + STR_PLAYER_SPOT, META_BASE + STR_EMPTY),
        );

        // The Network cache entry is good; the PlayerSpot entry now points
        // at Network's class, so its identity check must fail and trigger a
        // scan for PlayerSpot alone.
        let network_offset = 0x100u64;
        let stale_offset = 0x108u64;
        mem.put_u64(MODULE_BASE + network_offset, network_ptr);
        mem.put_u64(MODULE_BASE + stale_offset, network_ptr);
        build_module(&mut mem, &[(62, player_spot_ptr)]);

        let mut reader = standard_reader_with_base(mem, MODULE_BASE);
        let mut anchors = [ClassAnchor::new(NETWORK), ClassAnchor::new(PLAYER_SPOT)];
        resolve_class_anchors(
            &mut reader,
            &mut anchors,
            Some(&[network_offset, stale_offset]),
        )
        .unwrap();

        assert_eq!(anchors[0].module_offset, network_offset);
        assert!(!anchors[0].fresh);
        assert_eq!(anchors[1].module_offset, DATA_SECTION_VA + 62 * 8);
        assert!(anchors[1].fresh);
    }

    #[test]
    fn cache_round_trip_and_size_check() {
        let path = std::env::temp_dir().join(format!(
            "phasmo-vc-fixer-cache-test-{}",
            std::process::id()
        ));
        let cache = OffsetCache::new(&path);

        assert!(cache.load(2).is_none());
        cache.store(&[0x1234, 0xabcd_ef00]).unwrap();
        assert_eq!(cache.load(2), Some(vec![0x1234, 0xabcd_ef00]));
        // Wrong anchor count: reject wholesale.
        assert!(cache.load(3).is_none());

        let _ = fs::remove_file(&path);
    }
}
