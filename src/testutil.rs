//! Shared test fixtures: a fake address space and builders for synthetic
//! metadata files, PE headers and runtime structures.

use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{Error, Result};
use crate::il2cpp::{Metadata, TypeCode};
use crate::il2cpp::reader::Il2CppReader;
use crate::remote::{MemRange, MemorySource, RemotePtr};

/// Remote address the synthetic metadata file is "mapped" at.
pub const META_BASE: u64 = 0x2000_0000;
/// Size of the synthetic metadata file (one page, so mapped size == size).
pub const META_SIZE: usize = 4096;

// File offsets of the strings inside the standard metadata fixture; a
// remote `const char*` for one of them is `META_BASE + STR_*`.
pub const STR_EMPTY: u64 = 512;
pub const STR_NETWORK: u64 = 513;
pub const STR_PLAYER_SPOT: u64 = 521;

// String-table indices of the same strings (table starts at offset 512).
const IDX_EMPTY: u32 = 0;
const IDX_NETWORK: u32 = 1;
const IDX_PLAYER_SPOT: u32 = 9;
const IDX_LIST: u32 = 20;
const IDX_SCG: u32 = 27;
const IDX_PLAYER: u32 = 54;

// File offsets of the type-definition records in the standard fixture.
pub const TYPEDEF_NETWORK: u64 = 1024;
pub const TYPEDEF_PLAYER_SPOT: u64 = 1112;
pub const TYPEDEF_PLAYER: u64 = 1200;
pub const TYPEDEF_LIST: u64 = 1288;

/// A sparse fake address space made of disjoint byte regions.
pub struct FakeMemory {
    regions: Vec<(u64, Vec<u8>)>,
}

impl FakeMemory {
    pub fn new() -> Self {
        FakeMemory { regions: Vec::new() }
    }

    pub fn put(&mut self, addr: u64, bytes: &[u8]) {
        self.regions.push((addr, bytes.to_vec()));
    }

    pub fn put_u64(&mut self, addr: u64, value: u64) {
        self.put(addr, &value.to_le_bytes());
    }

    fn locate(&mut self, addr: u64, len: usize) -> Option<(usize, usize)> {
        let end = addr.checked_add(len as u64)?;
        self.regions.iter().position(|(base, bytes)| {
            addr >= *base && end <= *base + bytes.len() as u64
        }).map(|index| (index, (addr - self.regions[index].0) as usize))
    }
}

impl MemorySource for FakeMemory {
    fn read_raw(&mut self, addr: RemotePtr, out: &mut [u8]) -> Result<()> {
        match self.locate(addr.0, out.len()) {
            Some((index, offset)) => {
                out.copy_from_slice(&self.regions[index].1[offset..offset + out.len()]);
                Ok(())
            }
            None => Err(Error::Access(io::Error::new(
                io::ErrorKind::Other,
                "unmapped fake address",
            ))),
        }
    }

    fn write_raw(&mut self, addr: RemotePtr, data: &[u8]) -> Result<()> {
        match self.locate(addr.0, data.len()) {
            Some((index, offset)) => {
                self.regions[index].1[offset..offset + data.len()].copy_from_slice(data);
                Ok(())
            }
            None => Err(Error::Access(io::Error::new(
                io::ErrorKind::Other,
                "unmapped fake address",
            ))),
        }
    }
}

/// Builds synthetic global-metadata.dat images.
pub struct MetadataBuilder {
    bytes: Vec<u8>,
}

impl MetadataBuilder {
    pub fn new() -> Self {
        let mut bytes = vec![0u8; META_SIZE];
        bytes[0..4].copy_from_slice(&0xFAB11BAFu32.to_le_bytes());
        bytes[4..8].copy_from_slice(&29i32.to_le_bytes());
        MetadataBuilder { bytes }
    }

    pub fn sanity(mut self, value: u32) -> Self {
        self.bytes[0..4].copy_from_slice(&value.to_le_bytes());
        self
    }

    pub fn version(mut self, value: i32) -> Self {
        self.bytes[4..8].copy_from_slice(&value.to_le_bytes());
        self
    }

    /// Sets the header's string-table offset/size pair (bytes 24..32).
    pub fn string_table(mut self, offset: i32, size: i32) -> Self {
        self.bytes[24..28].copy_from_slice(&offset.to_le_bytes());
        self.bytes[28..32].copy_from_slice(&size.to_le_bytes());
        self
    }

    pub fn raw_at(mut self, offset: usize, data: &[u8]) -> Self {
        self.bytes[offset..offset + data.len()].copy_from_slice(data);
        self
    }

    /// Plants a type-definition record: only the leading name/namespace
    /// string indices matter to the engine.
    pub fn typedef_at(self, offset: usize, name_index: u32, namespace_index: u32) -> Self {
        self.raw_at(offset, &name_index.to_le_bytes())
            .raw_at(offset + 4, &namespace_index.to_le_bytes())
    }

    pub fn build(self) -> Vec<u8> {
        self.bytes
    }
}

/// The metadata image most tests share: a string table holding the game's
/// class names and typedef records for them.
pub fn standard_metadata() -> Vec<u8> {
    MetadataBuilder::new()
        .string_table(512, 256)
        .raw_at(
            512,
            b"\0Network\0PlayerSpot\0List`1\0System.Collections.Generic\0Player\0",
        )
        .typedef_at(TYPEDEF_NETWORK as usize, IDX_NETWORK, IDX_EMPTY)
        .typedef_at(TYPEDEF_PLAYER_SPOT as usize, IDX_PLAYER_SPOT, IDX_EMPTY)
        .typedef_at(TYPEDEF_PLAYER as usize, IDX_PLAYER, IDX_EMPTY)
        .typedef_at(TYPEDEF_LIST as usize, IDX_LIST, IDX_SCG)
        .build()
}

static TEMP_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Writes bytes to a unique temp file, runs `f` on its path, cleans up.
pub fn write_temp_metadata<R>(bytes: &[u8], f: impl FnOnce(&Path) -> R) -> R {
    let path = std::env::temp_dir().join(format!(
        "phasmo-vc-fixer-meta-{}-{}",
        std::process::id(),
        TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    std::fs::write(&path, bytes).unwrap();
    let result = f(&path);
    let _ = std::fs::remove_file(&path);
    result
}

/// A reader over a fake address space with the standard metadata fixture
/// mapped at [`META_BASE`].
pub fn standard_reader(mem: FakeMemory) -> Il2CppReader<FakeMemory> {
    standard_reader_with_base(mem, 0x1_4000_0000)
}

pub fn standard_reader_with_base(mem: FakeMemory, module_base: u64) -> Il2CppReader<FakeMemory> {
    let bytes = standard_metadata();
    let metadata = write_temp_metadata(&bytes, |path| Metadata::open(path).unwrap());
    metadata.validate().unwrap();
    let mapped = metadata.view().mapped_size() as u64;
    Il2CppReader::from_parts(
        mem,
        RemotePtr(module_base),
        MemRange {
            start: META_BASE,
            end: META_BASE + mapped,
        },
        metadata,
    )
}

// -- runtime structure builders ------------------------------------------

pub fn pack_type_bits(attrs: u16, code: TypeCode) -> u32 {
    attrs as u32 | ((code as u32) << 16)
}

/// A 16-byte Il2CppType image.
pub fn type_bytes(data: u64, attrs: u16, code: TypeCode) -> [u8; 16] {
    let mut bytes = [0u8; 16];
    bytes[0..8].copy_from_slice(&data.to_le_bytes());
    bytes[8..12].copy_from_slice(&pack_type_bits(attrs, code).to_le_bytes());
    bytes
}

/// A class instance image large enough for every partial read the engine
/// does, with both embedded type descriptors claiming CLASS kind.
pub fn class_bytes(name_ptr: u64, namespace_ptr: u64) -> Vec<u8> {
    let mut bytes = vec![0u8; 0x130];
    bytes[0x10..0x18].copy_from_slice(&name_ptr.to_le_bytes());
    bytes[0x18..0x20].copy_from_slice(&namespace_ptr.to_le_bytes());
    bytes[0x20..0x30].copy_from_slice(&type_bytes(0, 0, TypeCode::CLASS));
    bytes[0x30..0x40].copy_from_slice(&type_bytes(0, 0, TypeCode::CLASS));
    bytes
}

/// Wires a field array into a class image built by [`class_bytes`].
pub fn set_class_fields(class: &mut [u8], fields_ptr: u64, count: u16) {
    class[0x80..0x88].copy_from_slice(&fields_ptr.to_le_bytes());
    class[0x124..0x126].copy_from_slice(&count.to_le_bytes());
}

/// A 32-byte FieldInfo image (token left zero).
pub fn field_info_bytes(name: u64, ty: u64, parent: u64, offset: i32) -> [u8; 32] {
    let mut bytes = [0u8; 32];
    bytes[0..8].copy_from_slice(&name.to_le_bytes());
    bytes[8..16].copy_from_slice(&ty.to_le_bytes());
    bytes[16..24].copy_from_slice(&parent.to_le_bytes());
    bytes[24..28].copy_from_slice(&offset.to_le_bytes());
    bytes
}

/// A managed string image: object header, length, UTF-16 data.
pub fn managed_string_bytes(s: &str) -> Vec<u8> {
    let units: Vec<u16> = s.encode_utf16().collect();
    let mut bytes = vec![0u8; 0x14 + units.len() * 2];
    bytes[0x10..0x14].copy_from_slice(&(units.len() as i32).to_le_bytes());
    for (i, unit) in units.iter().enumerate() {
        bytes[0x14 + i * 2..0x16 + i * 2].copy_from_slice(&unit.to_le_bytes());
    }
    bytes
}

/// Lays out a managed `List<T>` plus its backing array.
pub fn build_managed_list(
    mem: &mut FakeMemory,
    list_ptr: u64,
    array_ptr: u64,
    elements: &[u64],
    size: i32,
) {
    let mut header = vec![0u8; 32];
    header[16..24].copy_from_slice(&array_ptr.to_le_bytes());
    header[24..28].copy_from_slice(&size.to_le_bytes());
    mem.put(list_ptr, &header);

    let mut array = vec![0u8; 0x20 + elements.len() * 8];
    for (i, element) in elements.iter().enumerate() {
        array[0x20 + i * 8..0x28 + i * 8].copy_from_slice(&element.to_le_bytes());
    }
    mem.put(array_ptr, &array);
}

/// Lays out a generic instantiation (`GenericClass` → open type + inst →
/// argument types) in one contiguous region and returns its address. The
/// typedef pointers must point into the metadata region.
pub fn build_generic_class(
    mem: &mut FakeMemory,
    base: u64,
    open_typedef: u64,
    arg_typedefs: &[u64],
) -> RemotePtr {
    const OPEN_TYPE: u64 = 0x40;
    const INST: u64 = 0x60;
    const ARGV: u64 = 0x80;
    const ARG_TYPES: u64 = 0x100;

    let mut bytes = vec![0u8; (ARG_TYPES + arg_typedefs.len() as u64 * 0x10) as usize];

    // Il2CppGenericClass { ty, class_inst, .. }
    bytes[0..8].copy_from_slice(&(base + OPEN_TYPE).to_le_bytes());
    bytes[8..16].copy_from_slice(&(base + INST).to_le_bytes());

    // Open definition's type descriptor.
    bytes[OPEN_TYPE as usize..OPEN_TYPE as usize + 16]
        .copy_from_slice(&type_bytes(open_typedef, 0, TypeCode::CLASS));

    // Il2CppGenericInst { type_argc, type_argv }.
    bytes[INST as usize..INST as usize + 4]
        .copy_from_slice(&(arg_typedefs.len() as u32).to_le_bytes());
    bytes[INST as usize + 8..INST as usize + 16].copy_from_slice(&(base + ARGV).to_le_bytes());

    for (i, arg_typedef) in arg_typedefs.iter().enumerate() {
        let arg_type = base + ARG_TYPES + i as u64 * 0x10;
        bytes[ARGV as usize + i * 8..ARGV as usize + i * 8 + 8]
            .copy_from_slice(&arg_type.to_le_bytes());
        let at = (ARG_TYPES as usize) + i * 0x10;
        bytes[at..at + 16].copy_from_slice(&type_bytes(*arg_typedef, 0, TypeCode::CLASS));
    }

    mem.put(base, &bytes);
    RemotePtr(base)
}

/// Builds raw PE header bytes: DOS stub, NT headers, section table. The
/// buffer ends right after the section table.
pub fn build_pe_header(sections: &[(&[u8], u32, u32)]) -> Vec<u8> {
    const NT: usize = 0x80;
    const OPT_SIZE: usize = 0xf0;

    let file_header = NT + 4;
    let table = file_header + 20 + OPT_SIZE;
    let mut bytes = vec![0u8; table + sections.len() * 40];

    bytes[0..2].copy_from_slice(&0x5a4du16.to_le_bytes());
    bytes[0x3c..0x40].copy_from_slice(&(NT as u32).to_le_bytes());
    bytes[NT..NT + 4].copy_from_slice(&0x0000_4550u32.to_le_bytes());
    bytes[file_header + 2..file_header + 4]
        .copy_from_slice(&(sections.len() as u16).to_le_bytes());
    bytes[file_header + 16..file_header + 18].copy_from_slice(&(OPT_SIZE as u16).to_le_bytes());

    let mut section = table;
    for (name, virtual_address, raw_size) in sections {
        bytes[section..section + name.len()].copy_from_slice(name);
        bytes[section + 12..section + 16].copy_from_slice(&virtual_address.to_le_bytes());
        bytes[section + 16..section + 20].copy_from_slice(&raw_size.to_le_bytes());
        section += 40;
    }
    bytes
}
