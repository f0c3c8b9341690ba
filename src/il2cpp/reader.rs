//! The introspection engine over a live IL2CPP process.
//!
//! [`Il2CppReader`] combines a remote address space with a local mapping of
//! the target's metadata file and answers semantic questions about the
//! runtime: what class a pointer refers to, where a field lives, what a
//! managed string says. Remote memory is never trusted; metadata pointers
//! are only ever dereferenced after translation into the local mapping, and
//! everything read out of the target is validated structurally before use.

use bytemuck::{Pod, Zeroable};
use log::debug;

use super::metadata::{Metadata, MAX_IDENT_LEN};
use super::structs::{
    ClassHead, FieldInfo, Il2CppGenericClass, Il2CppGenericInst, Il2CppType, ManagedListHeader,
    MetaTypeDefinition, ARRAY_ITEMS, CLASS_FIELDS, CLASS_FIELD_COUNT, CLASS_NAME, CLASS_NAMESPACE,
    OBJECT_KLASS, STRING_CHARS, STRING_LENGTH,
};
use super::type_code::TypeCode;
use crate::error::{Error, Result};
use crate::remote::{MemRange, MemorySource, RemoteProcess, RemotePtr};

/// Module that hosts the compiled managed code and the runtime's statics.
pub const GAME_ASSEMBLY_DLL: &str = "GameAssembly.dll";

/// The metadata blob the runtime maps read-only at startup.
pub const GLOBAL_METADATA_FILE: &str = "global-metadata.dat";

/// Guard against corrupted field counts when enumerating a class.
pub const MAX_CLASS_FIELDS: u16 = 512;

/// A class identity: name and namespace, borrowed from the local metadata
/// mapping. Equality of both parts is the basis of all class recognition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Il2CppId<'a> {
    pub name: &'a str,
    pub namespace: &'a str,
}

impl<'a> Il2CppId<'a> {
    pub const fn new(name: &'a str, namespace: &'a str) -> Self {
        Il2CppId { name, namespace }
    }
}

/// Introspects an IL2CPP process through a [`MemorySource`].
///
/// Constructing one is the Closed → Ready transition; dropping it (or the
/// target exiting) is Ready → Closed. A failed [`open`](Self::open) releases
/// everything it acquired, so retrying is always safe.
pub struct Il2CppReader<S = RemoteProcess> {
    mem: S,
    game_assembly_base: RemotePtr,
    metadata_range: MemRange,
    metadata: Metadata,
}

impl Il2CppReader<RemoteProcess> {
    /// Opens a remote IL2CPP process by executable name.
    pub fn open(process_name: &str) -> Result<Self> {
        let mut process = RemoteProcess::open_by_name(process_name)?;

        let module = process.module_info(GAME_ASSEMBLY_DLL).ok_or(Error::RuntimeStructure(
            "GameAssembly.dll is not loaded in the target",
        ))?;

        let mapped = process
            .mapped_file_info(GLOBAL_METADATA_FILE)
            .ok_or(Error::RuntimeStructure(
                "global-metadata.dat is not mapped in the target",
            ))?;

        let metadata = Metadata::open(&mapped.path)?;
        if metadata.view().mapped_size() as u64 != mapped.range.size() {
            // The file on disk is not the one the target actually mapped.
            return Err(Error::RuntimeStructure(
                "local and remote metadata sizes differ",
            ));
        }
        metadata.validate()?;

        debug!(
            "opened il2cpp process [pid: {}, metadata version: {}, GameAssembly base: {}, \
             metadata: {:#x}-{:#x}]",
            process.pid(),
            metadata.version(),
            module.base,
            mapped.range.start,
            mapped.range.end
        );

        Ok(Il2CppReader {
            mem: process,
            game_assembly_base: module.base,
            metadata_range: mapped.range,
            metadata,
        })
    }

    pub fn is_open(&self) -> bool {
        self.mem.is_open()
    }

    pub fn pid(&self) -> u32 {
        self.mem.pid()
    }
}

impl<S: MemorySource> Il2CppReader<S> {
    #[cfg(test)]
    pub(crate) fn from_parts(
        mem: S,
        game_assembly_base: RemotePtr,
        metadata_range: MemRange,
        metadata: Metadata,
    ) -> Self {
        Il2CppReader {
            mem,
            game_assembly_base,
            metadata_range,
            metadata,
        }
    }

    /// Direct access to the underlying address space, for value reads and
    /// writes once offsets are known.
    pub fn memory(&mut self) -> &mut S {
        &mut self.mem
    }

    pub fn game_assembly_base(&self) -> RemotePtr {
        self.game_assembly_base
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    // -- metadata pointer translation ------------------------------------

    /// Translates a remote pointer claimed to point into the metadata file
    /// to an offset in the local mapping. This is the only sanctioned way to
    /// dereference such a pointer; anything outside the recorded remote
    /// region is rejected.
    pub fn ptr_to_local(&self, remote: RemotePtr) -> Option<usize> {
        if !self.metadata_range.contains(remote.0) {
            return None;
        }
        Some((remote.0 - self.metadata_range.start) as usize)
    }

    /// Resolves a remote `const char*` into the metadata file to a local
    /// string view, with the scan bounded at `max_len`.
    pub fn remote_str_to_local(&self, remote: RemotePtr, max_len: usize) -> Option<&str> {
        self.metadata.str_at_offset(self.ptr_to_local(remote)?, max_len)
    }

    // -- class instances -------------------------------------------------

    /// Reads the class-instance pointer out of a managed object header.
    pub fn object_class(&mut self, obj_ptr: RemotePtr) -> Option<RemotePtr> {
        self.mem.read::<RemotePtr>(obj_ptr.offset(OBJECT_KLASS)).ok()
    }

    pub fn class_name(&mut self, class_ptr: RemotePtr) -> Option<&str> {
        let name_ptr = self.mem.read::<RemotePtr>(class_ptr.offset(CLASS_NAME)).ok()?;
        self.remote_str_to_local(name_ptr, MAX_IDENT_LEN)
    }

    pub fn class_namespace(&mut self, class_ptr: RemotePtr) -> Option<&str> {
        let ns_ptr = self
            .mem
            .read::<RemotePtr>(class_ptr.offset(CLASS_NAMESPACE))
            .ok()?;
        self.remote_str_to_local(ns_ptr, MAX_IDENT_LEN)
    }

    /// Checks a class instance against an expected identity. The identity is
    /// re-derived on every call: the remote memory can be repurposed by the
    /// target's GC between observations, so it is only trustworthy
    /// per-observation.
    pub fn class_has_id(&mut self, class_ptr: RemotePtr, id: Il2CppId<'_>) -> bool {
        #[derive(Clone, Copy, Pod, Zeroable)]
        #[repr(C)]
        struct NamePtrs {
            name: RemotePtr,
            namespace: RemotePtr,
        }

        let Ok(ptrs) = self.mem.read::<NamePtrs>(class_ptr.offset(CLASS_NAME)) else {
            return false;
        };
        self.remote_str_to_local(ptrs.name, MAX_IDENT_LEN) == Some(id.name)
            && self.remote_str_to_local(ptrs.namespace, MAX_IDENT_LEN) == Some(id.namespace)
    }

    /// Heuristically decides whether an arbitrary value found in scanned
    /// memory points at a class instance, and if so returns its identity.
    ///
    /// A failed remote read here is the normal "not a class" outcome of a
    /// search, never an error.
    pub fn heuristic_class_check(&mut self, class_ptr: RemotePtr) -> Option<Il2CppId<'_>> {
        if !class_ptr.is_plausible() {
            return None;
        }
        let head = self.mem.read::<ClassHead>(class_ptr).ok()?;
        if !head.looks_like_class() {
            return None;
        }
        let name = self.remote_str_to_local(head.name, MAX_IDENT_LEN)?;
        let namespace = self.remote_str_to_local(head.namespace, MAX_IDENT_LEN)?;
        Some(Il2CppId { name, namespace })
    }

    // -- type definitions (metadata records) -----------------------------

    fn typedef_at(&self, typedef_ptr: RemotePtr) -> Option<MetaTypeDefinition> {
        let offset = self.ptr_to_local(typedef_ptr)?;
        self.metadata.view().read(offset)
    }

    pub fn typedef_name(&self, typedef_ptr: RemotePtr) -> Option<&str> {
        let td = self.typedef_at(typedef_ptr)?;
        self.metadata.string_by_index(td.name_index, MAX_IDENT_LEN)
    }

    pub fn typedef_namespace(&self, typedef_ptr: RemotePtr) -> Option<&str> {
        let td = self.typedef_at(typedef_ptr)?;
        self.metadata.string_by_index(td.namespace_index, MAX_IDENT_LEN)
    }

    /// Checks a metadata type definition against an expected identity.
    pub fn typedef_has_id(&self, typedef_ptr: RemotePtr, id: Il2CppId<'_>) -> bool {
        let Some(td) = self.typedef_at(typedef_ptr) else {
            return false;
        };
        self.metadata.string_by_index(td.name_index, MAX_IDENT_LEN) == Some(id.name)
            && self.metadata.string_by_index(td.namespace_index, MAX_IDENT_LEN)
                == Some(id.namespace)
    }

    /// Checks whether a `GENERICINST` payload is the given open generic
    /// definition instantiated with exactly the given class arguments.
    ///
    /// The open definition's identity is checked first and short-circuits
    /// everything else (by convention its name carries the arity suffix,
    /// e.g. ``List`1``); then the argument count must match exactly, then
    /// every argument must be a class with the expected identity, in order.
    pub fn generic_inst_matches(
        &mut self,
        generic_class_ptr: RemotePtr,
        open: Il2CppId<'_>,
        args: &[Il2CppId<'_>],
    ) -> bool {
        let Ok(generic_class) = self.mem.read::<Il2CppGenericClass>(generic_class_ptr) else {
            return false;
        };
        let Ok(open_ty) = self.mem.read::<Il2CppType>(generic_class.ty) else {
            return false;
        };
        if open_ty.code() != TypeCode::CLASS || !self.typedef_has_id(open_ty.data, open) {
            return false;
        }

        let Ok(inst) = self.mem.read::<Il2CppGenericInst>(generic_class.class_inst) else {
            return false;
        };
        if inst.type_argc as usize != args.len() {
            return false;
        }
        for (i, want) in args.iter().enumerate() {
            let Ok(arg_ptr) = self
                .mem
                .read::<RemotePtr>(inst.type_argv.offset(i as u64 * 8))
            else {
                return false;
            };
            let Ok(arg_ty) = self.mem.read::<Il2CppType>(arg_ptr) else {
                return false;
            };
            if arg_ty.code() != TypeCode::CLASS || !self.typedef_has_id(arg_ty.data, *want) {
                return false;
            }
        }
        true
    }

    // -- fields ----------------------------------------------------------

    /// Enumerates a class's fields in declaration order while the visitor
    /// returns `true`.
    ///
    /// The field array is fetched with a single bulk read to keep remote
    /// round-trips down; the count is clamped at `max_fields` to guard
    /// against corrupted memory. Any read failure silently ends the
    /// enumeration: consumers cannot (and do not need to) distinguish
    /// "nothing there" from "couldn't look".
    pub fn enum_fields<F>(&mut self, class_ptr: RemotePtr, max_fields: u16, mut visit: F)
    where
        F: FnMut(&mut Self, &FieldInfo) -> bool,
    {
        let Ok(field_count) = self.mem.read::<u16>(class_ptr.offset(CLASS_FIELD_COUNT)) else {
            return;
        };
        let field_count = field_count.min(max_fields) as usize;
        if field_count == 0 {
            return;
        }
        let Ok(fields_ptr) = self.mem.read::<RemotePtr>(class_ptr.offset(CLASS_FIELDS)) else {
            return;
        };

        let mut buf = vec![0u8; field_count * std::mem::size_of::<FieldInfo>()];
        if self.mem.read_raw(fields_ptr, &mut buf).is_err() {
            return;
        }
        for chunk in buf.chunks_exact(std::mem::size_of::<FieldInfo>()) {
            let field: FieldInfo = bytemuck::pod_read_unaligned(chunk);
            if !visit(&mut *self, &field) {
                break;
            }
        }
    }

    /// Resolves a field's name through the metadata mapping.
    pub fn field_name(&self, field: &FieldInfo) -> Option<&str> {
        self.remote_str_to_local(field.name, MAX_IDENT_LEN)
    }

    /// Reads a field's type descriptor.
    pub fn field_type(&mut self, field: &FieldInfo) -> Option<Il2CppType> {
        self.mem.read::<Il2CppType>(field.ty).ok()
    }

    // -- managed objects -------------------------------------------------

    /// Reads a `System.String` as raw UTF-16 code units. Only the length the
    /// object itself declares is trusted; nothing is read past it.
    pub fn string_read_utf16(&mut self, str_ptr: RemotePtr) -> Option<Vec<u16>> {
        let length = self.mem.read::<i32>(str_ptr.offset(STRING_LENGTH)).ok()?;
        let length = usize::try_from(length).ok()?;
        let mut buf = vec![0u8; length * 2];
        self.mem.read_raw(str_ptr.offset(STRING_CHARS), &mut buf).ok()?;
        Some(
            buf.chunks_exact(2)
                .map(|unit| u16::from_le_bytes([unit[0], unit[1]]))
                .collect(),
        )
    }

    /// Reads a `System.String` and converts it to UTF-8. An unpaired
    /// surrogate makes the conversion fail softly.
    pub fn string_read_utf8(&mut self, str_ptr: RemotePtr) -> Option<String> {
        String::from_utf16(&self.string_read_utf16(str_ptr)?).ok()
    }

    /// Reads a `List<T>` of reference-typed elements.
    ///
    /// Returns the list's true logical size together with up to `max_count`
    /// leading elements; a returned size larger than the vector's length
    /// means the element read was truncated, never that elements are
    /// missing from the list.
    pub fn generic_list_read(
        &mut self,
        list_ptr: RemotePtr,
        max_count: usize,
    ) -> Option<(usize, Vec<RemotePtr>)> {
        let header = self.mem.read::<ManagedListHeader>(list_ptr).ok()?;
        let size = usize::try_from(header.size).ok()?;
        let take = size.min(max_count);
        let mut buf = vec![0u8; take * 8];
        if take > 0 {
            self.mem
                .read_raw(header.items.offset(ARRAY_ITEMS), &mut buf)
                .ok()?;
        }
        let items = buf
            .chunks_exact(8)
            .map(|chunk| bytemuck::pod_read_unaligned::<RemotePtr>(chunk))
            .collect();
        Some((size, items))
    }
}
