//! Raw IL2CPP structure layouts.
//!
//! Byte-exact mirrors of the runtime structures this engine reads, for
//! Unity 2022.3 era builds (metadata version 29+). Every pointer-typed field
//! is a [`RemotePtr`]: an address in the target, never dereferenceable
//! locally. Structures that the runtime allocates with version-dependent
//! tails (notably `Il2CppClass`) are deliberately *not* mirrored whole;
//! callers read the sub-ranges they need through the byte offsets below.

use bytemuck::{Pod, Zeroable};

use super::type_code::TypeCode;
use crate::remote::RemotePtr;

// ---------------------------------------------------------------------------
// Metadata file (global-metadata.dat)
// ---------------------------------------------------------------------------

/// Fixed prefix of the global-metadata.dat header: a sanity value, a format
/// version and `(offset, size)` pairs for each metadata table. Tables past
/// `type_definitions` shift between IL2CPP versions and are not needed.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct GlobalMetadataHeader {
    pub sanity: u32,
    pub version: i32,
    pub string_literal_offset: i32, // string data for managed code
    pub string_literal_size: i32,
    pub string_literal_data_offset: i32,
    pub string_literal_data_size: i32,
    pub string_offset: i32, // string data for metadata identifiers
    pub string_size: i32,
    pub events_offset: i32,
    pub events_size: i32,
    pub properties_offset: i32,
    pub properties_size: i32,
    pub methods_offset: i32,
    pub methods_size: i32,
    pub parameter_default_values_offset: i32,
    pub parameter_default_values_size: i32,
    pub field_default_values_offset: i32,
    pub field_default_values_size: i32,
    pub field_and_parameter_default_value_data_offset: i32,
    pub field_and_parameter_default_value_data_size: i32,
    pub field_marshaled_sizes_offset: i32,
    pub field_marshaled_sizes_size: i32,
    pub parameters_offset: i32,
    pub parameters_size: i32,
    pub fields_offset: i32,
    pub fields_size: i32,
    pub generic_parameters_offset: i32,
    pub generic_parameters_size: i32,
    pub generic_parameter_constraints_offset: i32,
    pub generic_parameter_constraints_size: i32,
    pub generic_containers_offset: i32,
    pub generic_containers_size: i32,
    pub nested_types_offset: i32,
    pub nested_types_size: i32,
    pub interfaces_offset: i32,
    pub interfaces_size: i32,
    pub vtable_methods_offset: i32,
    pub vtable_methods_size: i32,
    pub interface_offsets_offset: i32,
    pub interface_offsets_size: i32,
    pub type_definitions_offset: i32,
    pub type_definitions_size: i32,
}

/// A type definition record in the metadata file (88 bytes).
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct MetaTypeDefinition {
    pub name_index: u32,
    pub namespace_index: u32,
    pub byval_type_index: i32,
    pub declaring_type_index: i32,
    pub parent_index: i32,
    pub element_type_index: i32,
    pub generic_container_index: i32,
    pub flags: u32,
    pub field_start: i32,
    pub method_start: i32,
    pub event_start: i32,
    pub property_start: i32,
    pub nested_types_start: i32,
    pub interfaces_start: i32,
    pub vtable_start: i32,
    pub interface_offsets_start: i32,
    pub method_count: u16,
    pub property_count: u16,
    pub field_count: u16,
    pub event_count: u16,
    pub nested_type_count: u16,
    pub vtable_count: u16,
    pub interfaces_count: u16,
    pub interface_offsets_count: u16,
    // Bit-packed booleans and packing sizes; decoded nowhere in this engine,
    // layout kept for record size fidelity.
    pub bitfield: u32,
    pub token: u32,
}

// ---------------------------------------------------------------------------
// Runtime structures
// ---------------------------------------------------------------------------

/// A type descriptor: a payload word plus a bit-packed attribute word.
///
/// The attribute word packs, from the least significant bit up:
///   bits  0..16  attrs (field/parameter attribute flags)
///   bits 16..24  type code (see [`TypeCode`])
///   bits 24..29  num_mods
///   bit  29      byref
///   bit  30      pinned
///   bit  31      valuetype
///
/// The payload is interpreted per type code: for `CLASS` it is a remote
/// pointer to a [`MetaTypeDefinition`] inside the mapped metadata file, for
/// `GENERICINST` a remote pointer to an [`Il2CppGenericClass`].
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct Il2CppType {
    pub data: RemotePtr,
    pub bits: u32,
    _pad: u32,
}

impl Il2CppType {
    pub fn attrs(&self) -> u32 {
        self.bits & 0xffff
    }

    pub fn code(&self) -> TypeCode {
        TypeCode::from_raw((self.bits >> 16) & 0xff)
    }

    pub fn num_mods(&self) -> u32 {
        (self.bits >> 24) & 0x1f
    }

    pub fn is_byref(&self) -> bool {
        self.bits & (1 << 29) != 0
    }

    pub fn is_pinned(&self) -> bool {
        self.bits & (1 << 30) != 0
    }

    pub fn is_valuetype(&self) -> bool {
        self.bits & (1 << 31) != 0
    }
}

/// Field access bits inside [`Il2CppType::attrs`] for field descriptors.
pub const FIELD_ACCESS_MASK: u32 = 0x0007;
pub const FIELD_ACCESS_PRIVATE: u32 = 0x0001;
pub const FIELD_ACCESS_PUBLIC: u32 = 0x0006;

/// A field record inside a class's field array (32 bytes, fixed layout,
/// safe to batch-read).
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct FieldInfo {
    /// Remote `const char*` into the mapped metadata file.
    pub name: RemotePtr,
    /// Remote pointer to this field's [`Il2CppType`].
    pub ty: RemotePtr,
    /// Remote pointer to the declaring `Il2CppClass`.
    pub parent: RemotePtr,
    /// Byte offset of the field inside an instance (or the static block).
    pub offset: i32,
    pub token: u32,
}

/// The version-stable prefix of `Il2CppClass`: the four leading pointers and
/// the two embedded self-describing type descriptors (64 bytes). This is the
/// structural signature used for heuristic class recognition.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct ClassHead {
    pub image: RemotePtr,
    pub gc_desc: RemotePtr,
    /// Remote `const char*` into the mapped metadata file.
    pub name: RemotePtr,
    /// Remote `const char*` into the mapped metadata file.
    pub namespace: RemotePtr,
    pub byval_arg: Il2CppType,
    pub this_arg: Il2CppType,
}

impl ClassHead {
    /// The pure structural gate: every class describes itself with two
    /// embedded type descriptors, and both must claim `CLASS` kind. One
    /// descriptor matching is a common accident in scanned data; both
    /// matching at the right offsets is structurally improbable for
    /// anything that is not a class.
    pub fn looks_like_class(&self) -> bool {
        self.byval_arg.code() == TypeCode::CLASS && self.this_arg.code() == TypeCode::CLASS
    }
}

/// Byte offsets into `Il2CppClass` for the partial reads this engine does.
/// The structure's full size varies with version and flags, so it is never
/// read whole.
pub const CLASS_NAME: u64 = 0x10;
pub const CLASS_NAMESPACE: u64 = 0x18;
pub const CLASS_FIELDS: u64 = 0x80;
pub const CLASS_STATIC_FIELDS: u64 = 0xb8;
pub const CLASS_FIELD_COUNT: u64 = 0x124;

/// Every managed object starts with a class pointer and a monitor word.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct Il2CppObject {
    pub klass: RemotePtr,
    pub monitor: RemotePtr,
}

pub const OBJECT_KLASS: u64 = 0x0;

/// `System.String`: object header, then a code-unit count, then the UTF-16
/// data. The data is not 8-aligned, so the layout is expressed as offsets.
pub const STRING_LENGTH: u64 = 0x10;
pub const STRING_CHARS: u64 = 0x14;

/// `Il2CppArray`: object header, bounds pointer, max length, then elements.
pub const ARRAY_ITEMS: u64 = 0x20;

/// Header of `System.Collections.Generic.List<T>`: backing array and
/// logical element count (the backing array is usually longer).
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct ManagedListHeader {
    pub object: Il2CppObject,
    /// Remote pointer to the backing `Il2CppArray`.
    pub items: RemotePtr,
    pub size: i32,
    pub version: i32,
}

/// A generic instantiation: the open definition's type descriptor plus the
/// instantiation context.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct Il2CppGenericClass {
    /// Remote pointer to the open definition's [`Il2CppType`].
    pub ty: RemotePtr,
    /// Remote pointer to the class [`Il2CppGenericInst`].
    pub class_inst: RemotePtr,
    /// Remote pointer to the method [`Il2CppGenericInst`].
    pub method_inst: RemotePtr,
    pub cached_class: RemotePtr,
}

/// An ordered set of generic type arguments.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct Il2CppGenericInst {
    pub type_argc: u32,
    _pad: u32,
    /// Remote pointer to an array of `type_argc` remote [`Il2CppType`]
    /// pointers.
    pub type_argv: RemotePtr,
}
