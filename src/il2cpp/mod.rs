//! IL2CPP runtime introspection.
//!
//! Everything needed to make sense of an IL2CPP process from the outside:
//! the raw structure layouts, the local metadata mapping, and the reader
//! that ties both to a remote address space.

pub mod metadata;
pub mod reader;
pub mod structs;
pub mod type_code;

pub use metadata::{Metadata, MAX_IDENT_LEN};
pub use reader::{
    Il2CppId, Il2CppReader, GAME_ASSEMBLY_DLL, GLOBAL_METADATA_FILE, MAX_CLASS_FIELDS,
};
pub use type_code::TypeCode;
