//! Remote introspection of Phasmophobia's IL2CPP runtime.
//!
//! The game embeds its managed metadata in a blob and exposes no debugger
//! surface, so everything here works from raw remote memory: locate the
//! process and its modules, map the metadata file locally, recognize class
//! instances by structural signature, resolve field offsets by declared
//! type, and finally read and patch live object state. Class anchors found
//! by the expensive memory scan are cached across runs and revalidated
//! against the live process before being trusted.

pub mod error;
pub mod il2cpp;
pub mod metadata_view;
pub mod pe;
pub mod phasmo;
pub mod remote;
pub mod resolver;

#[cfg(test)]
mod testutil;

pub use error::{Error, Result};
pub use il2cpp::{Il2CppId, Il2CppReader};
pub use phasmo::{PhasmoMemory, WalkieTalkieFix, MAX_PLAYERS, PHASMO_EXE_NAME};
pub use remote::{MemRange, MemorySource, RemoteProcess, RemotePtr};
