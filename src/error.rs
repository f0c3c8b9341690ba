//! Error taxonomy for the introspection engine.
//!
//! Every failure crosses the component boundary as a value; nothing in the
//! engine panics on bad remote data. Heuristic misses (a candidate pointer
//! that fails a structural check) are not errors and surface as `None` or
//! `false` from the query in question.

use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The target process, module or file does not exist (yet).
    /// Recoverable by retrying later.
    #[error("target not found")]
    NotFound,

    /// The OS denied access to the target process. Not recoverable without
    /// running elevated.
    #[error("insufficient privileges to open the target process")]
    NoPrivileges,

    /// A remote read/write primitive failed for a reason other than the
    /// process having exited (partial copy, invalid address, protection
    /// change).
    #[error("remote memory access failed: {0}")]
    Access(#[source] io::Error),

    /// The target does not present the expected IL2CPP layout: bad metadata
    /// header, missing module/mapped file, or an anchor/field that stayed
    /// unresolved after a full scan. Usually an incompatible game build or a
    /// process that has not finished loading.
    #[error("runtime structure mismatch: {0}")]
    RuntimeStructure(&'static str),

    /// The target process exited. All engine resources have been released;
    /// the session is over until a fresh open.
    #[error("target process exited")]
    ProcessExited,
}

impl Error {
    /// Whether waiting and retrying the same operation can reasonably
    /// succeed without external action.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::NotFound | Error::Access(_) | Error::RuntimeStructure(_)
        )
    }
}
