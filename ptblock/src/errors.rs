use crate::status::{EngineError, Status};
use std::{io, path::PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PtBlockError {
    /// The decode engine refused to allocate a decoder or an image.
    #[error("failed to allocate {0}")]
    Allocation(&'static str),
    /// The CPU identity or its errata couldn't be determined.
    #[error("failed to determine CPU: {0}")]
    Cpu(EngineError),
    /// Synchronising the decoder onto the packet stream failed for a reason other than the stream
    /// being empty.
    #[error("failed to synchronise decoder: {0}")]
    Sync(EngineError),
    /// The code image of the current process couldn't be built.
    #[error("failed to load code image: {0}")]
    ImageLoad(#[from] ImageLoadError),
    /// The decoder wouldn't accept the code image.
    #[error("failed to attach code image: {0}")]
    ImageAttach(EngineError),
    /// A block straddles two regions of the code image. We don't know how to resume decoding in
    /// this case.
    #[error("truncated block at 0x{first_instr:x}")]
    TruncatedBlock { first_instr: u64 },
    /// The engine reported an error while fetching events or blocks.
    #[error("failed to decode trace: {0}")]
    Decode(EngineError),
    /// The engine broke its own contract (e.g. left status flags we don't know about).
    #[error("decoder contract violated: {0}")]
    Contract(String),
    /// The session has been closed.
    #[error("decoder session is closed")]
    Closed,
    /// A previous call on the session failed and the session can't be used for decoding.
    #[error("decoder session is in an error state")]
    Errored,
    /// Invalid configuration.
    #[error("{0}")]
    Config(String),
}

impl PtBlockError {
    /// Returns `true` if the hardware trace buffer overflowed. Collecting the trace again may
    /// succeed.
    pub fn is_overflow(&self) -> bool {
        match self {
            Self::Sync(e) | Self::Decode(e) => e.is_overflow(),
            _ => false,
        }
    }

    /// Builds a [PtBlockError::Contract] for a status that the engine should never have returned.
    pub(crate) fn unexpected_status(what: &str, status: Status) -> Self {
        Self::Contract(format!("unexpected status after {what}: {status:?}"))
    }
}

/// Why the code image of the current process couldn't be built.
#[derive(Debug, Error)]
pub enum ImageLoadError {
    /// The image wouldn't accept a region.
    #[error("can't add {path:?} at 0x{vaddr:x}: {err}")]
    Register {
        path: PathBuf,
        vaddr: u64,
        err: EngineError,
    },
    /// The VDSO couldn't be copied to the dump sink.
    #[error("can't dump VDSO: {0}")]
    VdsoDump(io::Error),
    /// The dump sink couldn't be flushed to stable storage.
    #[error("can't sync VDSO dump: {0}")]
    SyncSink(io::Error),
    /// The path of the running program couldn't be determined.
    #[error("can't find the path of the main executable: {0}")]
    MainExe(io::Error),
}
