//! The interface to the underlying trace decoding engine.
//!
//! We don't parse packets or model instruction semantics ourselves: an engine (e.g. libipt) does
//! that. This module describes what we need from such an engine. Resources are released by
//! dropping them.

use crate::status::{EngineError, Status};
use std::{fmt, path::Path};

/// The CPU vendor, as far as the decode engine cares.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CpuVendor {
    Unknown,
    Intel,
}

/// The identity of the CPU that produced a trace.
#[derive(Clone, Copy, Eq, PartialEq)]
pub struct Cpu {
    pub vendor: CpuVendor,
    pub family: u16,
    pub model: u8,
    pub stepping: u8,
}

impl fmt::Debug for Cpu {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Cpu({:?} {}/{}/{})",
            self.vendor, self.family, self.model, self.stepping
        )
    }
}

/// The set of CPU errata that the decoder should work around.
///
/// The meaning of each bit is up to the engine: for libipt this is the layout of `struct
/// pt_errata`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Errata {
    words: [u32; 16],
}

impl Errata {
    pub fn from_words(words: [u32; 16]) -> Self {
        Self { words }
    }

    pub fn words(&self) -> &[u32; 16] {
        &self.words
    }

    /// Returns `true` if there are no errata to work around.
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }
}

/// How to configure a block decoder.
#[derive(Clone, Debug)]
pub struct DecoderConfig<'b> {
    /// The raw packet stream.
    pub buf: &'b [u8],
    pub cpu: Cpu,
    pub errata: Errata,
    /// End a block after a call instruction.
    pub end_on_call: bool,
    /// End a block after an unconditional jump.
    pub end_on_jump: bool,
}

/// A block as reported by the engine.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RawBlock {
    /// Virtual address of the first instruction in the block.
    pub ip: u64,
    /// Virtual address of the last instruction in the block.
    pub end_ip: u64,
    /// The number of instructions in the block.
    pub ninsn: u16,
    /// The block was cut short because its code continues in a different image region.
    pub truncated: bool,
}

/// A decode engine: the source of block decoders and code images.
pub trait DecodeEngine {
    type Decoder: BlockDecoder<Image = Self::Image>;
    type Image: CodeImage;

    /// Read the identity of the CPU we are running on.
    fn read_cpu(&self) -> Result<Cpu, EngineError>;

    /// Determine the errata that apply to `cpu`.
    fn cpu_errata(&self, cpu: &Cpu) -> Result<Errata, EngineError>;

    /// Allocate a block decoder from `config`, or `None` if the engine refuses.
    ///
    /// # Safety
    ///
    /// The decoder may read `config.buf` for as long as it lives: the caller must ensure that the
    /// buffer outlives the decoder.
    unsafe fn alloc_decoder(&self, config: &DecoderConfig<'_>) -> Option<Self::Decoder>;

    /// Allocate an empty code image, or `None` if the engine refuses.
    fn alloc_image(&self) -> Option<Self::Image>;
}

/// A stateful block decoder.
///
/// Every method returns the decoder's new status, which the caller must feed into its next
/// decision.
pub trait BlockDecoder {
    type Image;

    /// Synchronise onto the first packet boundary from which decoding can start.
    fn sync_forward(&mut self) -> Status;

    /// Fetch (and discard) the next pending event.
    fn next_event(&mut self) -> Status;

    /// Fetch the next block. The block is only meaningful if the status is non-negative.
    fn next_block(&mut self) -> (Status, RawBlock);

    /// Make the decoder read code from `image`.
    ///
    /// # Safety
    ///
    /// The decoder may keep referring to the code held by `image` (but not to the `image` value
    /// itself, which may be moved): the caller must not use the decoder after `image` is dropped.
    unsafe fn set_image(&mut self, image: &mut Self::Image) -> Result<(), EngineError>;
}

/// A code image: the regions of code that a decoder can read instructions from.
pub trait CodeImage {
    /// Register `size` bytes of the file at `path`, starting at `offset`, as being loaded at
    /// `vaddr`.
    fn add_file(&mut self, path: &Path, offset: u64, size: u64, vaddr: u64)
        -> Result<(), EngineError>;
}
