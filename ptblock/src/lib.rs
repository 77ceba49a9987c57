//! Reconstruct the sequence of executed basic blocks from an Intel Processor Trace packet stream,
//! using a code image of the current process.
//!
//! A [DecoderSession] binds a block decoder (supplied by a [DecodeEngine], such as
//! [libipt::Libipt] when the `libipt` feature is enabled) to a packet buffer and to the code
//! loaded into this process. Blocks are then pulled one at a time with
//! [DecoderSession::next_block] or [DecoderSession::iter_blocks].

#![cfg(all(target_arch = "x86_64", target_os = "linux"))]
#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

mod block;
pub mod cpu;
pub mod engine;
pub mod errors;
pub mod image;
mod iter;
#[cfg(decoder_libipt)]
pub mod libipt;
pub mod log;
mod session;
pub mod status;
#[cfg(test)]
mod testing;

pub use block::Block;
pub use cpu::CpuSelection;
pub use engine::DecodeEngine;
pub use errors::{ImageLoadError, PtBlockError};
pub use image::{load_self_image, CodeMap, DumpSink, ProcessModules, Region, RegionList, VdsoFile};
pub use iter::BlockIterator;
pub use session::{DecoderSession, DecoderSessionBuilder};
pub use status::Status;
