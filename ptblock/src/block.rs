use crate::engine::RawBlock;
use std::fmt;

/// A basic block, as found by the block decoder.
///
/// Blocks end at calls, unconditional jumps, and at whatever else the decode engine considers a
/// block boundary (e.g. conditional branches, returns, or a change of code region).
#[derive(Clone, Copy, Eq, PartialEq)]
pub struct Block {
    /// Virtual address of the start of the first instruction in this block.
    first_instr: u64,
    /// Virtual address of the start of the last instruction in this block.
    last_instr: u64,
    /// The number of instructions in the block.
    ninsn: u16,
}

impl fmt::Debug for Block {
    /// Format virtual addresses using hexadecimal.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Block({:x}..={:x}, ninsn={})",
            self.first_instr, self.last_instr, self.ninsn
        )
    }
}

impl Block {
    /// Creates a new basic block from the virtual addresses of:
    ///   * the start of the first instruction in the basic block.
    ///   * the start of the last instruction in the basic block.
    pub fn from_vaddr_range(first_instr: u64, last_instr: u64, ninsn: u16) -> Self {
        debug_assert!(first_instr <= last_instr);
        Self {
            first_instr,
            last_instr,
            ninsn,
        }
    }

    pub fn first_instr(&self) -> u64 {
        self.first_instr
    }

    pub fn last_instr(&self) -> u64 {
        self.last_instr
    }

    pub fn ninsn(&self) -> u16 {
        self.ninsn
    }
}

impl From<RawBlock> for Block {
    fn from(b: RawBlock) -> Self {
        Self::from_vaddr_range(b.ip, b.end_ip, b.ninsn)
    }
}
