//! A decode engine that replays canned replies and records how it was driven.

use crate::{
    engine::{BlockDecoder, CodeImage, Cpu, CpuVendor, DecodeEngine, DecoderConfig, Errata, RawBlock},
    errors::ImageLoadError,
    image::{DumpSink, Module, ModuleSource, Region, Segment},
    status::{EngineError, ErrorCode, Status},
};
use std::{
    cell::RefCell,
    collections::VecDeque,
    io::{self, Write},
    path::Path,
    rc::Rc,
};

/// A call into the engine.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum Call {
    ReadCpu,
    CpuErrata(Cpu),
    AllocDecoder {
        buf_len: usize,
        cpu: Cpu,
        errata: bool,
        end_on_call: bool,
        end_on_jump: bool,
    },
    SyncForward,
    NextEvent,
    NextBlock,
    AllocImage,
    AddFile(Region),
    SetImage,
    FreeImage,
    FreeDecoder,
}

/// The decoder's answer to the next event or block fetch.
#[derive(Clone, Debug)]
pub(crate) enum Reply {
    Event(Status),
    Block(Status, RawBlock),
}

pub(crate) const TEST_CPU: Cpu = Cpu {
    vendor: CpuVendor::Intel,
    family: 6,
    model: 0x55,
    stepping: 4,
};

/// A well-formed block of `ninsn` one byte instructions starting at `ip`.
pub(crate) fn blk(ip: u64, ninsn: u16) -> RawBlock {
    RawBlock {
        ip,
        end_ip: ip + u64::from(ninsn.saturating_sub(1)),
        ninsn,
        truncated: false,
    }
}

pub(crate) struct ScriptedEngine {
    calls: Rc<RefCell<Vec<Call>>>,
    pub cpu: Result<Cpu, EngineError>,
    pub errata: Result<Errata, EngineError>,
    pub refuse_decoder: bool,
    pub refuse_image: bool,
    /// What `sync_forward` returns.
    pub sync: Status,
    /// Replies handed out, in order, by `next_event` and `next_block`.
    pub replies: Vec<Reply>,
    /// What `set_image` returns.
    pub set_image: Result<(), EngineError>,
    /// Make `add_file` fail.
    pub reject_regions: bool,
}

impl ScriptedEngine {
    pub(crate) fn new() -> Self {
        Self {
            calls: Rc::new(RefCell::new(Vec::new())),
            cpu: Ok(TEST_CPU),
            errata: Ok(Errata::from_words([1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0])),
            refuse_decoder: false,
            refuse_image: false,
            sync: Status::CLEAN,
            replies: Vec::new(),
            set_image: Ok(()),
            reject_regions: false,
        }
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls.borrow().clone()
    }

    pub(crate) fn clear_calls(&self) {
        self.calls.borrow_mut().clear();
    }

    pub(crate) fn config<'b>(&self, buf: &'b [u8]) -> DecoderConfig<'b> {
        DecoderConfig {
            buf,
            cpu: TEST_CPU,
            errata: Errata::default(),
            end_on_call: true,
            end_on_jump: true,
        }
    }

    fn record(&self, c: Call) {
        self.calls.borrow_mut().push(c);
    }
}

impl DecodeEngine for ScriptedEngine {
    type Decoder = ScriptedDecoder;
    type Image = ScriptedImage;

    fn read_cpu(&self) -> Result<Cpu, EngineError> {
        self.record(Call::ReadCpu);
        self.cpu
    }

    fn cpu_errata(&self, cpu: &Cpu) -> Result<Errata, EngineError> {
        self.record(Call::CpuErrata(*cpu));
        self.errata
    }

    unsafe fn alloc_decoder(&self, config: &DecoderConfig<'_>) -> Option<Self::Decoder> {
        self.record(Call::AllocDecoder {
            buf_len: config.buf.len(),
            cpu: config.cpu,
            errata: !config.errata.is_empty(),
            end_on_call: config.end_on_call,
            end_on_jump: config.end_on_jump,
        });
        if self.refuse_decoder {
            return None;
        }
        Some(ScriptedDecoder {
            calls: Rc::clone(&self.calls),
            sync: self.sync,
            replies: self.replies.iter().cloned().collect(),
            set_image: self.set_image,
        })
    }

    fn alloc_image(&self) -> Option<Self::Image> {
        self.record(Call::AllocImage);
        if self.refuse_image {
            return None;
        }
        Some(ScriptedImage {
            calls: Rc::clone(&self.calls),
            reject: self.reject_regions,
        })
    }
}

pub(crate) struct ScriptedDecoder {
    calls: Rc<RefCell<Vec<Call>>>,
    sync: Status,
    replies: VecDeque<Reply>,
    set_image: Result<(), EngineError>,
}

impl BlockDecoder for ScriptedDecoder {
    type Image = ScriptedImage;

    fn sync_forward(&mut self) -> Status {
        self.calls.borrow_mut().push(Call::SyncForward);
        self.sync
    }

    fn next_event(&mut self) -> Status {
        self.calls.borrow_mut().push(Call::NextEvent);
        match self.replies.pop_front() {
            Some(Reply::Event(s)) => s,
            x => panic!("event fetched, but the next reply is {x:?}"),
        }
    }

    fn next_block(&mut self) -> (Status, RawBlock) {
        self.calls.borrow_mut().push(Call::NextBlock);
        match self.replies.pop_front() {
            Some(Reply::Block(s, b)) => (s, b),
            None => (Status::from_error(ErrorCode::Eos), RawBlock::default()),
            x => panic!("block fetched, but the next reply is {x:?}"),
        }
    }

    unsafe fn set_image(&mut self, _image: &mut ScriptedImage) -> Result<(), EngineError> {
        self.calls.borrow_mut().push(Call::SetImage);
        self.set_image
    }
}

impl Drop for ScriptedDecoder {
    fn drop(&mut self) {
        self.calls.borrow_mut().push(Call::FreeDecoder);
    }
}

pub(crate) struct ScriptedImage {
    calls: Rc<RefCell<Vec<Call>>>,
    reject: bool,
}

impl CodeImage for ScriptedImage {
    fn add_file(
        &mut self,
        path: &Path,
        offset: u64,
        size: u64,
        vaddr: u64,
    ) -> Result<(), EngineError> {
        self.calls
            .borrow_mut()
            .push(Call::AddFile(Region::new(path, offset, size, vaddr)));
        if self.reject {
            return Err(EngineError::from(ErrorCode::BadImage));
        }
        Ok(())
    }
}

impl Drop for ScriptedImage {
    fn drop(&mut self) {
        self.calls.borrow_mut().push(Call::FreeImage);
    }
}

/// A process with one library and no VDSO.
pub(crate) struct FakeModules;

impl FakeModules {
    pub(crate) const REGION: (&'static str, u64, u64, u64) = ("/lib/libtest.so", 0x1000, 0x500, 0x7f00_1000);
}

impl ModuleSource for FakeModules {
    fn modules(&self) -> Result<Vec<Module>, ImageLoadError> {
        let (path, offset, filesz, vaddr) = Self::REGION;
        Ok(vec![Module::new(
            path,
            0x7f00_0000,
            vec![
                Segment {
                    typ: libc::PT_LOAD,
                    flags: libc::PF_R,
                    vaddr: 0,
                    offset: 0,
                    filesz: 0x800,
                },
                Segment {
                    typ: libc::PT_LOAD,
                    flags: libc::PF_R | libc::PF_X,
                    vaddr: vaddr - 0x7f00_0000,
                    offset,
                    filesz,
                },
            ],
        )])
    }

    unsafe fn code_bytes(&self, vaddr: u64, _len: u64) -> &[u8] {
        panic!("no VDSO here, but asked for code at 0x{vaddr:x}");
    }
}

/// A sink that discards everything and remembers if it was synced.
#[derive(Default)]
pub(crate) struct NullSink {
    pub synced: bool,
}

impl Write for NullSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl DumpSink for NullSink {
    fn path(&self) -> &Path {
        Path::new("/dev/null")
    }

    fn sync(&mut self) -> io::Result<()> {
        self.synced = true;
        Ok(())
    }
}
