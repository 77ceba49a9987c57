//! Decoder sessions: a block decoder bound to a packet buffer and to a code image of the current
//! process.

use crate::{
    block::Block,
    cpu::CpuSelection,
    engine::{BlockDecoder, CpuVendor, DecodeEngine, DecoderConfig, Errata},
    errors::PtBlockError,
    image::{load_self_image, CodeMap, DumpSink, ModuleSource, Region},
    iter::{self, BlockIterator},
    log::{Log, Verbosity},
    status::Status,
};
use std::{env, fmt, marker::PhantomData};

/// Configures and opens [DecoderSession]s.
#[derive(Clone, Debug)]
pub struct DecoderSessionBuilder {
    cpu: CpuSelection,
    errata: bool,
    end_on_call: bool,
    end_on_jump: bool,
    log: Log,
}

impl Default for DecoderSessionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DecoderSessionBuilder {
    /// A builder that decodes for the CPU we are running on, working around its errata, with
    /// blocks ending at calls and unconditional jumps.
    pub fn new() -> Self {
        Self {
            cpu: CpuSelection::Auto,
            errata: true,
            end_on_call: true,
            end_on_jump: true,
            log: Log::default(),
        }
    }

    /// Like [DecoderSessionBuilder::new], but honouring the `PTBLOCK_CPU` and `PTBLOCK_LOG`
    /// environment variables.
    pub fn from_env() -> Result<Self, PtBlockError> {
        Self::from_settings(
            env::var("PTBLOCK_CPU").ok().as_deref(),
            env::var("PTBLOCK_LOG").ok().as_deref(),
        )
    }

    fn from_settings(cpu: Option<&str>, log: Option<&str>) -> Result<Self, PtBlockError> {
        let mut b = Self::new();
        if let Some(s) = cpu {
            b.cpu = s.parse()?;
        }
        if let Some(s) = log {
            b.log = Log::parse(s)?;
        }
        Ok(b)
    }

    /// Select the CPU that the trace is decoded for.
    pub fn cpu(mut self, cpu: CpuSelection) -> Self {
        self.cpu = cpu;
        self
    }

    /// Should the decoder work around the errata of the CPU?
    pub fn errata(mut self, errata: bool) -> Self {
        self.errata = errata;
        self
    }

    /// Should a block end after a call instruction?
    pub fn end_on_call(mut self, end_on_call: bool) -> Self {
        self.end_on_call = end_on_call;
        self
    }

    /// Should a block end after an unconditional jump?
    pub fn end_on_jump(mut self, end_on_jump: bool) -> Self {
        self.end_on_jump = end_on_jump;
        self
    }

    pub fn log(mut self, log: Log) -> Self {
        self.log = log;
        self
    }

    /// Open a session decoding `buf` with a decoder allocated by `engine`.
    ///
    /// A code image of the objects reported by `modules` is built and attached to the decoder.
    /// The VDSO is dumped into `sink`, which must stay in place (on disk) for as long as the
    /// session is in use.
    ///
    /// If `buf` holds no synchronisation point, this isn't an error: the session reports the end
    /// of the stream straight away. On error, everything allocated so far has been released.
    pub fn open<'b, E, M, S>(
        &self,
        engine: &E,
        buf: &'b [u8],
        modules: &M,
        sink: &mut S,
    ) -> Result<DecoderSession<'b, E>, PtBlockError>
    where
        E: DecodeEngine,
        M: ModuleSource + ?Sized,
        S: DumpSink + ?Sized,
    {
        match self.do_open(engine, buf, modules, sink) {
            Ok(s) => Ok(s),
            Err(e) => {
                self.log
                    .log(Verbosity::Error, &format!("failed to open session: {e}"));
                Err(e)
            }
        }
    }

    fn do_open<'b, E, M, S>(
        &self,
        engine: &E,
        buf: &'b [u8],
        modules: &M,
        sink: &mut S,
    ) -> Result<DecoderSession<'b, E>, PtBlockError>
    where
        E: DecodeEngine,
        M: ModuleSource + ?Sized,
        S: DumpSink + ?Sized,
    {
        let cpu = match self.cpu {
            CpuSelection::Auto => engine.read_cpu().map_err(PtBlockError::Cpu)?,
            CpuSelection::Fixed(cpu) => cpu,
        };
        let errata = if !self.errata {
            Errata::default()
        } else if cpu.vendor == CpuVendor::Unknown {
            self.log.log(
                Verbosity::Warning,
                &format!("not applying errata: unknown vendor for {cpu:?}"),
            );
            Errata::default()
        } else {
            engine.cpu_errata(&cpu).map_err(PtBlockError::Cpu)?
        };
        let config = DecoderConfig {
            buf,
            cpu,
            errata,
            end_on_call: self.end_on_call,
            end_on_jump: self.end_on_jump,
        };

        // The session can't outlive `buf`.
        let mut decoder = unsafe { engine.alloc_decoder(&config) }
            .ok_or(PtBlockError::Allocation("decoder"))?;

        let status = decoder.sync_forward();
        let status = if status.is_eos_error() {
            // There's nothing to decode. The first request for a block reports as much.
            Status::from_flags(Status::END_OF_STREAM)
        } else if let Some(e) = status.error() {
            return Err(PtBlockError::Sync(e));
        } else {
            status
        };

        // From here on, if we return early, `image` is dropped before `decoder`.
        let mut image = engine
            .alloc_image()
            .ok_or(PtBlockError::Allocation("image"))?;
        let regions = load_self_image(modules, &mut image, sink)?;
        // The image and decoder are owned together, and the image is released first.
        unsafe { decoder.set_image(&mut image) }.map_err(PtBlockError::ImageAttach)?;

        if self.log.enabled(Verbosity::SessionEvent) {
            self.log.log(
                Verbosity::SessionEvent,
                &format!(
                    "opened session: {} bytes of trace, {cpu:?}, {} regions, status {status:?}",
                    buf.len(),
                    regions.len()
                ),
            );
            for r in &regions {
                self.log
                    .log(Verbosity::SessionEvent, &format!("region {}", r.ptxed_arg()));
            }
        }

        Ok(DecoderSession {
            attached: Some(Attached { image, decoder }),
            status,
            errored: false,
            regions,
            log: self.log.clone(),
            _buf: PhantomData,
        })
    }
}

/// A decoder and the image attached to it.
struct Attached<E: DecodeEngine> {
    image: E::Image,
    decoder: E::Decoder,
}

/// A block decoder synchronised onto a packet buffer, with the code image of the current process
/// attached.
///
/// Closing the session (explicitly, or by dropping it) releases the image and then the decoder.
pub struct DecoderSession<'b, E: DecodeEngine> {
    /// `None` once closed.
    attached: Option<Attached<E>>,
    /// The decoder status left by the last decoder operation.
    status: Status,
    /// Set when an operation failed. The decoder can't be trusted after that.
    errored: bool,
    regions: Vec<Region>,
    log: Log,
    _buf: PhantomData<&'b [u8]>,
}

impl<'b, E: DecodeEngine> DecoderSession<'b, E> {
    /// Release the image, then the decoder. Closing a closed session does nothing.
    pub fn close(&mut self) {
        if let Some(Attached { image, decoder }) = self.attached.take() {
            drop(image);
            drop(decoder);
            self.log.log(Verbosity::SessionEvent, "closed session");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.attached.is_none()
    }

    /// Decode the next block, skipping any events the decoder reports along the way.
    ///
    /// Returns `Ok(None)` at the end of the stream, and keeps doing so if called again. After an
    /// error, the session only returns [PtBlockError::Errored].
    pub fn next_block(&mut self) -> Result<Option<Block>, PtBlockError> {
        let attached = self.attached.as_mut().ok_or(PtBlockError::Closed)?;
        if self.errored {
            return Err(PtBlockError::Errored);
        }

        let (status, res) = iter::step(&mut attached.decoder, self.status);
        self.status = status;
        match res {
            Ok(Some(b)) => {
                let b = Block::from(b);
                if self.log.enabled(Verbosity::BlockEvent) {
                    self.log.log(
                        Verbosity::BlockEvent,
                        &format!("{b:?} status {status:?}"),
                    );
                }
                Ok(Some(b))
            }
            Ok(None) => {
                self.log.log(Verbosity::BlockEvent, "end of stream");
                Ok(None)
            }
            Err(e) => {
                self.errored = true;
                self.log.log(Verbosity::Error, &e.to_string());
                Err(e)
            }
        }
    }

    /// Decode the next block, returning the address of its first instruction and `false`, or
    /// `(0, true)` at the end of the stream.
    pub fn next_addr(&mut self) -> Result<(u64, bool), PtBlockError> {
        Ok(match self.next_block()? {
            Some(b) => (b.first_instr(), false),
            None => (0, true),
        })
    }

    /// Iterate over the remaining blocks.
    pub fn iter_blocks(&mut self) -> BlockIterator<'_, 'b, E> {
        BlockIterator::new(self)
    }

    /// The regions registered in the session's code image, in the order they were registered.
    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    /// Build a map from virtual addresses to the code regions of the session's image.
    pub fn code_map(&self) -> CodeMap {
        CodeMap::new(&self.regions)
    }

    pub fn status(&self) -> Status {
        self.status
    }
}

impl<E: DecodeEngine> Drop for DecoderSession<'_, E> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<E: DecodeEngine> fmt::Debug for DecoderSession<'_, E> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("DecoderSession")
            .field("closed", &self.is_closed())
            .field("status", &self.status)
            .field("errored", &self.errored)
            .field("regions", &self.regions.len())
            .finish()
    }
}
