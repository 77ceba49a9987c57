//! A decode engine backed by Intel's reference decoder library, libipt.

#![allow(non_camel_case_types)]

use crate::{
    cpu,
    engine::{
        BlockDecoder, CodeImage, Cpu, CpuVendor, DecodeEngine, DecoderConfig, Errata, RawBlock,
    },
    status::{EngineError, ErrorCode, Status},
};
use libc::{c_char, c_int, c_void, size_t};
use std::{
    ffi::{CStr, CString},
    mem::size_of,
    os::unix::ffi::OsStrExt,
    path::Path,
    ptr::{self, NonNull},
};

// Opaque libipt types.
#[repr(C)]
struct pt_block_decoder {
    _private: [u8; 0],
}

#[repr(C)]
struct pt_image {
    _private: [u8; 0],
}

#[repr(C)]
#[derive(Clone, Copy)]
struct pt_cpu {
    vendor: c_int,
    family: u16,
    model: u8,
    stepping: u8,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct pt_errata {
    words: [u32; 16],
}

#[repr(C)]
struct pt_decode_callback {
    callback: Option<unsafe extern "C" fn(*mut c_void, *const pt_config, *const u8) -> c_int>,
    context: *mut c_void,
}

#[repr(C)]
struct pt_conf_addr_filter {
    config: u64,
    addrs: [u64; 8],
    reserved: [u64; 8],
}

#[repr(C)]
struct pt_config {
    size: size_t,
    begin: *mut u8,
    end: *mut u8,
    decode: pt_decode_callback,
    cpu: pt_cpu,
    errata: pt_errata,
    cpuid_0x15_eax: u32,
    cpuid_0x15_ebx: u32,
    mtc_freq: u8,
    nom_freq: u8,
    /// The `pt_conf_flags` union. For a block decoder, the first word holds the block flags.
    flags: [u32; 4],
    addr_filter: pt_conf_addr_filter,
}

#[repr(C)]
struct pt_block {
    ip: u64,
    end_ip: u64,
    isid: c_int,
    mode: c_int,
    iclass: c_int,
    ninsn: u16,
    raw: [u8; 15],
    size: u8,
    flags: u32,
}

/// Space for a `struct pt_event`. We never look inside.
#[repr(C)]
struct pt_event_buf([u64; 16]);

const PCV_UNKNOWN: c_int = 0;
const PCV_INTEL: c_int = 1;
const BLOCK_END_ON_CALL: u32 = 1 << 0;
const BLOCK_END_ON_JUMP: u32 = 1 << 2;
const BLOCK_TRUNCATED: u32 = 1 << 1;

extern "C" {
    fn pt_blk_alloc_decoder(config: *const pt_config) -> *mut pt_block_decoder;
    fn pt_blk_free_decoder(decoder: *mut pt_block_decoder);
    fn pt_blk_sync_forward(decoder: *mut pt_block_decoder) -> c_int;
    fn pt_blk_event(decoder: *mut pt_block_decoder, event: *mut pt_event_buf, size: size_t)
        -> c_int;
    fn pt_blk_next(decoder: *mut pt_block_decoder, block: *mut pt_block, size: size_t) -> c_int;
    fn pt_blk_set_image(decoder: *mut pt_block_decoder, image: *mut pt_image) -> c_int;
    fn pt_image_alloc(name: *const c_char) -> *mut pt_image;
    fn pt_image_free(image: *mut pt_image);
    fn pt_image_add_file(
        image: *mut pt_image,
        filename: *const c_char,
        offset: u64,
        size: u64,
        asid: *const c_void,
        vaddr: u64,
    ) -> c_int;
    fn pt_cpu_errata(errata: *mut pt_errata, cpu: *const pt_cpu) -> c_int;
    fn pt_errstr(code: c_int) -> *const c_char;
}

fn to_pt_cpu(cpu: &Cpu) -> pt_cpu {
    pt_cpu {
        vendor: match cpu.vendor {
            CpuVendor::Unknown => PCV_UNKNOWN,
            CpuVendor::Intel => PCV_INTEL,
        },
        family: cpu.family,
        model: cpu.model,
        stepping: cpu.stepping,
    }
}

/// libipt's description of `code`.
pub(crate) fn errstr(code: ErrorCode) -> String {
    let s = unsafe { CStr::from_ptr(pt_errstr(code as c_int)) };
    s.to_string_lossy().into_owned()
}

fn check(rc: c_int) -> Result<(), EngineError> {
    if rc < 0 {
        Err(EngineError::from_raw(rc))
    } else {
        Ok(())
    }
}

/// The libipt decode engine.
#[derive(Clone, Copy, Debug, Default)]
pub struct Libipt;

impl DecodeEngine for Libipt {
    type Decoder = LibiptDecoder;
    type Image = LibiptImage;

    fn read_cpu(&self) -> Result<Cpu, EngineError> {
        Ok(cpu::read_cpu())
    }

    fn cpu_errata(&self, cpu: &Cpu) -> Result<Errata, EngineError> {
        let mut errata = pt_errata { words: [0; 16] };
        let cpu = to_pt_cpu(cpu);
        check(unsafe { pt_cpu_errata(&mut errata, &cpu) })?;
        Ok(Errata::from_words(errata.words))
    }

    unsafe fn alloc_decoder(&self, config: &DecoderConfig<'_>) -> Option<Self::Decoder> {
        let mut flags = 0;
        if config.end_on_call {
            flags |= BLOCK_END_ON_CALL;
        }
        if config.end_on_jump {
            flags |= BLOCK_END_ON_JUMP;
        }
        let range = config.buf.as_ptr_range();
        let conf = pt_config {
            size: size_of::<pt_config>(),
            // libipt never writes to the trace.
            begin: range.start as *mut u8,
            end: range.end as *mut u8,
            decode: pt_decode_callback {
                callback: None,
                context: ptr::null_mut(),
            },
            cpu: to_pt_cpu(&config.cpu),
            errata: pt_errata {
                words: *config.errata.words(),
            },
            cpuid_0x15_eax: 0,
            cpuid_0x15_ebx: 0,
            mtc_freq: 0,
            nom_freq: 0,
            flags: [flags, 0, 0, 0],
            addr_filter: pt_conf_addr_filter {
                config: 0,
                addrs: [0; 8],
                reserved: [0; 8],
            },
        };
        // libipt copies the configuration.
        NonNull::new(unsafe { pt_blk_alloc_decoder(&conf) }).map(LibiptDecoder)
    }

    fn alloc_image(&self) -> Option<Self::Image> {
        NonNull::new(unsafe { pt_image_alloc(ptr::null()) }).map(LibiptImage)
    }
}

/// A libipt block decoder (`struct pt_block_decoder`).
pub struct LibiptDecoder(NonNull<pt_block_decoder>);

impl BlockDecoder for LibiptDecoder {
    type Image = LibiptImage;

    fn sync_forward(&mut self) -> Status {
        Status::from_raw(unsafe { pt_blk_sync_forward(self.0.as_ptr()) })
    }

    fn next_event(&mut self) -> Status {
        let mut ev = pt_event_buf([0; 16]);
        Status::from_raw(unsafe {
            pt_blk_event(self.0.as_ptr(), &mut ev, size_of::<pt_event_buf>())
        })
    }

    fn next_block(&mut self) -> (Status, RawBlock) {
        let mut blk = pt_block {
            ip: 0,
            end_ip: 0,
            isid: 0,
            mode: 0,
            iclass: 0,
            ninsn: 0,
            raw: [0; 15],
            size: 0,
            flags: 0,
        };
        let rc = unsafe { pt_blk_next(self.0.as_ptr(), &mut blk, size_of::<pt_block>()) };
        (
            Status::from_raw(rc),
            RawBlock {
                ip: blk.ip,
                end_ip: blk.end_ip,
                ninsn: blk.ninsn,
                truncated: blk.flags & BLOCK_TRUNCATED != 0,
            },
        )
    }

    unsafe fn set_image(&mut self, image: &mut LibiptImage) -> Result<(), EngineError> {
        check(unsafe { pt_blk_set_image(self.0.as_ptr(), image.0.as_ptr()) })
    }
}

impl Drop for LibiptDecoder {
    fn drop(&mut self) {
        unsafe { pt_blk_free_decoder(self.0.as_ptr()) };
    }
}

/// A libipt code image (`struct pt_image`).
pub struct LibiptImage(NonNull<pt_image>);

impl CodeImage for LibiptImage {
    fn add_file(
        &mut self,
        path: &Path,
        offset: u64,
        size: u64,
        vaddr: u64,
    ) -> Result<(), EngineError> {
        let path = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| EngineError::from(ErrorCode::Invalid))?;
        check(unsafe {
            pt_image_add_file(
                self.0.as_ptr(),
                path.as_ptr(),
                offset,
                size,
                ptr::null(),
                vaddr,
            )
        })
    }
}

impl Drop for LibiptImage {
    fn drop(&mut self) {
        unsafe { pt_image_free(self.0.as_ptr()) };
    }
}
