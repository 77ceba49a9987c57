//! The objects loaded into the current process, as reported by the dynamic loader.

use super::{Module, ModuleSource, Segment};
use crate::errors::ImageLoadError;
use std::{ffi::OsStr, os::unix::ffi::OsStrExt, path::PathBuf, slice};

/// The objects of the current process, as `dl_iterate_phdr(3)` reports them.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessModules;

impl ModuleSource for ProcessModules {
    fn modules(&self) -> Result<Vec<Module>, ImageLoadError> {
        Ok(phdrs::objects()
            .iter()
            .map(|obj| {
                let name = PathBuf::from(OsStr::from_bytes(obj.name().to_bytes()));
                let segments = obj
                    .iter_phdrs()
                    .map(|hdr| Segment {
                        typ: hdr.type_(),
                        flags: hdr.flags(),
                        vaddr: hdr.vaddr(),
                        offset: hdr.offset(),
                        filesz: hdr.filesz(),
                    })
                    .collect();
                Module::new(name, obj.addr(), segments)
            })
            .collect())
    }

    unsafe fn code_bytes(&self, vaddr: u64, len: u64) -> &[u8] {
        // The caller guarantees that this is mapped, loaded code.
        unsafe {
            slice::from_raw_parts(vaddr as usize as *const u8, usize::try_from(len).unwrap())
        }
    }
}
