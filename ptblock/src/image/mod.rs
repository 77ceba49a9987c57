//! Building a code image that mirrors the executable code loaded into the current process.
//!
//! The decode engine follows the traced control flow by reading the instructions that were
//! executed, so it needs to know which code lives at which virtual address. We describe every
//! loadable, executable segment of every loaded object to the engine as a region of a file on
//! disk.
//!
//! The VDSO is special. It doesn't exist on-disk as a regular library, but rather it is a set of
//! pages shared with the kernel. Since the engine can only load code from files, we dump the VDSO
//! into a file supplied by the caller and register that instead. The engine reads files lazily,
//! so the dump has to be synced to disk, and has to outlive the decoder.
//!
//! The image is built from scratch for each session: load addresses differ from run to run.

mod process;

use crate::{engine::CodeImage, errors::ImageLoadError};
use intervaltree::IntervalTree;
use std::{
    env,
    fs::File,
    io::{self, Write},
    path::{Path, PathBuf},
};
use tempfile::NamedTempFile;

pub use process::ProcessModules;

/// The name under which the dynamic loader reports the VDSO.
pub const VDSO_NAME: &str = "linux-vdso.so.1";

/// A program header of a loaded object.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Segment {
    /// The segment type (`p_type`).
    pub typ: u32,
    /// The permission flags (`p_flags`).
    pub flags: u32,
    /// The virtual address of the segment, relative to the object's base address (`p_vaddr`).
    pub vaddr: u64,
    /// The offset of the segment in the object's file (`p_offset`).
    pub offset: u64,
    /// The number of bytes of the segment backed by the file (`p_filesz`).
    pub filesz: u64,
}

impl Segment {
    /// Is this a loadable, executable segment?
    pub fn is_exec_load(&self) -> bool {
        self.typ == libc::PT_LOAD && self.flags & libc::PF_X != 0
    }
}

/// An object (the main executable, a shared object, or the VDSO) loaded into an address space.
#[derive(Clone, Debug)]
pub struct Module {
    /// The name the dynamic loader reports. On Linux the empty name means "the main executable".
    name: PathBuf,
    /// The address the object was loaded at.
    base: u64,
    segments: Vec<Segment>,
}

impl Module {
    pub fn new(name: impl Into<PathBuf>, base: u64, segments: Vec<Segment>) -> Self {
        Self {
            name: name.into(),
            base,
            segments,
        }
    }

    pub fn name(&self) -> &Path {
        &self.name
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn is_main_exe(&self) -> bool {
        self.name.as_os_str().is_empty()
    }

    pub fn is_vdso(&self) -> bool {
        self.name == Path::new(VDSO_NAME)
    }
}

/// Something that can tell us which objects are loaded and read their code.
pub trait ModuleSource {
    /// The loaded objects, in the order the dynamic loader reports them.
    fn modules(&self) -> Result<Vec<Module>, ImageLoadError>;

    /// The `len` bytes of code loaded at `vaddr`.
    ///
    /// # Safety
    ///
    /// `vaddr..vaddr + len` must lie within a segment of a module returned by
    /// [ModuleSource::modules].
    unsafe fn code_bytes(&self, vaddr: u64, len: u64) -> &[u8];
}

/// Where to dump the VDSO's code: a writable file and its path.
pub trait DumpSink: Write {
    /// The path that the decode engine will find the dump at.
    fn path(&self) -> &Path;

    /// Flush the dump to stable storage.
    fn sync(&mut self) -> io::Result<()>;
}

/// A caller-supplied open file, together with its path, to dump the VDSO into.
pub struct VdsoFile<'a> {
    file: &'a File,
    path: &'a Path,
}

impl<'a> VdsoFile<'a> {
    pub fn new(file: &'a File, path: &'a Path) -> Self {
        Self { file, path }
    }
}

impl Write for VdsoFile<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut f = self.file;
        f.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut f = self.file;
        f.flush()
    }
}

impl DumpSink for VdsoFile<'_> {
    fn path(&self) -> &Path {
        self.path
    }

    fn sync(&mut self) -> io::Result<()> {
        self.file.sync_all()
    }
}

impl DumpSink for NamedTempFile {
    fn path(&self) -> &Path {
        NamedTempFile::path(self)
    }

    fn sync(&mut self) -> io::Result<()> {
        self.as_file().sync_all()
    }
}

/// A region of code registered in a code image.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Region {
    /// The file the code is read from.
    path: PathBuf,
    /// The offset of the code in `path`.
    offset: u64,
    /// The length of the code in bytes.
    len: u64,
    /// The virtual address the code is loaded at.
    vaddr: u64,
}

impl Region {
    pub fn new(path: impl Into<PathBuf>, offset: u64, len: u64, vaddr: u64) -> Self {
        Self {
            path: path.into(),
            offset,
            len,
            vaddr,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn vaddr(&self) -> u64 {
        self.vaddr
    }

    /// Render this region as an argument to `ptxed --raw`, so that a trace can be cross-checked
    /// with libipt's reference decoder.
    pub fn ptxed_arg(&self) -> String {
        format!(
            "{}:0x{:x}-0x{:x}:0x{:x}",
            self.path.display(),
            self.offset,
            self.offset + self.len,
            self.vaddr
        )
    }
}

/// A [CodeImage] that only records the regions added to it.
#[derive(Debug, Default)]
pub struct RegionList {
    regions: Vec<Region>,
}

impl RegionList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }
}

impl CodeImage for RegionList {
    fn add_file(
        &mut self,
        path: &Path,
        offset: u64,
        size: u64,
        vaddr: u64,
    ) -> Result<(), crate::status::EngineError> {
        self.regions.push(Region::new(path, offset, size, vaddr));
        Ok(())
    }
}

/// Maps virtual addresses back to the file and offset that the code was loaded from.
pub struct CodeMap {
    tree: IntervalTree<u64, usize>,
    regions: Vec<Region>,
}

impl CodeMap {
    pub fn new(regions: &[Region]) -> Self {
        let tree = regions
            .iter()
            .enumerate()
            .filter(|(_, r)| r.len > 0)
            .map(|(i, r)| (r.vaddr..r.vaddr.saturating_add(r.len), i))
            .collect::<IntervalTree<u64, usize>>();
        Self {
            tree,
            regions: regions.to_vec(),
        }
    }

    /// Returns the file and file offset that the code at `vaddr` was loaded from, or `None` if
    /// `vaddr` isn't in any region.
    ///
    /// If regions overlap, the one registered last wins (as it does in libipt's images).
    pub fn resolve(&self, vaddr: u64) -> Option<(&Path, u64)> {
        let idx = self
            .tree
            .query(vaddr..vaddr.checked_add(1)?)
            .map(|e| e.value)
            .max()?;
        let r = &self.regions[idx];
        Some((&r.path, r.offset + (vaddr - r.vaddr)))
    }
}

/// Load `image` with the executable code of the objects reported by `modules`, dumping the VDSO
/// (if there is one) into `sink`.
///
/// Returns the regions that were registered, in the order they were registered. If an error is
/// returned, `image` may contain some regions and should be discarded.
pub fn load_self_image<M, I, S>(
    modules: &M,
    image: &mut I,
    sink: &mut S,
) -> Result<Vec<Region>, ImageLoadError>
where
    M: ModuleSource + ?Sized,
    I: CodeImage + ?Sized,
    S: DumpSink + ?Sized,
{
    let mut regions = Vec::new();
    // Bytes of VDSO code dumped so far.
    let mut dumped = 0;
    for m in modules.modules()? {
        let path = if m.is_main_exe() {
            env::current_exe().map_err(ImageLoadError::MainExe)?
        } else {
            m.name().to_owned()
        };
        let vdso = m.is_vdso();

        for seg in m.segments().iter().filter(|s| s.is_exec_load()) {
            let vaddr = m.base().wrapping_add(seg.vaddr);
            let region = if vdso {
                // Safe: the range is exactly a segment reported by `modules`.
                let code = unsafe { modules.code_bytes(vaddr, seg.filesz) };
                sink.write_all(code).map_err(ImageLoadError::VdsoDump)?;
                let len = seg.filesz;
                let r = Region::new(sink.path(), dumped, len, vaddr);
                dumped += len;
                r
            } else {
                Region::new(&path, seg.offset, seg.filesz, vaddr)
            };

            image
                .add_file(&region.path, region.offset, region.len, region.vaddr)
                .map_err(|err| ImageLoadError::Register {
                    path: region.path.clone(),
                    vaddr: region.vaddr,
                    err,
                })?;
            regions.push(region);
        }
    }
    sink.sync().map_err(ImageLoadError::SyncSink)?;
    Ok(regions)
}
