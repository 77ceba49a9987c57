//! Build the code image of this very process.

use object::FileKind;
use ptblock::{load_self_image, CodeMap, ProcessModules, RegionList};
use std::{env, fs};
use tempfile::NamedTempFile;

#[inline(never)]
fn here() -> u64 {
    here as usize as u64
}

#[test]
fn self_image() {
    let mut img = RegionList::new();
    let mut sink = NamedTempFile::new().unwrap();
    let regions = load_self_image(&ProcessModules, &mut img, &mut sink).unwrap();
    assert_eq!(regions, img.regions());

    // Our own code is in the image, and maps back to the test executable.
    let exe = env::current_exe().unwrap();
    let cm = CodeMap::new(&regions);
    let (path, off) = cm.resolve(here()).unwrap();
    assert_eq!(path, exe);
    assert!(off < fs::metadata(&exe).unwrap().len());

    let vdso = regions
        .iter()
        .filter(|r| r.path() == sink.path())
        .collect::<Vec<_>>();
    if vdso.is_empty() {
        // Running without a VDSO (e.g. under some emulators).
        return;
    }
    assert_eq!(vdso[0].offset(), 0);
    let dumped = vdso.iter().map(|r| r.len()).sum::<u64>();
    let bytes = fs::read(sink.path()).unwrap();
    assert_eq!(bytes.len() as u64, dumped);
    // The VDSO's executable segment starts with the object's ELF header.
    assert_eq!(FileKind::parse(&*bytes).unwrap(), FileKind::Elf64);
}
