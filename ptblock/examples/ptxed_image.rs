//! Print the `ptxed` arguments that describe the code image of this process.
//!
//! Usage: `ptxed_image <vdso-dump-path>`. The VDSO is dumped to the given path, which must stay
//! in place for as long as the arguments are in use.

use ptblock::{load_self_image, ProcessModules, RegionList, VdsoFile};
use std::{env, fs::File, path::PathBuf, process};

fn main() {
    let Some(path) = env::args().nth(1).map(PathBuf::from) else {
        eprintln!("usage: ptxed_image <vdso-dump-path>");
        process::exit(1);
    };
    let file = File::create(&path).unwrap();
    let mut sink = VdsoFile::new(&file, &path);
    let mut img = RegionList::new();
    load_self_image(&ProcessModules, &mut img, &mut sink).unwrap();
    for r in img.regions() {
        println!("--raw {}", r.ptxed_arg());
    }
}
