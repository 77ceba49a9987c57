use std::env;

fn main() {
    println!("cargo:rustc-check-cfg=cfg(decoder_libipt)");
    println!("cargo:rerun-if-env-changed=IPT_LIB_DIR");

    if env::var_os("CARGO_FEATURE_LIBIPT").is_some() {
        println!("cargo:rustc-cfg=decoder_libipt");
        if let Some(dir) = env::var_os("IPT_LIB_DIR") {
            println!("cargo:rustc-link-search=native={}", dir.to_string_lossy());
        }
        println!("cargo:rustc-link-lib=ipt");
    }
}
