use std::env;

// With the `fuzzir` feature the driver symbols come from an interpreter
// library built with trace-pc-guard instrumentation.
fn main() {
    println!("cargo:rerun-if-env-changed=SHUTTLE_FUZZIR_LIB");
    println!("cargo:rerun-if-env-changed=SHUTTLE_FUZZIR_LIB_DIR");

    if env::var_os("CARGO_FEATURE_FUZZIR").is_none() {
        return;
    }

    if let Some(dir) = env::var_os("SHUTTLE_FUZZIR_LIB_DIR") {
        println!("cargo:rustc-link-search=native={}", dir.to_string_lossy());
    }
    // Without a name the library must be supplied through RUSTFLAGS.
    if let Ok(lib) = env::var("SHUTTLE_FUZZIR_LIB") {
        println!("cargo:rustc-link-lib={lib}");
    }
}
