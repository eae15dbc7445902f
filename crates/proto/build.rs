//! Build script for tidelog-proto.
//!
//! Compiles the broker protobuf definitions into Rust code using
//! tonic-prost-build.

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo::rerun-if-changed=../../proto/tidelog/v1/broker.proto");

    if std::env::var_os("PROTOC").is_none() {
        // SAFETY: single-threaded build script, no concurrent env access.
        unsafe {
            std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
        }
    }

    tonic_prost_build::configure()
        .build_server(true)
        .build_client(true)
        .emit_rerun_if_changed(true)
        .compile_protos(&["../../proto/tidelog/v1/broker.proto"], &["../../proto"])?;

    Ok(())
}
