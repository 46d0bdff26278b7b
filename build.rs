fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Use the vendored protoc so builds don't depend on a system install.
    if std::env::var_os("PROTOC").is_none() {
        std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
    }

    tonic_build::configure()
        .bytes(["."])
        .compile_protos(&["proto/worker.proto"], &["proto"])?;

    println!("cargo:rerun-if-changed=proto/worker.proto");
    Ok(())
}
