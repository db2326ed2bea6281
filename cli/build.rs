fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed=../proto/microloan.proto");

    // Only the client side is needed; the bridge is served elsewhere.
    tonic_build::configure()
        .build_server(false)
        .compile_protos(&["../proto/microloan.proto"], &["../proto"])?;

    Ok(())
}
