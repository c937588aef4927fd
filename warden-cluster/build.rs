//! Generates the gRPC transport from `proto/warden.proto`.

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed=proto/warden.proto");

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&["proto/warden.proto"], &["proto"])?;

    Ok(())
}
