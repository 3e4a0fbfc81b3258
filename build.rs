fn main() -> Result<(), Box<dyn std::error::Error>> {
    tonic_build::configure().compile(&["proto/ingest.proto"], &["proto"])?;
    println!("cargo:rerun-if-changed=proto/ingest.proto");
    Ok(())
}
