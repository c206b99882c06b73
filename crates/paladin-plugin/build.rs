fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed=proto/paladin_plugin.proto");
    // protox compiles the proto in-process, so builds never depend on a
    // system protoc installation
    let file_descriptors = protox::compile(["proto/paladin_plugin.proto"], ["proto"])?;
    tonic_prost_build::configure().compile_fds(file_descriptors)?;
    Ok(())
}
