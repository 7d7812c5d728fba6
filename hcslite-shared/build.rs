//! Build script to compile Protocol Buffer definitions.

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let file_descriptor_set = protox::compile(["proto/hcslite/v1/task.proto"], ["proto"])?;

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .build_transport(false)
        .compile_fds(file_descriptor_set)?;

    println!("cargo:rerun-if-changed=proto/");
    Ok(())
}
