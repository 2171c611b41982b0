fn main() -> Result<(), Box<dyn std::error::Error>> {
    if std::env::var_os("PROTOC").is_none() {
        std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
    }

    // Compile the protobuf files into Rust code
    tonic_prost_build::configure()
        .build_client(true)
        .build_server(true)
        .compile_protos(
            &[
                "proto/agent.proto",
                "proto/platform.proto",
                "proto/cri.proto",
            ],
            &["proto"],
        )?;

    Ok(())
}
