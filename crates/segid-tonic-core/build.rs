/// Generates the gRPC client and server for `proto/segid.proto`.
///
/// Also writes a file descriptor set (`segid_descriptor.bin`) to `OUT_DIR`
/// for the server's reflection service.
///
/// Generated code is included with:
///
/// ```rust,ignore
/// pub mod segid {
///     tonic::include_proto!("segid");
/// }
/// ```
use std::env;
use std::path::PathBuf;
fn main() {
    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());
    let descriptor_path = out_dir.join("segid_descriptor.bin");

    let mut config = tonic_prost_build::Config::new();
    config.file_descriptor_set_path(&descriptor_path);

    tonic_prost_build::configure()
        .compile_with_config(config, &["proto/segid.proto"], &["proto"])
        .unwrap();
}
