fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed=build.rs");

    // The admission messages are hand-written prost structs in src/grpc/proto.rs,
    // so only the service stubs are generated here and no protoc is needed.
    let codec = "tonic::codec::ProstCodec";
    let method = |name: &str, route: &str, input: &str, output: &str| {
        tonic_build::manual::Method::builder()
            .name(name)
            .route_name(route)
            .input_type(format!("crate::grpc::proto::{}", input))
            .output_type(format!("crate::grpc::proto::{}", output))
            .codec_path(codec)
            .build()
    };

    let admission = tonic_build::manual::Service::builder()
        .name("Admission")
        .package("tollgate.admission.v1")
        .method(method("check", "Check", "CheckRequest", "CheckResponse"))
        .method(method("snapshot", "Snapshot", "SnapshotRequest", "SnapshotResponse"))
        .method(method(
            "clear_block",
            "ClearBlock",
            "ClearBlockRequest",
            "ClearBlockResponse",
        ))
        .build();

    tonic_build::manual::Builder::new()
        .build_client(false)
        .compile(&[admission]);

    Ok(())
}
