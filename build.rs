fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Vendored copies of the Cloudstate entity protocol. The proxy side of
    // the protocol owns the canonical definitions; these must stay in sync
    // with the protocol version this library claims to speak.
    let protos = [
        "proto/cloudstate/entity.proto",
        "proto/cloudstate/event_sourced.proto",
        "proto/cloudstate/action.proto",
        "proto/cloudstate/function.proto",
    ];

    for proto in &protos {
        println!("cargo:rerun-if-changed={proto}");
    }

    tonic_build::configure().compile_protos(&protos, &["proto"])?;
    Ok(())
}
