fn main() {
    if let Err(e) = tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile(&["orchestrator.proto", "guest.proto"], &["proto"])
    {
        eprintln!("Building protos failed with:\n{e}");
        std::process::exit(1);
    }
}
