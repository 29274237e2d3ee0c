fn main() -> std::io::Result<()> {
    // `signalservice.rs` is checked in. Regeneration only happens when
    // `GENERATE_PROTO` is set, for developers editing the `.proto` file.
    if std::env::var("GENERATE_PROTO").is_err() {
        println!("cargo:rerun-if-changed=build.rs");
        return Ok(());
    }

    println!("cargo:rerun-if-changed=src/signalservice.proto");
    println!("cargo:warning=GENERATE_PROTO is set, regenerating proto definitions...");

    let mut config = prost_build::Config::new();
    config.type_attribute(".", "#[derive(serde::Serialize, serde::Deserialize)]");
    config.out_dir("src/");

    config.compile_protos(&["src/signalservice.proto"], &["src/"])?;
    Ok(())
}
