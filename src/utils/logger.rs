use log::LevelFilter;

/// Console diagnostics at `Info`, overridable through `RUST_LOG`.
pub fn setup_logger() {
    env_logger::Builder::new()
        .filter_level(LevelFilter::Info)
        .parse_default_env()
        .init();
}
