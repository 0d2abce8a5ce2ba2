use tracing_subscriber::EnvFilter;

/// Logs go to stderr; stdout carries script output only.
pub fn init_tracing() {
    // RUST_LOG=scriptdeck_core=debug
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_line_number(true)
        .compact()
        .try_init();
}

/// Log panics through tracing, then let the default hook print them, so a
/// panic before `init_tracing` still reaches stderr.
pub fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let payload = info
            .payload()
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| info.payload().downcast_ref::<String>().map(String::as_str))
            .unwrap_or("<non-string panic payload>");
        let location = info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()))
            .unwrap_or_default();
        let thread = std::thread::current();

        tracing::error!(thread = thread.name().unwrap_or("<unnamed>"), %location, payload, "block engine panicked");
        default_hook(info);
    }));
}
