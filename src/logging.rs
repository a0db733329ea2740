use tracing_subscriber::EnvFilter;

/// Environment variable holding an `EnvFilter` directive, e.g.
/// `docrecall=debug`.
pub const LOG_ENV_VAR: &str = "DOCRECALL_LOG";

/// Install a stderr `fmt` subscriber for the host process.
///
/// `DOCRECALL_LOG` wins when set; otherwise `quiet` selects `warn` and each
/// `verbose` step moves from `info` to `debug` to `trace`. Calling this more
/// than once is harmless: later calls keep the first subscriber.
pub fn init_tracing(verbose: u8, quiet: bool) {
    let filter = if let Ok(env) = std::env::var(LOG_ENV_VAR) {
        EnvFilter::new(env)
    } else {
        EnvFilter::new(default_directive(verbose, quiet))
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .try_init();
}

fn default_directive(verbose: u8, quiet: bool) -> &'static str {
    if quiet {
        return "warn";
    }
    match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}
