use std::io::IsTerminal;

use tracing_subscriber::EnvFilter;

/// Install the global subscriber. Filtering follows `RUST_LOG` and falls
/// back to `info`; output goes to stderr so that command output on stdout
/// stays machine readable.
pub fn init() -> Result<(), Box<dyn std::error::Error>> {
    let ansi = std::env::var_os("NO_COLOR").is_none() && std::io::stderr().is_terminal();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(ansi)
        .with_target(false)
        .compact()
        .try_init()
        .map_err(|err| std::io::Error::other(err.to_string()))?;
    Ok(())
}
