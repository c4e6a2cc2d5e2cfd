use eyre::Result;
use tracing_subscriber::EnvFilter;

use crate::cli::LogArgs;

/// Initialize the tracing subscriber from the verbosity flags.
pub fn init_logging(args: &LogArgs) -> Result<()> {
    let level = match args.verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    // quiet libp2p internals unless asked for explicitly
    let mut directives = format!("warn,portmux={level},portmux_addr={level},portmux_client={level},portmux_forwarder={level},portmux_node={level},portmux_registry={level}");
    if let Some(filter) = &args.filter {
        directives = format!("{directives},{filter}");
    }
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(directives))?;

    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}
