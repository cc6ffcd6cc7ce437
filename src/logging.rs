//! Tracing subscriber setup.
//!
//! Logs go to stderr so they stay out of the run report on stdout.
//! `RUST_LOG` overrides the level chosen from `--verbose`.

use tracing::Level;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const QUIET_CRATES: [&str; 4] = ["hyper", "hyper_util", "reqwest", "h2"];

fn default_filter(verbose: bool) -> anyhow::Result<EnvFilter> {
    // Without --verbose only problems are logged; the progress bar shows the rest.
    let level = if verbose { Level::DEBUG } else { Level::WARN };
    let mut filter = EnvFilter::new(level.to_string());
    for name in QUIET_CRATES {
        filter = filter.add_directive(format!("{name}=warn").parse()?);
    }
    Ok(filter)
}

pub fn setup_logging(verbose: bool) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => default_filter(verbose)?,
    };

    let console_layer = fmt::layer()
        .with_target(verbose)
        .with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .try_init()?;

    tracing::debug!(verbose, "logging initialized");
    Ok(())
}
