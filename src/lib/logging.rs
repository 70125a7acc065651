use std::sync::OnceLock;

use anyhow::{Context, Result};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const LOG_ENV: &str = "ENTITYDBX_LOG";

static INITIALIZED: OnceLock<()> = OnceLock::new();

/// Installs a stdout subscriber for hosts embedding the engine.
///
/// `ENTITYDBX_LOG` (then `RUST_LOG`) overrides `default_filter`. Calling this
/// again, or after another subscriber was installed, is a no-op.
pub fn init(default_filter: &str) -> Result<()> {
    if INITIALIZED.get().is_some() {
        return Ok(());
    }

    let env_filter = match std::env::var(LOG_ENV) {
        Ok(directive) if !directive.trim().is_empty() => EnvFilter::try_new(directive.trim())
            .with_context(|| format!("invalid {LOG_ENV} directive '{directive}'"))?,
        _ => match EnvFilter::try_from_default_env() {
            Ok(filter) => filter,
            Err(_) => EnvFilter::try_new(default_filter)
                .with_context(|| format!("invalid log filter '{default_filter}'"))?,
        },
    };

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(false));

    if subscriber.try_init().is_ok() {
        let _ = INITIALIZED.set(());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_init_is_a_noop() {
        init("debug").unwrap();
        init("debug").unwrap();
    }
}
