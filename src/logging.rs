//! Tracing setup and the secret-masking helper (spec §3 log invariant).

use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Initialize the global tracing subscriber. `verbose` raises this
/// crate's own default filter to `debug` (spec §6 CLI `--verbose`);
/// `RUST_LOG` always takes precedence when set.
pub fn init(verbose: bool) {
    let default_directive = if verbose {
        "sidecar_proxy=debug,info"
    } else {
        "sidecar_proxy=info,warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        // Already set (e.g. in tests that init more than once) — not fatal.
    }
}

/// Mask a header value that may carry secret material: at most the
/// last four characters survive, preceded by `***`. Never emit this
/// value's un-masked form to any log call.
pub fn mask(value: &str) -> String {
    let tail_len = value.chars().count().min(4);
    let tail: String = value.chars().rev().take(tail_len).collect::<Vec<_>>().into_iter().rev().collect();
    format!("***{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_long_value() {
        assert_eq!(mask("sk-ant-REDACTED"), "***alue");
    }

    #[test]
    fn masks_short_value() {
        assert_eq!(mask("ab"), "***ab");
    }

    #[test]
    fn masks_empty_value() {
        assert_eq!(mask(""), "***");
    }
}
