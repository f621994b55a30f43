use tracing::info;
use tracing_subscriber::fmt;
use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is not set.
pub fn default_directive(verbose: bool) -> &'static str {
    if verbose {
        "debug"
    } else {
        "info"
    }
}

/// Install the global fmt subscriber. Logs go to stderr so stdout stays free for command output.
///
/// `RUST_LOG` takes precedence over `verbose`.
pub fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)));
    fmt::Subscriber::builder()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .with_target(verbose)
        .init();
    info!("slotcar v{}", env!("CARGO_PKG_VERSION"));
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(false, "info"; "Quiet")]
    #[test_case(true, "debug"; "Verbose")]
    fn directive_follows_verbosity(verbose: bool, directive: &str) {
        assert_eq!(default_directive(verbose), directive);
    }
}
