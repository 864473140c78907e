//! Diagnostics of the tracer itself go through `tracing`; hosts without a subscriber of their own
//! can install one with [`init_logging!`](crate::init_logging).

/// Install a `tracing-subscriber` fmt subscriber filtered by `RUST_LOG`, falling back to the given
/// filter, or to `apm_tracer=info` when none is given.
///
/// Does nothing if a global subscriber is already installed.
#[macro_export]
macro_rules! init_logging {
    () => {
        $crate::init_logging!($crate::logging::tracing_subscriber::EnvFilter::new(
            $crate::logging::DEFAULT_FILTER
        ))
    };
    ($env_filter:expr) => {{
        let builder = $crate::logging::tracing_subscriber::fmt::Subscriber::builder();
        let env_filter = ::std::env::var($crate::logging::tracing_subscriber::EnvFilter::DEFAULT_ENV)
            .map($crate::logging::tracing_subscriber::EnvFilter::new)
            .unwrap_or_else(|_| $env_filter);
        let builder = builder.with_env_filter(env_filter);
        let subscriber = builder.finish();
        use $crate::logging::tracing_subscriber::util::SubscriberInitExt as _;
        let _ = subscriber.try_init();
    }};
}

#[doc(hidden)]
pub use tracing_subscriber;

pub const DEFAULT_FILTER: &str = "apm_tracer=info";

#[cfg(test)]
mod tests {
    #[test]
    fn init_is_idempotent() {
        crate::init_logging!();
        crate::init_logging!(tracing_subscriber::EnvFilter::new("apm_tracer=debug"));
        tracing::info!("still logging");
    }
}
