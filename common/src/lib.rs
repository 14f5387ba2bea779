//! Shared building blocks for the `syncd` receiver and the `syncmon` directory monitor.
//!
//! - [`hash`]: 128-bit content digests used for equality checks
//! - [`filename`]: validation of names received over the wire
//! - [`versioned`]: `name_v<N>.ext` allocation for preserved versions
//! - [`resolve`]: the conflict resolver that persists incoming files
//! - [`stats`]: process-wide counters printed on shutdown
//! - [`config`]: runtime, output and limit settings
//!
//! [`run`] wires up logging and the tokio runtime for both binaries.

use anyhow::Context;

pub mod config;
pub mod filename;
pub mod hash;
pub mod resolve;
pub mod stats;
pub mod versioned;

pub use config::{MessageLimits, OutputConfig, RuntimeConfig};

static STATS: std::sync::LazyLock<stats::Stats> = std::sync::LazyLock::new(stats::Stats::new);

pub fn get_stats() -> &'static stats::Stats {
    &STATS
}

fn init_tracing(output: &OutputConfig) -> anyhow::Result<()> {
    if output.quiet {
        return Ok(());
    }
    // RUST_LOG wins over -v so individual targets can be tuned
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(output.level()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| anyhow::anyhow!("{err}"))
        .context("Failed to initialize logging")
}

fn build_runtime(runtime: &RuntimeConfig) -> anyhow::Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if runtime.max_workers > 0 {
        builder.worker_threads(runtime.max_workers);
    }
    if runtime.max_blocking_threads > 0 {
        builder.max_blocking_threads(runtime.max_blocking_threads);
    }
    builder.build().context("Failed to create tokio runtime")
}

/// Runs `func` on a freshly built tokio runtime with logging configured.
///
/// Returns `None` if setup failed or `func` returned an error; the error has already been
/// reported on stderr by then.
pub fn run<Fut, T>(
    output: OutputConfig,
    runtime: RuntimeConfig,
    func: impl FnOnce() -> Fut,
) -> Option<T>
where
    Fut: std::future::Future<Output = anyhow::Result<T>>,
{
    if let Err(err) = init_tracing(&output) {
        eprintln!("{err:#}");
        return None;
    }
    let runtime = match build_runtime(&runtime) {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("{err:#}");
            return None;
        }
    };
    let res = runtime.block_on(func());
    if output.print_summary {
        println!("{}", get_stats());
    }
    match res {
        Ok(value) => Some(value),
        Err(err) => {
            if !output.quiet {
                eprintln!("{err:#}");
            }
            None
        }
    }
}
