use clap::Parser;
use tracing::instrument;

use filesync::source;

fn parse_size(s: &str) -> Result<usize, String> {
    let size = s.parse::<bytesize::ByteSize>()?.as_u64();
    if size == 0 {
        return Err("size must be at least 1 byte".to_string());
    }
    usize::try_from(size).map_err(|e| format!("{e}"))
}

fn parse_nonzero_usize(s: &str) -> Result<usize, String> {
    let val: usize = s.parse().map_err(|e| format!("{e}"))?;
    if val == 0 {
        return Err("value must be at least 1".to_string());
    }
    Ok(val)
}

fn parse_nonzero_u64(s: &str) -> Result<u64, String> {
    let val: u64 = s.parse().map_err(|e| format!("{e}"))?;
    if val == 0 {
        return Err("value must be at least 1".to_string());
    }
    Ok(val)
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "syncmon",
    version,
    about = "Watch a directory and send every change to a `syncd` receiver",
    long_about = "`syncmon` watches a single directory (subdirectories are not followed) and sends each created, modified or renamed file to `syncd` over TCP. Deleting a file sends a delete notice.

Every change is sent on its own connection. There is no batching or deduplication, a file written twice is sent twice.

EXAMPLE:
    # Send changes in ~/outbox to a receiver
    syncmon ~/outbox receiver.example.com:8080 -v"
)]
struct Args {
    // Transfer options
    /// Maximum number of seconds to wait for a connection to the receiver
    #[arg(
        long,
        default_value = "15",
        value_name = "SECONDS",
        value_parser = parse_nonzero_u64,
        help_heading = "Transfer options"
    )]
    conn_timeout_sec: u64,

    /// Maximum number of seconds a single write may stall
    #[arg(
        long,
        default_value = "30",
        value_name = "SECONDS",
        value_parser = parse_nonzero_u64,
        help_heading = "Transfer options"
    )]
    io_timeout_sec: u64,

    /// Read buffer size, e.g. "64KiB", "1MiB"
    #[arg(
        long,
        default_value = "64KiB",
        value_name = "SIZE",
        value_parser = parse_size,
        help_heading = "Transfer options"
    )]
    chunk_size: usize,

    /// Maximum number of transfers in progress, further changes wait for a slot
    #[arg(
        long,
        default_value = "64",
        value_name = "N",
        value_parser = parse_nonzero_usize,
        help_heading = "Transfer options"
    )]
    max_in_flight: usize,

    /// Number of times a transfer is retried after a network error, 0 means no retries
    ///
    /// Retries back off exponentially starting at 200ms, up to 10s between attempts. Files that
    /// disappeared before they could be read are never retried.
    #[arg(long, default_value = "0", value_name = "N", help_heading = "Transfer options")]
    retries: u32,

    // Progress & output
    /// Verbose level (implies "summary"): -v INFO / -vv DEBUG / -vvv TRACE (default: ERROR)
    #[arg(
        short = 'v',
        long = "verbose",
        action = clap::ArgAction::Count,
        help_heading = "Progress & output"
    )]
    verbose: u8,

    /// Print summary on shutdown
    #[arg(long, help_heading = "Progress & output")]
    summary: bool,

    /// Quiet mode, don't report errors
    #[arg(short = 'q', long = "quiet", help_heading = "Progress & output")]
    quiet: bool,

    // Advanced settings
    /// Number of worker threads, 0 means number of cores
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_workers: usize,

    /// Number of blocking worker threads, 0 means Tokio runtime default (512)
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_blocking_threads: usize,

    // ARGUMENTS
    /// Directory to watch
    #[arg()]
    dir: std::path::PathBuf,

    /// Receiver address, host:port
    #[arg()]
    server: String,
}

#[instrument]
async fn async_main(args: Args) -> anyhow::Result<()> {
    let settings = source::Settings {
        server: args.server,
        tcp: remote::TcpConfig {
            conn_timeout: std::time::Duration::from_secs(args.conn_timeout_sec),
            io_timeout: std::time::Duration::from_secs(args.io_timeout_sec),
        },
        chunk_size: args.chunk_size,
        max_in_flight: args.max_in_flight,
        retry: source::RetryPolicy {
            retries: args.retries,
            ..Default::default()
        },
    };
    let cancel = tokio_util::sync::CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    tracing::info!("Received Ctrl-C, shutting down");
                    cancel.cancel();
                }
                Err(err) => tracing::error!("Failed to listen for Ctrl-C: {err}"),
            }
        }
    });
    source::run(&args.dir, settings, cancel).await
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let output = common::OutputConfig {
        quiet: args.quiet,
        verbose: args.verbose,
        print_summary: args.summary || args.verbose > 0,
    };
    let runtime = common::RuntimeConfig {
        max_workers: args.max_workers,
        max_blocking_threads: args.max_blocking_threads,
    };
    let func = {
        let args = args.clone();
        || async_main(args)
    };
    let res = common::run(output, runtime, func);
    if res.is_none() {
        std::process::exit(1);
    }
    Ok(())
}
