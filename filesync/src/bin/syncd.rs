use clap::Parser;
use tracing::instrument;

use filesync::destination;

fn parse_size(s: &str) -> Result<u64, String> {
    s.parse::<bytesize::ByteSize>().map(|size| size.as_u64())
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
    name = "syncd",
    version,
    about = "Receive files from `syncmon` and keep every differing version",
    long_about = "`syncd` accepts connections from `syncmon` and stores each received file under the destination root.

When a file with the same name but different content already exists it is renamed to the lowest free `name_v<N>.ext` before the new content is written. Identical content is replaced by the incoming copy.

EXAMPLE:
    # Listen on all interfaces and store files in /srv/inbox
    syncd /srv/inbox --bind 0.0.0.0:8080 -v"
)]
struct Args {
    // Receiver options
    /// Address to listen on
    #[arg(
        long,
        default_value = "127.0.0.1:8080",
        value_name = "ADDR",
        help_heading = "Receiver options"
    )]
    bind: String,

    /// Remove the stored file when the sender reports a deletion
    ///
    /// By default deletion notices are only logged. Versioned copies are never removed.
    #[arg(long, help_heading = "Receiver options")]
    propagate_deletes: bool,

    // Limits
    /// Longest accepted file name, in bytes
    #[arg(long, default_value = "4096", value_name = "N", help_heading = "Limits")]
    max_name_len: usize,

    /// Largest accepted file, e.g. "512MiB", "1GiB"
    #[arg(
        long,
        default_value = "1GiB",
        value_name = "SIZE",
        value_parser = parse_size,
        help_heading = "Limits"
    )]
    max_body_size: u64,

    /// Maximum number of connections handled at once, the rest wait for a slot
    #[arg(
        long,
        default_value = "256",
        value_name = "N",
        value_parser = parse_nonzero_usize,
        help_heading = "Limits"
    )]
    max_connections: usize,

    /// Close a connection after this many seconds without receiving data
    #[arg(
        long,
        default_value = "30",
        value_name = "SECONDS",
        value_parser = parse_nonzero_u64,
        help_heading = "Limits"
    )]
    idle_timeout_sec: u64,

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
    /// Directory received files are stored in, created if missing
    #[arg()]
    root: std::path::PathBuf,
}

#[instrument]
async fn async_main(args: Args) -> anyhow::Result<()> {
    let settings = destination::Settings {
        root: args.root,
        limits: common::MessageLimits {
            max_name_len: args.max_name_len,
            max_body_size: args.max_body_size,
        },
        idle_timeout: std::time::Duration::from_secs(args.idle_timeout_sec),
        max_connections: args.max_connections,
        propagate_deletes: args.propagate_deletes,
    };
    let listener = remote::bind(&args.bind).await?;
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
    destination::serve(listener, settings, cancel).await
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
