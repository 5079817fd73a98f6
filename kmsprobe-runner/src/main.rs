#![warn(rust_2018_idioms)]

use std::{path::PathBuf, process::ExitCode};

use clap::Parser;
use tracing::info;
use tracing_subscriber::{filter::LevelFilter, fmt, prelude::*, EnvFilter};

mod harness;
mod ringbuf;
mod subtests;

use harness::{Harness, Target};
use ringbuf::RingBuffer;

#[derive(Parser, Debug)]
#[command(author, version, about = "Runs KMS validation subtests", long_about = None)]
struct Cli {
    /// List the available subtests and exit
    #[arg(long)]
    list_subtests: bool,
    /// Print the description of every subtest and exit
    #[arg(long)]
    describe: bool,
    /// Only run subtests matching this pattern (`*` and `?` wildcards, comma separated)
    #[arg(long, value_name = "PATTERN")]
    run_subtest: Option<String>,
    /// DRM device node to test
    #[arg(long, default_value = "/dev/dri/card0")]
    device: PathBuf,
    /// Run against the simulated device instead of real hardware
    #[arg(long, conflicts_with = "device")]
    mock: bool,
    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(long)]
    debug: bool,
}

fn init_logging(debug: bool, ring: &RingBuffer) {
    let default = if debug { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .compact()
                .with_writer(std::io::stderr)
                .with_filter(env_filter),
        )
        .with(
            fmt::layer()
                .with_ansi(false)
                .with_writer(ring.clone())
                .with_filter(LevelFilter::DEBUG),
        )
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let ring = RingBuffer::new();
    init_logging(cli.debug, &ring);

    let target = if cli.mock { Target::Mock } else { Target::Node(cli.device) };
    let harness = Harness::new(subtests::SUBTESTS, target, ring);

    if cli.list_subtests {
        for name in harness.list() {
            println!("{}", name);
        }
        return ExitCode::SUCCESS;
    }
    if cli.describe {
        for subtest in subtests::SUBTESTS {
            println!("{}: {}", subtest.name, subtest.description);
        }
        return ExitCode::SUCCESS;
    }

    info!(version = env!("CARGO_PKG_VERSION"), "kmsprobe runner");
    let code = harness.run(cli.run_subtest.as_deref());
    ExitCode::from(code as u8)
}
