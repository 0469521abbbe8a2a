use std::time::Duration;

use clap::{Arg, ArgAction, ArgMatches, Command};

const DEFAULT_METRICS_PORT: &str = "2469";
const DEFAULT_CLOSE_TIMEOUT_MS: &str = "5000";

pub(super) fn root_cli() -> Command {
    Command::new("benchsink")
        .author("benchsink Authors")
        .about("Benchmarking output that measures message latency and throughput")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(add_bench_subcommand())
}

fn add_bench_subcommand() -> Command {
    Command::new("bench")
        .about("Generates timestamped messages and runs them through the bench output")
        .arg(
            Arg::new("rate")
                .long("rate")
                .help("Messages generated per second")
                .action(ArgAction::Set)
                .default_value("1000")
                .value_parser(clap::value_parser!(u64).range(1..=1_000_000_000)),
        )
        .arg(
            Arg::new("parts")
                .long("parts")
                .help("Payload parts per message, besides the timestamp")
                .action(ArgAction::Set)
                .default_value("1")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("size")
                .long("size")
                .help("Size of every payload part in bytes")
                .action(ArgAction::Set)
                .default_value("128")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("duration")
                .long("duration")
                .help("Stop generating after this many seconds and let the output drain")
                .action(ArgAction::Set)
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("period-ms")
                .long("period-ms")
                .help("Reporting period in milliseconds, overrides BENCHSINK_REPORT_PERIOD_MS")
                .action(ArgAction::Set)
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
        .arg(
            Arg::new("metrics-port")
                .long("metrics-port")
                .help("Port of the prometheus metrics endpoint")
                .action(ArgAction::Set)
                .default_value(DEFAULT_METRICS_PORT)
                .value_parser(clap::value_parser!(u16)),
        )
        .arg(
            Arg::new("close-timeout-ms")
                .long("close-timeout-ms")
                .help("How long to wait for the output to close on shutdown")
                .action(ArgAction::Set)
                .default_value(DEFAULT_CLOSE_TIMEOUT_MS)
                .value_parser(clap::value_parser!(u64)),
        )
}

/// Arguments of the `bench` subcommand.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct BenchArgs {
    pub(crate) rate: u64,
    pub(crate) parts: usize,
    pub(crate) size: usize,
    pub(crate) duration: Option<Duration>,
    pub(crate) period: Option<Duration>,
    pub(crate) metrics_port: u16,
    pub(crate) close_timeout: Duration,
}

impl From<&ArgMatches> for BenchArgs {
    fn from(args: &ArgMatches) -> Self {
        // every argument below has a default value or is optional
        Self {
            rate: args.get_one::<u64>("rate").copied().unwrap_or(1000),
            parts: args.get_one::<usize>("parts").copied().unwrap_or(1),
            size: args.get_one::<usize>("size").copied().unwrap_or(128),
            duration: args
                .get_one::<u64>("duration")
                .map(|secs| Duration::from_secs(*secs)),
            period: args
                .get_one::<u64>("period-ms")
                .map(|ms| Duration::from_millis(*ms)),
            metrics_port: args.get_one::<u16>("metrics-port").copied().unwrap_or(2469),
            close_timeout: Duration::from_millis(
                args.get_one::<u64>("close-timeout-ms")
                    .copied()
                    .unwrap_or(5000),
            ),
        }
    }
}
