use std::path::PathBuf;

use anyhow::Result;
use clap::{ArgAction, Parser};
use tracing_subscriber::EnvFilter;

use lattop::config::{Backend, Config, SortKey, NSEC_PER_USEC};
use lattop::lat_translator::LATENCYTOP_TRANS_PATH;
use lattop::symbolize::KALLSYMS_PATH;

#[derive(Debug, Parser)]
#[command(version, about = "Show which kernel call stacks are making threads wait to run")]
struct Command {
    /// Increase verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
    /// Seconds between reports
    #[arg(short, long, default_value = "5", value_parser = clap::value_parser!(u64).range(1..))]
    interval: u64,
    /// Exit after this many reports, 0 runs until interrupted
    #[arg(short, long, default_value = "0")]
    count: u32,
    /// Report order
    #[arg(short, long, value_enum, default_value_t = SortKey::Max)]
    sort: SortKey,
    /// Reverse the report order
    #[arg(short, long)]
    reverse: bool,
    /// Ignore delays shorter than this many microseconds
    #[arg(short = 'm', long, default_value = "0")]
    min_latency: u64,
    /// Ignore interruptible sleeps longer than this many microseconds
    #[arg(short = 'M', long, default_value = "5000")]
    max_interruptible: u64,
    /// Only report this process
    #[arg(short, long)]
    pid_filter: Option<u32>,
    /// Event source
    #[arg(long, value_enum, default_value_t = Backend::Script)]
    backend: Backend,
    /// Tracing script for the script backend
    #[arg(long, default_value = "lat.stp")]
    script: PathBuf,
    /// Tracer command line the script is appended to
    #[arg(long, default_value = "stap -g")]
    tracer: String,
    /// latencytop.trans style symbol translations
    #[arg(long, default_value = LATENCYTOP_TRANS_PATH)]
    translations: PathBuf,
    /// Kernel symbol listing
    #[arg(long, default_value = KALLSYMS_PATH)]
    kallsyms: PathBuf,
    /// Keep latencies of lattop's own thread
    #[arg(long)]
    include_self: bool,
}

impl From<Command> for Config {
    fn from(opts: Command) -> Self {
        Config {
            verbosity: opts.verbose,
            interval: opts.interval,
            count: opts.count,
            sort: opts.sort,
            reverse: opts.reverse,
            min_delay: opts.min_latency.saturating_mul(NSEC_PER_USEC),
            max_interruptible_delay: opts.max_interruptible.saturating_mul(NSEC_PER_USEC),
            pid_filter: opts.pid_filter,
            backend: opts.backend,
            script: opts.script,
            tracer: opts.tracer.split_whitespace().map(String::from).collect(),
            translations: opts.translations,
            kallsyms: opts.kallsyms,
            include_self: opts.include_self,
        }
    }
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() -> Result<()> {
    let opts = Command::parse();
    let config = Config::from(opts);
    init_logging(config.verbosity);

    lattop::lattop(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Command::command().debug_assert();
    }

    #[test]
    fn test_defaults_match_config() {
        let config = Config::from(Command::parse_from(["lattop"]));
        let defaults = Config::default();
        assert_eq!(config.interval, defaults.interval);
        assert_eq!(config.max_interruptible_delay, defaults.max_interruptible_delay);
        assert_eq!(config.tracer, defaults.tracer);
        assert_eq!(config.backend, defaults.backend);
        assert_eq!(config.kallsyms, defaults.kallsyms);
    }

    #[test]
    fn test_parse_flags() {
        let config = Config::from(Command::parse_from([
            "lattop", "-i", "2", "-c", "3", "-s", "total", "-r", "-p", "42", "--backend", "perf",
            "-vv",
        ]));
        assert_eq!(config.interval, 2);
        assert_eq!(config.count, 3);
        assert_eq!(config.sort, SortKey::Total);
        assert!(config.reverse);
        assert_eq!(config.pid_filter, Some(42));
        assert_eq!(config.backend, Backend::Perf);
        assert_eq!(config.verbosity, 2);
    }

    #[test]
    fn test_latency_flags_are_microseconds() {
        let config = Config::from(Command::parse_from(["lattop", "-m", "10", "-M", "2000"]));
        assert_eq!(config.min_delay, 10_000);
        assert_eq!(config.max_interruptible_delay, 2_000_000);

        let config = Config::from(Command::parse_from([
            "lattop",
            "--min-latency",
            "7",
            "--max-interruptible",
            "5000",
            "--pid-filter",
            "10",
        ]));
        assert_eq!(config.min_delay, 7_000);
        assert_eq!(config.max_interruptible_delay, 5_000_000);
        assert_eq!(config.pid_filter, Some(10));
    }

    #[test]
    fn test_zero_interval_rejected() {
        assert!(Command::try_parse_from(["lattop", "-i", "0"]).is_err());
    }
}
