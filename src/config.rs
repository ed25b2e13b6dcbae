use anyhow::{anyhow, bail, Result};
use clap::{Arg, ArgAction, ArgMatches, Command};
use log::LevelFilter;
use rand::Rng;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::clock::{ClockSource, Pacing};
use crate::distribution::ArrivalShape;
use crate::logging::{self, DEFAULT_LOG_LEVEL};
use crate::router::{BackendKind, DEFAULT_REDIS_URL};
use crate::sink::DEFAULT_RESULT_FILE;
use crate::sweep::SweepConfig;
use crate::trial::TrialConfig;

const DEFAULT_MODE: &str = "client";
const DEFAULT_START_RATE: &str = "1000";
const DEFAULT_DURATION: &str = "5";
const DEFAULT_WRITE_RATIO: &str = "50";
const DEFAULT_RATE_STEP_ARG: &str = "1000";
const DEFAULT_MAX_RATE_ARG: &str = "10000000";
const DEFAULT_KEYSPACE: &str = "100000";
const DEFAULT_PUT_VALUE: &str = "1111";
const DEFAULT_QUIESCENCE_MS: &str = "3000";
const DEFAULT_PAUSE_MS: &str = "0";
const DEFAULT_ARRIVAL: &str = "exponential";
const DEFAULT_PACING: &str = "spin";
const DEFAULT_CLOCK: &str = "realtime";
const DEFAULT_BACKEND: &str = "redis";
const DEFAULT_SERVER_THREADS: &str = "1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Client,
    Server,
}

impl FromStr for RunMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "client" => Ok(RunMode::Client),
            "server" => Ok(RunMode::Server),
            _ => Err(format!("Unknown run mode: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub server: SocketAddr,
    pub sweep: SweepConfig,
    pub clock: ClockSource,
    pub pacing: Pacing,
    pub output: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub backend: BackendKind,
    pub redis_url: String,
    pub threads: usize,
    pub preload: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ModeConfig {
    Client(ClientConfig),
    Server(ServerConfig),
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub log_level: LevelFilter,
    pub log_file: Option<PathBuf>,
    pub mode: ModeConfig,
}

pub fn build_cli() -> Command {
    Command::new("kvloadgen")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Open-loop latency sweep against a UDP key-value router")
        .arg(
            Arg::new("ADDR")
                .index(1)
                .required(true)
                .value_parser(clap::value_parser!(SocketAddr))
                .help("Server address (client) or address to listen on (server)"),
        )
        .arg(
            Arg::new("mode")
                .short('m')
                .long("mode")
                .value_name("MODE")
                .value_parser(clap::value_parser!(RunMode))
                .default_value(DEFAULT_MODE)
                .help("client or server"),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .num_args(1)
                .default_value(DEFAULT_LOG_LEVEL)
                .help("error, warn, info, debug or trace"),
        )
        .arg(
            Arg::new("log-file")
                .long("log-file")
                .num_args(1)
                .value_parser(clap::value_parser!(PathBuf))
                .help("Also append log lines to this file"),
        )
        .arg(
            Arg::new("start-rate")
                .short('r')
                .long("start-rate")
                .value_parser(clap::value_parser!(u64))
                .default_value(DEFAULT_START_RATE)
                .help("Requests per second of the first trial"),
        )
        .arg(
            Arg::new("duration")
                .short('d')
                .long("duration")
                .value_parser(clap::value_parser!(u64))
                .default_value(DEFAULT_DURATION)
                .help("Seconds of load per trial"),
        )
        .arg(
            Arg::new("write-ratio")
                .short('w')
                .long("write-ratio")
                .value_parser(clap::value_parser!(u32))
                .default_value(DEFAULT_WRITE_RATIO)
                .help("Percent of requests that are PUTs"),
        )
        .arg(
            Arg::new("rate-step")
                .long("rate-step")
                .value_parser(clap::value_parser!(u64))
                .default_value(DEFAULT_RATE_STEP_ARG)
                .help("Rate increase between trials"),
        )
        .arg(
            Arg::new("max-rate")
                .long("max-rate")
                .value_parser(clap::value_parser!(u64))
                .default_value(DEFAULT_MAX_RATE_ARG)
                .help("Highest rate the sweep will try"),
        )
        .arg(
            Arg::new("max-trials")
                .long("max-trials")
                .value_parser(clap::value_parser!(usize))
                .help("Stop after this many trials"),
        )
        .arg(
            Arg::new("stop-after-failures")
                .long("stop-after-failures")
                .value_parser(clap::value_parser!(usize))
                .help("Stop after this many incomplete trials in a row"),
        )
        .arg(
            Arg::new("keyspace")
                .short('k')
                .long("keyspace")
                .value_parser(clap::value_parser!(u32))
                .default_value(DEFAULT_KEYSPACE)
                .help("Keys are drawn uniformly from 0..keyspace"),
        )
        .arg(
            Arg::new("value")
                .long("value")
                .value_parser(clap::value_parser!(u64))
                .default_value(DEFAULT_PUT_VALUE)
                .help("Value carried by every PUT"),
        )
        .arg(
            Arg::new("workers")
                .short('t')
                .long("workers")
                .value_parser(clap::value_parser!(usize))
                .help("Generator threads per trial [default: one per second of duration]"),
        )
        .arg(
            Arg::new("quiescence-ms")
                .long("quiescence-ms")
                .value_parser(clap::value_parser!(u64))
                .default_value(DEFAULT_QUIESCENCE_MS)
                .help("Give up on a trial after this long without a response"),
        )
        .arg(
            Arg::new("pause-ms")
                .long("pause-ms")
                .value_parser(clap::value_parser!(u64))
                .default_value(DEFAULT_PAUSE_MS)
                .help("Idle time between trials"),
        )
        .arg(
            Arg::new("output")
                .short('o')
                .long("output")
                .value_parser(clap::value_parser!(PathBuf))
                .default_value(DEFAULT_RESULT_FILE)
                .help("File that completed trials are appended to"),
        )
        .arg(
            Arg::new("arrival")
                .long("arrival")
                .value_parser(clap::value_parser!(ArrivalShape))
                .default_value(DEFAULT_ARRIVAL)
                .help("exponential, constant or bimodal:<p>:<f1>:<f2>"),
        )
        .arg(
            Arg::new("pacing")
                .long("pacing")
                .value_parser(clap::value_parser!(Pacing))
                .default_value(DEFAULT_PACING)
                .help("spin or hybrid"),
        )
        .arg(
            Arg::new("clock")
                .long("clock")
                .value_parser(clap::value_parser!(ClockSource))
                .default_value(DEFAULT_CLOCK)
                .help("monotonic or realtime"),
        )
        .arg(
            Arg::new("seed")
                .long("seed")
                .value_parser(clap::value_parser!(u64))
                .help("Seed for request generation [default: random]"),
        )
        .arg(
            Arg::new("backend")
                .long("backend")
                .value_parser(clap::value_parser!(BackendKind))
                .default_value(DEFAULT_BACKEND)
                .help("redis or memory"),
        )
        .arg(
            Arg::new("redis-url")
                .long("redis-url")
                .num_args(1)
                .default_value(DEFAULT_REDIS_URL)
                .help("Redis server used by the redis backend"),
        )
        .arg(
            Arg::new("threads")
                .long("threads")
                .value_parser(clap::value_parser!(usize))
                .default_value(DEFAULT_SERVER_THREADS)
                .help("Server receive threads"),
        )
        .arg(
            Arg::new("preload")
                .long("preload")
                .value_parser(clap::value_parser!(u32))
                .help("Store keys 0..N before serving"),
        )
        .arg(
            Arg::new("quiet")
                .short('q')
                .long("quiet")
                .action(ArgAction::SetTrue)
                .conflicts_with("log-level")
                .help("Only log warnings and errors"),
        )
}

fn required<T: Clone + Send + Sync + 'static>(matches: &ArgMatches, name: &str) -> Result<T> {
    matches
        .get_one::<T>(name)
        .cloned()
        .ok_or_else(|| anyhow!("missing --{}", name))
}

impl ClientConfig {
    pub fn from_matches(matches: &ArgMatches) -> Result<Self> {
        let server: SocketAddr = required(matches, "ADDR")?;
        let start_rate: u64 = required(matches, "start-rate")?;
        let duration_secs: u64 = required(matches, "duration")?;
        let write_ratio: u32 = required(matches, "write-ratio")?;
        let rate_step: u64 = required(matches, "rate-step")?;
        let max_rate: u64 = required(matches, "max-rate")?;
        let keyspace: u32 = required(matches, "keyspace")?;
        let workers = matches
            .get_one::<usize>("workers")
            .copied()
            .unwrap_or(duration_secs as usize);

        if write_ratio > 100 {
            bail!("write ratio must be between 0 and 100, got {}", write_ratio);
        }
        if duration_secs == 0 {
            bail!("trial duration must be at least one second");
        }
        if workers == 0 {
            bail!("at least one generator thread is required");
        }
        if rate_step == 0 {
            bail!("rate step must be positive");
        }
        if start_rate > max_rate {
            bail!(
                "start rate {} is above the maximum rate {}",
                start_rate,
                max_rate
            );
        }
        if keyspace == 0 {
            bail!("keyspace must hold at least one key");
        }

        let seed = matches
            .get_one::<u64>("seed")
            .copied()
            .unwrap_or_else(|| rand::thread_rng().gen());

        let template = TrialConfig {
            target_rate: start_rate,
            duration_secs,
            write_ratio,
            keyspace,
            put_value: required(matches, "value")?,
            workers,
            arrival: required(matches, "arrival")?,
            quiescence: Duration::from_millis(required(matches, "quiescence-ms")?),
            seed,
        };

        Ok(ClientConfig {
            server,
            sweep: SweepConfig {
                template,
                start_rate,
                rate_step,
                max_rate,
                max_trials: matches.get_one::<usize>("max-trials").copied(),
                stop_after_failures: matches.get_one::<usize>("stop-after-failures").copied(),
                pause: Duration::from_millis(required(matches, "pause-ms")?),
            },
            clock: required(matches, "clock")?,
            pacing: required(matches, "pacing")?,
            output: required(matches, "output")?,
        })
    }
}

impl ServerConfig {
    pub fn from_matches(matches: &ArgMatches) -> Result<Self> {
        let threads: usize = required(matches, "threads")?;
        if threads == 0 {
            bail!("at least one server thread is required");
        }
        Ok(ServerConfig {
            listen: required(matches, "ADDR")?,
            backend: required(matches, "backend")?,
            redis_url: required(matches, "redis-url")?,
            threads,
            preload: matches.get_one::<u32>("preload").copied().unwrap_or(0),
        })
    }
}

impl AppConfig {
    pub fn from_matches(matches: &ArgMatches) -> Result<Self> {
        let log_level = if matches.get_flag("quiet") {
            LevelFilter::Warn
        } else {
            let level: String = required(matches, "log-level")?;
            logging::parse_level(&level).map_err(|e| anyhow!(e))?
        };
        let mode = match required::<RunMode>(matches, "mode")? {
            RunMode::Client => ModeConfig::Client(ClientConfig::from_matches(matches)?),
            RunMode::Server => ModeConfig::Server(ServerConfig::from_matches(matches)?),
        };
        Ok(AppConfig {
            log_level,
            log_file: matches.get_one::<PathBuf>("log-file").cloned(),
            mode,
        })
    }
}
