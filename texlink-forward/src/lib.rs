//! Shared pieces of the helper executables TeX spawns.

use std::io::{self, BufRead, Write};

use texlink::{GlobalConfiguration, TransportMode};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Extra arguments appended to the command line, whitespace separated.
pub const EXTRA_ARGS_ENV: &str = "TEXLINK_EXTRA_ARGS";

pub const USAGE: &str = "\
Usage: texlink-forward [-m <mode>] [-d <level>] [--naive-flush] [--debug-log-communication <path>]

Options:
  -m, --mode <mode>                      unnamed-pipe or loopback-network [default: first available]
  -d, --debug <level>                    debug level 0-9 [default: 0]
      --naive-flush                      pad output for TeX distributions that do not flush
      --debug-log-communication <path>   log every exchanged line ($pid is substituted)
  -h, --help                             print this help";

/// Parsed `texlink-forward` command line.
#[derive(Debug, Default, PartialEq)]
pub struct ForwardArgs {
    pub mode: Option<TransportMode>,
    pub debug: u8,
    pub naive_flush: bool,
    pub debug_log_communication: Option<String>,
}

impl ForwardArgs {
    /// Configuration handed to TeX, still without a communicator.
    pub fn configuration(&self) -> GlobalConfiguration {
        let config = GlobalConfiguration::new()
            .with_debug(self.debug)
            .with_naive_flush(self.naive_flush);
        match &self.debug_log_communication {
            Some(path) => config.with_communication_log(path.clone()),
            None => config,
        }
    }
}

/// Parse arguments (without the program name). `Err("")` asks for help.
pub fn parse_args(args: &[String]) -> Result<ForwardArgs, String> {
    let mut parsed = ForwardArgs::default();

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "-m" | "--mode" => {
                i += 1;
                let mode = args.get(i).ok_or("--mode requires a value")?;
                parsed.mode = Some(mode.parse().map_err(|e| format!("{e}"))?);
            }
            "-d" | "--debug" => {
                i += 1;
                let level = args.get(i).ok_or("--debug requires a value")?;
                parsed.debug = match level.parse::<u8>() {
                    Ok(level) if level <= 9 => level,
                    _ => return Err(format!("invalid debug level '{level}', expected 0-9")),
                };
            }
            "--naive-flush" => parsed.naive_flush = true,
            "--debug-log-communication" => {
                i += 1;
                let path = args
                    .get(i)
                    .ok_or("--debug-log-communication requires a value")?;
                parsed.debug_log_communication = Some(path.clone());
            }
            "--help" | "-h" => return Err(String::new()),
            arg => return Err(format!("unexpected argument: {arg}")),
        }
        i += 1;
    }

    Ok(parsed)
}

/// Command-line arguments followed by those from [`EXTRA_ARGS_ENV`].
pub fn collect_args(extra: Option<&str>) -> Vec<String> {
    let mut args: Vec<String> = std::env::args().skip(1).collect();
    if let Some(extra) = extra {
        args.extend(extra.split_whitespace().map(str::to_string));
    }
    args
}

/// Copy `input` to `output` line by line, flushing after each line.
pub fn copy_lines(mut input: impl BufRead, mut output: impl Write) -> io::Result<u64> {
    let mut copied = 0;
    let mut line = Vec::new();
    loop {
        line.clear();
        if input.read_until(b'\n', &mut line)? == 0 {
            return Ok(copied);
        }
        output.write_all(&line)?;
        output.flush()?;
        copied += 1;
    }
}

/// Log to stderr; stdout belongs to TeX.
///
/// `RUST_LOG` wins; otherwise `TEXLINK_LOG` sets the level for texlink crates
/// (default `warn`, since TeX may show our stderr). `LOG_FORMAT=json` selects
/// JSON output.
pub fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("TEXLINK_LOG").as_deref() {
            Ok("trace") => "trace",
            Ok("debug") => "debug",
            Ok("info") => "info",
            Ok("error") => "error",
            _ => "warn",
        };
        EnvFilter::new(format!("texlink={level},texlink_forward={level}"))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(io::stderr));
        let _ = subscriber.try_init();
    }
}
