use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Subcommand};
use relaypeer_peer::SessionConfig;

use crate::exit::{CliError, CliResult, USAGE};
use crate::output::OutputFormat;

pub mod fanout;
pub mod pipe;
mod sink;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Stream a file between two in-process peers.
    Pipe(PipeArgs),
    /// Run several concurrent streams between one peer pair.
    Fanout(FanoutArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat, config: SessionConfig) -> CliResult<i32> {
    match command {
        Command::Pipe(args) => pipe::run(args, format, config),
        Command::Fanout(args) => fanout::run(args, format, config),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct PipeArgs {
    /// File to stream.
    pub input: PathBuf,
    /// Write the received bytes here.
    #[arg(long, short = 'o', value_name = "FILE")]
    pub output: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct FanoutArgs {
    /// File whose contents every stream carries.
    pub input: PathBuf,
    /// Number of concurrent streams.
    #[arg(long, short = 'n', default_value = "3", value_parser = clap::value_parser!(u16).range(1..=256))]
    pub streams: u16,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

/// Parse `5s`, `500ms` or a bare number of seconds.
pub fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, millis) = if let Some(num) = input.strip_suffix("ms") {
        (num, true)
    } else if let Some(num) = input.strip_suffix('s') {
        (num, false)
    } else {
        (input, false)
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;

    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    Ok(if millis {
        Duration::from_millis(value)
    } else {
        Duration::from_secs(value)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_seconds_and_millis() {
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("150ms").unwrap(), Duration::from_millis(150));
        assert_eq!(parse_duration("3").unwrap(), Duration::from_secs(3));
    }

    #[test]
    fn parse_duration_rejects_invalid_values() {
        assert!(parse_duration("0s").is_err());
        assert!(parse_duration("bad").is_err());
        assert!(parse_duration("").is_err());
    }
}
