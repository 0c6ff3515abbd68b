mod cmd;
mod exit;
mod logging;
mod output;

use clap::Parser;
use relaypeer_peer::{SessionConfig, DEFAULT_CHUNK_SIZE};

use crate::cmd::Command;
use crate::exit::CliResult;
use crate::logging::{init_logging, LogFormat, LogLevel};
use crate::output::OutputFormat;

#[derive(Parser, Debug)]
#[command(name = "relaypeer", version, about = "Relay peer sessions CLI")]
struct Cli {
    /// Output format.
    #[arg(long, value_name = "FORMAT", global = true)]
    format: Option<OutputFormat>,

    /// Log output format (stderr).
    #[arg(long, value_name = "FORMAT", default_value = "text", global = true)]
    log_format: LogFormat,

    /// Minimum log level (stderr).
    #[arg(long, value_name = "LEVEL", default_value = "info", global = true)]
    log_level: LogLevel,

    /// Relay request timeout (e.g. 5s, 500ms).
    #[arg(long, value_name = "DURATION", default_value = "10s", global = true)]
    timeout: String,

    /// Stream chunk size in bytes.
    #[arg(long, value_name = "BYTES", default_value_t = DEFAULT_CHUNK_SIZE, global = true)]
    chunk_size: usize,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    fn session_config(&self) -> CliResult<SessionConfig> {
        let timeout = cmd::parse_duration(&self.timeout)?;
        Ok(SessionConfig::default()
            .with_request_timeout(Some(timeout))
            .with_chunk_size(self.chunk_size))
    }
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_format, cli.log_level);

    let format = cli.format.unwrap_or_else(OutputFormat::default_for_stdout);
    let result = cli
        .session_config()
        .and_then(|config| cmd::run(cli.command, format, config));

    match result {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(err.code);
        }
    }
}
