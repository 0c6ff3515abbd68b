use std::collections::HashMap;
use std::fs;
use std::io::Cursor;
use std::time::Instant;

use relaypeer_peer::SessionConfig;
use relaypeer_relay::MemoryRelay;
use serde::Serialize;
use tracing::{debug, info};

use crate::cmd::sink::{self, ChannelSink};
use crate::cmd::PipeArgs;
use crate::exit::{io_error, peer_error, CliResult, DATA_INVALID, SUCCESS};
use crate::output::{print_report, OutputFormat};

const SENDER: &str = "pipe-sender";
const RECEIVER: &str = "pipe-receiver";

#[derive(Debug, Serialize)]
struct PipeReport {
    input: String,
    output: Option<String>,
    bytes: usize,
    chunk_size: usize,
    chunks: usize,
    elapsed_ms: u128,
    intact: bool,
}

pub fn run(args: PipeArgs, format: OutputFormat, config: SessionConfig) -> CliResult<i32> {
    let data = fs::read(&args.input)
        .map_err(|err| io_error(&format!("failed reading {}", args.input.display()), err))?;
    let chunk_size = config.effective_chunk_size();
    let idle = config.request_timeout;

    let relay = MemoryRelay::new();
    let sender = sink::open_session(&relay, SENDER, config.clone())?;
    let receiver = sink::open_session(&relay, RECEIVER, config)?;

    let (tx, rx) = sink::channel();
    receiver.multiplexer().on_stream_requested(move |duplex| {
        let tag = duplex.local_stream_id().to_string();
        duplex.attach_output(ChannelSink::new(tag, tx.clone()));
        Ok(())
    });

    let started = Instant::now();
    let stream = sender
        .open_stream(RECEIVER)
        .map_err(|err| peer_error("open stream failed", err))?;
    info!(stream = %stream.local_stream_id(), bytes = data.len(), "streaming input");

    let expected = HashMap::from([(stream.remote_stream_id().to_string(), data.len())]);
    stream
        .set_input(Cursor::new(data.clone()))
        .map_err(|err| peer_error("attach input failed", err))?;
    let mut received = sink::collect(&rx, &expected, idle)?;
    let elapsed = started.elapsed();
    stream.close();

    let body = received
        .remove(stream.remote_stream_id())
        .unwrap_or_default();
    let intact = body == data;
    debug!(bytes = body.len(), intact, "stream drained");

    if let Some(path) = &args.output {
        fs::write(path, &body)
            .map_err(|err| io_error(&format!("failed writing {}", path.display()), err))?;
    }

    sender.disconnect();
    receiver.disconnect();

    let report = PipeReport {
        input: args.input.display().to_string(),
        output: args.output.as_ref().map(|path| path.display().to_string()),
        bytes: body.len(),
        chunk_size,
        chunks: data.len().div_ceil(chunk_size),
        elapsed_ms: elapsed.as_millis(),
        intact,
    };
    print_report(
        &report,
        &["INPUT", "BYTES", "CHUNKS", "ELAPSED_MS", "INTACT"],
        &[vec![
            report.input.clone(),
            report.bytes.to_string(),
            report.chunks.to_string(),
            report.elapsed_ms.to_string(),
            report.intact.to_string(),
        ]],
        format,
    );

    Ok(if intact { SUCCESS } else { DATA_INVALID })
}
