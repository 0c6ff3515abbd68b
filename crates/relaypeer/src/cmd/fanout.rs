use std::collections::HashMap;
use std::fs;
use std::io::Cursor;
use std::time::Instant;

use relaypeer_peer::{Duplex, SessionConfig};
use relaypeer_relay::MemoryRelay;
use serde::Serialize;
use tracing::{debug, info};

use crate::cmd::sink::{self, ChannelSink};
use crate::cmd::FanoutArgs;
use crate::exit::{io_error, peer_error, CliResult, DATA_INVALID, SUCCESS};
use crate::output::{print_report, OutputFormat};

const SENDER: &str = "fanout-sender";
const RECEIVER: &str = "fanout-receiver";

#[derive(Debug, Serialize)]
struct StreamReport {
    index: u16,
    stream_id: String,
    expected_bytes: usize,
    received_bytes: usize,
    intact: bool,
}

#[derive(Debug, Serialize)]
struct FanoutReport {
    input: String,
    chunk_size: usize,
    elapsed_ms: u128,
    intact: bool,
    streams: Vec<StreamReport>,
}

/// Payload for stream `index`: a tag line, then the file contents.
fn tagged_payload(index: u16, data: &[u8]) -> Vec<u8> {
    let mut payload = format!("stream {index}\n").into_bytes();
    payload.extend_from_slice(data);
    payload
}

pub fn run(args: FanoutArgs, format: OutputFormat, config: SessionConfig) -> CliResult<i32> {
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
    let mut opened: Vec<(u16, Duplex, Vec<u8>)> = Vec::with_capacity(args.streams.into());
    for index in 0..args.streams {
        let stream = sender
            .open_stream(RECEIVER)
            .map_err(|err| peer_error("open stream failed", err))?;
        debug!(index, stream = %stream.local_stream_id(), "stream opened");
        opened.push((index, stream, tagged_payload(index, &data)));
    }
    info!(streams = opened.len(), bytes = data.len(), "fanning out");

    let expected: HashMap<String, usize> = opened
        .iter()
        .map(|(_, stream, payload)| (stream.remote_stream_id().to_string(), payload.len()))
        .collect();
    for (_, stream, payload) in &opened {
        stream
            .set_input(Cursor::new(payload.clone()))
            .map_err(|err| peer_error("attach input failed", err))?;
    }
    let received = sink::collect(&rx, &expected, idle)?;
    let elapsed = started.elapsed();

    let streams: Vec<StreamReport> = opened
        .iter()
        .map(|(index, stream, payload)| {
            let body = received
                .get(stream.remote_stream_id())
                .map(Vec::as_slice)
                .unwrap_or_default();
            StreamReport {
                index: *index,
                stream_id: stream.local_stream_id().to_string(),
                expected_bytes: payload.len(),
                received_bytes: body.len(),
                intact: body == payload.as_slice(),
            }
        })
        .collect();
    for (_, stream, _) in &opened {
        stream.close();
    }
    sender.disconnect();
    receiver.disconnect();

    let intact = streams.iter().all(|stream| stream.intact);
    let rows: Vec<Vec<String>> = streams
        .iter()
        .map(|stream| {
            vec![
                stream.index.to_string(),
                stream.stream_id.clone(),
                stream.expected_bytes.to_string(),
                stream.received_bytes.to_string(),
                stream.intact.to_string(),
            ]
        })
        .collect();
    let report = FanoutReport {
        input: args.input.display().to_string(),
        chunk_size,
        elapsed_ms: elapsed.as_millis(),
        intact,
        streams,
    };
    print_report(
        &report,
        &["INDEX", "STREAM", "EXPECTED", "RECEIVED", "INTACT"],
        &rows,
        format,
    );

    Ok(if intact { SUCCESS } else { DATA_INVALID })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tagged_payloads_differ_per_stream() {
        let a = tagged_payload(0, b"body");
        let b = tagged_payload(1, b"body");
        assert_eq!(a, b"stream 0\nbody");
        assert_ne!(a, b);
    }
}
