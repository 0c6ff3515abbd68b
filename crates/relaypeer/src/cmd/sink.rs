use std::collections::HashMap;
use std::io::{self, Write};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

use relaypeer_peer::{Session, SessionConfig};
use relaypeer_relay::MemoryRelay;

use crate::exit::{peer_error, transport_error, CliError, CliResult, FAILURE, TIMEOUT};

pub type Chunk = (String, Vec<u8>);

/// Stream output that forwards each chunk, tagged with the stream id, to
/// the command's collector.
pub struct ChannelSink {
    tag: String,
    tx: Sender<Chunk>,
}

impl ChannelSink {
    pub fn new(tag: impl Into<String>, tx: Sender<Chunk>) -> Self {
        Self {
            tag: tag.into(),
            tx,
        }
    }
}

impl Write for ChannelSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tx
            .send((self.tag.clone(), buf.to_vec()))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "collector is gone"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub fn channel() -> (Sender<Chunk>, Receiver<Chunk>) {
    mpsc::channel()
}

/// Gather chunks until every tag in `expected` holds its byte count.
///
/// `idle` bounds the gap between two chunks; `None` waits forever.
pub fn collect(
    rx: &Receiver<Chunk>,
    expected: &HashMap<String, usize>,
    idle: Option<Duration>,
) -> CliResult<HashMap<String, Vec<u8>>> {
    let mut received: HashMap<String, Vec<u8>> = expected
        .keys()
        .map(|tag| (tag.clone(), Vec::new()))
        .collect();
    let complete = |received: &HashMap<String, Vec<u8>>| {
        expected
            .iter()
            .all(|(tag, len)| received.get(tag).is_some_and(|buf| buf.len() >= *len))
    };

    while !complete(&received) {
        let (tag, bytes) = match idle {
            Some(timeout) => rx.recv_timeout(timeout).map_err(|err| match err {
                RecvTimeoutError::Timeout => CliError::new(
                    TIMEOUT,
                    format!("no stream data within {}ms", timeout.as_millis()),
                ),
                RecvTimeoutError::Disconnected => stream_gone(),
            })?,
            None => rx.recv().map_err(|_| stream_gone())?,
        };
        received.entry(tag).or_default().extend_from_slice(&bytes);
    }
    Ok(received)
}

fn stream_gone() -> CliError {
    CliError::new(FAILURE, "streams closed before all data arrived")
}

/// Connect `client_id` to `relay` and start a session on it.
pub fn open_session(relay: &MemoryRelay, client_id: &str, config: SessionConfig) -> CliResult<Session> {
    let link = relay
        .connect(client_id)
        .map_err(|err| transport_error("relay connect failed", err))?;
    Session::new(link, client_id, config).map_err(|err| peer_error("session setup failed", err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collect_waits_for_every_tag() {
        let (tx, rx) = channel();
        let mut a = ChannelSink::new("a", tx.clone());
        let mut b = ChannelSink::new("b", tx);
        a.write_all(b"he").expect("write should succeed");
        b.write_all(b"xyz").expect("write should succeed");
        a.write_all(b"llo").expect("write should succeed");

        let expected = HashMap::from([("a".to_string(), 5), ("b".to_string(), 3)]);
        let received = collect(&rx, &expected, Some(Duration::from_secs(1)))
            .expect("collect should finish");
        assert_eq!(received["a"], b"hello");
        assert_eq!(received["b"], b"xyz");
    }

    #[test]
    fn collect_times_out_when_data_stops() {
        let (tx, rx) = channel();
        let mut sink = ChannelSink::new("a", tx);
        sink.write_all(b"12").expect("write should succeed");

        let expected = HashMap::from([("a".to_string(), 10)]);
        let err = collect(&rx, &expected, Some(Duration::from_millis(50)))
            .expect_err("collect should time out");
        assert_eq!(err.code, TIMEOUT);
    }
}
