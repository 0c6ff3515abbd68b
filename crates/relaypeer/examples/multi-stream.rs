//! Three concurrent duplex streams between one pair of peers.
//!
//! Run with:
//!   cargo run --example multi-stream

use std::io::{self, Cursor, Write};
use std::sync::mpsc;
use std::time::Duration;

use relaypeer::peer::{Session, SessionConfig};
use relaypeer::relay::MemoryRelay;

/// Forwards every chunk, tagged with its stream id.
struct Tagged {
    stream: String,
    tx: mpsc::Sender<(String, Vec<u8>)>,
}

impl Write for Tagged {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = self.tx.send((self.stream.clone(), buf.to_vec()));
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let relay = MemoryRelay::new();
    let config = SessionConfig::default().with_chunk_size(8);
    let alice = Session::new(relay.connect("alice")?, "alice", config.clone())?;
    let bob = Session::new(relay.connect("bob")?, "bob", config)?;

    let (tx, rx) = mpsc::channel();
    bob.multiplexer().on_stream_requested(move |duplex| {
        duplex.attach_output(Tagged {
            stream: duplex.local_stream_id().to_string(),
            tx: tx.clone(),
        });
        Ok(())
    });

    let mut streams = Vec::new();
    for name in ["red", "green", "blue"] {
        let stream = alice.open_stream("bob")?;
        stream.set_input(Cursor::new(format!("{name} says hello over its own stream\n")))?;
        streams.push(stream);
    }

    while let Ok((stream, chunk)) = rx.recv_timeout(Duration::from_millis(200)) {
        eprintln!("{stream}: {:?}", String::from_utf8_lossy(&chunk));
    }

    for stream in &streams {
        stream.close();
    }
    eprintln!("open streams left on bob: {}", bob.multiplexer().streams().len());
    Ok(())
}
