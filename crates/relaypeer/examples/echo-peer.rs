//! Two exclusive sessions on an in-process relay; one echoes what the
//! other sends back through the acknowledgement.
//!
//! Run with:
//!   cargo run --example echo-peer

use std::sync::mpsc;
use std::time::Duration;

use relaypeer::peer::{ExclusiveSession, SessionConfig};
use relaypeer::relay::MemoryRelay;
use relaypeer::transport::Arg;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let relay = MemoryRelay::new();
    let client = ExclusiveSession::new(relay.connect("client")?, "client", SessionConfig::default())?;
    let echo = ExclusiveSession::new(relay.connect("echo")?, "echo", SessionConfig::default())?;

    echo.on("say", |event| {
        let args = event.args.clone();
        event.acknowledge(args);
    });

    client.register("echo")?;
    eprintln!("bound to {:?}", client.target());

    for word in ["hello", "relay", "peer"] {
        let (tx, rx) = mpsc::channel();
        client.emit_with_ack("say", vec![Arg::text(word)], move |reply| {
            let _ = tx.send(reply);
        })?;
        let reply = rx.recv_timeout(Duration::from_secs(2))?;
        eprintln!("echoed: {:?}", reply.first().and_then(Arg::as_str));
    }

    client.unregister()?;
    Ok(())
}
