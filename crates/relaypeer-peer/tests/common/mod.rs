#![allow(dead_code)]

use std::io::{self, Write};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use relaypeer_peer::{ExclusiveSession, Session, SessionConfig};
use relaypeer_relay::MemoryRelay;

pub fn session(relay: &MemoryRelay, id: &str) -> Session {
    session_with_config(relay, id, SessionConfig::default())
}

pub fn session_with_config(relay: &MemoryRelay, id: &str, config: SessionConfig) -> Session {
    let link = relay.connect(id).expect("client should connect");
    Session::new(link, id, config).expect("session should build")
}

pub fn exclusive(relay: &MemoryRelay, id: &str) -> ExclusiveSession {
    let link = relay.connect(id).expect("client should connect");
    ExclusiveSession::new(link, id, SessionConfig::default()).expect("session should build")
}

/// Poll `condition` for up to three seconds.
pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..300 {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

/// In-memory sink shared with the test body.
#[derive(Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn contents(&self) -> Vec<u8> {
        self.0
            .lock()
            .expect("buffer lock should not be poisoned")
            .clone()
    }

    pub fn len(&self) -> usize {
        self.0
            .lock()
            .expect("buffer lock should not be poisoned")
            .len()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .lock()
            .expect("buffer lock should not be poisoned")
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
