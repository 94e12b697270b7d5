use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

/// A listening socket observed by the platform scanner.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Port {
    /// "tcp" or "udp".
    pub proto: String,
    pub port: u16,
    /// Name of the owning process, when known.
    pub process: String,
}

/// Receiving half of the port-list feed. The platform scanner holds the
/// sender and publishes a full snapshot on every change; the agent consumes
/// snapshots on a reader thread it spawns once at start.
pub struct Poller {
    rx: Receiver<Vec<Port>>,
}

impl Poller {
    pub fn new() -> (Poller, Sender<Vec<Port>>) {
        let (tx, rx) = channel();
        (Poller { rx }, tx)
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<Vec<Port>, RecvTimeoutError> {
        self.rx.recv_timeout(timeout)
    }
}
