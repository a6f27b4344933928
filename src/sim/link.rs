//! The co-simulation link.
//!
//! A [`ChannelLink`] connects the machine to an outside simulator (e.g., a network simulator)
//! over a pair of channels. The machine never blocks on the link: at the start of each step,
//! every batch of bytes which has arrived is delivered to the link's target device, and at
//! the end of each step, the bytes transmitted by devices are sent back as one batch.
//!
//! Bytes delivered before a checkpoint restore are not re-delivered.
//! The outside simulator is expected to resend anything after the synchronization point it rolled back to.

use crossbeam_channel as cbc;
use log::info;

use super::device::DeviceId;

/// The machine's end of a co-simulation link.
#[derive(Debug)]
pub struct ChannelLink {
    target: DeviceId,
    inbound: cbc::Receiver<Vec<u8>>,
    outbound: cbc::Sender<Vec<u8>>,
    connected: bool,
}

/// The outside simulator's end of a co-simulation link.
#[derive(Debug, Clone)]
pub struct LinkPeer {
    tx: cbc::Sender<Vec<u8>>,
    rx: cbc::Receiver<Vec<u8>>,
}

impl ChannelLink {
    /// Creates a link from existing channels.
    ///
    /// Bytes received from `inbound` are delivered to the device `target`.
    pub fn new(target: DeviceId, inbound: cbc::Receiver<Vec<u8>>, outbound: cbc::Sender<Vec<u8>>) -> Self {
        Self { target, inbound, outbound, connected: true }
    }

    /// Creates a link delivering to `target`, along with the peer's end of the link.
    pub fn pair(target: DeviceId) -> (Self, LinkPeer) {
        let (in_tx, in_rx) = cbc::unbounded();
        let (out_tx, out_rx) = cbc::unbounded();
        (Self::new(target, in_rx, out_tx), LinkPeer { tx: in_tx, rx: out_rx })
    }

    /// The device receiving inbound bytes.
    pub fn target(&self) -> DeviceId {
        self.target
    }
    /// Whether the peer is still connected.
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Takes every byte which has arrived, without blocking.
    pub(crate) fn poll(&mut self) -> Vec<u8> {
        let mut bytes = vec![];
        if !self.connected { return bytes };

        loop {
            match self.inbound.try_recv() {
                Ok(batch) => bytes.extend(batch),
                Err(cbc::TryRecvError::Empty) => break,
                Err(cbc::TryRecvError::Disconnected) => {
                    info!("co-simulation peer disconnected");
                    self.connected = false;
                    break;
                }
            }
        }
        bytes
    }

    /// Sends a batch of bytes to the peer.
    pub(crate) fn send(&mut self, bytes: Vec<u8>) {
        if !self.connected || bytes.is_empty() { return };

        if self.outbound.send(bytes).is_err() {
            info!("co-simulation peer disconnected");
            self.connected = false;
        }
    }
}

impl LinkPeer {
    /// Queues bytes for delivery to the machine at its next step.
    ///
    /// This returns false if the machine's end of the link is gone.
    pub fn deliver(&self, bytes: &[u8]) -> bool {
        self.tx.send(bytes.to_vec()).is_ok()
    }

    /// Takes every byte the machine has sent so far, without blocking.
    pub fn take(&self) -> Vec<u8> {
        self.rx.try_iter().flatten().collect()
    }

    /// Waits for the next batch of bytes from the machine.
    pub fn recv_timeout(&self, timeout: std::time::Duration) -> Option<Vec<u8>> {
        self.rx.recv_timeout(timeout).ok()
    }
}
