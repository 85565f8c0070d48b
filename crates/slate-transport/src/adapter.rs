use std::collections::VecDeque;

use slate_core::PeerId;

/// Byte-oriented mesh contract the coordination engine drives.
///
/// Implementations own the connected-peer roster; the engine reads it and
/// never mutates it. Sends are best-effort and unordered: delivery guarantees
/// live in the reliable layer above.
pub trait MeshTransport {
    /// Transport-specific send error.
    type Error: std::fmt::Display;

    /// Attempts best-effort delivery of a byte payload to a peer.
    fn send_to(&mut self, peer: &PeerId, bytes: &[u8]) -> Result<(), Self::Error>;
    /// Returns the next inbound payload and its sending peer.
    fn recv(&mut self) -> Option<(PeerId, Vec<u8>)>;
    /// Snapshot of the currently connected peers.
    fn connected_peers(&self) -> Vec<PeerId>;

    /// Whether `peer` is currently in the roster.
    fn is_connected(&self, peer: &PeerId) -> bool {
        self.connected_peers().iter().any(|p| p == peer)
    }
}

/// In-memory mesh for tests and simulations.
///
/// Outbound frames are captured for inspection or routing; inbound frames are
/// queued explicitly. The roster is settable so peer join/leave can be
/// simulated mid-test.
#[derive(Debug, Default, Clone)]
pub struct InMemoryMesh {
    peers: Vec<PeerId>,
    inbound: VecDeque<(PeerId, Vec<u8>)>,
    outbound: Vec<(PeerId, Vec<u8>)>,
    drop_outbound: bool,
    send_ok: u64,
    send_err: u64,
    recv_ok: u64,
}

impl InMemoryMesh {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a mesh with an initial connected roster.
    pub fn with_peers<I, P>(peers: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PeerId>,
    {
        Self {
            peers: peers.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Replaces the connected roster.
    pub fn set_connected<I, P>(&mut self, peers: I)
    where
        I: IntoIterator<Item = P>,
        P: Into<PeerId>,
    {
        self.peers = peers.into_iter().map(Into::into).collect();
    }

    /// Adds one peer to the roster if not already present.
    pub fn connect(&mut self, peer: impl Into<PeerId>) {
        let peer = peer.into();
        if !self.peers.contains(&peer) {
            self.peers.push(peer);
        }
    }

    /// Removes one peer from the roster.
    pub fn disconnect(&mut self, peer: &PeerId) {
        self.peers.retain(|p| p != peer);
    }

    /// Queues bytes as inbound traffic from `peer`.
    pub fn enqueue_inbound(&mut self, peer: impl Into<PeerId>, bytes: Vec<u8>) {
        self.inbound.push_back((peer.into(), bytes));
    }

    /// Drains and returns all outbound sends captured so far.
    pub fn take_outbound(&mut self) -> Vec<(PeerId, Vec<u8>)> {
        std::mem::take(&mut self.outbound)
    }

    /// If enabled, outbound sends are silently discarded (loss simulation).
    pub fn set_drop_outbound(&mut self, drop_outbound: bool) {
        self.drop_outbound = drop_outbound;
    }

    pub fn sends_attempted(&self) -> u64 {
        self.send_ok + self.send_err
    }

    pub fn sends_failed(&self) -> u64 {
        self.send_err
    }

    pub fn frames_received(&self) -> u64 {
        self.recv_ok
    }
}

impl MeshTransport for InMemoryMesh {
    type Error = &'static str;

    fn send_to(&mut self, peer: &PeerId, bytes: &[u8]) -> Result<(), Self::Error> {
        if !self.peers.contains(peer) {
            self.send_err += 1;
            return Err("peer not connected");
        }
        if self.drop_outbound {
            // Loss is not an error to the sender on a datagram mesh.
            self.send_ok += 1;
            return Ok(());
        }
        self.outbound.push((peer.clone(), bytes.to_vec()));
        self.send_ok += 1;
        Ok(())
    }

    fn recv(&mut self) -> Option<(PeerId, Vec<u8>)> {
        let frame = self.inbound.pop_front();
        if frame.is_some() {
            self.recv_ok += 1;
        }
        frame
    }

    fn connected_peers(&self) -> Vec<PeerId> {
        self.peers.clone()
    }
}

/// Moves all frames captured on `source` into `target`'s inbound queue,
/// tagging them as sent by `source_peer`, regardless of addressee. Returns the
/// number moved. Multi-node simulations that need addressed routing live in
/// the sim crate.
pub fn route_in_memory(
    source: &mut InMemoryMesh,
    target: &mut InMemoryMesh,
    source_peer: &PeerId,
) -> usize {
    let outbound = source.take_outbound();
    let moved = outbound.len();
    for (_, bytes) in outbound {
        target.enqueue_inbound(source_peer.clone(), bytes);
    }
    moved
}

#[cfg(test)]
mod tests {
    use slate_core::PeerId;

    use super::{route_in_memory, InMemoryMesh, MeshTransport};

    #[test]
    fn send_and_recv_work() {
        let mut mesh = InMemoryMesh::with_peers(["cam-b"]);
        mesh.enqueue_inbound("cam-b", vec![1, 2, 3]);

        let (from, bytes) = mesh.recv().expect("should receive one frame");
        assert_eq!(from, PeerId::from("cam-b"));
        assert_eq!(bytes, vec![1, 2, 3]);

        mesh.send_to(&PeerId::from("cam-b"), &[9, 8])
            .expect("send should succeed");
        let outbound = mesh.take_outbound();
        assert_eq!(outbound, vec![(PeerId::from("cam-b"), vec![9, 8])]);
        assert_eq!(mesh.sends_attempted(), 1);
        assert_eq!(mesh.frames_received(), 1);
    }

    #[test]
    fn send_to_unknown_peer_fails() {
        let mut mesh = InMemoryMesh::with_peers(["cam-b"]);
        let err = mesh
            .send_to(&PeerId::from("cam-z"), &[1])
            .expect_err("unknown peer should be rejected");
        assert_eq!(err, "peer not connected");
        assert_eq!(mesh.sends_failed(), 1);
    }

    #[test]
    fn drop_outbound_simulates_loss_without_error() {
        let mut mesh = InMemoryMesh::with_peers(["cam-b"]);
        mesh.set_drop_outbound(true);
        mesh.send_to(&PeerId::from("cam-b"), &[1, 2, 3])
            .expect("lossy send should still report ok");
        assert!(mesh.take_outbound().is_empty());
    }

    #[test]
    fn roster_changes_are_visible() {
        let mut mesh = InMemoryMesh::new();
        assert!(mesh.connected_peers().is_empty());
        mesh.connect("cam-b");
        mesh.connect("cam-c");
        mesh.connect("cam-b");
        assert_eq!(mesh.connected_peers().len(), 2);
        assert!(mesh.is_connected(&PeerId::from("cam-c")));
        mesh.disconnect(&PeerId::from("cam-b"));
        assert!(!mesh.is_connected(&PeerId::from("cam-b")));
    }

    #[test]
    fn route_in_memory_moves_frames_to_receiver_inbox() {
        let a = PeerId::from("cam-a");
        let mut src = InMemoryMesh::with_peers(["cam-b"]);
        let mut dst = InMemoryMesh::with_peers(["cam-a"]);
        src.send_to(&PeerId::from("cam-b"), &[1, 2, 3])
            .expect("send should succeed");
        src.send_to(&PeerId::from("cam-b"), &[4, 5])
            .expect("send should succeed");

        let moved = route_in_memory(&mut src, &mut dst, &a);
        assert_eq!(moved, 2);

        let (from, bytes) = dst.recv().expect("first inbound expected");
        assert_eq!(from, a);
        assert_eq!(bytes, vec![1, 2, 3]);
        let (_, bytes) = dst.recv().expect("second inbound expected");
        assert_eq!(bytes, vec![4, 5]);
    }
}
