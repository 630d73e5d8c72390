//! Per-direction byte accumulation shared by every protocol parser.
//!
//! A parser receives one packet event at a time but a protocol message may span several
//! packets (or several messages may land in one packet, as with pipelined HTTP). Each
//! parser keeps one [`DirectionalBuffers`], appends incoming bytes to the buffer for that
//! packet's direction, then repeatedly tries to pull a complete message off the front of
//! the buffer, leaving any partial remainder for the next packet event.

use crate::ingress::PacketDir;

#[derive(Default)]
pub struct DirectionalBuffers {
    client_to_server: Vec<u8>,
    server_to_client: Vec<u8>,
}

impl DirectionalBuffers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn buffer(&self, dir: PacketDir) -> &[u8] {
        match dir {
            PacketDir::ClientToServer => &self.client_to_server,
            PacketDir::ServerToClient => &self.server_to_client,
        }
    }

    fn buffer_mut(&mut self, dir: PacketDir) -> &mut Vec<u8> {
        match dir {
            PacketDir::ClientToServer => &mut self.client_to_server,
            PacketDir::ServerToClient => &mut self.server_to_client,
        }
    }

    pub fn append(&mut self, dir: PacketDir, bytes: &[u8]) {
        self.buffer_mut(dir).extend_from_slice(bytes);
    }

    /// Removes the first `n` bytes of `dir`'s buffer, e.g. after a complete message was
    /// parsed from the front.
    pub fn consume(&mut self, dir: PacketDir, n: usize) {
        self.buffer_mut(dir).drain(..n);
    }

    /// Drops everything buffered for `dir`, forcing the next packet to resync from a
    /// clean slate (used on a hard framing error or when over the size budget).
    pub fn clear(&mut self, dir: PacketDir) {
        self.buffer_mut(dir).clear();
    }

    pub fn cache_size(&self) -> usize {
        self.client_to_server.len() + self.server_to_client.len()
    }

    /// If the combined buffers exceed `size_limit_bytes`, drops both directions' buffered
    /// bytes and reports `true`. Buffered-but-unparsed bytes can't be partially discarded
    /// without corrupting the next message, so going over budget means a full resync.
    pub fn shed_to_limit(&mut self, size_limit_bytes: usize) -> bool {
        if self.cache_size() <= size_limit_bytes {
            return false;
        }
        self.client_to_server.clear();
        self.server_to_client.clear();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_and_consumes_independently_per_direction() {
        let mut buffers = DirectionalBuffers::new();
        buffers.append(PacketDir::ClientToServer, b"abc");
        buffers.append(PacketDir::ServerToClient, b"xy");
        assert_eq!(buffers.buffer(PacketDir::ClientToServer), b"abc");
        buffers.consume(PacketDir::ClientToServer, 1);
        assert_eq!(buffers.buffer(PacketDir::ClientToServer), b"bc");
        assert_eq!(buffers.buffer(PacketDir::ServerToClient), b"xy");
    }

    #[test]
    fn shed_to_limit_clears_both_directions_once_over_budget() {
        let mut buffers = DirectionalBuffers::new();
        buffers.append(PacketDir::ClientToServer, b"0123456789");
        buffers.append(PacketDir::ServerToClient, b"01234");
        assert!(!buffers.shed_to_limit(100));
        assert!(buffers.shed_to_limit(8));
        assert_eq!(buffers.cache_size(), 0);
    }
}
