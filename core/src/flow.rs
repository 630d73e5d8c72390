//! Flow identity.
//!
//! A flow is a 5-tuple (source/destination address and port, L4 protocol). `FlowKey` is
//! directional (distinguishes the originator from the responder); `ConnId` normalizes a
//! `FlowKey` so that packets from either direction of the same flow hash to the same
//! table entry.

use std::cmp;
use std::fmt;
use std::net::SocketAddr;

use serde::Serialize;

/// Layer-4 protocol of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum L4Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for L4Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            L4Protocol::Tcp => write!(f, "tcp"),
            L4Protocol::Udp => write!(f, "udp"),
        }
    }
}

/// A directional flow identifier: the endpoint that sent the first observed packet is
/// `orig`, the other is `resp`.
#[derive(Debug, Copy, Clone, Hash, Eq, PartialEq, Serialize)]
pub struct FlowKey {
    pub orig: SocketAddr,
    pub resp: SocketAddr,
    pub l4: L4Protocol,
}

impl FlowKey {
    pub fn new(orig: SocketAddr, resp: SocketAddr, l4: L4Protocol) -> Self {
        FlowKey { orig, resp, l4 }
    }

    /// Normalizes this key into the direction-independent `ConnId` used by the
    /// connection table.
    pub fn conn_id(&self) -> ConnId {
        ConnId(cmp::max(self.orig, self.resp), cmp::min(self.orig, self.resp), self.l4)
    }

    /// `true` if `addr` is the originator of this flow.
    pub fn is_orig(&self, addr: SocketAddr) -> bool {
        self.orig == addr
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {} ({})", self.orig, self.resp, self.l4)
    }
}

/// A direction-independent connection identifier used as the connection table's key.
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct ConnId(SocketAddr, SocketAddr, L4Protocol);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <> {} ({})", self.0, self.1, self.2)
    }
}
