//! Bounded detail channel with drop-oldest backpressure.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

use super::ProtocolDetail;

pub struct DetailStream {
    tx: Sender<ProtocolDetail>,
    rx: Receiver<ProtocolDetail>,
    dropped: AtomicU64,
}

impl DetailStream {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity);
        DetailStream {
            tx,
            rx,
            dropped: AtomicU64::new(0),
        }
    }

    /// Pushes `detail`, discarding the oldest queued record (not `detail` itself) if the
    /// channel is full, and counting the drop.
    pub fn push(&self, detail: ProtocolDetail) {
        let mut pending = detail;
        loop {
            match self.tx.try_send(pending) {
                Ok(()) => return,
                Err(TrySendError::Full(rejected)) => {
                    pending = rejected;
                    if self.rx.try_recv().is_ok() {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                }
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }

    pub fn receiver(&self) -> Receiver<ProtocolDetail> {
        self.rx.clone()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn detail(op: &str) -> ProtocolDetail {
        ProtocolDetail {
            flow_key_display: "x".to_string(),
            l4: crate::flow::L4Protocol::Tcp,
            proc_meta: super::super::ProcMetaRecord {
                pid: 0,
                container_id: String::new(),
            },
            protocol: "http",
            operation: op.to_string(),
            start_ns: 0,
            duration_ns: 0,
            status: "ok",
            bytes_in: 0,
            bytes_out: 0,
            attributes: HashMap::new(),
        }
    }

    #[test]
    fn drops_oldest_when_full() {
        let stream = DetailStream::new(2);
        stream.push(detail("a"));
        stream.push(detail("b"));
        stream.push(detail("c"));
        assert_eq!(stream.dropped(), 1);
        let first = stream.receiver().try_recv().unwrap();
        assert_eq!(first.operation, "b");
    }
}
