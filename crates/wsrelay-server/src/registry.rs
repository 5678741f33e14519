//! Live session registry and broadcast fan-out.

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tracing::{debug, warn};
use wsrelay_proto::frame::{self, Opcode};
use wsrelay_proto::SessionId;

use crate::errors::SendError;
use crate::websocket::handle::SessionHandle;

/// Delivery summary for one broadcast.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Sessions the frame was queued for.
    pub delivered: usize,
    /// Sessions that were closed or whose send queue was full. They stay
    /// registered; their own read loop, writer or keepalive tears them down.
    pub failed: Vec<SessionId>,
}

impl BroadcastReport {
    pub fn recipients(&self) -> usize {
        self.delivered + self.failed.len()
    }
}

/// Thread-safe set of Open sessions keyed by id.
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<SessionHandle>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    /// Register a session. Re-joining the same id replaces the entry.
    pub fn join(&self, handle: Arc<SessionHandle>) {
        let id = handle.id().clone();
        let _ = self.sessions.insert(id.clone(), handle);
        metrics::gauge!("ws_connections_active").set(self.sessions.len() as f64);
        debug!(session_id = %id, members = self.sessions.len(), "session joined");
    }

    /// Remove a session. Returns `false` if it was not registered.
    pub fn leave(&self, id: &SessionId) -> bool {
        let removed = self.sessions.remove(id).is_some();
        if removed {
            metrics::gauge!("ws_connections_active").set(self.sessions.len() as f64);
            debug!(session_id = %id, members = self.sessions.len(), "session left");
        }
        removed
    }

    pub fn get(&self, id: &SessionId) -> Option<Arc<SessionHandle>> {
        self.sessions.get(id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.sessions.contains_key(id)
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Registered ids, oldest first.
    pub fn ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.sessions.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Point-in-time copy of the members. Shard locks are released before
    /// the caller does anything with it.
    pub fn snapshot(&self) -> Vec<Arc<SessionHandle>> {
        self.sessions.iter().map(|e| Arc::clone(e.value())).collect()
    }

    /// Queue one pre-encoded frame for every member.
    ///
    /// Each member has its own send queue and writer, so a slow or dead peer
    /// costs the broadcaster nothing beyond its failed entry in the report.
    pub fn broadcast_frame(&self, frame: &Bytes) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        for member in self.snapshot() {
            match member.send_frame(frame) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!(session_id = %member.id(), error = %e, "broadcast send failed");
                    metrics::counter!("ws_broadcast_failures_total").increment(1);
                    report.failed.push(member.id().clone());
                }
            }
        }
        debug!(
            delivered = report.delivered,
            failed = report.failed.len(),
            bytes = frame.len(),
            "broadcast complete"
        );
        report
    }

    /// Encode `text` once as a Text frame and broadcast it.
    pub fn broadcast_text(&self, text: &str) -> BroadcastReport {
        self.broadcast_frame(&frame::encode(Opcode::Text, text.as_bytes(), true))
    }

    /// Encode `data` once as a Binary frame and broadcast it.
    pub fn broadcast_binary(&self, data: &[u8]) -> BroadcastReport {
        self.broadcast_frame(&frame::encode(Opcode::Binary, data, true))
    }

    /// Queue a pre-encoded frame for one member.
    pub fn send_to(&self, id: &SessionId, frame: &Bytes) -> Result<(), SendError> {
        let handle = self.get(id).ok_or(SendError::NotFound)?;
        handle.send_frame(frame)
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{failing_handle, open_handle, piped_handle, read_frame};
    use crate::websocket::handle::SendLimits;
    use std::time::Duration;

    #[tokio::test]
    async fn join_and_leave() {
        let registry = SessionRegistry::new();
        let (a, _ca) = open_handle();
        let (b, _cb) = open_handle();

        registry.join(Arc::clone(&a));
        registry.join(Arc::clone(&b));
        assert_eq!(registry.count(), 2);
        assert!(registry.contains(a.id()));

        assert!(registry.leave(a.id()));
        assert!(!registry.leave(a.id()));
        assert_eq!(registry.count(), 1);
        assert!(registry.get(a.id()).is_none());
        assert!(registry.get(b.id()).is_some());
    }

    #[tokio::test]
    async fn ids_sorted_by_creation() {
        let registry = SessionRegistry::new();
        let handles: Vec<_> = (0..5).map(|_| open_handle()).collect();
        for (h, _) in handles.iter().rev() {
            registry.join(Arc::clone(h));
        }
        let expected: Vec<SessionId> = handles.iter().map(|(h, _)| h.id().clone()).collect();
        assert_eq!(registry.ids(), expected);
    }

    #[tokio::test]
    async fn broadcast_reaches_every_member() {
        let registry = SessionRegistry::new();
        let (a, mut ca) = open_handle();
        let (b, mut cb) = open_handle();
        registry.join(a);
        registry.join(b);

        let report = registry.broadcast_text("hi all");
        assert_eq!(report.delivered, 2);
        assert!(report.failed.is_empty());

        for client in [&mut ca, &mut cb] {
            let frame = read_frame(client).await;
            assert_eq!(frame.opcode, Opcode::Text);
            assert_eq!(frame.payload, b"hi all");
        }
    }

    #[tokio::test]
    async fn broadcast_isolates_failing_member() {
        let registry = SessionRegistry::new();
        let (a, mut ca) = open_handle();
        let broken = failing_handle();
        broken.send_text("first write fails").unwrap();
        broken.cancel_token().cancelled().await;
        let (c, mut cc) = open_handle();
        registry.join(a);
        registry.join(Arc::clone(&broken));
        registry.join(c);

        let report = registry.broadcast_binary(&[1, 2, 3]);
        assert_eq!(report.delivered, 2);
        assert_eq!(report.failed, vec![broken.id().clone()]);
        assert_eq!(report.recipients(), 3);

        for client in [&mut ca, &mut cc] {
            let frame = read_frame(client).await;
            assert_eq!(frame.opcode, Opcode::Binary);
            assert_eq!(frame.payload, vec![1, 2, 3]);
        }
        // Failed members are not evicted by broadcast.
        assert_eq!(registry.count(), 3);
    }

    #[tokio::test]
    async fn broadcast_to_empty_registry() {
        let registry = SessionRegistry::new();
        let report = registry.broadcast_text("nobody");
        assert_eq!(report, BroadcastReport::default());
    }

    #[tokio::test]
    async fn broadcast_skips_closing_member() {
        let registry = SessionRegistry::new();
        let (a, _ca) = open_handle();
        assert!(a.begin_closing());
        registry.join(Arc::clone(&a));

        let report = registry.broadcast_text("late");
        assert_eq!(report.delivered, 0);
        assert_eq!(report.failed, vec![a.id().clone()]);
    }

    #[tokio::test]
    async fn send_to_single_member() {
        let registry = SessionRegistry::new();
        let (a, mut ca) = open_handle();
        let (b, _cb) = open_handle();
        registry.join(Arc::clone(&a));
        registry.join(b);

        let frame = frame::encode(Opcode::Text, b"direct", true);
        registry.send_to(a.id(), &frame).unwrap();
        assert_eq!(read_frame(&mut ca).await.payload, b"direct");

        let missing = SessionId::from_raw("conn_missing");
        assert!(matches!(
            registry.send_to(&missing, &frame),
            Err(SendError::NotFound)
        ));
    }

    #[tokio::test]
    async fn concurrent_broadcasts_do_not_interleave() {
        let registry = Arc::new(SessionRegistry::new());
        let (a, mut ca) = open_handle();
        registry.join(a);

        let payload_a = vec![b'a'; 3000];
        let payload_b = vec![b'b'; 3000];
        let r1 = {
            let registry = Arc::clone(&registry);
            let p = payload_a.clone();
            tokio::spawn(async move { registry.broadcast_binary(&p) })
        };
        let r2 = {
            let registry = Arc::clone(&registry);
            let p = payload_b.clone();
            tokio::spawn(async move { registry.broadcast_binary(&p) })
        };
        assert_eq!(r1.await.unwrap().delivered, 1);
        assert_eq!(r2.await.unwrap().delivered, 1);

        let first = read_frame(&mut ca).await.payload;
        let second = read_frame(&mut ca).await.payload;
        let mut got = vec![first, second];
        got.sort();
        assert_eq!(got, vec![payload_a, payload_b]);
    }

    #[tokio::test]
    async fn stalled_member_does_not_hold_up_broadcast() {
        let registry = SessionRegistry::new();
        let (healthy, mut reader) = open_handle();
        // Never read: the writer parks inside the first frame.
        let (stalled, _unread) = piped_handle(
            64,
            SendLimits {
                queue_size: 2,
                write_timeout: Duration::from_secs(60),
            },
        );
        registry.join(Arc::clone(&healthy));
        registry.join(Arc::clone(&stalled));

        let payload = vec![5u8; 4096];
        let mut failed = Vec::new();
        for round in 0..5 {
            let report = registry.broadcast_binary(&payload);
            assert_eq!(report.recipients(), 2);
            failed.extend(report.failed);
            assert_eq!(read_frame(&mut reader).await.payload, payload, "round {round}");
        }

        assert!(!failed.is_empty());
        assert!(failed.iter().all(|id| id == stalled.id()));
        assert_eq!(registry.count(), 2);
    }
}
