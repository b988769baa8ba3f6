//! Resource registry — the single source of truth for ownership.
//!
//! Every transport, producer and consumer id maps to exactly one owning
//! session; the per-session sets and the flat indexes are mutated in the same
//! logical step so no dangling cross-references can be observed. The bridge's
//! run/stop decisions are derived from these counts and nothing else.
//!
//! All operations are synchronous; the orchestrator owns one instance behind
//! a mutex and never exposes it as global state.

use mezzo_common::{MezzoError, MezzoResult};
use mezzo_engine::{MediaKind, TransportDirection};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// Lifecycle of a transport as tracked by the registry. A closed transport
/// is simply removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Created,
    Connected,
}

#[derive(Debug, Clone)]
pub struct TransportRecord {
    pub id: Uuid,
    pub session_id: Uuid,
    pub direction: TransportDirection,
    pub state: TransportState,
}

#[derive(Debug, Clone)]
pub struct ProducerRecord {
    pub id: Uuid,
    pub session_id: Uuid,
    pub transport_id: Uuid,
    pub kind: MediaKind,
}

#[derive(Debug, Clone)]
pub struct ConsumerRecord {
    pub id: Uuid,
    pub session_id: Uuid,
    pub transport_id: Uuid,
    pub producer_id: Uuid,
}

#[derive(Debug, Default)]
struct SessionRecord {
    transports: HashSet<Uuid>,
    producers: HashSet<Uuid>,
    consumers: HashSet<Uuid>,
}

/// Everything a removed session owned, plus consumers of other sessions that
/// were sourced from its producers. The caller releases each id in the
/// engine before the removal counts as complete.
#[derive(Debug, Default)]
pub struct Teardown {
    pub transports: Vec<Uuid>,
    pub producers: Vec<ProducerRecord>,
    pub consumers: Vec<Uuid>,
    /// Consumers owned by *other* sessions whose source producer just went
    /// away; their owners must be told they closed.
    pub orphaned_consumers: Vec<ConsumerRecord>,
}

#[derive(Debug, Default)]
pub struct Registry {
    sessions: HashMap<Uuid, SessionRecord>,
    transports: HashMap<Uuid, TransportRecord>,
    producers: HashMap<Uuid, ProducerRecord>,
    consumers: HashMap<Uuid, ConsumerRecord>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    // === Sessions ===

    pub fn register_session(&mut self, id: Uuid) {
        self.sessions.entry(id).or_default();
    }

    pub fn session_exists(&self, id: Uuid) -> bool {
        self.sessions.contains_key(&id)
    }

    /// Remove a session and everything it owns, in one step. Returns `None`
    /// if the session is already gone (double removal is a no-op).
    pub fn remove_session(&mut self, id: Uuid) -> Option<Teardown> {
        let record = self.sessions.remove(&id)?;
        let mut teardown = Teardown::default();

        for consumer_id in record.consumers {
            if self.consumers.remove(&consumer_id).is_some() {
                teardown.consumers.push(consumer_id);
            }
        }
        for producer_id in record.producers {
            if let Some(producer) = self.producers.remove(&producer_id) {
                teardown
                    .orphaned_consumers
                    .extend(self.drop_consumers_of(producer_id));
                teardown.producers.push(producer);
            }
        }
        for transport_id in record.transports {
            if self.transports.remove(&transport_id).is_some() {
                teardown.transports.push(transport_id);
            }
        }
        Some(teardown)
    }

    // === Transports ===

    pub fn add_transport(
        &mut self,
        session_id: Uuid,
        id: Uuid,
        direction: TransportDirection,
    ) -> MezzoResult<()> {
        let session = self
            .sessions
            .get_mut(&session_id)
            .ok_or_else(|| MezzoError::not_found("session"))?;
        session.transports.insert(id);
        self.transports.insert(
            id,
            TransportRecord {
                id,
                session_id,
                direction,
                state: TransportState::Created,
            },
        );
        Ok(())
    }

    pub fn transport(&self, id: Uuid) -> Option<&TransportRecord> {
        self.transports.get(&id)
    }

    /// The transport, if it exists and is owned by the given session.
    pub fn owned_transport(&self, session_id: Uuid, id: Uuid) -> Option<&TransportRecord> {
        self.transports
            .get(&id)
            .filter(|t| t.session_id == session_id)
    }

    pub fn mark_transport_connected(&mut self, id: Uuid) -> MezzoResult<()> {
        let transport = self
            .transports
            .get_mut(&id)
            .ok_or_else(|| MezzoError::not_found("transport"))?;
        transport.state = TransportState::Connected;
        Ok(())
    }

    pub fn remove_transport(&mut self, id: Uuid) -> Option<TransportRecord> {
        let record = self.transports.remove(&id)?;
        if let Some(session) = self.sessions.get_mut(&record.session_id) {
            session.transports.remove(&id);
        }
        Some(record)
    }

    // === Producers ===

    pub fn add_producer(
        &mut self,
        session_id: Uuid,
        transport_id: Uuid,
        id: Uuid,
        kind: MediaKind,
    ) -> MezzoResult<()> {
        let session = self
            .sessions
            .get_mut(&session_id)
            .ok_or_else(|| MezzoError::not_found("session"))?;
        session.producers.insert(id);
        self.producers.insert(
            id,
            ProducerRecord {
                id,
                session_id,
                transport_id,
                kind,
            },
        );
        Ok(())
    }

    pub fn producer(&self, id: Uuid) -> Option<&ProducerRecord> {
        self.producers.get(&id)
    }

    /// Remove a producer plus every consumer sourced from it, in one step.
    /// Returns the producer and the dropped consumers; `None` if already
    /// absent.
    pub fn remove_producer(&mut self, id: Uuid) -> Option<(ProducerRecord, Vec<ConsumerRecord>)> {
        let record = self.producers.remove(&id)?;
        if let Some(session) = self.sessions.get_mut(&record.session_id) {
            session.producers.remove(&id);
        }
        let dropped = self.drop_consumers_of(id);
        Some((record, dropped))
    }

    /// All producers, as broadcast to a newly connected session.
    pub fn producers_snapshot(&self) -> Vec<(Uuid, MediaKind)> {
        self.producers.values().map(|p| (p.id, p.kind)).collect()
    }

    /// Active video producers — the count that decides whether the bridge
    /// should run.
    pub fn eligible_video_producers(&self) -> Vec<Uuid> {
        self.producers
            .values()
            .filter(|p| p.kind == MediaKind::Video)
            .map(|p| p.id)
            .collect()
    }

    pub fn producer_count(&self) -> usize {
        self.producers.len()
    }

    // === Consumers ===

    pub fn add_consumer(
        &mut self,
        session_id: Uuid,
        transport_id: Uuid,
        id: Uuid,
        producer_id: Uuid,
    ) -> MezzoResult<()> {
        let session = self
            .sessions
            .get_mut(&session_id)
            .ok_or_else(|| MezzoError::not_found("session"))?;
        session.consumers.insert(id);
        self.consumers.insert(
            id,
            ConsumerRecord {
                id,
                session_id,
                transport_id,
                producer_id,
            },
        );
        Ok(())
    }

    /// The consumer, if it exists and is owned by the given session.
    pub fn owned_consumer(&self, session_id: Uuid, id: Uuid) -> Option<&ConsumerRecord> {
        self.consumers
            .get(&id)
            .filter(|c| c.session_id == session_id)
    }

    pub fn remove_consumer(&mut self, id: Uuid) -> Option<ConsumerRecord> {
        let record = self.consumers.remove(&id)?;
        if let Some(session) = self.sessions.get_mut(&record.session_id) {
            session.consumers.remove(&id);
        }
        Some(record)
    }

    /// Drop every consumer sourced from a producer, keeping session sets in
    /// sync within the same step.
    fn drop_consumers_of(&mut self, producer_id: Uuid) -> Vec<ConsumerRecord> {
        let ids: Vec<Uuid> = self
            .consumers
            .values()
            .filter(|c| c.producer_id == producer_id)
            .map(|c| c.id)
            .collect();
        ids.into_iter()
            .filter_map(|id| self.remove_consumer(id))
            .collect()
    }

    /// Counts for the ops surface: (sessions, producers, video producers).
    pub fn counts(&self) -> (usize, usize, usize) {
        (
            self.sessions.len(),
            self.producers.len(),
            self.eligible_video_producers().len(),
        )
    }

    #[cfg(test)]
    fn is_empty_for(&self, session_id: Uuid) -> bool {
        !self.transports.values().any(|t| t.session_id == session_id)
            && !self.producers.values().any(|p| p.session_id == session_id)
            && !self.consumers.values().any(|c| c.session_id == session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: usize) -> Vec<Uuid> {
        (0..n).map(|_| Uuid::new_v4()).collect()
    }

    #[test]
    fn add_requires_registered_session() {
        let mut reg = Registry::new();
        let [session, transport] = [Uuid::new_v4(), Uuid::new_v4()];
        let err = reg
            .add_transport(session, transport, TransportDirection::Send)
            .unwrap_err();
        assert!(matches!(err, MezzoError::NotFound { .. }));

        reg.register_session(session);
        reg.add_transport(session, transport, TransportDirection::Send)
            .unwrap();
        assert!(reg.owned_transport(session, transport).is_some());
    }

    #[test]
    fn remove_session_cascades_everything() {
        let mut reg = Registry::new();
        let v = ids(5);
        let (session, transport, producer, recv, consumer) = (v[0], v[1], v[2], v[3], v[4]);

        reg.register_session(session);
        reg.add_transport(session, transport, TransportDirection::Send)
            .unwrap();
        reg.add_transport(session, recv, TransportDirection::Recv)
            .unwrap();
        reg.add_producer(session, transport, producer, MediaKind::Video)
            .unwrap();
        reg.add_consumer(session, recv, consumer, producer).unwrap();

        let teardown = reg.remove_session(session).unwrap();
        assert_eq!(teardown.transports.len(), 2);
        assert_eq!(teardown.producers.len(), 1);
        assert_eq!(teardown.consumers.len(), 1);
        assert!(reg.is_empty_for(session));
        assert!(reg.eligible_video_producers().is_empty());

        // Second removal is a no-op, not an error.
        assert!(reg.remove_session(session).is_none());
    }

    #[test]
    fn remove_session_reports_other_sessions_orphaned_consumers() {
        let mut reg = Registry::new();
        let v = ids(6);
        let (a, a_send, a_producer) = (v[0], v[1], v[2]);
        let (b, b_recv, b_consumer) = (v[3], v[4], v[5]);

        reg.register_session(a);
        reg.register_session(b);
        reg.add_transport(a, a_send, TransportDirection::Send).unwrap();
        reg.add_producer(a, a_send, a_producer, MediaKind::Video)
            .unwrap();
        reg.add_transport(b, b_recv, TransportDirection::Recv).unwrap();
        reg.add_consumer(b, b_recv, b_consumer, a_producer).unwrap();

        let teardown = reg.remove_session(a).unwrap();
        assert_eq!(teardown.orphaned_consumers.len(), 1);
        assert_eq!(teardown.orphaned_consumers[0].id, b_consumer);
        assert_eq!(teardown.orphaned_consumers[0].session_id, b);

        // B's consumer is gone from B's set too — no dangling references.
        assert!(reg.owned_consumer(b, b_consumer).is_none());
        assert!(reg.session_exists(b));
    }

    #[test]
    fn remove_producer_drops_its_consumers() {
        let mut reg = Registry::new();
        let v = ids(5);
        let (session, send, producer, recv, consumer) = (v[0], v[1], v[2], v[3], v[4]);

        reg.register_session(session);
        reg.add_transport(session, send, TransportDirection::Send).unwrap();
        reg.add_transport(session, recv, TransportDirection::Recv).unwrap();
        reg.add_producer(session, send, producer, MediaKind::Video)
            .unwrap();
        reg.add_consumer(session, recv, consumer, producer).unwrap();

        let (record, dropped) = reg.remove_producer(producer).unwrap();
        assert_eq!(record.kind, MediaKind::Video);
        assert_eq!(dropped.len(), 1);
        assert!(reg.owned_consumer(session, consumer).is_none());

        // Idempotent.
        assert!(reg.remove_producer(producer).is_none());
        assert!(reg.remove_consumer(consumer).is_none());
        assert!(reg.remove_transport(Uuid::new_v4()).is_none());
    }

    #[test]
    fn eligibility_counts_video_only() {
        let mut reg = Registry::new();
        let v = ids(4);
        let (session, send, audio, video) = (v[0], v[1], v[2], v[3]);

        reg.register_session(session);
        reg.add_transport(session, send, TransportDirection::Send).unwrap();
        reg.add_producer(session, send, audio, MediaKind::Audio).unwrap();
        assert!(reg.eligible_video_producers().is_empty());

        reg.add_producer(session, send, video, MediaKind::Video).unwrap();
        assert_eq!(reg.eligible_video_producers(), vec![video]);

        let (sessions, producers, videos) = reg.counts();
        assert_eq!((sessions, producers, videos), (1, 2, 1));
    }

    #[test]
    fn transport_state_transitions() {
        let mut reg = Registry::new();
        let v = ids(2);
        let (session, transport) = (v[0], v[1]);
        reg.register_session(session);
        reg.add_transport(session, transport, TransportDirection::Send)
            .unwrap();
        assert_eq!(
            reg.transport(transport).unwrap().state,
            TransportState::Created
        );
        reg.mark_transport_connected(transport).unwrap();
        assert_eq!(
            reg.transport(transport).unwrap().state,
            TransportState::Connected
        );
        assert!(reg.mark_transport_connected(Uuid::new_v4()).is_err());
    }
}
