use std::{collections::BTreeMap, sync::Arc};

use tokio::sync::RwLock;

use crate::participant::{Participant, ParticipantId};

/// Set of participants whose read loop is still running.
///
/// Keyed by id in a `BTreeMap` so snapshots come out in connection order.
/// The lock is never held across network I/O; broadcast works on a
/// [`Registry::snapshot`] and applies removals afterwards.
#[derive(Debug, Default)]
pub struct Registry {
    participants: RwLock<BTreeMap<ParticipantId, Arc<Participant>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` when the id was already present; the existing entry is kept.
    pub async fn register(&self, participant: Arc<Participant>) -> bool {
        let mut participants = self.participants.write().await;
        if participants.contains_key(&participant.id()) {
            return false;
        }
        participants.insert(participant.id(), participant);
        true
    }

    /// Removing an absent id is a no-op that returns `false`.
    pub async fn deregister(&self, id: ParticipantId) -> bool {
        self.participants.write().await.remove(&id).is_some()
    }

    pub async fn snapshot(&self) -> Vec<Arc<Participant>> {
        self.participants.read().await.values().cloned().collect()
    }

    pub async fn contains(&self, id: ParticipantId) -> bool {
        self.participants.read().await.contains_key(&id)
    }

    pub async fn len(&self) -> usize {
        self.participants.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.participants.read().await.is_empty()
    }
}
