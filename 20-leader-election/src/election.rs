//! Leader election over the registry.
//!
//! The leader is always the oldest surviving registration at the moment an
//! election happens. Elections only happen when there is no leader: on the
//! first registration, when the leader departs, or as a safety net after a
//! sweep. A registration while a leader exists never changes it.
//!
//! Every transition produces an [`Outbox`] instead of sending directly. On
//! appointment the new leader gets `ownership-granted`, everyone else
//! `ownership-denied`, and then all clients get `ownership-status`, which
//! is the message clients should treat as authoritative.

use tracing::info;

use crate::{
    message::{ClientId, ServerMessage},
    registry::Registry,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub to: ClientId,
    pub message: ServerMessage,
}

impl Envelope {
    pub fn new(to: ClientId, message: ServerMessage) -> Self {
        Self { to, message }
    }
}

/// Messages to deliver, in order.
pub type Outbox = Vec<Envelope>;

#[derive(Debug, Default)]
pub struct Election {
    leader: Option<ClientId>,
}

impl Election {
    pub fn leader(&self) -> Option<&ClientId> {
        self.leader.as_ref()
    }

    pub fn is_leader(&self, id: &ClientId) -> bool {
        self.leader.as_ref() == Some(id)
    }

    pub fn status_for(&self, id: &ClientId) -> ServerMessage {
        ServerMessage::status(id, self.leader.as_ref())
    }

    /// `id` has just been registered.
    pub fn on_join(&mut self, registry: &Registry, id: &ClientId) -> Outbox {
        let Some(leader) = self.leader.clone() else {
            return self.appoint(registry, id.clone());
        };

        let mut outbox = vec![Envelope::new(id.clone(), ServerMessage::denied(&leader))];
        outbox.extend(self.broadcast_status(registry));
        outbox
    }

    /// `id` has just been removed from the registry.
    pub fn on_departure(&mut self, registry: &Registry, id: &ClientId) -> Outbox {
        if !self.is_leader(id) {
            return self.broadcast_status(registry);
        }

        self.leader = None;
        info!(client = %id, "leader departed");
        match registry.first().cloned() {
            Some(next) => self.appoint(registry, next),
            None => self.broadcast_status(registry),
        }
    }

    /// Elects the oldest registration if there are clients but no leader.
    pub fn ensure_leader(&mut self, registry: &Registry) -> Outbox {
        if self.leader.is_some() {
            return Outbox::new();
        }
        match registry.first().cloned() {
            Some(next) => self.appoint(registry, next),
            None => Outbox::new(),
        }
    }

    pub fn appoint(&mut self, registry: &Registry, leader: ClientId) -> Outbox {
        debug_assert!(
            registry.contains(&leader),
            "appointing unregistered client {leader}"
        );
        info!(leader = %leader, clients = registry.len(), "leader elected");

        let mut outbox = Outbox::with_capacity(registry.len() * 2);
        outbox.push(Envelope::new(leader.clone(), ServerMessage::granted(&leader)));
        outbox.extend(
            registry
                .ids()
                .filter(|id| **id != leader)
                .map(|id| Envelope::new(id.clone(), ServerMessage::denied(&leader))),
        );
        self.leader = Some(leader);
        outbox.extend(self.broadcast_status(registry));
        outbox
    }

    pub fn broadcast_status(&self, registry: &Registry) -> Outbox {
        registry
            .ids()
            .map(|id| Envelope::new(id.clone(), self.status_for(id)))
            .collect()
    }

    /// The leader, if any, is registered; clients are never left leaderless.
    pub fn is_consistent(&self, registry: &Registry) -> bool {
        match &self.leader {
            Some(leader) => registry.contains(leader),
            None => registry.is_empty(),
        }
    }
}
