//! The coordinator event loop.
//!
//! All state lives in one [`CoordinatorState`] owned by a single tokio task.
//! Inbound client messages, probe ticks, sweep ticks and status queries are
//! all [`Event`]s on one queue and are applied strictly one at a time, so
//! registry and election never see concurrent mutation and need no locks.
//! Timers only ever enqueue; they never touch state directly.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use anyhow::{Context, Result, anyhow};
use tokio::{
    select,
    sync::{mpsc, oneshot},
    time::{Instant, MissedTickBehavior, interval_at},
};
use tracing::{debug, info, warn};

use crate::{
    channel::{ClientChannel, ClientEndpoint, ConnectionId},
    clock::{Clock, Timestamp},
    config::CoordinatorConfig,
    detector::{self, ProbeTimer},
    election::{Election, Outbox},
    message::{ClientId, ClientMessage, ServerMessage},
    registry::{Generation, Registry},
};

#[derive(Debug)]
pub(crate) enum Event {
    Inbound {
        channel: ClientChannel,
        message: ClientMessage,
    },
    ChannelClosed {
        connection: ConnectionId,
    },
    ProbeDue {
        id: ClientId,
        generation: Generation,
    },
    SweepTick,
    Status {
        respond_to: oneshot::Sender<CoordinatorStatus>,
    },
    Shutdown,
}

/// Point-in-time view of the coordinator, for operators and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorStatus {
    pub leader: Option<ClientId>,
    /// Registered clients, oldest registration first.
    pub clients: Vec<ClientSummary>,
}

impl CoordinatorStatus {
    pub fn is_registered(&self, id: &str) -> bool {
        self.clients.iter().any(|client| client.id.as_str() == id)
    }

    pub fn ids(&self) -> Vec<&str> {
        self.clients.iter().map(|client| client.id.as_str()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSummary {
    pub id: ClientId,
    pub last_seen: Timestamp,
    /// False once the client's channel is known to be closed.
    pub connected: bool,
}

pub struct CoordinatorState {
    config: CoordinatorConfig,
    clock: Clock,
    registry: Registry,
    election: Election,
    events: mpsc::WeakUnboundedSender<Event>,
}

impl CoordinatorState {
    pub(crate) fn new(
        config: CoordinatorConfig,
        clock: Clock,
        events: mpsc::WeakUnboundedSender<Event>,
    ) -> Self {
        Self {
            config,
            clock,
            registry: Registry::default(),
            election: Election::default(),
            events,
        }
    }

    pub fn leader(&self) -> Option<&ClientId> {
        self.election.leader()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Applies one event. Returns `false` when the loop should stop.
    pub(crate) fn handle_event(&mut self, event: Event) -> bool {
        match event {
            Event::Inbound { channel, message } => self.handle_message(channel, message),
            Event::ChannelClosed { connection } => {
                let invalidated = self.registry.invalidate_connection(connection);
                if invalidated > 0 {
                    debug!(connection, invalidated, "link closed");
                }
            }
            Event::ProbeDue { id, generation } => self.probe(&id, generation),
            Event::SweepTick => self.sweep(),
            Event::Status { respond_to } => {
                let _ = respond_to.send(self.status());
            }
            Event::Shutdown => return false,
        }
        self.check_invariants();
        true
    }

    pub fn handle_message(&mut self, channel: ClientChannel, message: ClientMessage) {
        match message {
            ClientMessage::Register { id } => self.register(id, channel),
            ClientMessage::Heartbeat { id, timestamp } => self.heartbeat(&id, timestamp),
            ClientMessage::Release { id } | ClientMessage::Disconnect { id } => self.release(&id),
            ClientMessage::CheckOwnership { id } => self.check_ownership(&id),
        }
    }

    fn register(&mut self, id: ClientId, channel: ClientChannel) {
        // A duplicate is a full departure first, so a re-registering leader
        // hands over to the next oldest client if there is one.
        if self.depart(&id) {
            info!(client = %id, "client re-registered, replaced previous record");
        }

        let now = self.clock.now();
        let period = self.config.probe_interval;
        let events = self.events.clone();
        self.registry
            .register(id.clone(), channel, now, |id, generation| {
                ProbeTimer::start(id.clone(), generation, period, events)
            });
        info!(client = %id, clients = self.registry.len(), "client registered");

        let outbox = self.election.on_join(&self.registry, &id);
        self.deliver(outbox);
    }

    fn heartbeat(&mut self, id: &ClientId, timestamp: Option<Timestamp>) {
        let now = self.clock.now();
        // Clients cannot vouch for themselves into the future.
        let seen = timestamp.map_or(now, |timestamp| timestamp.min(now));
        if !self.registry.touch(id, seen) {
            debug!(client = %id, "heartbeat from unregistered client ignored");
        }
    }

    fn release(&mut self, id: &ClientId) {
        if self.depart(id) {
            info!(client = %id, clients = self.registry.len(), "client released");
        } else {
            debug!(client = %id, "release for unregistered client ignored");
        }
    }

    fn check_ownership(&mut self, id: &ClientId) {
        let status = self.election.status_for(id);
        if !self.registry.send(id, status) {
            debug!(client = %id, "ownership check from unreachable client ignored");
        }
    }

    fn probe(&mut self, id: &ClientId, generation: Generation) {
        if !self.registry.is_current(id, generation) {
            debug!(client = %id, generation, "stale probe ignored");
            return;
        }
        self.registry.send(id, ServerMessage::HeartbeatRequest);
    }

    fn sweep(&mut self) {
        let now = self.clock.now();
        let expired = detector::expired_clients(&self.registry, now, self.config.liveness_timeout);

        // The whole batch goes before anyone is elected, so ownership can
        // only land on a survivor.
        let mut evicted_leader = None;
        for id in expired.iter() {
            warn!(client = %id, "client timed out, evicting");
            self.registry.remove(id);
            if self.election.is_leader(id) {
                evicted_leader = Some(id.clone());
            }
        }

        let outbox = match evicted_leader {
            Some(leader) => self.election.on_departure(&self.registry, &leader),
            None if !expired.is_empty() => self.election.broadcast_status(&self.registry),
            None => Outbox::new(),
        };
        self.deliver(outbox);

        let outbox = self.election.ensure_leader(&self.registry);
        self.deliver(outbox);
    }

    /// Removes `id` and runs the election consequences. `false` if unknown.
    fn depart(&mut self, id: &ClientId) -> bool {
        if self.registry.remove(id).is_none() {
            return false;
        }
        let outbox = self.election.on_departure(&self.registry, id);
        self.deliver(outbox);
        true
    }

    fn deliver(&mut self, outbox: Outbox) {
        for envelope in outbox {
            self.registry.send(&envelope.to, envelope.message);
        }
    }

    pub fn status(&self) -> CoordinatorStatus {
        CoordinatorStatus {
            leader: self.election.leader().cloned(),
            clients: self
                .registry
                .records()
                .map(|record| ClientSummary {
                    id: record.id().clone(),
                    last_seen: record.last_seen(),
                    connected: record.channel().is_some(),
                })
                .collect(),
        }
    }

    fn check_invariants(&self) {
        debug_assert!(
            self.election.is_consistent(&self.registry),
            "leader {:?} inconsistent with {} registered clients",
            self.election.leader(),
            self.registry.len()
        );
    }
}

/// Owns the state and drives it from the event queue.
pub struct Coordinator {
    state: CoordinatorState,
    events_rx: mpsc::UnboundedReceiver<Event>,
    sweep_interval: Duration,
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig) -> Result<(Self, CoordinatorHandle)> {
        config.validate().context("invalid coordinator config")?;

        let (events, events_rx) = mpsc::unbounded_channel();
        let state = CoordinatorState::new(config, Clock::new(), events.downgrade());
        let coordinator = Self {
            state,
            events_rx,
            sweep_interval: config.sweep_interval,
        };
        let handle = CoordinatorHandle {
            events,
            next_connection: Arc::new(AtomicU64::new(1)),
        };
        Ok((coordinator, handle))
    }

    /// Runs the loop on a new tokio task.
    pub fn spawn(config: CoordinatorConfig) -> Result<CoordinatorHandle> {
        let (coordinator, handle) = Self::new(config)?;
        tokio::spawn(coordinator.run());
        Ok(handle)
    }

    /// Processes events until shutdown, or until every handle and endpoint
    /// is gone. Dropping the state on exit cancels all probe timers.
    pub async fn run(mut self) {
        let period = self.sweep_interval;
        let mut sweep = interval_at(Instant::now() + period, period);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(?period, "coordinator running");

        loop {
            let event = select! {
                event = self.events_rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
                _ = sweep.tick() => Event::SweepTick,
            };
            if !self.state.handle_event(event) {
                break;
            }
        }

        info!(clients = self.state.registry().len(), "coordinator stopped");
    }
}

/// Cloneable access to a running coordinator.
#[derive(Clone)]
pub struct CoordinatorHandle {
    events: mpsc::UnboundedSender<Event>,
    next_connection: Arc<AtomicU64>,
}

impl CoordinatorHandle {
    /// Opens a new link. Each link gets its own connection id.
    pub fn connect(&self) -> ClientEndpoint {
        let connection = self.next_connection.fetch_add(1, Ordering::Relaxed);
        ClientEndpoint::new(connection, self.events.clone())
    }

    pub async fn status(&self) -> Result<CoordinatorStatus> {
        let (respond_to, response) = oneshot::channel();
        self.events
            .send(Event::Status { respond_to })
            .map_err(|_| anyhow!("coordinator has stopped"))?;
        response.await.context("status response channel closed")
    }

    pub fn shutdown(&self) -> Result<()> {
        self.events
            .send(Event::Shutdown)
            .map_err(|_| anyhow!("coordinator has already stopped"))
    }
}
