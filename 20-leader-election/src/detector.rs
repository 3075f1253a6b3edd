//! Failure detection.
//!
//! Two mechanisms work together. Each registered client gets a
//! [`ProbeTimer`] that periodically asks the coordinator to send it a
//! `heartbeat-request`, which nudges idle clients into reporting. The
//! coordinator separately sweeps the registry on its own interval and
//! evicts anyone silent for longer than the liveness timeout, so loss in
//! either direction still ends in a deterministic eviction.

use std::time::Duration;

use tokio::{
    sync::mpsc::WeakUnboundedSender,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior, interval_at},
};

use crate::{
    clock::Timestamp,
    coordinator::Event,
    message::ClientId,
    registry::{Generation, Registry},
};

/// Recurring probe for one client record.
///
/// The timer never touches coordinator state itself. Each tick becomes a
/// [`Event::ProbeDue`] on the coordinator's queue, carrying the record's
/// generation so a tick queued just before cancellation is recognisable as
/// stale. Dropping the timer aborts it.
#[derive(Debug)]
pub struct ProbeTimer {
    task: JoinHandle<()>,
}

impl ProbeTimer {
    /// Starts ticking one `period` from now.
    ///
    /// Holds only a weak sender, so a running timer never keeps a stopped
    /// coordinator's queue alive.
    pub(crate) fn start(
        id: ClientId,
        generation: Generation,
        period: Duration,
        events: WeakUnboundedSender<Event>,
    ) -> Self {
        let task = tokio::spawn(async move {
            let mut ticks = interval_at(Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                let Some(events) = events.upgrade() else {
                    break;
                };
                let due = Event::ProbeDue {
                    id: id.clone(),
                    generation,
                };
                if events.send(due).is_err() {
                    break;
                }
            }
        });
        Self { task }
    }

    pub fn cancel(&self) {
        self.task.abort();
    }
}

impl Drop for ProbeTimer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub fn is_expired(last_seen: Timestamp, now: Timestamp, timeout: Duration) -> bool {
    u128::from(now.saturating_sub(last_seen)) > timeout.as_millis()
}

/// Ids whose last sign of life is older than `timeout`, in registration order.
pub fn expired_clients(registry: &Registry, now: Timestamp, timeout: Duration) -> Vec<ClientId> {
    registry
        .records()
        .filter(|record| is_expired(record.last_seen(), now, timeout))
        .map(|record| record.id().clone())
        .collect()
}
