//! Client registry: one record per live client, in registration order.

use std::collections::{BTreeMap, HashMap};

use tracing::debug;

use crate::{
    channel::{ClientChannel, ConnectionId},
    clock::Timestamp,
    detector::ProbeTimer,
    message::{ClientId, ServerMessage},
};

/// Registration counter. Strictly increasing across the registry's
/// lifetime, so it doubles as the ordering key and as a way to tell a
/// record apart from an earlier one registered under the same id.
pub type Generation = u64;

#[derive(Debug)]
pub struct ClientRecord {
    id: ClientId,
    channel: Option<ClientChannel>,
    last_seen: Timestamp,
    generation: Generation,
    probe: ProbeTimer,
}

impl ClientRecord {
    pub fn id(&self) -> &ClientId {
        &self.id
    }

    /// `None` once a send on the channel has failed.
    pub fn channel(&self) -> Option<&ClientChannel> {
        self.channel.as_ref()
    }

    pub fn last_seen(&self) -> Timestamp {
        self.last_seen
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }
}

#[derive(Debug, Default)]
pub struct Registry {
    records: HashMap<ClientId, ClientRecord>,
    order: BTreeMap<Generation, ClientId>,
    next_generation: Generation,
}

impl Registry {
    /// Inserts a fresh record for `id`, fully removing any existing one
    /// first. `start_probe` receives the new record's generation.
    pub fn register<F>(
        &mut self,
        id: ClientId,
        channel: ClientChannel,
        now: Timestamp,
        start_probe: F,
    ) -> &ClientRecord
    where
        F: FnOnce(&ClientId, Generation) -> ProbeTimer,
    {
        self.remove(&id);

        self.next_generation += 1;
        let generation = self.next_generation;
        let probe = start_probe(&id, generation);
        self.order.insert(generation, id.clone());
        self.records.entry(id.clone()).or_insert(ClientRecord {
            id,
            channel: Some(channel),
            last_seen: now,
            generation,
            probe,
        })
    }

    /// Records a sign of life. Unknown ids are ignored, and `last_seen`
    /// never moves backwards.
    pub fn touch(&mut self, id: &ClientId, timestamp: Timestamp) -> bool {
        match self.records.get_mut(id) {
            Some(record) => {
                record.last_seen = record.last_seen.max(timestamp);
                true
            }
            None => false,
        }
    }

    /// Cancels the record's probe and deletes it.
    pub fn remove(&mut self, id: &ClientId) -> Option<ClientRecord> {
        let record = self.records.remove(id)?;
        record.probe.cancel();
        self.order.remove(&record.generation);
        Some(record)
    }

    pub fn get(&self, id: &ClientId) -> Option<&ClientRecord> {
        self.records.get(id)
    }

    pub fn contains(&self, id: &ClientId) -> bool {
        self.records.contains_key(id)
    }

    /// Whether a probe tick from `generation` still belongs to a live record.
    pub fn is_current(&self, id: &ClientId, generation: Generation) -> bool {
        self.records
            .get(id)
            .is_some_and(|record| record.generation == generation)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Registered ids, oldest registration first.
    pub fn ids(&self) -> impl Iterator<Item = &ClientId> + '_ {
        self.order.values()
    }

    pub fn first(&self) -> Option<&ClientId> {
        self.ids().next()
    }

    pub fn records(&self) -> impl Iterator<Item = &ClientRecord> + '_ {
        self.order.values().filter_map(|id| self.records.get(id))
    }

    /// Best-effort send. A failed send invalidates the record's channel so
    /// nothing more is attempted on it; the record itself stays until the
    /// sweep or an explicit release removes it.
    pub fn send(&mut self, id: &ClientId, message: ServerMessage) -> bool {
        let Some(record) = self.records.get_mut(id) else {
            return false;
        };
        let Some(channel) = &record.channel else {
            return false;
        };
        if let Err(err) = channel.send(message) {
            debug!(client = %id, %err, "channel closed, invalidating");
            record.channel = None;
            return false;
        }
        true
    }

    /// Invalidates every record bound to `connection`. Returns how many.
    pub fn invalidate_connection(&mut self, connection: ConnectionId) -> usize {
        let mut invalidated = 0;
        for record in self.records.values_mut() {
            let bound = record
                .channel
                .as_ref()
                .is_some_and(|channel| channel.connection() == connection);
            if bound {
                record.channel = None;
                invalidated += 1;
            }
        }
        invalidated
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;
    use crate::coordinator::Event;

    const PROBE: Duration = Duration::from_secs(2);

    struct Fixture {
        registry: Registry,
        events: mpsc::UnboundedSender<Event>,
        events_rx: mpsc::UnboundedReceiver<Event>,
    }

    impl Fixture {
        fn new() -> Self {
            let (events, events_rx) = mpsc::unbounded_channel();
            Self {
                registry: Registry::default(),
                events,
                events_rx,
            }
        }

        fn register(
            &mut self,
            id: &str,
            now: Timestamp,
        ) -> (Generation, mpsc::UnboundedReceiver<ServerMessage>) {
            let (outbound, inbound) = mpsc::unbounded_channel();
            let events = self.events.downgrade();
            let record = self.registry.register(
                id.into(),
                ClientChannel::new(1, outbound),
                now,
                |id, generation| ProbeTimer::start(id.clone(), generation, PROBE, events),
            );
            (record.generation(), inbound)
        }

        fn probes(&mut self) -> Vec<(ClientId, Generation)> {
            let mut probes = Vec::new();
            while let Ok(event) = self.events_rx.try_recv() {
                if let Event::ProbeDue { id, generation } = event {
                    probes.push((id, generation));
                }
            }
            probes
        }
    }

    #[tokio::test(start_paused = true)]
    async fn ids_follow_registration_order() {
        let mut fx = Fixture::new();
        fx.register("b", 0);
        fx.register("a", 0);
        fx.register("c", 0);

        let ids: Vec<_> = fx.registry.ids().map(ClientId::as_str).collect();
        assert_eq!(ids, ["b", "a", "c"]);
        assert_eq!(fx.registry.first().map(ClientId::as_str), Some("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_registration_replaces_and_cancels_first_probe() {
        let mut fx = Fixture::new();
        let (first, _) = fx.register("a", 0);
        fx.register("b", 0);
        let (second, _) = fx.register("a", 10);

        assert_eq!(fx.registry.len(), 2);
        assert!(!fx.registry.is_current(&"a".into(), first));
        assert!(fx.registry.is_current(&"a".into(), second));
        // The replacement goes to the back of the line.
        let ids: Vec<_> = fx.registry.ids().map(ClientId::as_str).collect();
        assert_eq!(ids, ["b", "a"]);

        tokio::time::sleep(PROBE + Duration::from_millis(100)).await;
        let probes_for_a: Vec<_> = fx
            .probes()
            .into_iter()
            .filter(|(id, _)| id.as_str() == "a")
            .collect();
        assert_eq!(probes_for_a, vec![(ClientId::from("a"), second)]);
    }

    #[tokio::test(start_paused = true)]
    async fn touch_ignores_unknown_and_never_rewinds() {
        let mut fx = Fixture::new();
        fx.register("a", 1_000);

        assert!(!fx.registry.touch(&"ghost".into(), 5_000));
        assert!(fx.registry.touch(&"a".into(), 3_000));
        assert!(fx.registry.touch(&"a".into(), 2_000));
        assert_eq!(fx.registry.get(&"a".into()).map(ClientRecord::last_seen), Some(3_000));
    }

    #[tokio::test(start_paused = true)]
    async fn remove_stops_probing() {
        let mut fx = Fixture::new();
        fx.register("a", 0);

        assert!(fx.registry.remove(&"a".into()).is_some());
        assert!(fx.registry.remove(&"a".into()).is_none());
        assert!(fx.registry.is_empty());

        tokio::time::sleep(PROBE * 3).await;
        assert!(fx.probes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_send_invalidates_channel() {
        let mut fx = Fixture::new();
        let (_, inbound) = fx.register("a", 0);
        let id = ClientId::from("a");

        assert!(fx.registry.send(&id, ServerMessage::HeartbeatRequest));
        drop(inbound);
        assert!(!fx.registry.send(&id, ServerMessage::HeartbeatRequest));
        assert!(fx.registry.get(&id).is_some_and(|record| record.channel().is_none()));
        assert!(!fx.registry.send(&"ghost".into(), ServerMessage::HeartbeatRequest));
    }

    #[tokio::test(start_paused = true)]
    async fn invalidate_connection_keeps_records() {
        let mut fx = Fixture::new();
        fx.register("a", 0);
        fx.register("b", 0);

        assert_eq!(fx.registry.invalidate_connection(1), 2);
        assert_eq!(fx.registry.invalidate_connection(1), 0);
        assert_eq!(fx.registry.len(), 2);
    }
}
