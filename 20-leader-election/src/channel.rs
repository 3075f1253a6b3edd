//! Links between the coordinator and its clients.
//!
//! A link is a pair of unbounded queues. Outbound, the coordinator holds a
//! [`ClientChannel`] per registered client. Inbound, whoever owns the
//! client side holds a [`ClientEndpoint`] whose messages land on the
//! coordinator's event queue, tagged with the channel they came from, so
//! they are processed in the order the link delivered them.

use thiserror::Error;
use tokio::{select, sync::mpsc};

use crate::{
    coordinator::Event,
    message::{ClientMessage, ServerMessage},
};

pub type ConnectionId = u64;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("connection {connection} is closed")]
pub struct ChannelClosed {
    pub connection: ConnectionId,
}

/// Coordinator-side handle for sending to one client.
#[derive(Debug, Clone)]
pub struct ClientChannel {
    connection: ConnectionId,
    outbound: mpsc::UnboundedSender<ServerMessage>,
}

impl ClientChannel {
    pub(crate) fn new(
        connection: ConnectionId,
        outbound: mpsc::UnboundedSender<ServerMessage>,
    ) -> Self {
        Self {
            connection,
            outbound,
        }
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    /// Queues `message` without waiting for delivery.
    ///
    /// An error only says the link is gone. Callers may drop it; a dead
    /// client is removed by the liveness sweep, never by the sender.
    pub fn send(&self, message: ServerMessage) -> Result<(), ChannelClosed> {
        self.outbound.send(message).map_err(|_| ChannelClosed {
            connection: self.connection,
        })
    }
}

/// Client-side end of a link, handed out by
/// [`CoordinatorHandle::connect`](crate::coordinator::CoordinatorHandle::connect).
///
/// Dropping it tells the coordinator the link is gone.
pub struct ClientEndpoint {
    channel: ClientChannel,
    events: mpsc::UnboundedSender<Event>,
    inbound: mpsc::UnboundedReceiver<ServerMessage>,
}

impl ClientEndpoint {
    pub(crate) fn new(connection: ConnectionId, events: mpsc::UnboundedSender<Event>) -> Self {
        let (outbound, inbound) = mpsc::unbounded_channel();
        Self {
            channel: ClientChannel::new(connection, outbound),
            events,
            inbound,
        }
    }

    pub fn connection(&self) -> ConnectionId {
        self.channel.connection
    }

    /// Hands `message` to the coordinator. Fails only once the coordinator
    /// has stopped.
    pub fn send(&self, message: ClientMessage) -> Result<(), ChannelClosed> {
        self.events
            .send(Event::Inbound {
                channel: self.channel.clone(),
                message,
            })
            .map_err(|_| ChannelClosed {
                connection: self.channel.connection,
            })
    }

    /// Next message from the coordinator, or `None` once the coordinator has
    /// stopped and everything it sent has been read.
    pub async fn recv(&mut self) -> Option<ServerMessage> {
        select! {
            biased;
            message = self.inbound.recv() => message,
            _ = self.events.closed() => self.inbound.try_recv().ok(),
        }
    }

    /// Everything already queued, without waiting.
    pub fn drain(&mut self) -> Vec<ServerMessage> {
        let mut messages = Vec::new();
        while let Ok(message) = self.inbound.try_recv() {
            messages.push(message);
        }
        messages
    }
}

impl Drop for ClientEndpoint {
    fn drop(&mut self) {
        let _ = self.events.send(Event::ChannelClosed {
            connection: self.channel.connection,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_after_endpoint_drop_reports_closed() {
        let (events, mut events_rx) = mpsc::unbounded_channel();
        let endpoint = ClientEndpoint::new(3, events);
        let channel = endpoint.channel.clone();
        drop(endpoint);

        assert!(matches!(
            events_rx.recv().await,
            Some(Event::ChannelClosed { connection: 3 })
        ));
        assert_eq!(
            channel.send(ServerMessage::HeartbeatRequest),
            Err(ChannelClosed { connection: 3 })
        );
    }

    #[tokio::test]
    async fn endpoint_forwards_messages_tagged_with_its_channel() {
        let (events, mut events_rx) = mpsc::unbounded_channel();
        let endpoint = ClientEndpoint::new(11, events);

        endpoint
            .send(ClientMessage::Register { id: "a".into() })
            .expect("coordinator queue open");

        match events_rx.recv().await {
            Some(Event::Inbound { channel, message }) => {
                assert_eq!(channel.connection(), 11);
                assert_eq!(message, ClientMessage::Register { id: "a".into() });
                channel
                    .send(ServerMessage::HeartbeatRequest)
                    .expect("endpoint still alive");
            }
            _ => panic!("expected an inbound event"),
        }

        let mut endpoint = endpoint;
        assert_eq!(endpoint.drain(), vec![ServerMessage::HeartbeatRequest]);
    }

    #[tokio::test]
    async fn recv_ends_when_coordinator_stops() {
        let (events, events_rx) = mpsc::unbounded_channel();
        let mut endpoint = ClientEndpoint::new(1, events);
        endpoint
            .channel
            .send(ServerMessage::HeartbeatRequest)
            .expect("queue open");
        drop(events_rx);

        assert_eq!(endpoint.recv().await, Some(ServerMessage::HeartbeatRequest));
        assert_eq!(endpoint.recv().await, None);
    }
}
