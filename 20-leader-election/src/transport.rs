//! TCP front end for the coordinator.
//!
//! Each accepted connection becomes one [`ClientEndpoint`]. Lines read from
//! the socket are validated and forwarded to the coordinator; messages from
//! the coordinator are written back as JSON lines. The coordinator never
//! learns about sockets, only about links opening and closing.

use std::{future::Future, net::SocketAddr};

use anyhow::Result;
use tokio::{
    io::{AsyncBufRead, AsyncWrite, BufReader},
    net::{TcpListener, TcpStream},
    select,
};
use tracing::{debug, info, warn};

use crate::{
    channel::ClientEndpoint,
    coordinator::CoordinatorHandle,
    message::{ClientMessage, FrameReader, write_message},
};

pub struct Server {
    listener: TcpListener,
    coordinator: CoordinatorHandle,
}

impl Server {
    pub fn new(listener: TcpListener, coordinator: CoordinatorHandle) -> Self {
        Self {
            listener,
            coordinator,
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server {
            listener,
            coordinator,
        } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    info!("server shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &coordinator);
                }
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    coordinator: &CoordinatorHandle,
) {
    match result {
        Ok((stream, peer)) => spawn_connection_handler(stream, peer, coordinator),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_connection_handler(stream: TcpStream, peer: SocketAddr, coordinator: &CoordinatorHandle) {
    let endpoint = coordinator.connect();
    tokio::spawn(async move {
        let connection = endpoint.connection();
        debug!(%peer, connection, "connection opened");
        if let Err(err) = handle_connection(stream, endpoint).await {
            warn!(%peer, connection, error = ?err, "connection closed with error");
        } else {
            debug!(%peer, connection, "connection closed");
        }
    });
}

async fn handle_connection(stream: TcpStream, endpoint: ClientEndpoint) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut frames = FrameReader::new(BufReader::new(reader));
    pump(&mut frames, &mut writer, endpoint).await
}

/// Shuttles messages between one socket and its endpoint until either side
/// goes away. Dropping the endpoint at the end is what tells the
/// coordinator the link closed.
async fn pump<R, W>(
    frames: &mut FrameReader<R>,
    writer: &mut W,
    mut endpoint: ClientEndpoint,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        select! {
            frame = frames.next_frame() => {
                let Some(line) = frame? else {
                    break;
                };
                if !forward_frame(&endpoint, &line) {
                    break;
                }
            }
            outbound = endpoint.recv() => {
                let Some(message) = outbound else {
                    break;
                };
                write_message(writer, &message).await?;
            }
        }
    }

    Ok(())
}

/// Returns `false` once the coordinator has stopped.
fn forward_frame(endpoint: &ClientEndpoint, line: &str) -> bool {
    match ClientMessage::decode(line) {
        Ok(message) => endpoint.send(message).is_ok(),
        Err(err) => {
            debug!(connection = endpoint.connection(), %err, "dropping malformed message");
            true
        }
    }
}
