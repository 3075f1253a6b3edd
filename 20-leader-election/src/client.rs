use std::time::Duration;

use anyhow::{Context, Result};
use tokio::{
    io::{self, AsyncBufRead, AsyncWrite, AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
    time::{Instant, interval_at},
};
use tracing::{info, warn};

use crate::{
    cli::ClientArgs,
    message::{ClientId, ClientMessage, FrameReader, ServerMessage, write_message},
};

pub async fn run(args: ClientArgs) -> Result<()> {
    let (mut reader, mut writer) = establish_connection(&args).await?;
    let id = ClientId::new(args.id.as_str());
    write_message(&mut writer, &ClientMessage::Register { id: id.clone() }).await?;

    let mut stdin = FrameReader::new(BufReader::new(tokio::io::stdin()));
    let heartbeat_every = Duration::from_millis(args.heartbeat_interval_ms);

    let release =
        run_client_loop(&id, &mut reader, &mut writer, &mut stdin, heartbeat_every).await?;
    if release {
        write_message(&mut writer, &ClientMessage::Release { id }).await?;
        write_stdout("*** released").await?;
    }
    shutdown_connection(&mut writer).await;

    Ok(())
}

async fn establish_connection(
    args: &ClientArgs,
) -> Result<(FrameReader<BufReader<OwnedReadHalf>>, OwnedWriteHalf)> {
    let stream = TcpStream::connect(args.server)
        .await
        .with_context(|| format!("failed to connect to {}", args.server))?;

    info!("connected to {}", args.server);

    let (reader, writer) = stream.into_split();
    Ok((FrameReader::new(BufReader::new(reader)), writer))
}

/// Returns whether the coordinator should be told we are leaving.
///
/// Stdin goes through a [`FrameReader`] as well, so a half-typed command
/// survives a server frame or heartbeat tick winning the race.
async fn run_client_loop<R, W, I>(
    id: &ClientId,
    reader: &mut FrameReader<R>,
    writer: &mut W,
    stdin: &mut FrameReader<I>,
    heartbeat_every: Duration,
) -> Result<bool>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
    I: AsyncBufRead + Unpin,
{
    let mut heartbeats = interval_at(Instant::now() + heartbeat_every, heartbeat_every);
    let mut owner: Option<Option<ClientId>> = None;

    loop {
        select! {
            frame = reader.next_frame() => {
                let Some(line) = frame? else {
                    write_stdout("*** coordinator closed the connection").await?;
                    return Ok(false);
                };
                handle_server_frame(id, &line, writer, &mut owner).await?;
            }
            _ = heartbeats.tick() => {
                send_heartbeat(id, writer).await?;
            }
            command = stdin.next_frame() => {
                if !handle_stdin_input(id, command, writer).await? {
                    return Ok(true);
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                return Ok(true);
            }
        }
    }
}

async fn handle_server_frame<W>(
    id: &ClientId,
    line: &str,
    writer: &mut W,
    owner: &mut Option<Option<ClientId>>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let message: ServerMessage = match serde_json::from_str(line) {
        Ok(message) => message,
        Err(error) => {
            warn!(?error, "ignoring unreadable message from coordinator");
            return Ok(());
        }
    };

    match message {
        ServerMessage::HeartbeatRequest => send_heartbeat(id, writer).await,
        // Only the status broadcast is rendered; granted/denied are hints.
        ServerMessage::OwnershipStatus { owner_id, .. } => {
            if owner.as_ref() != Some(&owner_id) {
                render_owner(id, owner_id.as_ref()).await?;
                *owner = Some(owner_id);
            }
            Ok(())
        }
        ServerMessage::OwnershipGranted { .. } | ServerMessage::OwnershipDenied { .. } => Ok(()),
    }
}

async fn send_heartbeat<W>(id: &ClientId, writer: &mut W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let heartbeat = ClientMessage::Heartbeat {
        id: id.clone(),
        timestamp: None,
    };
    write_message(writer, &heartbeat).await?;
    Ok(())
}

/// Returns `false` once the user is done, on `/release` or end of input.
async fn handle_stdin_input<W>(
    id: &ClientId,
    command: io::Result<Option<String>>,
    writer: &mut W,
) -> Result<bool>
where
    W: AsyncWrite + Unpin,
{
    let Some(command) = command? else {
        return Ok(false);
    };

    let text = command.trim();
    if text.eq_ignore_ascii_case("/release") {
        return Ok(false);
    }
    if text.eq_ignore_ascii_case("/check") {
        write_message(writer, &ClientMessage::CheckOwnership { id: id.clone() }).await?;
    }
    Ok(true)
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

async fn shutdown_connection(writer: &mut OwnedWriteHalf) {
    if let Err(error) = writer.shutdown().await {
        warn!(?error, "failed to shutdown client writer cleanly");
    }
}

async fn render_owner(me: &ClientId, owner: Option<&ClientId>) -> io::Result<()> {
    match owner {
        Some(owner) if owner == me => write_stdout(&format!("*** owner: {owner} (you)")).await,
        Some(owner) => write_stdout(&format!("*** owner: {owner}")).await,
        None => write_stdout("*** owner: none").await,
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}
