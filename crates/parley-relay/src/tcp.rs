use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use parley_protocol::codec::*;
use parley_protocol::messages::{ClientEvent, RelayEvent};
use parley_protocol::types::{PublicKeyBytes, UserId};

use crate::state::RelayState;

/// Time a fresh connection has to introduce itself.
const HELLO_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle a single session connection for its whole lifetime.
pub async fn handle_connection(
    mut stream: TcpStream,
    addr: SocketAddr,
    state: Arc<RelayState>,
) -> anyhow::Result<()> {
    stream.set_nodelay(true)?;
    let mut buf = BytesMut::with_capacity(16 * 1024);
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(256);

    let hello = tokio::time::timeout(HELLO_TIMEOUT, read_hello(&mut stream, &mut buf)).await;
    let (username, public_key, version) = match hello {
        Ok(Ok(hello)) => hello,
        Ok(Err(e)) => {
            warn!(%addr, "handshake failed: {}", e);
            reject(&mut stream, &e.to_string()).await;
            return Ok(());
        }
        Err(_) => {
            warn!(%addr, "no hello within {:?}", HELLO_TIMEOUT);
            reject(&mut stream, "hello timed out").await;
            return Ok(());
        }
    };

    if version != PROTOCOL_VERSION {
        warn!(%addr, version, "protocol version mismatch");
        let msg = format!(
            "protocol version mismatch: relay speaks {}, session sent {}",
            PROTOCOL_VERSION, version
        );
        reject(&mut stream, &msg).await;
        return Ok(());
    }

    let (user, known) = match state.register(&username, public_key.clone(), tx.clone()) {
        Ok(registered) => registered,
        Err(e) => {
            info!(%addr, username, "hello rejected: {}", e);
            reject(&mut stream, &e.to_string()).await;
            return Ok(());
        }
    };
    info!(%addr, user, "user joined ({} online)", state.user_count());

    let (read_half, mut write_half) = stream.into_split();

    let writer = tokio::spawn(async move {
        while let Some(data) = rx.recv().await {
            if let Err(e) = write_half.write_all(&data).await {
                error!("write error: {}", e);
                break;
            }
        }
    });

    let result = serve(&state, &user, &tx, public_key, known, read_half, buf).await;
    if let Err(e) = &result {
        warn!(user, "connection error: {}", e);
    }

    state.remove(&user);
    writer.abort();
    info!(user, "user left ({} online)", state.user_count());
    Ok(())
}

/// Read lines until the first one, which must be a `hello`.
async fn read_hello(
    stream: &mut TcpStream,
    buf: &mut BytesMut,
) -> anyhow::Result<(String, PublicKeyBytes, u32)> {
    loop {
        if let Some(line) = try_decode_line(buf)? {
            return match decode_client_event(&line)? {
                ClientEvent::Hello {
                    user,
                    public_key,
                    protocol_version,
                } => Ok((user, public_key, protocol_version)),
                other => Err(anyhow!("expected hello, got {}", other.kind())),
            };
        }
        let n = stream.read_buf(buf).await?;
        if n == 0 {
            anyhow::bail!("connection closed before hello");
        }
    }
}

/// Best-effort status line before dropping a connection that never got in.
async fn reject(stream: &mut TcpStream, msg: &str) {
    let event = RelayEvent::Status { msg: msg.to_string() };
    if let Ok(line) = encode_relay_event(&event) {
        let _ = stream.write_all(&line).await;
    }
    let _ = stream.shutdown().await;
}

async fn serve(
    state: &RelayState,
    user: &UserId,
    tx: &mpsc::Sender<Vec<u8>>,
    public_key: PublicKeyBytes,
    known: Vec<(UserId, PublicKeyBytes)>,
    mut read_half: OwnedReadHalf,
    mut buf: BytesMut,
) -> anyhow::Result<()> {
    // Introduce the newcomer both ways, then tell them which groups exist
    for (peer, key) in known {
        send_event(tx, &RelayEvent::PeerKey { user: peer, public_key: key }).await?;
    }
    broadcast(
        state,
        &RelayEvent::PeerKey {
            user: user.clone(),
            public_key,
        },
        Some(user),
    )
    .await;
    for name in state.group_list().await {
        send_event(tx, &RelayEvent::GroupCreated { name }).await?;
    }

    loop {
        // Drain whatever is already buffered, the hello may have arrived with company
        loop {
            match try_decode_line(&mut buf) {
                Ok(Some(line)) => match decode_client_event(&line) {
                    Ok(event) => handle_event(state, user, tx, event).await?,
                    Err(e) => {
                        warn!(user, "failed to decode event: {}", e);
                        send_status(tx, "malformed event ignored").await?;
                    }
                },
                Ok(None) => break,
                Err(e) => {
                    warn!(user, "discarding line: {}", e);
                    send_status(tx, &e.to_string()).await?;
                }
            }
        }

        let n = read_half.read_buf(&mut buf).await?;
        if n == 0 {
            debug!(user, "connection closed by peer");
            return Ok(());
        }
    }
}

/// Route one event from an authenticated user.
async fn handle_event(
    state: &RelayState,
    user: &UserId,
    tx: &mpsc::Sender<Vec<u8>>,
    event: ClientEvent,
) -> anyhow::Result<()> {
    debug!(user, event = event.kind(), "event");
    match event {
        ClientEvent::Hello { .. } => {
            send_status(tx, "already signed in").await?;
        }

        ClientEvent::Message(mut msg) => {
            if !state.try_consume_message(user) {
                return send_status(tx, "rate limited, message dropped").await;
            }
            msg.sender = user.clone();
            if let Some(key) = state.public_key_of(user) {
                msg.sender_public_key = key;
            }
            let (to, group) = (msg.to.clone(), msg.group.clone());
            route(state, user, tx, to, group, &RelayEvent::Message(msg)).await?;
        }

        ClientEvent::File(mut file) => {
            if !state.try_consume_message(user) {
                return send_status(tx, "rate limited, file dropped").await;
            }
            file.sender = user.clone();
            if let Some(key) = state.public_key_of(user) {
                file.sender_public_key = key;
            }
            let (to, group) = (file.to.clone(), file.group.clone());
            route(state, user, tx, to, group, &RelayEvent::File(file)).await?;
        }

        ClientEvent::Reaction(mut reaction) => {
            reaction.user = user.clone();
            broadcast(state, &RelayEvent::Reaction(reaction), Some(user)).await;
        }

        ClientEvent::Call { to, signal } => {
            let event = RelayEvent::Call {
                from: user.clone(),
                signal,
            };
            match state.sender_of(&to) {
                Some(peer_tx) if to != *user => {
                    if send_event(&peer_tx, &event).await.is_err() {
                        debug!(user, to, "call target went away");
                    }
                }
                _ => send_status(tx, &format!("user `{}` is not connected", to)).await?,
            }
        }

        ClientEvent::CreateGroup { name } => match state.create_group(&name).await {
            Ok(name) => {
                info!(user, group = name, "group created");
                broadcast(state, &RelayEvent::GroupCreated { name }, None).await;
            }
            Err(e) => send_status(tx, &e.to_string()).await?,
        },

        ClientEvent::JoinGroup { name } => match state.join_group(user, &name).await {
            Ok((name, created)) => {
                info!(user, group = name, "joined group");
                if created {
                    broadcast(state, &RelayEvent::GroupCreated { name: name.clone() }, None)
                        .await;
                }
                send_status(tx, &format!("joined {}", name)).await?;
            }
            Err(e) => send_status(tx, &e.to_string()).await?,
        },
    }
    Ok(())
}

/// Deliver a message or file to its direct recipient or group members.
async fn route(
    state: &RelayState,
    user: &UserId,
    tx: &mpsc::Sender<Vec<u8>>,
    to: Option<UserId>,
    group: Option<String>,
    event: &RelayEvent,
) -> anyhow::Result<()> {
    match (to, group) {
        (Some(to), _) => match state.sender_of(&to) {
            Some(peer_tx) => {
                if send_event(&peer_tx, event).await.is_err() {
                    debug!(user, to, "recipient went away");
                }
                Ok(())
            }
            None => send_status(tx, &format!("user `{}` is not connected", to)).await,
        },
        (None, Some(group)) => {
            let line = encode_relay_event(event)?;
            for peer_tx in state.group_senders(&group, user) {
                let _ = peer_tx.send(line.clone()).await;
            }
            Ok(())
        }
        (None, None) => send_status(tx, &format!("{} has no recipient", event.kind())).await,
    }
}

/// Encode and queue one event on a writer channel.
async fn send_event(tx: &mpsc::Sender<Vec<u8>>, event: &RelayEvent) -> anyhow::Result<()> {
    let line = encode_relay_event(event).context("failed to encode relay event")?;
    tx.send(line)
        .await
        .map_err(|_| anyhow!("TCP send channel closed"))
}

async fn send_status(tx: &mpsc::Sender<Vec<u8>>, msg: &str) -> anyhow::Result<()> {
    send_event(tx, &RelayEvent::Status { msg: msg.to_string() }).await
}

/// Send an event to every connected user, optionally skipping one.
async fn broadcast(state: &RelayState, event: &RelayEvent, exclude: Option<&UserId>) {
    let line = match encode_relay_event(event) {
        Ok(line) => line,
        Err(e) => {
            error!("failed to encode broadcast: {}", e);
            return;
        }
    };
    for peer_tx in state.senders_except(exclude.map(String::as_str)) {
        let _ = peer_tx.send(line.clone()).await;
    }
}
