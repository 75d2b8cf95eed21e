//! TCP connection to the relay: newline-delimited JSON in both directions.

use std::sync::Arc;

use bytes::BytesMut;
use parley_protocol::codec::{decode_relay_event, encode_client_event, try_decode_line};
use parley_protocol::messages::ClientEvent;
use parley_protocol::ProtocolError;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::config::{Identity, SessionConfig};
use crate::error::SessionError;
use crate::media::MediaEngine;
use crate::session::Session;

/// Connect to the relay at `config.relay_addr` and start a session on it.
pub async fn connect(
    identity: Identity,
    config: &SessionConfig,
    engine: Arc<dyn MediaEngine>,
) -> Result<Session, SessionError> {
    let stream = TcpStream::connect(&config.relay_addr)
        .await
        .map_err(ProtocolError::from)?;
    stream.set_nodelay(true).map_err(ProtocolError::from)?;
    info!(addr = %config.relay_addr, "connected to relay");

    let (read_half, write_half) = stream.into_split();
    let (out_tx, out_rx) = mpsc::channel(config.mailbox_capacity.max(1));
    tokio::spawn(writer_task(write_half, out_rx));

    let session = Session::start(identity, config, engine, out_tx).await?;
    tokio::spawn(reader_task(read_half, session.clone()));
    Ok(session)
}

async fn writer_task(mut write_half: OwnedWriteHalf, mut rx: mpsc::Receiver<ClientEvent>) {
    while let Some(event) = rx.recv().await {
        let line = match encode_client_event(&event) {
            Ok(line) => line,
            Err(e) => {
                error!(event = event.kind(), "failed to encode event: {}", e);
                continue;
            }
        };
        if let Err(e) = write_half.write_all(&line).await {
            error!("relay write error: {}", e);
            break;
        }
    }
    info!("relay writer task ended");
}

async fn reader_task(mut read_half: OwnedReadHalf, session: Session) {
    let mut buf = BytesMut::with_capacity(16 * 1024);
    'read: loop {
        match read_half.read_buf(&mut buf).await {
            Ok(0) => {
                info!("relay closed connection");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                error!("relay read error: {}", e);
                break;
            }
        }

        loop {
            match try_decode_line(&mut buf) {
                Ok(Some(line)) => match decode_relay_event(&line) {
                    Ok(event) => {
                        if session.deliver(event).await.is_err() {
                            break 'read;
                        }
                    }
                    Err(e) => warn!("failed to decode relay event: {}", e),
                },
                Ok(None) => break,
                Err(e) => warn!("discarding relay line: {}", e),
            }
        }
    }
    let _ = session.disconnected().await;
    info!("relay reader task ended");
}
