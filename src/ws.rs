// ===============================
// src/ws.rs (WebSocket stream server)
// ===============================
//
// Per koneksi:
//   - registry.connect() -> (id, rx); writer task men-drain rx ke socket
//   - reader loop mem-parse aksi client: subscribe / unsubscribe / snapshot / history / breakdown
//   - koneksi putus -> registry.disconnect(id), writer berhenti sendiri
//
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::domain::{Outbound, Push, PushSource};
use crate::scheduler::Scheduler;
use crate::subscriptions::{ClientId, Group};

const DEFAULT_HISTORY_LIMIT: usize = 20;

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum ClientMessage {
    Subscribe { group: String },
    Unsubscribe { group: String },
    Snapshot,
    History {
        #[serde(default)]
        limit: Option<usize>,
    },
    Breakdown,
}

pub async fn serve(
    port: u16,
    sched: Arc<Scheduler>,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "websocket listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tokio::spawn(handle_conn(stream, peer, sched.clone(), shutdown.clone()));
                }
                Err(e) => warn!(?e, "ws accept error"),
            },
            _ = shutdown.changed() => {
                info!("websocket server stopped");
                break;
            }
        }
    }
    Ok(())
}

async fn handle_conn(
    stream: TcpStream,
    peer: SocketAddr,
    sched: Arc<Scheduler>,
    mut shutdown: watch::Receiver<bool>,
) {
    let ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(?e, %peer, "ws handshake failed");
            return;
        }
    };
    let (mut sink, mut source) = ws.split();
    let registry = sched.registry().clone();
    let (id, mut rx) = registry.connect();
    info!(client = id, %peer, "ws client attached");

    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let text = match serde_json::to_string(&msg) {
                Ok(t) => t,
                Err(e) => {
                    error!(?e, client = id, "serialize outbound failed");
                    continue;
                }
            };
            if let Err(e) = sink.send(Message::Text(text)).await {
                debug!(?e, client = id, "ws write failed");
                break;
            }
        }
        let _ = sink.close().await;
    });

    loop {
        tokio::select! {
            frame = source.next() => match frame {
                Some(Ok(Message::Text(text))) => handle_text(&sched, id, &text).await,
                Some(Ok(Message::Close(_))) | None => break,
                // ping dibalas otomatis oleh tungstenite; binary diabaikan
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(?e, client = id, "ws read error");
                    break;
                }
            },
            _ = shutdown.changed() => break,
        }
    }

    registry.disconnect(id);
    let _ = writer.await;
}

/// Apply one client frame; replies go through the client's own channel.
pub async fn handle_text(sched: &Scheduler, id: ClientId, text: &str) {
    let agg = sched.aggregator();
    let reply = match serde_json::from_str::<ClientMessage>(text) {
        Err(e) => Some(Outbound::error(format!("invalid message: {e}"))),
        Ok(ClientMessage::Subscribe { group }) => match group.parse::<Group>() {
            Ok(g) => {
                sched.subscribe(id, g).await;
                None
            }
            Err(e) => Some(Outbound::error(e)),
        },
        Ok(ClientMessage::Unsubscribe { group }) => match group.parse::<Group>() {
            Ok(g) => {
                sched.registry().unsubscribe(id, g);
                None
            }
            Err(e) => Some(Outbound::error(e)),
        },
        Ok(ClientMessage::Snapshot) => Some(Outbound::PnlUpdate(Push::new(
            agg.get_snapshot().await,
            PushSource::Initial,
        ))),
        Ok(ClientMessage::History { limit }) => Some(Outbound::History(
            agg.get_history(limit.unwrap_or(DEFAULT_HISTORY_LIMIT)),
        )),
        Ok(ClientMessage::Breakdown) => Some(Outbound::ComponentsUpdate(Push::new(
            agg.get_component_breakdown().await,
            PushSource::Initial,
        ))),
    };
    if let Some(msg) = reply {
        sched.registry().send_to(id, msg);
    }
}
