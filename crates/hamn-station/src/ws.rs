// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The WebSocket gate — same envelope JSON, browser-friendly transport.
//!
//! Text frames carry one envelope each; Mars framing does not apply, so
//! liveness maps onto WebSocket ping/pong frames and replies are plain
//! text frames. The whole pipeline behind [`Station::handle_body`] is
//! shared with the TCP gate.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::{sleep, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, warn};

use hamn_wire::{MarsPackage, BODY_PING, BODY_PONG};

use crate::docker::{self, FrameSink};
use crate::error::StationError;
use crate::gate::HANDSHAKE_TIMEOUT;
use crate::session::ConnCtx;
use crate::station::Station;

struct WsSink(SplitSink<WebSocketStream<TcpStream>, Message>);

#[async_trait]
impl FrameSink for WsSink {
    async fn send_frame(&mut self, package: MarsPackage) -> Result<(), StationError> {
        let message = if package.body == BODY_PING {
            Message::Ping(Vec::new())
        } else if package.body == BODY_PONG {
            Message::Pong(Vec::new())
        } else if package.is_liveness() {
            return Ok(());
        } else {
            let text = String::from_utf8(package.body)
                .map_err(|_| StationError::Framing("non-UTF8 WebSocket payload".into()))?;
            Message::Text(text)
        };
        self.0
            .send(message)
            .await
            .map_err(|e| StationError::Transport(e.to_string()))
    }
}

pub async fn serve_ws(
    station: Arc<Station>,
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    tokio::spawn(run_ws_connection(
                        station.clone(),
                        stream,
                        remote,
                        shutdown.clone(),
                    ));
                }
                Err(err) => {
                    warn!("ws accept failed: {err}");
                    sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
    debug!("websocket gate stopped");
}

async fn run_ws_connection(
    station: Arc<Station>,
    stream: TcpStream,
    remote: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) {
    let socket = match tokio_tungstenite::accept_async(stream).await {
        Ok(socket) => socket,
        Err(err) => {
            debug!(%remote, "ws upgrade failed: {err}");
            return;
        }
    };
    debug!(%remote, "ws connection accepted");
    let (sink, mut source) = socket.split();

    let heartbeat = Duration::from_secs(station.config.heartbeat_interval_s.max(1));
    let docker = docker::spawn(WsSink(sink), heartbeat);
    let ctx = ConnCtx::new(remote, docker.clone());
    let mut closed = docker.closed();

    let deadline = sleep(HANDSHAKE_TIMEOUT);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = closed.changed() => break,
            _ = &mut deadline, if !ctx.is_active() => {
                debug!(%remote, "ws handshake did not complete in time");
                break;
            }
            message = source.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    docker.inbound_seen().await;
                    if handle_ws_body(&station, &ctx, text.as_bytes()).await {
                        break;
                    }
                }
                Some(Ok(Message::Binary(body))) => {
                    docker.inbound_seen().await;
                    if handle_ws_body(&station, &ctx, &body).await {
                        break;
                    }
                }
                Some(Ok(Message::Ping(_))) => {
                    docker.inbound_seen().await;
                    let _ = ctx.docker.send_package(MarsPackage::pong(0)).await;
                }
                Some(Ok(Message::Pong(_))) => docker.inbound_seen().await,
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!(%remote, "ws recv error: {err}");
                    break;
                }
            }
        }
    }

    station.sessions.close_connection(ctx.conn_id);
    docker.close().await;
    debug!(%remote, "ws connection closed");
}

/// Returns `true` when the connection should close.
async fn handle_ws_body(station: &Arc<Station>, ctx: &Arc<ConnCtx>, body: &[u8]) -> bool {
    let (reply, close) = station.handle_body(body, ctx).await;
    if !reply.is_empty()
        && ctx
            .docker
            .send_package(MarsPackage::message(0, reply))
            .await
            .is_err()
    {
        return true;
    }
    close
}
