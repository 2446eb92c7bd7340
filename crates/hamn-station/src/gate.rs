// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The TCP gate: accept loop plus the per-connection inbound pump.
//!
//! Frames come off a [`MarsCodec`]-framed read half; liveness bodies are
//! answered in place, responses complete their awaiting ship by `seq`, and
//! data bodies go through the dispatcher, whose reply (possibly empty) is
//! sent back with the same `cmd` and `seq`.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::{sleep, Duration};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, warn};

use hamn_wire::{MarsCmd, MarsCodec, MarsPackage, BODY_NOOP, BODY_PING, BODY_PONG};

use crate::docker::{self, FrameSink};
use crate::error::StationError;
use crate::session::ConnCtx;
use crate::station::{Station, STATION_SEQ_BASE};

/// A connection that has not turned active within this window is cut.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(60);

struct MarsSink(FramedWrite<OwnedWriteHalf, MarsCodec>);

#[async_trait]
impl FrameSink for MarsSink {
    async fn send_frame(&mut self, package: MarsPackage) -> Result<(), StationError> {
        self.0.send(package).await.map_err(StationError::from)
    }
}

pub async fn serve_mars(
    station: Arc<Station>,
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    tokio::spawn(run_connection(
                        station.clone(),
                        stream,
                        remote,
                        shutdown.clone(),
                    ));
                }
                Err(err) => {
                    warn!("accept failed: {err}");
                    sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
    debug!("mars gate stopped");
}

async fn run_connection(
    station: Arc<Station>,
    stream: TcpStream,
    remote: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(%remote, "connection accepted");
    let _ = stream.set_nodelay(true);
    let (read_half, write_half) = stream.into_split();
    let mut frames = FramedRead::new(read_half, MarsCodec::new());

    let heartbeat = Duration::from_secs(station.config.heartbeat_interval_s.max(1));
    let docker = docker::spawn(
        MarsSink(FramedWrite::new(write_half, MarsCodec::new())),
        heartbeat,
    );
    let ctx = ConnCtx::new(remote, docker.clone());
    let mut closed = docker.closed();

    let deadline = sleep(HANDSHAKE_TIMEOUT);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = closed.changed() => break,
            _ = &mut deadline, if !ctx.is_active() => {
                debug!(%remote, "handshake did not complete in time");
                break;
            }
            frame = frames.next() => match frame {
                None => break,
                Some(Err(err)) => {
                    warn!(%remote, "unrecoverable framing error: {err}");
                    break;
                }
                Some(Ok(package)) => {
                    docker.inbound_seen().await;
                    if handle_package(&station, &ctx, package).await {
                        break;
                    }
                }
            }
        }
    }

    station.sessions.close_connection(ctx.conn_id);
    docker.close().await;
    debug!(%remote, "connection closed");
}

/// Returns `true` when the connection should close.
async fn handle_package(station: &Arc<Station>, ctx: &Arc<ConnCtx>, pkg: MarsPackage) -> bool {
    // Liveness bodies never reach the dispatcher.
    if pkg.body == BODY_PING {
        return ctx.docker.send_package(MarsPackage::pong(pkg.seq)).await.is_err();
    }
    if pkg.body == BODY_PONG {
        return false;
    }
    if pkg.body.is_empty() || pkg.body == BODY_NOOP {
        let echo = MarsPackage::new(MarsCmd::Noop, pkg.seq, BODY_NOOP.to_vec());
        return ctx.docker.send_package(echo).await.is_err();
    }

    // Frames echoing one of our own sequence numbers are responses to
    // pushed envelopes, not fresh requests.
    if pkg.seq >= STATION_SEQ_BASE {
        ctx.docker.ack(pkg.seq).await;
        return false;
    }

    let (reply, close) = station.handle_body(&pkg.body, ctx).await;
    if ctx
        .docker
        .send_package(MarsPackage::new(pkg.cmd, pkg.seq, reply))
        .await
        .is_err()
    {
        return true;
    }
    close
}
