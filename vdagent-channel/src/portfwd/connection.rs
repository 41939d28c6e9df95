//! Per-connection data pumps
//!
//! Each tunnel runs a reader over the TCP stream that turns socket bytes
//! into data messages, pausing once a window's worth is unacknowledged,
//! and a writer that drains guest payloads into the socket, acking every
//! `ack_interval` octets. Both halves stop on the shared cancellation
//! token; the session actor learns about endings through events.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::session::Command;

use super::DATA_PAYLOAD_SIZE;

#[derive(Debug, Clone, Copy)]
pub(crate) struct ConnParams {
    pub id: u32,
    pub window: u32,
    pub ack_interval: u32,
}

/// The pump-side ends of a connection's channels.
pub(crate) struct ConnChannels {
    pub data_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    pub ack_rx: mpsc::UnboundedReceiver<u32>,
    pub cancel: CancellationToken,
}

/// Remote-accept path: connect to the associated host endpoint first.
pub(crate) async fn connect_and_run(
    params: ConnParams,
    host: String,
    port: u16,
    channels: ConnChannels,
    events: mpsc::UnboundedSender<Command>,
) {
    let connect = TcpStream::connect((host.as_str(), port));

    let stream = tokio::select! {
        _ = channels.cancel.cancelled() => return,
        connected = connect => match connected {
            Ok(stream) => stream,
            Err(err) => {
                debug!(id = params.id, %err, "connection could not connect");
                let _ = events.send(Command::ConnConnectFailed { id: params.id });
                return;
            }
        },
    };

    let _ = events.send(Command::ConnOpen { id: params.id });
    run_established(params, stream, channels, events).await;
}

/// Drive an established stream until either side ends the tunnel.
pub(crate) async fn run_established(
    params: ConnParams,
    stream: TcpStream,
    channels: ConnChannels,
    events: mpsc::UnboundedSender<Command>,
) {
    let ConnChannels {
        data_rx,
        ack_rx,
        cancel,
    } = channels;
    let (read_half, write_half) = stream.into_split();

    tokio::spawn(write_pump(
        params,
        write_half,
        data_rx,
        cancel.clone(),
        events.clone(),
    ));
    read_pump(params, read_half, ack_rx, cancel, events).await;
}

async fn read_pump(
    params: ConnParams,
    mut socket: OwnedReadHalf,
    mut ack_rx: mpsc::UnboundedReceiver<u32>,
    cancel: CancellationToken,
    events: mpsc::UnboundedSender<Command>,
) {
    let mut buf = vec![0u8; DATA_PAYLOAD_SIZE];
    let mut data_sent: u64 = 0;

    loop {
        while let Ok(acked) = ack_rx.try_recv() {
            data_sent = data_sent.saturating_sub(acked as u64);
        }

        if data_sent >= params.window as u64 {
            trace!(id = params.id, data_sent, "window full, pausing reads");
            tokio::select! {
                _ = cancel.cancelled() => return,
                acked = ack_rx.recv() => match acked {
                    Some(acked) => {
                        data_sent = data_sent.saturating_sub(acked as u64);
                        continue;
                    }
                    None => return,
                },
            }
        }

        let n = tokio::select! {
            _ = cancel.cancelled() => return,
            read = socket.read(&mut buf) => match read {
                Ok(n) => n,
                Err(err) => {
                    debug!(id = params.id, %err, "read error on connection");
                    let _ = events.send(Command::ConnClosed { id: params.id });
                    return;
                }
            },
        };

        if n == 0 {
            debug!(id = params.id, "connection reset by peer");
            let _ = events.send(Command::ConnClosed { id: params.id });
            return;
        }

        trace!(id = params.id, n, "read bytes on connection");
        data_sent += n as u64;
        if events
            .send(Command::ConnData {
                id: params.id,
                data: buf[..n].to_vec(),
            })
            .is_err()
        {
            return;
        }
    }
}

async fn write_pump(
    params: ConnParams,
    mut socket: OwnedWriteHalf,
    mut data_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    cancel: CancellationToken,
    events: mpsc::UnboundedSender<Command>,
) {
    let mut data_received: u64 = 0;

    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => return,
            chunk = data_rx.recv() => match chunk {
                Some(chunk) => chunk,
                None => return,
            },
        };

        if let Err(err) = socket.write_all(&chunk).await {
            debug!(id = params.id, %err, "write error on connection");
            let _ = events.send(Command::ConnClosed { id: params.id });
            return;
        }

        trace!(id = params.id, n = chunk.len(), "written bytes on connection");
        data_received += chunk.len() as u64;
        if data_received >= params.ack_interval as u64 {
            let _ = events.send(Command::ConnAck {
                id: params.id,
                size: data_received as u32,
            });
            data_received = 0;
        }
    }
}
