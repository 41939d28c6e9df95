//! Guest-to-host TCP port forwarding over the agent channel
//!
//! Two association tables drive the direction: remote associations make
//! the guest listen and the host connect on accept, local associations
//! make the host listen and tell the guest to connect. Every active tunnel
//! is a pair of pump tasks around one TCP stream, windowed by the ACK
//! sub-protocol.

mod connection;

use std::collections::HashMap;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use vdagent_codec::to_vec;

use crate::protocol::agent::*;
use crate::protocol::*;
use crate::session::Command;

use self::connection::ConnParams;

/// Octets a connection may have in flight towards the peer before its
/// read pump pauses for an ACK.
pub const WINDOW_SIZE: u32 = 10 * 1024 * 1024;

/// Largest agent message body; one data message never exceeds it.
pub const MAX_MSG_SIZE: usize = VD_AGENT_MAX_DATA_SIZE - AGENT_HEADER_LEN;

/// Payload budget of one data message: body minus the id and size fields.
pub const DATA_PAYLOAD_SIZE: usize = MAX_MSG_SIZE - 8;

/// An agent message to enqueue: `(type, body)`.
pub(crate) type OutMsg = (u32, Vec<u8>);

struct HostPort {
    host: String,
    port: u16,
}

struct LocalAssoc {
    host: String,
    rport: u16,
    cancel: CancellationToken,
}

struct ConnHandle {
    data_tx: mpsc::UnboundedSender<Vec<u8>>,
    ack_tx: mpsc::UnboundedSender<u32>,
    cancel: CancellationToken,
    connecting: bool,
}

/// Forwarder state, owned by the session actor.
pub(crate) struct Forwarder {
    window: u32,
    ack_interval: u32,
    remote_assocs: HashMap<u16, HostPort>,
    local_assocs: HashMap<u16, LocalAssoc>,
    connections: HashMap<u32, ConnHandle>,
    next_local_id: u32,
    events: mpsc::UnboundedSender<Command>,
}

impl Forwarder {
    pub fn new(events: mpsc::UnboundedSender<Command>) -> Self {
        Self {
            window: WINDOW_SIZE,
            ack_interval: WINDOW_SIZE / 2,
            remote_assocs: HashMap::new(),
            local_assocs: HashMap::new(),
            connections: HashMap::new(),
            // Host-assigned ids carry the high bit so they never collide
            // with guest-assigned ones.
            next_local_id: 0x8000_0000,
            events,
        }
    }

    /// Ask the guest to listen on `rport` and record where accepted
    /// connections should go on the host side.
    pub fn associate_remote(
        &mut self,
        bind_address: Option<String>,
        rport: u16,
        host: String,
        lport: u16,
    ) -> Vec<OutMsg> {
        let mut out = Vec::new();

        if self.remote_assocs.contains_key(&rport) {
            if let Ok(msgs) = self.disassociate_remote(rport) {
                out.extend(msgs);
            }
        }

        debug!(rport, %host, lport, "associate remote port");
        self.remote_assocs.insert(rport, HostPort { host, port: lport });

        let listen = PortForwardListen {
            port: rport,
            bind_address: bind_address.unwrap_or_else(|| "localhost".to_string()),
        };
        out.push((VD_AGENT_PORT_FORWARD_LISTEN, to_vec(&listen)));
        out
    }

    /// Ask the guest to stop listening. Fails when the port was never
    /// associated.
    pub fn disassociate_remote(&mut self, rport: u16) -> Result<Vec<OutMsg>, ()> {
        if self.remote_assocs.remove(&rport).is_none() {
            warn!(rport, "remote port is not associated with a local port");
            return Err(());
        }

        debug!(rport, "disassociate remote port");
        let msg = PortForwardShutdown { port: rport };
        Ok(vec![(VD_AGENT_PORT_FORWARD_SHUTDOWN, to_vec(&msg))])
    }

    /// Listen on a host port; accepted connections are announced to the
    /// guest, which connects to `host:rport` on its side. Re-associating
    /// the same port rotates the previous listener out.
    pub async fn associate_local(
        &mut self,
        bind_address: Option<String>,
        lport: u16,
        host: String,
        rport: u16,
    ) -> bool {
        if let Some(old) = self.local_assocs.remove(&lport) {
            old.cancel.cancel();
        }

        let bind = bind_address.unwrap_or_else(|| "127.0.0.1".to_string());
        let listener = match TcpListener::bind((bind.as_str(), lport)).await {
            Ok(listener) => listener,
            Err(err) => {
                warn!(lport, %err, "could not listen on local port");
                return false;
            }
        };

        debug!(lport, %host, rport, "associate local port");
        let cancel = CancellationToken::new();
        self.local_assocs.insert(
            lport,
            LocalAssoc {
                host,
                rport,
                cancel: cancel.clone(),
            },
        );

        let events = self.events.clone();
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = cancel.cancelled() => return,
                    accepted = listener.accept() => accepted,
                };
                match accepted {
                    Ok((stream, peer)) => {
                        debug!(lport, %peer, "accepted local connection");
                        if events
                            .send(Command::LocalAccepted { lport, stream })
                            .is_err()
                        {
                            return;
                        }
                    }
                    Err(err) => {
                        warn!(lport, %err, "could not accept connection");
                        return;
                    }
                }
            }
        });

        true
    }

    pub fn disassociate_local(&mut self, lport: u16) -> bool {
        match self.local_assocs.remove(&lport) {
            Some(assoc) => {
                debug!(lport, "disassociate local port");
                assoc.cancel.cancel();
                true
            }
            None => {
                warn!(lport, "local port is not associated");
                false
            }
        }
    }

    /// The guest accepted a connection on an associated remote port:
    /// connect to the recorded host endpoint.
    pub fn handle_accepted(&mut self, msg: PortForwardAccepted) -> Vec<OutMsg> {
        if self.connections.contains_key(&msg.id) {
            warn!(id = msg.id, "connection already exists");
            self.drop_connection(msg.id);
        }

        let (host, port) = match self.remote_assocs.get(&msg.port) {
            Some(target) => (target.host.clone(), target.port),
            None => {
                warn!(port = msg.port, "remote port is not associated with a local port");
                return vec![close_msg(msg.id)];
            }
        };

        debug!(
            id = msg.id,
            rport = msg.port,
            %host,
            lport = port,
            "guest accepted connection"
        );

        let handle = self.insert_connection(msg.id, true);
        let params = ConnParams {
            id: msg.id,
            window: self.window,
            ack_interval: msg.ack_interval,
        };
        let events = self.events.clone();
        tokio::spawn(connection::connect_and_run(
            params, host, port, handle, events,
        ));

        Vec::new()
    }

    /// A connection accepted on a local listener: assign an id and tell
    /// the guest to connect its side.
    pub fn handle_local_accepted(&mut self, lport: u16, stream: TcpStream) -> Vec<OutMsg> {
        let Some(assoc) = self.local_assocs.get(&lport) else {
            debug!(lport, "dropping connection accepted on stale listener");
            return Vec::new();
        };

        let id = self.next_local_id;
        self.next_local_id = self.next_local_id.wrapping_add(1);
        let rport = assoc.rport;

        debug!(id, lport, host = %assoc.host, rport, "announce local connection");

        let handle = self.insert_connection(id, false);
        let params = ConnParams {
            id,
            window: self.window,
            ack_interval: self.ack_interval,
        };
        let events = self.events.clone();
        tokio::spawn(connection::run_established(params, stream, handle, events));

        let accepted = PortForwardAccepted {
            id,
            port: rport,
            ack_interval: self.ack_interval,
        };
        vec![(VD_AGENT_PORT_FORWARD_ACCEPTED, to_vec(&accepted))]
    }

    pub fn handle_data(&mut self, msg: PortForwardData) -> Vec<OutMsg> {
        match self.connections.get(&msg.id) {
            None => {
                // usually an already closed connection
                warn!(id = msg.id, "data for unknown connection");
            }
            Some(conn) if conn.connecting => {
                warn!(id = msg.id, "data for a connection that is still connecting");
            }
            Some(conn) => {
                let _ = conn.data_tx.send(msg.data);
            }
        }
        Vec::new()
    }

    pub fn handle_ack(&mut self, msg: PortForwardAck) -> Vec<OutMsg> {
        match self.connections.get(&msg.id) {
            None => {
                // usually an already closed connection
                warn!(id = msg.id, "ack for unknown connection");
            }
            Some(conn) => {
                let _ = conn.ack_tx.send(msg.size);
            }
        }
        Vec::new()
    }

    pub fn handle_close(&mut self, msg: PortForwardClose) -> Vec<OutMsg> {
        if self.connections.contains_key(&msg.id) {
            debug!(id = msg.id, "guest closed connection");
            self.drop_connection(msg.id);
            Vec::new()
        } else {
            // close a stale guest-side connection
            warn!(id = msg.id, "close for unknown connection");
            vec![close_msg(msg.id)]
        }
    }

    /// A pump finished its TCP connect: credit the guest half a window.
    pub fn handle_conn_open(&mut self, id: u32) -> Vec<OutMsg> {
        match self.connections.get_mut(&id) {
            Some(conn) => {
                conn.connecting = false;
                let ack = PortForwardAck {
                    id,
                    size: self.window / 2,
                };
                vec![(VD_AGENT_PORT_FORWARD_ACK, to_vec(&ack))]
            }
            None => Vec::new(),
        }
    }

    pub fn handle_conn_connect_failed(&mut self, id: u32) -> Vec<OutMsg> {
        debug!(id, "connection could not connect");
        if self.connections.remove(&id).is_some() {
            vec![close_msg(id)]
        } else {
            Vec::new()
        }
    }

    /// Local EOF or socket error: tell the guest and forget the tunnel.
    pub fn handle_conn_closed(&mut self, id: u32) -> Vec<OutMsg> {
        if self.connections.contains_key(&id) {
            self.drop_connection(id);
            vec![close_msg(id)]
        } else {
            Vec::new()
        }
    }

    /// The channel is gone: tear everything down without telling anyone.
    pub fn agent_disconnected(&mut self) {
        debug!("agent disconnected, close all forwarded connections");
        for (_, assoc) in self.local_assocs.drain() {
            assoc.cancel.cancel();
        }
        self.remote_assocs.clear();
        for (_, conn) in self.connections.drain() {
            conn.cancel.cancel();
        }
    }

    fn insert_connection(&mut self, id: u32, connecting: bool) -> connection::ConnChannels {
        let (data_tx, data_rx) = mpsc::unbounded_channel();
        let (ack_tx, ack_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        self.connections.insert(
            id,
            ConnHandle {
                data_tx,
                ack_tx,
                cancel: cancel.clone(),
                connecting,
            },
        );

        connection::ConnChannels {
            data_rx,
            ack_rx,
            cancel,
        }
    }

    fn drop_connection(&mut self, id: u32) {
        if let Some(conn) = self.connections.remove(&id) {
            conn.cancel.cancel();
        }
    }
}

fn close_msg(id: u32) -> OutMsg {
    (
        VD_AGENT_PORT_FORWARD_CLOSE,
        to_vec(&PortForwardClose { id }),
    )
}
