//! Owner of the agent sub-protocol state over one main channel
//!
//! The session is a single actor task: a select loop over inbound carrier
//! frames, commands from the public handle, events from transfer and
//! connection pumps, and the display coalescing timer. All mutable state
//! (token queue, reassembler, capabilities, task and connection tables)
//! lives here, so no handler ever races another.

use std::collections::HashMap;
use std::path::PathBuf;
use std::pin::Pin;

use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration, Sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use vdagent_codec::{to_vec, Fragment, Writer};

use crate::bearer::{Bearer, BearerError, FrameBuffer};
use crate::caps::{Capabilities, CapabilitySet};
use crate::config::SessionConfig;
use crate::framer::{encode_chunks, AgentEnvelope, FramerError, Reassembler};
use crate::portfwd::Forwarder;
use crate::protocol::agent::*;
use crate::protocol::channel::{ClientMsg, ServerMsg, SPICE_MSGC_MAIN_AGENT_DATA};
use crate::protocol::*;
use crate::queue::{FlushWaiter, TokenQueue};
use crate::transfer::{
    CopyError, Operation, ProgressFn, TaskEntry, TaskOutcome, TaskPump, TaskStatusIn,
};

pub const MAX_DISPLAY: usize = 16;

const DISPLAY_TIMER_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("bearer failure")]
    Bearer(#[from] BearerError),

    #[error("agent framing failure")]
    Framer(#[from] FramerError),
}

/// Things the session surfaces to its collaborators.
#[derive(Debug)]
pub enum SessionEvent {
    AgentUpdated { connected: bool },
    CapsUpdated,
    MouseModeChanged { current: u32 },
    NewFileTransfer { id: u32, path: PathBuf, cancel: CancellationToken },
    ClipboardGrab { selection: u8, types: Vec<u32> },
    ClipboardData { selection: u8, kind: u32, data: Vec<u8> },
    ClipboardRequest { selection: u8, kind: u32 },
    ClipboardRelease { selection: u8 },
    VolumeSync { playback: bool, mute: bool, volumes: Vec<u16> },
    ServerName(String),
    ServerUuid([u8; 16]),
    MultiMediaTime(u32),
    ChannelsList(Vec<(u8, u8)>),
}

/// Everything that reaches the actor: public API calls and pump events.
pub(crate) enum Command {
    CopyFiles {
        paths: Vec<PathBuf>,
        cancel: Option<CancellationToken>,
        progress: Option<ProgressFn>,
        reply: oneshot::Sender<Result<(), CopyError>>,
    },
    ClipboardGrab { selection: u8, types: Vec<u32> },
    ClipboardNotify { selection: u8, kind: u32, data: Vec<u8> },
    ClipboardRequest { selection: u8, kind: u32 },
    ClipboardRelease { selection: u8 },
    VolumeSync { playback: bool, mute: bool, volumes: Vec<u16> },
    AssociateRemote {
        bind: Option<String>,
        rport: u16,
        host: String,
        lport: u16,
        reply: oneshot::Sender<bool>,
    },
    DisassociateRemote { rport: u16, reply: oneshot::Sender<bool> },
    AssociateLocal {
        bind: Option<String>,
        lport: u16,
        host: String,
        rport: u16,
        reply: oneshot::Sender<bool>,
    },
    DisassociateLocal { lport: u16, reply: oneshot::Sender<bool> },
    UpdateDisplay { id: usize, x: i32, y: i32, width: u32, height: u32, deferred: bool },
    UpdateDisplayEnabled { id: usize, enabled: bool, deferred: bool },
    SendMonitorConfig,
    RequestMouseMode(u32),
    PowerEventRequest(u32),
    SetMaxClipboard(i64),

    // transfer pump events
    XferStart { id: u32, name: String, size: u64, flush: FlushWaiter },
    XferData { id: u32, data: Vec<u8>, flush: FlushWaiter },
    XferProgress { id: u32 },
    XferStatusOut { id: u32, result: u32 },
    XferFinished { id: u32, outcome: TaskOutcome },

    // forward connection pump events
    ConnOpen { id: u32 },
    ConnConnectFailed { id: u32 },
    ConnClosed { id: u32 },
    ConnData { id: u32, data: Vec<u8> },
    ConnAck { id: u32, size: u32 },
    LocalAccepted { lport: u16, stream: TcpStream },
}

/// Cloneable front door to a running session.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl SessionHandle {
    /// Stream files to the guest. Resolves once every file has finished;
    /// a shared cancellation token cancels them all together, while
    /// leaving it out gives each file its own token (surfaced through
    /// [`SessionEvent::NewFileTransfer`]).
    pub async fn copy_files(
        &self,
        paths: Vec<PathBuf>,
        cancel: Option<CancellationToken>,
        progress: Option<ProgressFn>,
    ) -> Result<(), CopyError> {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(Command::CopyFiles {
            paths,
            cancel,
            progress,
            reply,
        });
        rx.await.map_err(|_| CopyError::SessionClosed)?
    }

    pub fn clipboard_selection_grab(&self, selection: u8, types: Vec<u32>) {
        let _ = self.tx.send(Command::ClipboardGrab { selection, types });
    }

    pub fn clipboard_selection_notify(&self, selection: u8, kind: u32, data: Vec<u8>) {
        let _ = self.tx.send(Command::ClipboardNotify {
            selection,
            kind,
            data,
        });
    }

    pub fn clipboard_selection_request(&self, selection: u8, kind: u32) {
        let _ = self.tx.send(Command::ClipboardRequest { selection, kind });
    }

    pub fn clipboard_selection_release(&self, selection: u8) {
        let _ = self.tx.send(Command::ClipboardRelease { selection });
    }

    pub fn volume_sync(&self, playback: bool, mute: bool, volumes: Vec<u16>) {
        let _ = self.tx.send(Command::VolumeSync {
            playback,
            mute,
            volumes,
        });
    }

    /// Make the guest listen on `rport`; accepted connections are routed
    /// to `host:lport` on this side.
    pub async fn associate_remote(
        &self,
        bind: Option<String>,
        rport: u16,
        host: String,
        lport: u16,
    ) -> bool {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(Command::AssociateRemote {
            bind,
            rport,
            host,
            lport,
            reply,
        });
        rx.await.unwrap_or(false)
    }

    pub async fn disassociate_remote(&self, rport: u16) -> bool {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(Command::DisassociateRemote { rport, reply });
        rx.await.unwrap_or(false)
    }

    /// Listen on `lport` here; accepted connections are announced to the
    /// guest, which connects to `host:rport` on its side.
    pub async fn associate_local(
        &self,
        bind: Option<String>,
        lport: u16,
        host: String,
        rport: u16,
    ) -> bool {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(Command::AssociateLocal {
            bind,
            lport,
            host,
            rport,
            reply,
        });
        rx.await.unwrap_or(false)
    }

    pub async fn disassociate_local(&self, lport: u16) -> bool {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(Command::DisassociateLocal { lport, reply });
        rx.await.unwrap_or(false)
    }

    pub fn update_display(
        &self,
        id: usize,
        x: i32,
        y: i32,
        width: u32,
        height: u32,
        deferred: bool,
    ) {
        let _ = self.tx.send(Command::UpdateDisplay {
            id,
            x,
            y,
            width,
            height,
            deferred,
        });
    }

    pub fn update_display_enabled(&self, id: usize, enabled: bool, deferred: bool) {
        let _ = self.tx.send(Command::UpdateDisplayEnabled {
            id,
            enabled,
            deferred,
        });
    }

    pub fn send_monitor_config(&self) {
        let _ = self.tx.send(Command::SendMonitorConfig);
    }

    pub fn request_mouse_mode(&self, mode: u32) {
        let _ = self.tx.send(Command::RequestMouseMode(mode));
    }

    pub fn power_event_request(&self, event: u32) {
        let _ = self.tx.send(Command::PowerEventRequest(event));
    }

    pub fn set_max_clipboard(&self, max: i64) {
        let _ = self.tx.send(Command::SetMaxClipboard(max));
    }
}

/// A started session: its handle, its event stream and the actor task.
pub struct RunningSession {
    pub handle: SessionHandle,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
    pub task: JoinHandle<Result<(), SessionError>>,
}

impl RunningSession {
    pub fn abort(&self) {
        self.task.abort();
    }
}

/// Spin up the session actor over a connected bearer.
pub fn start(bearer: Bearer, config: SessionConfig) -> RunningSession {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();

    let session = AgentSession::new(FrameBuffer::new(bearer), config, cmd_tx.clone(), cmd_rx, event_tx);
    let task = tokio::spawn(session.run());

    RunningSession {
        handle: SessionHandle { tx: cmd_tx },
        events: event_rx,
        task,
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct DisplayState {
    x: i32,
    y: i32,
    width: u32,
    height: u32,
    enabled: Option<bool>,
}

struct AgentSession {
    bearer: FrameBuffer,
    config: SessionConfig,
    queue: TokenQueue,
    reassembler: Reassembler,
    caps: Capabilities,
    forwarder: Forwarder,
    cmd_tx: mpsc::UnboundedSender<Command>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<SessionEvent>,
    agent_connected: bool,
    display_config_sent: bool,
    max_clipboard: i64,
    mouse_mode: u32,
    requested_mouse_mode: u32,
    displays: [DisplayState; MAX_DISPLAY],
    display_timer: Option<Pin<Box<Sleep>>>,
    next_task_id: u32,
    next_op_id: u64,
    xfer_tasks: HashMap<u32, TaskEntry>,
    xfer_ops: HashMap<u64, Operation>,
}

impl AgentSession {
    fn new(
        bearer: FrameBuffer,
        config: SessionConfig,
        cmd_tx: mpsc::UnboundedSender<Command>,
        cmd_rx: mpsc::UnboundedReceiver<Command>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        let max_clipboard = config.max_clipboard;

        Self {
            bearer,
            config,
            queue: TokenQueue::new(),
            reassembler: Reassembler::default(),
            caps: Capabilities::new(CapabilitySet::client_default()),
            forwarder: Forwarder::new(cmd_tx.clone()),
            cmd_tx,
            cmd_rx,
            events,
            agent_connected: false,
            display_config_sent: false,
            max_clipboard,
            mouse_mode: 0,
            requested_mouse_mode: 0,
            displays: [DisplayState::default(); MAX_DISPLAY],
            display_timer: None,
            next_task_id: 1,
            next_op_id: 1,
            xfer_tasks: HashMap::new(),
            xfer_ops: HashMap::new(),
        }
    }

    async fn run(mut self) -> Result<(), SessionError> {
        let result = self.drive().await;

        // Channel teardown: everything above the bearer resets.
        self.queue.reset();
        for entry in self.xfer_tasks.values() {
            let _ = entry.status_tx.send(TaskStatusIn::AgentGone);
        }
        self.forwarder.agent_disconnected();

        if let Err(err) = &result {
            error!(%err, "agent session terminated");
        }
        result
    }

    async fn drive(&mut self) -> Result<(), SessionError> {
        loop {
            self.pump_queue().await?;

            tokio::select! {
                frame = self.bearer.read_frame() => {
                    let (kind, body) = frame?;
                    self.handle_frame(kind, body).await?;
                }
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await?,
                    None => return Ok(()),
                },
                _ = timer_tick(&mut self.display_timer) => {
                    self.display_timer = None;
                    self.flush_monitor_config();
                }
            }
        }
    }

    /// Write out queued chunks while token credit lasts, completing flush
    /// waiters as their chunks hit the wire.
    async fn pump_queue(&mut self) -> Result<(), SessionError> {
        while let Some(sent) = self.queue.pop_sendable() {
            if tracing::event_enabled!(tracing::Level::TRACE) {
                trace!(data = hex::encode(&sent.bytes), "write agent chunk");
            }

            match self
                .bearer
                .write_frame(SPICE_MSGC_MAIN_AGENT_DATA, &sent.bytes)
                .await
            {
                Ok(()) => sent.complete(),
                Err(err) => {
                    sent.fail();
                    return Err(BearerError::Io(err).into());
                }
            }
        }
        Ok(())
    }

    fn enqueue_agent_msg(&mut self, kind: u32, body: &[u8]) -> Option<crate::queue::FlushHandle> {
        self.queue.enqueue(encode_chunks(kind, body))
    }

    async fn write_client_msg(&mut self, msg: ClientMsg) -> Result<(), SessionError> {
        self.bearer
            .write_frame(msg.kind(), &msg.body())
            .await
            .map_err(|err| BearerError::Io(err).into())
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    async fn handle_frame(&mut self, kind: u16, body: Vec<u8>) -> Result<(), SessionError> {
        let msg = match ServerMsg::decode(kind, &body) {
            Ok(Some(msg)) => msg,
            Ok(None) => {
                debug!(kind, "unhandled channel message");
                return Ok(());
            }
            Err(err) => {
                warn!(kind, %err, "malformed channel message");
                return Ok(());
            }
        };

        match msg {
            ServerMsg::Init(init) => {
                debug!(session_id = init.session_id, "main channel init");
                self.emit(SessionEvent::MultiMediaTime(init.multi_media_time));
                self.set_mouse_mode(init.supported_mouse_modes, init.current_mouse_mode)
                    .await?;
                self.queue.set_tokens(init.agent_tokens);
                if init.agent_connected {
                    self.agent_start().await?;
                }
                self.write_client_msg(ClientMsg::AttachChannels).await?;
            }
            ServerMsg::AgentConnected => self.agent_start().await?,
            ServerMsg::AgentConnectedTokens(tokens) => {
                self.queue.set_tokens(tokens);
                self.agent_start().await?;
            }
            ServerMsg::AgentDisconnected => self.agent_stopped(),
            ServerMsg::AgentToken(tokens) => self.queue.on_tokens(tokens),
            ServerMsg::AgentData(data) => {
                if !self.agent_connected {
                    debug!("agent data while agent is not connected");
                }
                for envelope in self.reassembler.feed(&data)? {
                    self.dispatch_agent_msg(envelope).await?;
                }
            }
            ServerMsg::MouseMode { supported, current } => {
                self.set_mouse_mode(supported, current).await?;
            }
            ServerMsg::MultiMediaTime(time) => self.emit(SessionEvent::MultiMediaTime(time)),
            ServerMsg::Name(name) => {
                debug!(%name, "server name");
                self.emit(SessionEvent::ServerName(name));
            }
            ServerMsg::Uuid(uuid) => self.emit(SessionEvent::ServerUuid(uuid)),
            ServerMsg::ChannelsList(channels) => {
                self.emit(SessionEvent::ChannelsList(channels));
            }
        }

        Ok(())
    }

    async fn agent_start(&mut self) -> Result<(), SessionError> {
        self.set_agent_connected(true);
        self.caps.reset();
        self.display_config_sent = false;

        self.write_client_msg(ClientMsg::AgentStart { num_tokens: !0 })
            .await?;
        self.announce_caps();
        Ok(())
    }

    fn agent_stopped(&mut self) {
        self.set_agent_connected(false);
    }

    fn set_agent_connected(&mut self, connected: bool) {
        debug!(connected, "agent connected state");
        if connected != self.agent_connected {
            self.agent_connected = connected;
            self.emit(SessionEvent::AgentUpdated { connected });
        }
        if !connected {
            self.reset_agent();
        }
    }

    /// The agent went away: reset everything above the carrier. Queued
    /// chunks survive since the server expects partial multi-chunk
    /// messages to be completed.
    fn reset_agent(&mut self) {
        self.caps.reset();
        self.display_config_sent = false;
        self.reassembler.reset();
        self.queue.fail_waiters();

        // Task cancellation tokens may be caller-owned, so tasks are told
        // the agent is gone instead of being cancelled.
        for entry in self.xfer_tasks.values() {
            let _ = entry.status_tx.send(TaskStatusIn::AgentGone);
        }
        self.forwarder.agent_disconnected();
    }

    fn announce_caps(&mut self) {
        if !self.agent_connected {
            return;
        }

        let msg = AnnounceCapabilities {
            request: !self.caps.received(),
            caps: self.caps.local().words().to_vec(),
        };
        self.enqueue_agent_msg(VD_AGENT_ANNOUNCE_CAPABILITIES, &to_vec(&msg));
    }

    async fn dispatch_agent_msg(&mut self, envelope: AgentEnvelope) -> Result<(), SessionError> {
        let AgentEnvelope { kind, body, .. } = envelope;

        match kind {
            VD_AGENT_ANNOUNCE_CAPABILITIES => {
                let Some(announce) = decode_or_warn::<AnnounceCapabilities>(kind, &body) else {
                    return Ok(());
                };
                self.on_announce_caps(announce).await?;
            }
            VD_AGENT_CLIPBOARD
            | VD_AGENT_CLIPBOARD_GRAB
            | VD_AGENT_CLIPBOARD_REQUEST
            | VD_AGENT_CLIPBOARD_RELEASE => self.on_clipboard_msg(kind, &body),
            VD_AGENT_REPLY => {
                if let Some(reply) = decode_or_warn::<Reply>(kind, &body) {
                    debug!(kind = reply.kind, error = reply.error, "agent reply");
                }
            }
            VD_AGENT_FILE_XFER_STATUS => {
                let Some(status) = decode_or_warn::<FileXferStatus>(kind, &body) else {
                    return Ok(());
                };
                debug!(
                    id = status.id,
                    result = status.result,
                    "file-xfer status from agent"
                );
                match self.xfer_tasks.get(&status.id) {
                    Some(entry) => {
                        let _ = entry.status_tx.send(TaskStatusIn::Agent {
                            result: status.result,
                            extra: status.data,
                        });
                    }
                    None => warn!(id = status.id, "status for unknown transfer task"),
                }
            }
            VD_AGENT_PORT_FORWARD_ACCEPTED => {
                if let Some(msg) = decode_or_warn::<PortForwardAccepted>(kind, &body) {
                    let out = self.forwarder.handle_accepted(msg);
                    self.enqueue_all(out);
                }
            }
            VD_AGENT_PORT_FORWARD_DATA => {
                if let Some(msg) = decode_or_warn::<PortForwardData>(kind, &body) {
                    let out = self.forwarder.handle_data(msg);
                    self.enqueue_all(out);
                }
            }
            VD_AGENT_PORT_FORWARD_ACK => {
                if let Some(msg) = decode_or_warn::<PortForwardAck>(kind, &body) {
                    let out = self.forwarder.handle_ack(msg);
                    self.enqueue_all(out);
                }
            }
            VD_AGENT_PORT_FORWARD_CLOSE => {
                if let Some(msg) = decode_or_warn::<PortForwardClose>(kind, &body) {
                    let out = self.forwarder.handle_close(msg);
                    self.enqueue_all(out);
                }
            }
            VD_AGENT_AUDIO_VOLUME_SYNC => {
                if let Some(msg) = decode_or_warn::<AudioVolumeSync>(kind, &body) {
                    self.emit(SessionEvent::VolumeSync {
                        playback: msg.is_playback,
                        mute: msg.mute,
                        volumes: msg.volumes,
                    });
                }
            }
            other => {
                warn!(
                    kind = other,
                    name = agent_msg_name(other),
                    size = body.len(),
                    "unhandled agent message type"
                );
            }
        }

        Ok(())
    }

    async fn on_announce_caps(
        &mut self,
        announce: AnnounceCapabilities,
    ) -> Result<(), SessionError> {
        self.caps.on_announce(&announce.caps);
        for cap in CapabilitySet::from_words(&announce.caps).iter() {
            debug!(cap, name = agent_cap_name(cap), "agent capability");
        }
        self.emit(SessionEvent::CapsUpdated);
        self.arm_display_timer(Duration::ZERO);

        if announce.request {
            self.announce_caps();
        }

        if self.caps.negotiated(VD_AGENT_CAP_DISPLAY_CONFIG) && !self.display_config_sent {
            self.send_display_config();
            self.display_config_sent = true;
        }

        self.send_max_clipboard();
        self.send_port_redirections().await;
        Ok(())
    }

    fn on_clipboard_msg(&mut self, kind: u32, body: &[u8]) {
        let (selection, payload) = if self.caps.has_remote(VD_AGENT_CAP_CLIPBOARD_SELECTION) {
            if body.len() < 4 {
                warn!(kind, "clipboard message too short for selection prefix");
                return;
            }
            (body[0], &body[4..])
        } else {
            (VD_AGENT_CLIPBOARD_SELECTION_CLIPBOARD, body)
        };

        match kind {
            VD_AGENT_CLIPBOARD => {
                if let Some(msg) = decode_or_warn::<ClipboardData>(kind, payload) {
                    self.emit(SessionEvent::ClipboardData {
                        selection,
                        kind: msg.kind,
                        data: msg.data,
                    });
                }
            }
            VD_AGENT_CLIPBOARD_GRAB => {
                if let Some(msg) = decode_or_warn::<ClipboardGrab>(kind, payload) {
                    self.emit(SessionEvent::ClipboardGrab {
                        selection,
                        types: msg.types,
                    });
                }
            }
            VD_AGENT_CLIPBOARD_REQUEST => {
                if let Some(msg) = decode_or_warn::<ClipboardRequest>(kind, payload) {
                    self.emit(SessionEvent::ClipboardRequest {
                        selection,
                        kind: msg.kind,
                    });
                }
            }
            VD_AGENT_CLIPBOARD_RELEASE => {
                self.emit(SessionEvent::ClipboardRelease { selection });
            }
            _ => unreachable!(),
        }
    }

    async fn handle_command(&mut self, cmd: Command) -> Result<(), SessionError> {
        match cmd {
            Command::CopyFiles {
                paths,
                cancel,
                progress,
                reply,
            } => self.start_copy(paths, cancel, progress, reply),
            Command::ClipboardGrab { selection, types } => {
                let mut w = Writer::new();
                for t in &types {
                    w.put_u32(*t);
                }
                self.send_clipboard_msg(VD_AGENT_CLIPBOARD_GRAB, selection, &w.into_vec());
            }
            Command::ClipboardNotify {
                selection,
                kind,
                data,
            } => {
                if self.max_clipboard >= 0 && data.len() as i64 >= self.max_clipboard {
                    warn!(
                        size = data.len(),
                        max = self.max_clipboard,
                        "clipboard data exceeds max-clipboard, dropping"
                    );
                    return Ok(());
                }
                let body = to_vec(&ClipboardData { kind, data });
                self.send_clipboard_msg(VD_AGENT_CLIPBOARD, selection, &body);
            }
            Command::ClipboardRequest { selection, kind } => {
                let body = to_vec(&ClipboardRequest { kind });
                self.send_clipboard_msg(VD_AGENT_CLIPBOARD_REQUEST, selection, &body);
            }
            Command::ClipboardRelease { selection } => {
                self.send_clipboard_msg(VD_AGENT_CLIPBOARD_RELEASE, selection, &[]);
            }
            Command::VolumeSync {
                playback,
                mute,
                volumes,
            } => {
                if self.agent_connected && self.caps.negotiated(VD_AGENT_CAP_AUDIO_VOLUME_SYNC) {
                    let body = to_vec(&AudioVolumeSync {
                        is_playback: playback,
                        mute,
                        volumes,
                    });
                    self.enqueue_agent_msg(VD_AGENT_AUDIO_VOLUME_SYNC, &body);
                }
            }
            Command::AssociateRemote {
                bind,
                rport,
                host,
                lport,
                reply,
            } => {
                let allowed = self.port_forward_allowed();
                if allowed {
                    let out = self.forwarder.associate_remote(bind, rport, host, lport);
                    self.enqueue_all(out);
                }
                let _ = reply.send(allowed);
            }
            Command::DisassociateRemote { rport, reply } => {
                let mut ok = self.port_forward_allowed();
                if ok {
                    match self.forwarder.disassociate_remote(rport) {
                        Ok(out) => self.enqueue_all(out),
                        Err(()) => ok = false,
                    }
                }
                let _ = reply.send(ok);
            }
            Command::AssociateLocal {
                bind,
                lport,
                host,
                rport,
                reply,
            } => {
                let ok = self.port_forward_allowed()
                    && self.forwarder.associate_local(bind, lport, host, rport).await;
                let _ = reply.send(ok);
            }
            Command::DisassociateLocal { lport, reply } => {
                let ok = self.port_forward_allowed() && self.forwarder.disassociate_local(lport);
                let _ = reply.send(ok);
            }
            Command::UpdateDisplay {
                id,
                x,
                y,
                width,
                height,
                deferred,
            } => {
                if id < MAX_DISPLAY {
                    let display = &mut self.displays[id];
                    display.x = x;
                    display.y = y;
                    display.width = width;
                    display.height = height;
                    self.arm_display_timer(if deferred {
                        DISPLAY_TIMER_DELAY
                    } else {
                        Duration::ZERO
                    });
                }
            }
            Command::UpdateDisplayEnabled {
                id,
                enabled,
                deferred,
            } => {
                if id < MAX_DISPLAY {
                    self.displays[id].enabled = Some(enabled);
                    self.arm_display_timer(if deferred {
                        DISPLAY_TIMER_DELAY
                    } else {
                        Duration::ZERO
                    });
                }
            }
            Command::SendMonitorConfig => self.flush_monitor_config(),
            Command::RequestMouseMode(mode) => {
                debug!(mode, "request mouse mode");
                self.requested_mouse_mode = mode;
                self.write_client_msg(ClientMsg::MouseModeRequest(mode))
                    .await?;
            }
            Command::PowerEventRequest(event) => {
                self.write_client_msg(ClientMsg::PowerEventRequest(event))
                    .await?;
            }
            Command::SetMaxClipboard(max) => {
                if max != self.max_clipboard {
                    self.max_clipboard = max;
                    self.send_max_clipboard();
                }
            }

            Command::XferStart {
                id,
                name,
                size,
                flush,
            } => {
                if let Some(entry) = self.xfer_tasks.get_mut(&id) {
                    entry.size = size;
                    if let Some(op) = self.xfer_ops.get_mut(&entry.op) {
                        op.transfer_size += size;
                    }
                }
                if !self.agent_connected {
                    let _ = flush.send(Err(crate::queue::FlushError::AgentGone));
                    return Ok(());
                }
                let body = to_vec(&FileXferStart {
                    id,
                    manifest: xfer_manifest(&name, size),
                });
                let handle = self.enqueue_agent_msg(VD_AGENT_FILE_XFER_START, &body);
                self.queue.register_flush(handle, flush);
            }
            Command::XferData { id, data, flush } => {
                if !self.agent_connected {
                    let _ = flush.send(Err(crate::queue::FlushError::AgentGone));
                    return Ok(());
                }
                let len = data.len() as u64;
                if let Some(entry) = self.xfer_tasks.get_mut(&id) {
                    entry.sent += len;
                    if let Some(op) = self.xfer_ops.get_mut(&entry.op) {
                        op.total_sent += len;
                    }
                }
                let body = to_vec(&FileXferData { id, data });
                let handle = self.enqueue_agent_msg(VD_AGENT_FILE_XFER_DATA, &body);
                self.queue.register_flush(handle, flush);
            }
            Command::XferProgress { id } => {
                if let Some(entry) = self.xfer_tasks.get(&id) {
                    if let Some(op) = self.xfer_ops.get_mut(&entry.op) {
                        op.emit_progress();
                    }
                }
            }
            Command::XferStatusOut { id, result } => {
                if self.agent_connected {
                    let body = to_vec(&FileXferStatus {
                        id,
                        result,
                        data: Vec::new(),
                    });
                    self.enqueue_agent_msg(VD_AGENT_FILE_XFER_STATUS, &body);
                }
            }
            Command::XferFinished { id, outcome } => self.finish_task(id, outcome),

            Command::ConnOpen { id } => {
                let out = self.forwarder.handle_conn_open(id);
                self.enqueue_all(out);
            }
            Command::ConnConnectFailed { id } => {
                let out = self.forwarder.handle_conn_connect_failed(id);
                self.enqueue_all(out);
            }
            Command::ConnClosed { id } => {
                let out = self.forwarder.handle_conn_closed(id);
                self.enqueue_all(out);
            }
            Command::ConnData { id, data } => {
                let body = to_vec(&PortForwardData { id, data });
                self.enqueue_agent_msg(VD_AGENT_PORT_FORWARD_DATA, &body);
            }
            Command::ConnAck { id, size } => {
                let body = to_vec(&PortForwardAck { id, size });
                self.enqueue_agent_msg(VD_AGENT_PORT_FORWARD_ACK, &body);
            }
            Command::LocalAccepted { lport, stream } => {
                let out = self.forwarder.handle_local_accepted(lport, stream);
                self.enqueue_all(out);
            }
        }

        Ok(())
    }

    fn port_forward_allowed(&self) -> bool {
        self.agent_connected && self.caps.negotiated(VD_AGENT_CAP_PORT_FORWARDING)
    }

    fn enqueue_all(&mut self, out: Vec<(u32, Vec<u8>)>) {
        for (kind, body) in out {
            self.enqueue_agent_msg(kind, &body);
        }
    }

    fn start_copy(
        &mut self,
        paths: Vec<PathBuf>,
        cancel: Option<CancellationToken>,
        progress: Option<ProgressFn>,
        reply: oneshot::Sender<Result<(), CopyError>>,
    ) {
        if !self.agent_connected {
            let _ = reply.send(Err(CopyError::AgentNotConnected));
            return;
        }
        if self.caps.has_remote(VD_AGENT_CAP_FILE_XFER_DISABLED) {
            let _ = reply.send(Err(CopyError::Disabled));
            return;
        }
        if paths.is_empty() {
            let _ = reply.send(Ok(()));
            return;
        }

        let op_id = self.next_op_id;
        self.next_op_id += 1;
        let operation = Operation::new(paths.len() as u32, progress, reply);
        self.xfer_ops.insert(op_id, operation);

        for path in paths {
            let id = self.next_task_id;
            self.next_task_id += 1;

            // Without a shared token every file gets its own, so single
            // tasks can be cancelled without touching their siblings.
            let token = cancel.clone().unwrap_or_default();
            let (status_tx, status_rx) = mpsc::unbounded_channel();

            debug!(id, path = %path.display(), "transfer task created");
            self.xfer_tasks.insert(
                id,
                TaskEntry {
                    op: op_id,
                    status_tx,
                    size: 0,
                    sent: 0,
                },
            );
            self.emit(SessionEvent::NewFileTransfer {
                id,
                path: path.clone(),
                cancel: token.clone(),
            });

            let pump = TaskPump {
                id,
                path,
                cancel: token,
                status: status_rx,
                actor: self.cmd_tx.clone(),
            };
            tokio::spawn(pump.run());
        }
    }

    fn finish_task(&mut self, id: u32, outcome: TaskOutcome) {
        let Some(entry) = self.xfer_tasks.remove(&id) else {
            return;
        };
        let Some(op) = self.xfer_ops.get_mut(&entry.op) else {
            return;
        };

        match outcome {
            TaskOutcome::Success => op.succeed += 1,
            TaskOutcome::Cancelled => {
                op.cancelled += 1;
                op.transfer_size = op
                    .transfer_size
                    .saturating_sub(entry.size.saturating_sub(entry.sent));
            }
            TaskOutcome::Failed(err) => {
                warn!(id, %err, "file transfer task failed");
                op.failed += 1;
                op.transfer_size = op
                    .transfer_size
                    .saturating_sub(entry.size.saturating_sub(entry.sent));
            }
        }

        op.remaining -= 1;
        if op.remaining == 0 {
            if let Some(op) = self.xfer_ops.remove(&entry.op) {
                op.resolve();
            }
        }
    }

    /// Build the selection-prefixed body and enqueue a clipboard message,
    /// honoring the capability gates.
    fn send_clipboard_msg(&mut self, kind: u32, selection: u8, payload: &[u8]) {
        if !self.agent_connected || !self.caps.negotiated(VD_AGENT_CAP_CLIPBOARD_BY_DEMAND) {
            return;
        }

        let mut body = Vec::with_capacity(payload.len() + 4);
        if self.caps.negotiated(VD_AGENT_CAP_CLIPBOARD_SELECTION) {
            body.extend_from_slice(&[selection, 0, 0, 0]);
        } else if selection != VD_AGENT_CLIPBOARD_SELECTION_CLIPBOARD {
            debug!(kind = agent_msg_name(kind), selection, "ignoring clipboard message");
            return;
        }
        body.extend_from_slice(payload);

        self.enqueue_agent_msg(kind, &body);
    }

    fn send_max_clipboard(&mut self) {
        if !self.caps.negotiated(VD_AGENT_CAP_MAX_CLIPBOARD) {
            return;
        }
        let msg = MaxClipboard {
            max: self.max_clipboard.clamp(i32::MIN as i64, i32::MAX as i64) as i32,
        };
        self.enqueue_agent_msg(VD_AGENT_MAX_CLIPBOARD, &to_vec(&msg));
    }

    fn send_display_config(&mut self) {
        let mut config = DisplayConfig { flags: 0, depth: 0 };

        if self.config.disable_wallpaper {
            config.flags |= VD_AGENT_DISPLAY_CONFIG_FLAG_DISABLE_WALLPAPER;
        }
        if self.config.disable_font_smooth {
            config.flags |= VD_AGENT_DISPLAY_CONFIG_FLAG_DISABLE_FONT_SMOOTH;
        }
        if self.config.disable_animation {
            config.flags |= VD_AGENT_DISPLAY_CONFIG_FLAG_DISABLE_ANIMATION;
        }
        if self.config.display_color_depth != 0 {
            config.flags |= VD_AGENT_DISPLAY_CONFIG_FLAG_SET_COLOR_DEPTH;
            config.depth = self.config.display_color_depth;
        }

        debug!(flags = config.flags, depth = config.depth, "display config");
        self.enqueue_agent_msg(VD_AGENT_DISPLAY_CONFIG, &to_vec(&config));
    }

    fn arm_display_timer(&mut self, delay: Duration) {
        self.display_timer = Some(Box::pin(sleep(delay)));
    }

    fn flush_monitor_config(&mut self) {
        if !self.agent_connected || !self.caps.negotiated(VD_AGENT_CAP_MONITORS_CONFIG) {
            return;
        }

        let mut monitors: Vec<MonConfig> = self
            .displays
            .iter()
            .filter(|d| d.width > 0 && d.height > 0 && d.enabled != Some(false))
            .map(|d| MonConfig {
                height: d.height,
                width: d.width,
                depth: 0,
                x: d.x,
                y: d.y,
            })
            .collect();

        if monitors.is_empty() {
            debug!("not sending monitors config, no display has dimensions");
            return;
        }

        if !self.config.disable_display_align {
            align_monitors(&mut monitors);
        }

        let flags = if self.caps.negotiated(VD_AGENT_CAP_MONITORS_CONFIG_POSITION)
            && !self.config.disable_display_position
        {
            VD_AGENT_CONFIG_MONITORS_FLAG_USE_POS
        } else {
            0
        };

        debug!(monitors = monitors.len(), flags, "monitors config");
        let body = to_vec(&MonitorsConfig { flags, monitors });
        self.enqueue_agent_msg(VD_AGENT_MONITORS_CONFIG, &body);
    }

    async fn set_mouse_mode(&mut self, supported: u32, current: u32) -> Result<(), SessionError> {
        if self.mouse_mode != current {
            self.mouse_mode = current;
            self.emit(SessionEvent::MouseModeChanged { current });
        }

        if self.requested_mouse_mode != self.mouse_mode
            && self.requested_mouse_mode & supported != 0
        {
            self.write_client_msg(ClientMsg::MouseModeRequest(self.requested_mouse_mode))
                .await?;
        }
        Ok(())
    }

    async fn send_port_redirections(&mut self) {
        if !self.caps.negotiated(VD_AGENT_CAP_PORT_FORWARDING) {
            return;
        }

        let remote = self.config.redirected_remote_ports.clone();
        for redir in remote {
            debug!(%redir, "replaying remote port redirection");
            let out = self.forwarder.associate_remote(
                redir.bind_address,
                redir.port,
                redir.host,
                redir.host_port,
            );
            self.enqueue_all(out);
        }

        let local = self.config.redirected_local_ports.clone();
        for redir in local {
            debug!(%redir, "replaying local port redirection");
            let bound = self
                .forwarder
                .associate_local(redir.bind_address, redir.port, redir.host, redir.host_port)
                .await;
            if !bound {
                warn!(port = redir.port, "failed to redirect local port");
            }
        }
    }
}

async fn timer_tick(slot: &mut Option<Pin<Box<Sleep>>>) {
    match slot.as_mut() {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

fn decode_or_warn<T: Fragment>(kind: u32, body: &[u8]) -> Option<T> {
    match vdagent_codec::from_slice::<T>(body) {
        Ok(msg) => Some(msg),
        Err(err) => {
            warn!(kind = agent_msg_name(kind), %err, "malformed agent message");
            None
        }
    }
}

/// Left-to-right packing of monitors sorted by their distance from the
/// origin; older peers report every monitor at 0x0.
fn align_monitors(monitors: &mut [MonConfig]) {
    let mut order: Vec<usize> = (0..monitors.len()).collect();
    order.sort_by(|a, b| {
        let da = f64::from(monitors[*a].x).hypot(f64::from(monitors[*a].y));
        let db = f64::from(monitors[*b].x).hypot(f64::from(monitors[*b].y));
        da.total_cmp(&db)
    });

    let mut x = 0i32;
    for idx in order {
        monitors[idx].x = x;
        monitors[idx].y = 0;
        x += monitors[idx].width as i32;
    }
}
