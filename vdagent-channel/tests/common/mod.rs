//! Scripted guest-side harness driving a session over loopback TCP
#![allow(dead_code)]

use std::collections::VecDeque;

use tokio::net::TcpListener;
use tokio::time::{timeout, timeout_at, Duration, Instant};

use vdagent_channel::bearer::{Bearer, FrameBuffer};
use vdagent_channel::config::SessionConfig;
use vdagent_channel::framer::{encode_chunks, AgentEnvelope, Reassembler};
use vdagent_channel::protocol::agent::{AnnounceCapabilities, FileXferStatus};
use vdagent_channel::protocol::channel::*;
use vdagent_channel::protocol::*;
use vdagent_channel::session::{self, RunningSession, SessionEvent};
use vdagent_codec::to_vec;

const WAIT: Duration = Duration::from_secs(5);

/// The far end of the main channel: reads client frames, reassembles
/// agent messages, and scripts the server/agent side of the dialogue.
pub struct FakeGuest {
    buf: FrameBuffer,
    reasm: Reassembler,
    pending: VecDeque<AgentEnvelope>,
    frames: Vec<(u16, Vec<u8>)>,
}

impl FakeGuest {
    /// Start a session against a loopback listener and accept its bearer.
    pub async fn start(config: SessionConfig) -> (FakeGuest, RunningSession) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = Bearer::connect_tcp(addr).await.unwrap();
        let running = session::start(client, config);

        let (bearer, _) = Bearer::accept_tcp(&listener).await.unwrap();
        let guest = FakeGuest {
            buf: FrameBuffer::new(bearer),
            reasm: Reassembler::default(),
            pending: VecDeque::new(),
            frames: Vec::new(),
        };

        (guest, running)
    }

    pub async fn write_frame(&mut self, kind: u16, body: &[u8]) {
        self.buf.write_frame(kind, body).await.unwrap();
    }

    pub async fn send_init(&mut self, tokens: u32, agent_connected: bool) {
        let init = MainInit {
            session_id: 1,
            supported_mouse_modes: SPICE_MOUSE_MODE_SERVER | SPICE_MOUSE_MODE_CLIENT,
            current_mouse_mode: SPICE_MOUSE_MODE_SERVER,
            agent_connected,
            agent_tokens: tokens,
            multi_media_time: 0,
            ram_hint: 0,
        };
        self.write_frame(SPICE_MSG_MAIN_INIT, &to_vec(&init)).await;
    }

    pub async fn send_tokens(&mut self, n: u32) {
        self.write_frame(SPICE_MSG_MAIN_AGENT_TOKEN, &n.to_le_bytes())
            .await;
    }

    /// Send one logical agent message, chunked the way the server relays
    /// agent traffic.
    pub async fn send_agent_msg(&mut self, kind: u32, body: &[u8]) {
        for chunk in encode_chunks(kind, body) {
            self.write_frame(SPICE_MSG_MAIN_AGENT_DATA, &chunk).await;
        }
    }

    pub async fn send_caps(&mut self, request: bool, caps: &[u32]) {
        let msg = AnnounceCapabilities {
            request,
            caps: caps.to_vec(),
        };
        self.send_agent_msg(VD_AGENT_ANNOUNCE_CAPABILITIES, &to_vec(&msg))
            .await;
    }

    pub async fn send_xfer_status(&mut self, id: u32, result: u32) {
        let msg = FileXferStatus {
            id,
            result,
            data: Vec::new(),
        };
        self.send_agent_msg(VD_AGENT_FILE_XFER_STATUS, &to_vec(&msg))
            .await;
    }

    /// Next reassembled agent message, or `None` after `wait` of silence.
    /// Non-agent frames seen along the way are stashed for
    /// [`FakeGuest::expect_frame`].
    pub async fn try_recv_agent_msg(&mut self, wait: Duration) -> Option<AgentEnvelope> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(envelope) = self.pending.pop_front() {
                return Some(envelope);
            }

            let (kind, body) = match timeout_at(deadline, self.buf.read_frame()).await {
                Ok(frame) => frame.unwrap(),
                Err(_) => return None,
            };

            if kind == SPICE_MSGC_MAIN_AGENT_DATA {
                self.pending.extend(self.reasm.feed(&body).unwrap());
            } else {
                self.frames.push((kind, body));
            }
        }
    }

    pub async fn recv_agent_msg(&mut self) -> AgentEnvelope {
        self.try_recv_agent_msg(WAIT)
            .await
            .expect("timed out waiting for an agent message")
    }

    /// Next agent message of the given type, skipping others.
    pub async fn expect_agent_msg(&mut self, kind: u32) -> AgentEnvelope {
        timeout(WAIT, async {
            loop {
                let envelope = self.recv_agent_msg().await;
                if envelope.kind == kind {
                    return envelope;
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for agent message {kind}"))
    }

    /// Next channel frame of the given kind, stashing agent data seen
    /// along the way.
    pub async fn expect_frame(&mut self, kind: u16) -> Vec<u8> {
        timeout(WAIT, async {
            loop {
                if let Some(pos) = self.frames.iter().position(|(k, _)| *k == kind) {
                    return self.frames.remove(pos).1;
                }

                let (k, body) = self.buf.read_frame().await.unwrap();
                if k == SPICE_MSGC_MAIN_AGENT_DATA {
                    self.pending.extend(self.reasm.feed(&body).unwrap());
                } else {
                    self.frames.push((k, body));
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for channel frame {kind}"))
    }
}

/// Drive the connect handshake up to a completed capability exchange.
/// Returns only after the session has applied the agent's capabilities,
/// so capability-gated calls are safe immediately.
pub async fn connect_with_caps(
    config: SessionConfig,
    tokens: u32,
    caps: &[u32],
) -> (FakeGuest, RunningSession) {
    let (mut guest, mut running) = FakeGuest::start(config).await;

    guest.send_init(tokens, true).await;
    guest.expect_frame(SPICE_MSGC_MAIN_AGENT_START).await;
    guest
        .expect_agent_msg(VD_AGENT_ANNOUNCE_CAPABILITIES)
        .await;
    guest.send_caps(false, caps).await;
    expect_event(&mut running, |e| matches!(e, SessionEvent::CapsUpdated)).await;

    (guest, running)
}

/// Capability words with the given bits set.
pub fn caps_words(bits: &[u32]) -> Vec<u32> {
    let mut words = vec![0u32; VD_AGENT_CAPS_WORDS];
    for bit in bits {
        words[(bit / 32) as usize] |= 1 << (bit % 32);
    }
    words
}

/// Next session event matching the predicate, skipping others.
pub async fn expect_event(
    running: &mut RunningSession,
    pred: impl Fn(&SessionEvent) -> bool,
) -> SessionEvent {
    timeout(WAIT, async {
        loop {
            let event = running
                .events
                .recv()
                .await
                .expect("session event stream closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for a session event")
}
