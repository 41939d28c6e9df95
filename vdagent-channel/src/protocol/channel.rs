//! Main-channel carrier messages wrapping the agent sub-protocol

use vdagent_codec::{Error, Fragment, Reader, Writer};

// server to client
pub const SPICE_MSG_MAIN_INIT: u16 = 103;
pub const SPICE_MSG_MAIN_CHANNELS_LIST: u16 = 104;
pub const SPICE_MSG_MAIN_MOUSE_MODE: u16 = 105;
pub const SPICE_MSG_MAIN_MULTI_MEDIA_TIME: u16 = 106;
pub const SPICE_MSG_MAIN_AGENT_CONNECTED: u16 = 107;
pub const SPICE_MSG_MAIN_AGENT_DISCONNECTED: u16 = 108;
pub const SPICE_MSG_MAIN_AGENT_DATA: u16 = 109;
pub const SPICE_MSG_MAIN_AGENT_TOKEN: u16 = 110;
pub const SPICE_MSG_MAIN_NAME: u16 = 118;
pub const SPICE_MSG_MAIN_UUID: u16 = 119;
pub const SPICE_MSG_MAIN_AGENT_CONNECTED_TOKENS: u16 = 120;

// client to server
pub const SPICE_MSGC_MAIN_ATTACH_CHANNELS: u16 = 104;
pub const SPICE_MSGC_MAIN_MOUSE_MODE_REQUEST: u16 = 105;
pub const SPICE_MSGC_MAIN_AGENT_START: u16 = 106;
pub const SPICE_MSGC_MAIN_AGENT_DATA: u16 = 107;
pub const SPICE_MSGC_MAIN_POWER_EVENT_REQUEST: u16 = 113;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MainInit {
    pub session_id: u32,
    pub supported_mouse_modes: u32,
    pub current_mouse_mode: u32,
    pub agent_connected: bool,
    pub agent_tokens: u32,
    pub multi_media_time: u32,
    pub ram_hint: u32,
}

impl Fragment for MainInit {
    fn write(&self, w: &mut Writer) {
        w.put_u32(self.session_id);
        w.put_u32(self.supported_mouse_modes);
        w.put_u32(self.current_mouse_mode);
        w.put_u32(self.agent_connected as u32);
        w.put_u32(self.agent_tokens);
        w.put_u32(self.multi_media_time);
        w.put_u32(self.ram_hint);
    }

    fn read(r: &mut Reader) -> Result<Self, Error> {
        Ok(Self {
            session_id: r.u32()?,
            supported_mouse_modes: r.u32()?,
            current_mouse_mode: r.u32()?,
            agent_connected: r.u32()? != 0,
            agent_tokens: r.u32()?,
            multi_media_time: r.u32()?,
            ram_hint: r.u32()?,
        })
    }
}

/// Messages received from the server on the main channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMsg {
    Init(MainInit),
    ChannelsList(Vec<(u8, u8)>),
    MouseMode { supported: u32, current: u32 },
    MultiMediaTime(u32),
    AgentConnected,
    AgentDisconnected,
    AgentData(Vec<u8>),
    AgentToken(u32),
    Name(String),
    Uuid([u8; 16]),
    AgentConnectedTokens(u32),
}

impl ServerMsg {
    /// Decode a frame body by kind. Unknown kinds yield `None` so the
    /// session can log and drop them.
    pub fn decode(kind: u16, body: &[u8]) -> Result<Option<Self>, Error> {
        let mut r = Reader::new(body);

        let msg = match kind {
            SPICE_MSG_MAIN_INIT => Self::Init(MainInit::read(&mut r)?),
            SPICE_MSG_MAIN_CHANNELS_LIST => {
                let num = r.u32()?;
                let mut channels = Vec::with_capacity(num as usize);
                for _ in 0..num {
                    channels.push((r.u8()?, r.u8()?));
                }
                Self::ChannelsList(channels)
            }
            SPICE_MSG_MAIN_MOUSE_MODE => Self::MouseMode {
                supported: r.u32()?,
                current: r.u32()?,
            },
            SPICE_MSG_MAIN_MULTI_MEDIA_TIME => Self::MultiMediaTime(r.u32()?),
            SPICE_MSG_MAIN_AGENT_CONNECTED => Self::AgentConnected,
            SPICE_MSG_MAIN_AGENT_DISCONNECTED => Self::AgentDisconnected,
            SPICE_MSG_MAIN_AGENT_DATA => Self::AgentData(r.rest().to_vec()),
            SPICE_MSG_MAIN_AGENT_TOKEN => Self::AgentToken(r.u32()?),
            SPICE_MSG_MAIN_NAME => {
                let len = r.u32()?;
                let raw = r.take(len as usize)?;
                let name = String::from_utf8(raw.to_vec()).map_err(|_| Error::InvalidUtf8)?;
                Self::Name(name)
            }
            SPICE_MSG_MAIN_UUID => {
                let raw = r.take(16)?;
                let mut uuid = [0u8; 16];
                uuid.copy_from_slice(raw);
                Self::Uuid(uuid)
            }
            SPICE_MSG_MAIN_AGENT_CONNECTED_TOKENS => Self::AgentConnectedTokens(r.u32()?),
            _ => return Ok(None),
        };

        Ok(Some(msg))
    }
}

/// Messages the client writes to the server on the main channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMsg {
    AttachChannels,
    MouseModeRequest(u32),
    AgentStart { num_tokens: u32 },
    AgentData(Vec<u8>),
    PowerEventRequest(u32),
}

impl ClientMsg {
    pub fn kind(&self) -> u16 {
        match self {
            Self::AttachChannels => SPICE_MSGC_MAIN_ATTACH_CHANNELS,
            Self::MouseModeRequest(..) => SPICE_MSGC_MAIN_MOUSE_MODE_REQUEST,
            Self::AgentStart { .. } => SPICE_MSGC_MAIN_AGENT_START,
            Self::AgentData(..) => SPICE_MSGC_MAIN_AGENT_DATA,
            Self::PowerEventRequest(..) => SPICE_MSGC_MAIN_POWER_EVENT_REQUEST,
        }
    }

    pub fn body(&self) -> Vec<u8> {
        let mut w = Writer::new();
        match self {
            Self::AttachChannels => {}
            Self::MouseModeRequest(mode) => w.put_u32(*mode),
            Self::AgentStart { num_tokens } => w.put_u32(*num_tokens),
            Self::AgentData(data) => w.put_bytes(data),
            Self::PowerEventRequest(event) => w.put_u32(*event),
        }
        w.into_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vdagent_codec::to_vec;

    #[test]
    fn init_roundtrip() {
        let init = MainInit {
            session_id: 42,
            supported_mouse_modes: 3,
            current_mouse_mode: 1,
            agent_connected: true,
            agent_tokens: 10,
            multi_media_time: 99,
            ram_hint: 0,
        };

        let decoded = ServerMsg::decode(SPICE_MSG_MAIN_INIT, &to_vec(&init)).unwrap();

        assert_eq!(decoded, Some(ServerMsg::Init(init)));
    }

    #[test]
    fn unknown_kind_is_none() {
        assert_eq!(ServerMsg::decode(9999, &[]).unwrap(), None);
    }

    #[test]
    fn name_is_length_prefixed() {
        let mut body = 4u32.to_le_bytes().to_vec();
        body.extend_from_slice(b"host");

        let decoded = ServerMsg::decode(SPICE_MSG_MAIN_NAME, &body).unwrap();

        assert_eq!(decoded, Some(ServerMsg::Name("host".to_string())));
    }
}
