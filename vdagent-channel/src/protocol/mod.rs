//! Wire constants and message types shared with the guest agent
//!
//! Every numeric value in this module is a protocol constant and must match
//! the agent bit-for-bit.

pub mod agent;
pub mod channel;

/// Protocol version carried in every agent message header.
pub const VD_AGENT_PROTOCOL: u32 = 1;

/// Maximum transport-level length of one carrier chunk.
pub const VD_AGENT_MAX_DATA_SIZE: usize = 2048;

/// Octets of the agent message header: protocol, type, opaque, size.
pub const AGENT_HEADER_LEN: usize = 20;

/// Number of `u32` words in a capability bitset.
pub const VD_AGENT_CAPS_WORDS: usize = 1;

// agent message types
pub const VD_AGENT_MOUSE_STATE: u32 = 1;
pub const VD_AGENT_MONITORS_CONFIG: u32 = 2;
pub const VD_AGENT_REPLY: u32 = 3;
pub const VD_AGENT_CLIPBOARD: u32 = 4;
pub const VD_AGENT_DISPLAY_CONFIG: u32 = 5;
pub const VD_AGENT_ANNOUNCE_CAPABILITIES: u32 = 6;
pub const VD_AGENT_CLIPBOARD_GRAB: u32 = 7;
pub const VD_AGENT_CLIPBOARD_REQUEST: u32 = 8;
pub const VD_AGENT_CLIPBOARD_RELEASE: u32 = 9;
pub const VD_AGENT_FILE_XFER_START: u32 = 10;
pub const VD_AGENT_FILE_XFER_STATUS: u32 = 11;
pub const VD_AGENT_FILE_XFER_DATA: u32 = 12;
pub const VD_AGENT_CLIENT_DISCONNECTED: u32 = 13;
pub const VD_AGENT_MAX_CLIPBOARD: u32 = 14;
pub const VD_AGENT_AUDIO_VOLUME_SYNC: u32 = 15;
pub const VD_AGENT_PORT_FORWARD_LISTEN: u32 = 16;
pub const VD_AGENT_PORT_FORWARD_ACCEPTED: u32 = 17;
pub const VD_AGENT_PORT_FORWARD_DATA: u32 = 18;
pub const VD_AGENT_PORT_FORWARD_ACK: u32 = 19;
pub const VD_AGENT_PORT_FORWARD_CLOSE: u32 = 20;
pub const VD_AGENT_PORT_FORWARD_SHUTDOWN: u32 = 21;

// agent capability bits
pub const VD_AGENT_CAP_MOUSE_STATE: u32 = 0;
pub const VD_AGENT_CAP_MONITORS_CONFIG: u32 = 1;
pub const VD_AGENT_CAP_REPLY: u32 = 2;
pub const VD_AGENT_CAP_CLIPBOARD: u32 = 3;
pub const VD_AGENT_CAP_DISPLAY_CONFIG: u32 = 4;
pub const VD_AGENT_CAP_CLIPBOARD_BY_DEMAND: u32 = 5;
pub const VD_AGENT_CAP_CLIPBOARD_SELECTION: u32 = 6;
pub const VD_AGENT_CAP_SPARSE_MONITORS_CONFIG: u32 = 7;
pub const VD_AGENT_CAP_GUEST_LINEEND_LF: u32 = 8;
pub const VD_AGENT_CAP_GUEST_LINEEND_CRLF: u32 = 9;
pub const VD_AGENT_CAP_MAX_CLIPBOARD: u32 = 10;
pub const VD_AGENT_CAP_AUDIO_VOLUME_SYNC: u32 = 11;
pub const VD_AGENT_CAP_PORT_FORWARDING: u32 = 12;
pub const VD_AGENT_CAP_MONITORS_CONFIG_POSITION: u32 = 13;
pub const VD_AGENT_CAP_FILE_XFER_DISABLED: u32 = 14;
pub const VD_AGENT_CAP_FILE_XFER_DETAILED_ERRORS: u32 = 15;

// clipboard selections, first octet of the 4-octet selection prefix
pub const VD_AGENT_CLIPBOARD_SELECTION_CLIPBOARD: u8 = 0;
pub const VD_AGENT_CLIPBOARD_SELECTION_PRIMARY: u8 = 1;
pub const VD_AGENT_CLIPBOARD_SELECTION_SECONDARY: u8 = 2;

// file transfer status codes; zero means "go ahead and send data"
pub const VD_AGENT_FILE_XFER_STATUS_CAN_SEND_DATA: u32 = 0;
pub const VD_AGENT_FILE_XFER_STATUS_CANCELLED: u32 = 1;
pub const VD_AGENT_FILE_XFER_STATUS_ERROR: u32 = 2;
pub const VD_AGENT_FILE_XFER_STATUS_SUCCESS: u32 = 3;
pub const VD_AGENT_FILE_XFER_STATUS_NOT_ENOUGH_SPACE: u32 = 4;
pub const VD_AGENT_FILE_XFER_STATUS_SESSION_LOCKED: u32 = 5;
pub const VD_AGENT_FILE_XFER_STATUS_VDAGENT_NOT_CONNECTED: u32 = 6;
pub const VD_AGENT_FILE_XFER_STATUS_DISABLED: u32 = 7;

// display config flags
pub const VD_AGENT_DISPLAY_CONFIG_FLAG_DISABLE_WALLPAPER: u32 = 1 << 0;
pub const VD_AGENT_DISPLAY_CONFIG_FLAG_DISABLE_FONT_SMOOTH: u32 = 1 << 1;
pub const VD_AGENT_DISPLAY_CONFIG_FLAG_DISABLE_ANIMATION: u32 = 1 << 2;
pub const VD_AGENT_DISPLAY_CONFIG_FLAG_SET_COLOR_DEPTH: u32 = 1 << 3;

// monitors config flags
pub const VD_AGENT_CONFIG_MONITORS_FLAG_USE_POS: u32 = 1 << 0;

// mouse modes
pub const SPICE_MOUSE_MODE_SERVER: u32 = 1;
pub const SPICE_MOUSE_MODE_CLIENT: u32 = 2;

// power events
pub const SPICE_POWER_EVENT_POWERDOWN: u32 = 1;
pub const SPICE_POWER_EVENT_RESET: u32 = 2;
pub const SPICE_POWER_EVENT_SHUTDOWN: u32 = 3;

/// Human-readable name of an agent message type, for logging.
pub fn agent_msg_name(kind: u32) -> &'static str {
    match kind {
        VD_AGENT_MOUSE_STATE => "mouse state",
        VD_AGENT_MONITORS_CONFIG => "monitors config",
        VD_AGENT_REPLY => "reply",
        VD_AGENT_CLIPBOARD => "clipboard",
        VD_AGENT_DISPLAY_CONFIG => "display config",
        VD_AGENT_ANNOUNCE_CAPABILITIES => "announce caps",
        VD_AGENT_CLIPBOARD_GRAB => "clipboard grab",
        VD_AGENT_CLIPBOARD_REQUEST => "clipboard request",
        VD_AGENT_CLIPBOARD_RELEASE => "clipboard release",
        VD_AGENT_FILE_XFER_START => "file-xfer start",
        VD_AGENT_FILE_XFER_STATUS => "file-xfer status",
        VD_AGENT_FILE_XFER_DATA => "file-xfer data",
        VD_AGENT_CLIENT_DISCONNECTED => "client disconnected",
        VD_AGENT_MAX_CLIPBOARD => "max-clipboard",
        VD_AGENT_AUDIO_VOLUME_SYNC => "volume-sync",
        VD_AGENT_PORT_FORWARD_LISTEN => "port-forward listen",
        VD_AGENT_PORT_FORWARD_ACCEPTED => "port-forward accepted",
        VD_AGENT_PORT_FORWARD_DATA => "port-forward data",
        VD_AGENT_PORT_FORWARD_ACK => "port-forward ack",
        VD_AGENT_PORT_FORWARD_CLOSE => "port-forward close",
        VD_AGENT_PORT_FORWARD_SHUTDOWN => "port-forward shutdown",
        _ => "?",
    }
}

/// Human-readable name of an agent capability bit, for logging.
pub fn agent_cap_name(cap: u32) -> &'static str {
    match cap {
        VD_AGENT_CAP_MOUSE_STATE => "mouse state",
        VD_AGENT_CAP_MONITORS_CONFIG => "monitors config",
        VD_AGENT_CAP_REPLY => "reply",
        VD_AGENT_CAP_CLIPBOARD => "clipboard (old)",
        VD_AGENT_CAP_DISPLAY_CONFIG => "display config",
        VD_AGENT_CAP_CLIPBOARD_BY_DEMAND => "clipboard",
        VD_AGENT_CAP_CLIPBOARD_SELECTION => "clipboard selection",
        VD_AGENT_CAP_SPARSE_MONITORS_CONFIG => "sparse monitors",
        VD_AGENT_CAP_GUEST_LINEEND_LF => "line-end lf",
        VD_AGENT_CAP_GUEST_LINEEND_CRLF => "line-end crlf",
        VD_AGENT_CAP_MAX_CLIPBOARD => "max-clipboard",
        VD_AGENT_CAP_AUDIO_VOLUME_SYNC => "volume-sync",
        VD_AGENT_CAP_PORT_FORWARDING => "port-forwarding",
        VD_AGENT_CAP_MONITORS_CONFIG_POSITION => "monitors config position",
        VD_AGENT_CAP_FILE_XFER_DISABLED => "file transfer disabled",
        VD_AGENT_CAP_FILE_XFER_DETAILED_ERRORS => "file transfer detailed errors",
        _ => "?",
    }
}
