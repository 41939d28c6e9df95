//! Capability bitsets advertised by each end of the agent channel

use crate::protocol::{self, VD_AGENT_CAPS_WORDS};

/// Fixed-width capability bitset, one bit per protocol capability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CapabilitySet {
    words: [u32; VD_AGENT_CAPS_WORDS],
}

impl CapabilitySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// The set this client announces to the agent.
    pub fn client_default() -> Self {
        let mut set = Self::new();
        set.set(protocol::VD_AGENT_CAP_MOUSE_STATE);
        set.set(protocol::VD_AGENT_CAP_MONITORS_CONFIG);
        set.set(protocol::VD_AGENT_CAP_REPLY);
        set.set(protocol::VD_AGENT_CAP_DISPLAY_CONFIG);
        set.set(protocol::VD_AGENT_CAP_CLIPBOARD_BY_DEMAND);
        set.set(protocol::VD_AGENT_CAP_CLIPBOARD_SELECTION);
        set.set(protocol::VD_AGENT_CAP_MAX_CLIPBOARD);
        set.set(protocol::VD_AGENT_CAP_AUDIO_VOLUME_SYNC);
        set.set(protocol::VD_AGENT_CAP_PORT_FORWARDING);
        set.set(protocol::VD_AGENT_CAP_MONITORS_CONFIG_POSITION);
        set.set(protocol::VD_AGENT_CAP_FILE_XFER_DETAILED_ERRORS);
        set
    }

    /// Build from received words, ignoring anything past the known width.
    pub fn from_words(words: &[u32]) -> Self {
        let mut set = Self::new();
        for (slot, word) in set.words.iter_mut().zip(words) {
            *slot = *word;
        }
        set
    }

    pub fn words(&self) -> &[u32] {
        &self.words
    }

    pub fn set(&mut self, cap: u32) {
        let word = (cap / 32) as usize;
        if word < self.words.len() {
            self.words[word] |= 1 << (cap % 32);
        }
    }

    pub fn has(&self, cap: u32) -> bool {
        let word = (cap / 32) as usize;
        word < self.words.len() && self.words[word] & (1 << (cap % 32)) != 0
    }

    /// Bits that are set, lowest first.
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        (0..(self.words.len() as u32 * 32)).filter(|cap| self.has(*cap))
    }
}

/// Local and remote capability state for one agent connection.
#[derive(Debug, Default)]
pub struct Capabilities {
    local: CapabilitySet,
    remote: CapabilitySet,
    received: bool,
}

impl Capabilities {
    pub fn new(local: CapabilitySet) -> Self {
        Self {
            local,
            remote: CapabilitySet::new(),
            received: false,
        }
    }

    pub fn local(&self) -> &CapabilitySet {
        &self.local
    }

    pub fn received(&self) -> bool {
        self.received
    }

    /// Record the peer's announcement.
    pub fn on_announce(&mut self, words: &[u32]) {
        self.remote = CapabilitySet::from_words(words);
        self.received = true;
    }

    /// Whether the peer advertised a capability. Always false before the
    /// first announcement arrives.
    pub fn has_remote(&self, cap: u32) -> bool {
        self.received && self.remote.has(cap)
    }

    /// A capability is negotiated when both ends advertise it.
    pub fn negotiated(&self, cap: u32) -> bool {
        self.has_remote(cap) && self.local.has(cap)
    }

    /// Forget the peer's announcement, e.g. on agent reconnect.
    pub fn reset(&mut self) {
        self.remote = CapabilitySet::new();
        self.received = false;
    }
}
