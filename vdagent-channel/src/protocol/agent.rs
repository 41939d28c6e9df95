//! Agent message bodies and their codecs
//!
//! Bodies are the octets that follow the 20-octet agent header. Clipboard
//! bodies never include the optional selection prefix here; the session
//! strips or prepends it according to the negotiated capabilities.

use vdagent_codec::{Error, Fragment, Reader, Writer};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceCapabilities {
    pub request: bool,
    pub caps: Vec<u32>,
}

impl Fragment for AnnounceCapabilities {
    fn write(&self, w: &mut Writer) {
        w.put_u32(self.request as u32);
        for word in &self.caps {
            w.put_u32(*word);
        }
    }

    fn read(r: &mut Reader) -> Result<Self, Error> {
        let request = r.u32()? != 0;
        let mut caps = Vec::with_capacity(r.remaining() / 4);
        while r.remaining() >= 4 {
            caps.push(r.u32()?);
        }
        Ok(Self { request, caps })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileXferStart {
    pub id: u32,
    /// GLib keyfile blob, nul terminator included.
    pub manifest: Vec<u8>,
}

impl Fragment for FileXferStart {
    fn write(&self, w: &mut Writer) {
        w.put_u32(self.id);
        w.put_bytes(&self.manifest);
    }

    fn read(r: &mut Reader) -> Result<Self, Error> {
        Ok(Self {
            id: r.u32()?,
            manifest: r.rest().to_vec(),
        })
    }
}

/// Render the keyfile manifest the guest expects in `FileXferStart`.
pub fn xfer_manifest(name: &str, size: u64) -> Vec<u8> {
    let escaped: String = name
        .chars()
        .flat_map(|c| match c {
            '\\' => vec!['\\', '\\'],
            '\n' => vec!['\\', 'n'],
            other => vec![other],
        })
        .collect();

    let mut blob = format!("[vdagent-file-xfer]\nname={escaped}\nsize={size}\n").into_bytes();
    blob.push(0);
    blob
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileXferStatus {
    pub id: u32,
    pub result: u32,
    pub data: Vec<u8>,
}

impl Fragment for FileXferStatus {
    fn write(&self, w: &mut Writer) {
        w.put_u32(self.id);
        w.put_u32(self.result);
        w.put_bytes(&self.data);
    }

    fn read(r: &mut Reader) -> Result<Self, Error> {
        Ok(Self {
            id: r.u32()?,
            result: r.u32()?,
            data: r.rest().to_vec(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileXferData {
    pub id: u32,
    pub data: Vec<u8>,
}

impl Fragment for FileXferData {
    fn write(&self, w: &mut Writer) {
        w.put_u32(self.id);
        w.put_u64(self.data.len() as u64);
        w.put_bytes(&self.data);
    }

    fn read(r: &mut Reader) -> Result<Self, Error> {
        let id = r.u32()?;
        let size = r.u64()?;
        let data = r.take(size as usize)?.to_vec();
        Ok(Self { id, data })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortForwardListen {
    pub port: u16,
    pub bind_address: String,
}

impl Fragment for PortForwardListen {
    fn write(&self, w: &mut Writer) {
        w.put_u16(self.port);
        w.put_cstr(&self.bind_address);
    }

    fn read(r: &mut Reader) -> Result<Self, Error> {
        Ok(Self {
            port: r.u16()?,
            bind_address: r.cstr()?.to_string(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortForwardShutdown {
    pub port: u16,
}

impl Fragment for PortForwardShutdown {
    fn write(&self, w: &mut Writer) {
        w.put_u16(self.port);
    }

    fn read(r: &mut Reader) -> Result<Self, Error> {
        Ok(Self { port: r.u16()? })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortForwardAccepted {
    pub id: u32,
    pub port: u16,
    pub ack_interval: u32,
}

impl Fragment for PortForwardAccepted {
    fn write(&self, w: &mut Writer) {
        w.put_u32(self.id);
        w.put_u16(self.port);
        w.put_u32(self.ack_interval);
    }

    fn read(r: &mut Reader) -> Result<Self, Error> {
        Ok(Self {
            id: r.u32()?,
            port: r.u16()?,
            ack_interval: r.u32()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortForwardData {
    pub id: u32,
    pub data: Vec<u8>,
}

impl Fragment for PortForwardData {
    fn write(&self, w: &mut Writer) {
        w.put_u32(self.id);
        w.put_u32(self.data.len() as u32);
        w.put_bytes(&self.data);
    }

    fn read(r: &mut Reader) -> Result<Self, Error> {
        let id = r.u32()?;
        let size = r.u32()?;
        let data = r.take(size as usize)?.to_vec();
        Ok(Self { id, data })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortForwardAck {
    pub id: u32,
    pub size: u32,
}

impl Fragment for PortForwardAck {
    fn write(&self, w: &mut Writer) {
        w.put_u32(self.id);
        w.put_u32(self.size);
    }

    fn read(r: &mut Reader) -> Result<Self, Error> {
        Ok(Self {
            id: r.u32()?,
            size: r.u32()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortForwardClose {
    pub id: u32,
}

impl Fragment for PortForwardClose {
    fn write(&self, w: &mut Writer) {
        w.put_u32(self.id);
    }

    fn read(r: &mut Reader) -> Result<Self, Error> {
        Ok(Self { id: r.u32()? })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayConfig {
    pub flags: u32,
    pub depth: u32,
}

impl Fragment for DisplayConfig {
    fn write(&self, w: &mut Writer) {
        w.put_u32(self.flags);
        w.put_u32(self.depth);
    }

    fn read(r: &mut Reader) -> Result<Self, Error> {
        Ok(Self {
            flags: r.u32()?,
            depth: r.u32()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonConfig {
    pub height: u32,
    pub width: u32,
    pub depth: u32,
    pub x: i32,
    pub y: i32,
}

impl Fragment for MonConfig {
    fn write(&self, w: &mut Writer) {
        w.put_u32(self.height);
        w.put_u32(self.width);
        w.put_u32(self.depth);
        w.put_i32(self.x);
        w.put_i32(self.y);
    }

    fn read(r: &mut Reader) -> Result<Self, Error> {
        Ok(Self {
            height: r.u32()?,
            width: r.u32()?,
            depth: r.u32()?,
            x: r.i32()?,
            y: r.i32()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorsConfig {
    pub flags: u32,
    pub monitors: Vec<MonConfig>,
}

impl Fragment for MonitorsConfig {
    fn write(&self, w: &mut Writer) {
        w.put_u32(self.monitors.len() as u32);
        w.put_u32(self.flags);
        for mon in &self.monitors {
            mon.write(w);
        }
    }

    fn read(r: &mut Reader) -> Result<Self, Error> {
        let num = r.u32()?;
        let flags = r.u32()?;
        let mut monitors = Vec::with_capacity(num as usize);
        for _ in 0..num {
            monitors.push(MonConfig::read(r)?);
        }
        Ok(Self { flags, monitors })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaxClipboard {
    pub max: i32,
}

impl Fragment for MaxClipboard {
    fn write(&self, w: &mut Writer) {
        w.put_i32(self.max);
    }

    fn read(r: &mut Reader) -> Result<Self, Error> {
        Ok(Self { max: r.i32()? })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClipboardGrab {
    pub types: Vec<u32>,
}

impl Fragment for ClipboardGrab {
    fn write(&self, w: &mut Writer) {
        for t in &self.types {
            w.put_u32(*t);
        }
    }

    fn read(r: &mut Reader) -> Result<Self, Error> {
        let mut types = Vec::with_capacity(r.remaining() / 4);
        while r.remaining() >= 4 {
            types.push(r.u32()?);
        }
        Ok(Self { types })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClipboardRequest {
    pub kind: u32,
}

impl Fragment for ClipboardRequest {
    fn write(&self, w: &mut Writer) {
        w.put_u32(self.kind);
    }

    fn read(r: &mut Reader) -> Result<Self, Error> {
        Ok(Self { kind: r.u32()? })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClipboardData {
    pub kind: u32,
    pub data: Vec<u8>,
}

impl Fragment for ClipboardData {
    fn write(&self, w: &mut Writer) {
        w.put_u32(self.kind);
        w.put_bytes(&self.data);
    }

    fn read(r: &mut Reader) -> Result<Self, Error> {
        Ok(Self {
            kind: r.u32()?,
            data: r.rest().to_vec(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioVolumeSync {
    pub is_playback: bool,
    pub mute: bool,
    pub volumes: Vec<u16>,
}

impl Fragment for AudioVolumeSync {
    fn write(&self, w: &mut Writer) {
        w.put_u8(self.is_playback as u8);
        w.put_u8(self.mute as u8);
        w.put_u8(self.volumes.len() as u8);
        for v in &self.volumes {
            w.put_u16(*v);
        }
    }

    fn read(r: &mut Reader) -> Result<Self, Error> {
        let is_playback = r.u8()? != 0;
        let mute = r.u8()? != 0;
        let nchannels = r.u8()?;
        let mut volumes = Vec::with_capacity(nchannels as usize);
        for _ in 0..nchannels {
            volumes.push(r.u16()?);
        }
        Ok(Self {
            is_playback,
            mute,
            volumes,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reply {
    pub kind: u32,
    pub error: u32,
}

impl Fragment for Reply {
    fn write(&self, w: &mut Writer) {
        w.put_u32(self.kind);
        w.put_u32(self.error);
    }

    fn read(r: &mut Reader) -> Result<Self, Error> {
        Ok(Self {
            kind: r.u32()?,
            error: r.u32()?,
        })
    }
}
