//! Message numbers and the attach-specific request payloads.

use vigil_executor::pty::WindowSize;

use crate::wire::{Cursor, Put};
use crate::AttachError;

pub const MSG_DISCONNECT: u8 = 1;
pub const MSG_IGNORE: u8 = 2;
pub const MSG_UNIMPLEMENTED: u8 = 3;
pub const MSG_DEBUG: u8 = 4;
pub const MSG_SERVICE_REQUEST: u8 = 5;
pub const MSG_SERVICE_ACCEPT: u8 = 6;
pub const MSG_KEXINIT: u8 = 20;
pub const MSG_NEWKEYS: u8 = 21;
pub const MSG_KEX_ECDH_INIT: u8 = 30;
pub const MSG_KEX_ECDH_REPLY: u8 = 31;
pub const MSG_USERAUTH_REQUEST: u8 = 50;
pub const MSG_USERAUTH_FAILURE: u8 = 51;
pub const MSG_USERAUTH_SUCCESS: u8 = 52;
pub const MSG_USERAUTH_PK_OK: u8 = 60;
pub const MSG_GLOBAL_REQUEST: u8 = 80;
pub const MSG_REQUEST_SUCCESS: u8 = 81;
pub const MSG_REQUEST_FAILURE: u8 = 82;
pub const MSG_CHANNEL_OPEN: u8 = 90;
pub const MSG_CHANNEL_OPEN_CONFIRMATION: u8 = 91;
pub const MSG_CHANNEL_OPEN_FAILURE: u8 = 92;
pub const MSG_CHANNEL_WINDOW_ADJUST: u8 = 93;
pub const MSG_CHANNEL_DATA: u8 = 94;
pub const MSG_CHANNEL_EXTENDED_DATA: u8 = 95;
pub const MSG_CHANNEL_EOF: u8 = 96;
pub const MSG_CHANNEL_CLOSE: u8 = 97;
pub const MSG_CHANNEL_REQUEST: u8 = 98;
pub const MSG_CHANNEL_SUCCESS: u8 = 99;
pub const MSG_CHANNEL_FAILURE: u8 = 100;

/// Extended data type code for stderr.
pub const EXTENDED_DATA_STDERR: u32 = 1;

pub const ATTACH_CHANNEL: &str = "attach";
pub const CONTAINERS_REQ: &str = "container-ids";
pub const WINDOW_CHANGE_REQ: &str = "window-change";
pub const SIGNAL_REQ: &str = "signal";
pub const CLOSE_STDIN_REQ: &str = "close-stdin";

/// Reason codes for a refused channel open (RFC 4254 section 5.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenFailure {
    Prohibited,
    ConnectFailed,
    UnknownChannelType,
    ResourceShortage,
    Other(u32),
}

impl OpenFailure {
    pub fn code(self) -> u32 {
        match self {
            OpenFailure::Prohibited => 1,
            OpenFailure::ConnectFailed => 2,
            OpenFailure::UnknownChannelType => 3,
            OpenFailure::ResourceShortage => 4,
            OpenFailure::Other(code) => code,
        }
    }
}

impl From<u32> for OpenFailure {
    fn from(code: u32) -> Self {
        match code {
            1 => OpenFailure::Prohibited,
            2 => OpenFailure::ConnectFailed,
            3 => OpenFailure::UnknownChannelType,
            4 => OpenFailure::ResourceShortage,
            other => OpenFailure::Other(other),
        }
    }
}

/// Reply to `container-ids`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ContainersMsg {
    pub ids: Vec<String>,
}

impl ContainersMsg {
    pub fn marshal(&self) -> Vec<u8> {
        let ids: Vec<&str> = self.ids.iter().map(String::as_str).collect();
        let mut out = Vec::new();
        out.put_name_list(&ids);
        out
    }

    pub fn unmarshal(payload: &[u8]) -> Result<Self, AttachError> {
        Ok(Self {
            ids: Cursor::new(payload).name_list()?,
        })
    }
}

pub fn marshal_window_change(size: WindowSize) -> Vec<u8> {
    let mut out = Vec::new();
    for v in [size.columns, size.rows, size.width_px, size.height_px] {
        out.put_u32(v as u32);
    }
    out
}

pub fn unmarshal_window_change(payload: &[u8]) -> Result<WindowSize, AttachError> {
    let mut c = Cursor::new(payload);
    let mut dim = || -> Result<u16, AttachError> {
        let v = c.u32()?;
        u16::try_from(v).map_err(|_| AttachError::protocol(format!("window dimension {} out of range", v)))
    };
    Ok(WindowSize {
        columns: dim()?,
        rows: dim()?,
        width_px: dim()?,
        height_px: dim()?,
    })
}

/// Signal name without the `SIG` prefix.
pub fn marshal_signal(name: &str) -> Vec<u8> {
    let mut out = Vec::new();
    out.put_string(name.as_bytes());
    out
}

pub fn unmarshal_signal(payload: &[u8]) -> Result<String, AttachError> {
    Cursor::new(payload).utf8()
}
