use std::fmt;

use thiserror::Error;

/// Identifier attached to a MIC failure: joins are keyed by DevEUI,
/// data frames by DevAddr.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeId {
    DevEui(u64),
    DevAddr(u32),
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeId::DevEui(eui) => write!(f, "DevEUI {eui:016X}"),
            NodeId::DevAddr(addr) => write!(f, "DevAddr {addr:08X}"),
        }
    }
}

/// Errors returned to the gateway transport. None are fatal to the engine.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("unknown gateway MAC {}", hex::encode(.0))]
    UnknownMac([u8; 8]),

    #[error("unknown DevEUI {0:016X}")]
    UnknownDevEui(u64),

    #[error("unknown DevAddr {0:08X}")]
    UnknownDevAddr(u32),

    #[error("bad MIC from {0}")]
    BadMic(NodeId),

    #[error("unparseable frame ({} bytes)", .0.len())]
    BadFrame(Vec<u8>),

    #[error("FPort 0 with piggybacked FOpts")]
    DoubleFopts,

    #[error("frame counter gap too large: DevAddr {0:08X} FCnt {1:#06X}")]
    FcntGapTooLarge(u32, u16),

    #[error("not allowed")]
    NotAllowed,

    #[error("application error: {0}")]
    App(String),
}
