pub mod crypto;
pub mod encoder;

use std::fmt;

use crate::error::Error;

/// LoRaWAN MAC Header (MHDR) - Message Type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MType {
    JoinRequest,
    JoinAccept,
    UnconfirmedDataUp,
    UnconfirmedDataDown,
    ConfirmedDataUp,
    ConfirmedDataDown,
    Rfu,
    Proprietary,
}

impl MType {
    /// The three MType bits, already shifted into MHDR position.
    pub fn mhdr(&self) -> u8 {
        let bits: u8 = match self {
            MType::JoinRequest => 0b000,
            MType::JoinAccept => 0b001,
            MType::UnconfirmedDataUp => 0b010,
            MType::UnconfirmedDataDown => 0b011,
            MType::ConfirmedDataUp => 0b100,
            MType::ConfirmedDataDown => 0b101,
            MType::Rfu => 0b110,
            MType::Proprietary => 0b111,
        };
        bits << 5
    }

    pub fn is_uplink(&self) -> bool {
        matches!(self, MType::UnconfirmedDataUp | MType::ConfirmedDataUp)
    }

    pub fn is_downlink(&self) -> bool {
        matches!(self, MType::UnconfirmedDataDown | MType::ConfirmedDataDown)
    }

    /// Direction byte for the B_0/A_i blocks: the low MType bit.
    pub fn dir(&self) -> u8 {
        (self.mhdr() >> 5) & 0x01
    }
}

impl From<u8> for MType {
    fn from(value: u8) -> Self {
        match (value >> 5) & 0x07 {
            0b000 => MType::JoinRequest,
            0b001 => MType::JoinAccept,
            0b010 => MType::UnconfirmedDataUp,
            0b011 => MType::UnconfirmedDataDown,
            0b100 => MType::ConfirmedDataUp,
            0b101 => MType::ConfirmedDataDown,
            0b110 => MType::Rfu,
            _ => MType::Proprietary,
        }
    }
}

impl fmt::Display for MType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MType::JoinRequest => write!(f, "JoinRequest"),
            MType::JoinAccept => write!(f, "JoinAccept"),
            MType::UnconfirmedDataUp => write!(f, "UnconfirmedDataUp"),
            MType::UnconfirmedDataDown => write!(f, "UnconfirmedDataDown"),
            MType::ConfirmedDataUp => write!(f, "ConfirmedDataUp"),
            MType::ConfirmedDataDown => write!(f, "ConfirmedDataDown"),
            MType::Rfu => write!(f, "RFU"),
            MType::Proprietary => write!(f, "Proprietary"),
        }
    }
}

/// Frame Control byte (FCtrl)
///
/// Bit 4 is ADRACKReq on uplinks and FPending on downlinks; both flags are
/// kept so one struct serves both directions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FCtrl {
    pub adr: bool,
    pub adr_ack_req: bool,
    pub ack: bool,
    pub f_pending: bool,
    pub f_opts_len: u8,
}

impl FCtrl {
    pub fn from_byte(byte: u8) -> Self {
        Self {
            adr: (byte & 0x80) != 0,
            adr_ack_req: (byte & 0x40) != 0,
            ack: (byte & 0x20) != 0,
            f_pending: (byte & 0x10) != 0,
            f_opts_len: byte & 0x0f,
        }
    }

    pub fn to_byte(self) -> u8 {
        let mut byte = self.f_opts_len & 0x0f;
        if self.adr {
            byte |= 0x80;
        }
        if self.adr_ack_req {
            byte |= 0x40;
        }
        if self.ack {
            byte |= 0x20;
        }
        if self.f_pending {
            byte |= 0x10;
        }
        byte
    }
}

/// Parsed join-request MACPayload. AppEUI/DevEUI transit the wire in
/// little-endian byte order; the parsed values are logical integers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRequest {
    pub app_eui: u64,
    pub dev_eui: u64,
    pub dev_nonce: u16,
    pub mic: [u8; 4],
}

/// Parsed data frame (up or down). `frm_payload` is still encrypted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFrame {
    pub mtype: MType,
    pub dev_addr: u32,
    pub fctrl: FCtrl,
    pub fcnt: u16,
    pub fopts: Vec<u8>,
    pub fport: Option<u8>,
    pub frm_payload: Vec<u8>,
    pub mic: [u8; 4],
}

/// Decoded LoRaWAN PHY payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Data(DataFrame),
    JoinRequest(JoinRequest),
    /// Join Accept (encrypted, not decoded further without keys)
    JoinAccept { encrypted_payload: Vec<u8> },
    Proprietary { payload: Vec<u8> },
    Rfu { payload: Vec<u8> },
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Frame::Data(df) => {
                write!(
                    f,
                    "{} DevAddr={:08X} FCnt={} FPort={} Payload={} bytes ADR={}",
                    df.mtype,
                    df.dev_addr,
                    df.fcnt,
                    df.fport.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string()),
                    df.frm_payload.len(),
                    df.fctrl.adr,
                )
            }
            Frame::JoinRequest(jr) => {
                write!(
                    f,
                    "JoinRequest AppEUI={:016X} DevEUI={:016X} DevNonce={}",
                    jr.app_eui, jr.dev_eui, jr.dev_nonce
                )
            }
            Frame::JoinAccept { encrypted_payload } => {
                write!(f, "JoinAccept (encrypted, {} bytes)", encrypted_payload.len())
            }
            Frame::Proprietary { payload } => write!(f, "Proprietary ({} bytes)", payload.len()),
            Frame::Rfu { payload } => write!(f, "RFU ({} bytes)", payload.len()),
        }
    }
}

/// Decode a LoRaWAN PHY payload (raw bytes after base64 decode)
pub fn decode_phy_payload(data: &[u8]) -> Result<Frame, Error> {
    if data.is_empty() {
        return Err(Error::BadFrame(Vec::new()));
    }

    let mtype = MType::from(data[0]);

    match mtype {
        MType::JoinRequest => decode_join_request(data),
        MType::JoinAccept => Ok(Frame::JoinAccept { encrypted_payload: data[1..].to_vec() }),
        MType::UnconfirmedDataUp
        | MType::UnconfirmedDataDown
        | MType::ConfirmedDataUp
        | MType::ConfirmedDataDown => decode_data_frame(mtype, data),
        MType::Proprietary => Ok(Frame::Proprietary { payload: data[1..].to_vec() }),
        MType::Rfu => Ok(Frame::Rfu { payload: data[1..].to_vec() }),
    }
}

fn decode_join_request(data: &[u8]) -> Result<Frame, Error> {
    // MHDR(1) + AppEUI(8) + DevEUI(8) + DevNonce(2) + MIC(4) = 23 bytes
    if data.len() != 23 {
        return Err(Error::BadFrame(data.to_vec()));
    }

    let mut app_eui = [0u8; 8];
    app_eui.copy_from_slice(&data[1..9]);
    let mut dev_eui = [0u8; 8];
    dev_eui.copy_from_slice(&data[9..17]);
    let dev_nonce = u16::from_le_bytes([data[17], data[18]]);
    let mic = [data[19], data[20], data[21], data[22]];

    Ok(Frame::JoinRequest(JoinRequest {
        app_eui: u64::from_le_bytes(app_eui),
        dev_eui: u64::from_le_bytes(dev_eui),
        dev_nonce,
        mic,
    }))
}

fn decode_data_frame(mtype: MType, data: &[u8]) -> Result<Frame, Error> {
    // Minimum: MHDR(1) + DevAddr(4) + FCtrl(1) + FCnt(2) + MIC(4) = 12 bytes
    if data.len() < 12 {
        return Err(Error::BadFrame(data.to_vec()));
    }

    // DevAddr is little-endian
    let mut addr = [0u8; 4];
    addr.copy_from_slice(&data[1..5]);
    let dev_addr = u32::from_le_bytes(addr);

    let fctrl = FCtrl::from_byte(data[5]);

    // FCnt (16-bit, little-endian)
    let fcnt = u16::from_le_bytes([data[6], data[7]]);

    let fopts_end = 8 + fctrl.f_opts_len as usize;
    if fopts_end > data.len() - 4 {
        return Err(Error::BadFrame(data.to_vec()));
    }
    let fopts = data[8..fopts_end].to_vec();

    // FPort + FRMPayload (optional, only present if there's data beyond FOpts + MIC)
    let mic_start = data.len() - 4;
    let (fport, frm_payload) = if fopts_end < mic_start {
        (Some(data[fopts_end]), data[fopts_end + 1..mic_start].to_vec())
    } else {
        (None, Vec::new())
    };

    let mic = [data[mic_start], data[mic_start + 1], data[mic_start + 2], data[mic_start + 3]];

    Ok(Frame::Data(DataFrame {
        mtype,
        dev_addr,
        fctrl,
        fcnt,
        fopts,
        fport,
        frm_payload,
        mic,
    }))
}
