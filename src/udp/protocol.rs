//! GWMP codec: the Semtech packet-forwarder datagram format.
//!
//! Every datagram starts with a 4-byte header (version, random token,
//! packet type), followed for most types by the 8-byte gateway EUI and a
//! JSON body. Uplink traffic arrives as PUSH_DATA, downlink orders leave
//! as PULL_RESP to the address of the gateway's latest PULL_DATA.
//!
//! Format reference: Lora-net/packet_forwarder PROTOCOL.TXT.

use anyhow::{bail, ensure, Context};
use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::mac::Stat;

/// The only protocol version deployed gateways speak.
pub const GWMP_VERSION: u8 = 0x02;

/// 8-byte gateway EUI carried after the header.
pub type GatewayEui = [u8; 8];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    PushData = 0x00,
    PushAck = 0x01,
    PullData = 0x02,
    PullResp = 0x03,
    PullAck = 0x04,
    TxAck = 0x05,
}

impl PacketType {
    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(Self::PushData),
            0x01 => Some(Self::PushAck),
            0x02 => Some(Self::PullData),
            0x03 => Some(Self::PullResp),
            0x04 => Some(Self::PullAck),
            0x05 => Some(Self::TxAck),
            _ => None,
        }
    }
}

/// A datagram the server can receive from a gateway.
#[derive(Debug)]
pub enum GwmpPacket {
    PushData { token: u16, eui: GatewayEui, json: String },
    PullData { token: u16, eui: GatewayEui },
    TxAck { token: u16, eui: GatewayEui, json: Option<String> },
}

impl GwmpPacket {
    /// Decode a datagram received from a gateway.
    pub fn parse(datagram: &[u8]) -> anyhow::Result<Self> {
        let [version, token_hi, token_lo, ptype, rest @ ..] = datagram else {
            bail!("datagram shorter than the 4-byte GWMP header");
        };
        ensure!(*version == GWMP_VERSION, "GWMP version 0x{version:02x} not supported");
        let token = u16::from_be_bytes([*token_hi, *token_lo]);

        match PacketType::from_byte(*ptype) {
            Some(PacketType::PushData) => {
                let (eui, body) = split_eui(rest)?;
                let json = json_body(body).context("PUSH_DATA body")?;
                Ok(GwmpPacket::PushData { token, eui, json })
            }
            Some(PacketType::PullData) => {
                let (eui, _) = split_eui(rest)?;
                Ok(GwmpPacket::PullData { token, eui })
            }
            Some(PacketType::TxAck) => {
                let (eui, body) = split_eui(rest)?;
                let json = if body.is_empty() {
                    None
                } else {
                    Some(json_body(body).context("TX_ACK body")?)
                };
                Ok(GwmpPacket::TxAck { token, eui, json })
            }
            Some(other) => bail!("{other:?} is server-to-gateway, not expected inbound"),
            None => bail!("unknown GWMP packet type 0x{ptype:02x}"),
        }
    }

    /// Acknowledge a PUSH_DATA.
    pub fn push_ack(token: u16) -> Vec<u8> {
        header(PacketType::PushAck, token).to_vec()
    }

    /// Acknowledge a PULL_DATA keepalive.
    pub fn pull_ack(token: u16) -> Vec<u8> {
        header(PacketType::PullAck, token).to_vec()
    }

    /// Wrap a txpk JSON body into a PULL_RESP downlink order.
    pub fn pull_resp(token: u16, json: &str) -> Vec<u8> {
        let mut buf = header(PacketType::PullResp, token);
        buf.put_slice(json.as_bytes());
        buf.to_vec()
    }
}

fn header(ptype: PacketType, token: u16) -> BytesMut {
    let mut buf = BytesMut::with_capacity(4);
    buf.put_u8(GWMP_VERSION);
    buf.put_u16(token);
    buf.put_u8(ptype as u8);
    buf
}

fn split_eui(rest: &[u8]) -> anyhow::Result<(GatewayEui, &[u8])> {
    ensure!(rest.len() >= 8, "datagram ends inside the gateway EUI");
    let mut eui = [0u8; 8];
    eui.copy_from_slice(&rest[..8]);
    Ok((eui, &rest[8..]))
}

fn json_body(body: &[u8]) -> anyhow::Result<String> {
    Ok(std::str::from_utf8(body).context("not valid UTF-8")?.to_owned())
}

/// One received RF packet out of a PUSH_DATA `rxpk` array.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rxpk {
    /// Carrier frequency, MHz
    pub freq: f64,
    /// Datarate identifier, e.g. "SF7BW125"
    pub datr: String,
    /// Coding rate, e.g. "4/5"
    pub codr: Option<String>,
    /// RSSI, dBm
    pub rssi: f64,
    /// Signal-to-noise ratio, dB
    pub lsnr: Option<f64>,
    /// Concentrator counter at reception, microseconds
    pub tmst: Option<u32>,
    /// GPS time, milliseconds since the GPS epoch
    pub tmms: Option<u64>,
    /// Reception time, ISO 8601
    pub time: Option<String>,
    /// Concentrator IF channel
    pub chan: Option<u8>,
    /// RF chain
    pub rfch: Option<u8>,
    /// "LORA" or "FSK"
    pub modu: Option<String>,
    /// Payload size, bytes
    pub size: u16,
    /// Base64-encoded PHY payload
    pub data: String,
}

/// Downlink order placed inside a PULL_RESP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Txpk {
    /// Send immediately (Class C)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub imme: Option<bool>,
    /// Concentrator timestamp to send at (microseconds)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tmst: Option<u32>,
    /// Frequency in MHz
    pub freq: f64,
    /// RF chain
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rfch: Option<u8>,
    /// TX power in dBm
    #[serde(skip_serializing_if = "Option::is_none")]
    pub powe: Option<i8>,
    /// Modulation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modu: Option<String>,
    /// LoRa datarate identifier
    pub datr: String,
    /// LoRa coding rate
    #[serde(skip_serializing_if = "Option::is_none")]
    pub codr: Option<String>,
    /// Inverted polarity (always true for LoRaWAN downlinks)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipol: Option<bool>,
    /// Payload size in bytes
    pub size: u16,
    /// Base64 encoded payload
    pub data: String,
    /// No CRC on downlink
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ncrc: Option<bool>,
}

/// Push data JSON wrapper
#[derive(Debug, Deserialize)]
pub struct PushDataPayload {
    pub rxpk: Option<Vec<Rxpk>>,
    pub stat: Option<Stat>,
}

/// Pull resp JSON wrapper
#[derive(Debug, Serialize)]
pub struct PullRespPayload {
    pub txpk: Txpk,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pull_data() {
        let mut raw = vec![0x02, 0x12, 0x34, 0x02];
        raw.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);

        match GwmpPacket::parse(&raw).unwrap() {
            GwmpPacket::PullData { token, eui } => {
                assert_eq!(token, 0x1234);
                assert_eq!(eui, [1, 2, 3, 4, 5, 6, 7, 8]);
            }
            other => panic!("unexpected packet: {other:?}"),
        }
    }

    #[test]
    fn test_parse_push_data_with_stat() {
        let body = r#"{"stat":{"time":"2024-01-01 00:00:00 UTC","lati":46.24,"long":6.05,"alti":432,"rxnb":2,"rxok":2,"rxfw":2,"ackr":100.0,"dwnb":0,"txnb":0}}"#;
        let mut raw = vec![0x02, 0x00, 0x01, 0x00];
        raw.extend_from_slice(&[8, 7, 6, 5, 4, 3, 2, 1]);
        raw.extend_from_slice(body.as_bytes());

        match GwmpPacket::parse(&raw).unwrap() {
            GwmpPacket::PushData { json, eui, .. } => {
                assert_eq!(eui, [8, 7, 6, 5, 4, 3, 2, 1]);
                let payload: PushDataPayload = serde_json::from_str(&json).unwrap();
                let stat = payload.stat.unwrap();
                assert_eq!(stat.lati, Some(46.24));
                assert_eq!(stat.alti, Some(432.0));
                assert!(payload.rxpk.is_none());
            }
            other => panic!("unexpected packet: {other:?}"),
        }
    }

    #[test]
    fn test_parse_tx_ack_without_body() {
        let mut raw = vec![0x02, 0xAB, 0xCD, 0x05];
        raw.extend_from_slice(&[0; 8]);
        match GwmpPacket::parse(&raw).unwrap() {
            GwmpPacket::TxAck { token, json, .. } => {
                assert_eq!(token, 0xABCD);
                assert!(json.is_none());
            }
            other => panic!("unexpected packet: {other:?}"),
        }
    }

    #[test]
    fn test_parse_rejects_bad_version() {
        assert!(GwmpPacket::parse(&[0x01, 0x00, 0x00, 0x02]).is_err());
    }

    #[test]
    fn test_parse_rejects_short_header_and_truncated_eui() {
        assert!(GwmpPacket::parse(&[0x02, 0x00]).is_err());
        // PULL_DATA cut off in the middle of the EUI.
        assert!(GwmpPacket::parse(&[0x02, 0x00, 0x00, 0x02, 1, 2, 3]).is_err());
    }

    #[test]
    fn test_parse_rejects_outbound_and_unknown_types() {
        // PULL_RESP is something the server sends, never receives.
        assert!(GwmpPacket::parse(&[0x02, 0x00, 0x00, 0x03]).is_err());
        assert!(GwmpPacket::parse(&[0x02, 0x00, 0x00, 0x7F]).is_err());
    }

    #[test]
    fn test_acks_echo_token() {
        assert_eq!(GwmpPacket::push_ack(0xBEEF), vec![0x02, 0xBE, 0xEF, 0x01]);
        assert_eq!(GwmpPacket::pull_ack(0xBEEF), vec![0x02, 0xBE, 0xEF, 0x04]);
    }

    #[test]
    fn test_pull_resp_carries_json() {
        let raw = GwmpPacket::pull_resp(0x0001, "{\"txpk\":{}}");
        assert_eq!(&raw[..4], &[0x02, 0x00, 0x01, 0x03]);
        assert_eq!(&raw[4..], b"{\"txpk\":{}}");
    }

    #[test]
    fn test_txpk_serialization_skips_absent_fields() {
        let txpk = Txpk {
            imme: None,
            tmst: Some(1_000_000),
            freq: 869.525,
            rfch: Some(0),
            powe: Some(27),
            modu: Some("LORA".to_string()),
            datr: "SF12BW125".to_string(),
            codr: Some("4/5".to_string()),
            ipol: Some(true),
            size: 4,
            data: "AQIDBA==".to_string(),
            ncrc: Some(true),
        };
        let json = serde_json::to_string(&PullRespPayload { txpk }).unwrap();
        assert!(json.contains("\"tmst\":1000000"));
        assert!(!json.contains("imme"));
    }
}
