//! LoRaWAN frame encoder for downlink/TX packets
//!
//! Builds raw LoRaWAN MAC frames suitable for transmission. The output
//! bytes are base64-encoded and placed inside the GWMP PULL_RESP txpk JSON.
//!
//! Frame structure (data down):
//!   MHDR(1) | DevAddr(4,LE) | FCtrl(1) | FCnt(2,LE) | FOpts(0-15) |
//!   [FPort(1) | FRMPayload(N)] | MIC(4)

use super::crypto;
use super::{DataFrame, FCtrl, MType};

/// Parameters for building a LoRaWAN data frame
#[derive(Debug, Clone)]
pub struct FrameBuilder {
    pub mtype: MType,
    /// Device address (32-bit)
    pub dev_addr: u32,
    /// Frame control flags; FOptsLen is derived from `fopts`
    pub fctrl: FCtrl,
    /// Low 16 bits of the session frame counter
    pub fcnt: u16,
    /// Piggybacked MAC commands (at most 15 bytes)
    pub fopts: Vec<u8>,
    /// FPort; absent only for FHDR-only frames
    pub fport: Option<u8>,
    /// FRMPayload, already encrypted
    pub frm_payload: Vec<u8>,
}

impl FrameBuilder {
    /// Build MHDR through the end of MACPayload. The MIC is computed over
    /// exactly these bytes and appended by the caller.
    pub fn body(&self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(12 + self.fopts.len() + self.frm_payload.len());

        frame.push(self.mtype.mhdr());

        // DevAddr (4 bytes, little-endian)
        frame.extend_from_slice(&self.dev_addr.to_le_bytes());

        let fctrl = FCtrl { f_opts_len: self.fopts.len() as u8, ..self.fctrl };
        frame.push(fctrl.to_byte());

        // FCnt (2 bytes, little-endian)
        frame.extend_from_slice(&self.fcnt.to_le_bytes());

        frame.extend_from_slice(&self.fopts);

        if let Some(port) = self.fport {
            frame.push(port);
            frame.extend_from_slice(&self.frm_payload);
        }

        frame
    }
}

/// Re-serialize a parsed data frame, MIC included.
pub fn serialize_data(frame: &DataFrame) -> Vec<u8> {
    let builder = FrameBuilder {
        mtype: frame.mtype,
        dev_addr: frame.dev_addr,
        fctrl: frame.fctrl,
        fcnt: frame.fcnt,
        fopts: frame.fopts.clone(),
        fport: frame.fport,
        frm_payload: frame.frm_payload.clone(),
    };
    let mut phy = builder.body();
    phy.extend_from_slice(&frame.mic);
    phy
}

/// Assemble a join-accept PHY payload.
///
/// MACPayload = AppNonce(3) | NetID(3) | DevAddr(4,LE) | DLSettings | RxDelay,
/// MIC = CMAC(AppKey, MHDR | MACPayload). The network server ECB-*decrypts*
/// `MACPayload | MIC` so that the device recovers the plaintext by
/// encrypting (LoRaWAN 1.0.1, 6.2.5).
pub fn encode_join_accept(
    app_key: &[u8; 16],
    app_nonce: &[u8; 3],
    net_id: &[u8; 3],
    dev_addr: u32,
    dl_settings: u8,
    rx_delay: u8,
) -> Vec<u8> {
    let mhdr = MType::JoinAccept.mhdr();

    let mut body = Vec::with_capacity(16);
    body.extend_from_slice(app_nonce);
    body.extend_from_slice(net_id);
    body.extend_from_slice(&dev_addr.to_le_bytes());
    body.push(dl_settings);
    body.push(rx_delay);

    let mut mic_input = Vec::with_capacity(1 + body.len());
    mic_input.push(mhdr);
    mic_input.extend_from_slice(&body);
    let mic = crypto::cmac4(app_key, &mic_input);
    body.extend_from_slice(&mic);

    let mut phy = vec![mhdr];
    phy.extend_from_slice(&crypto::aes128_decrypt_blocks(app_key, &crypto::padded16(&body)));
    phy
}
