//! Downlink engine: unicast and multicast frame assembly.
//!
//! Counter allocation, encryption, MIC and the pending-table write happen
//! in one store transaction so that N successful emissions advance
//! `fcntdown` by exactly N and never interleave for the same DevAddr.

use tracing::debug;

use super::commands::MacHandler;
use super::MacEngine;
use crate::app::{Application, TxData};
use crate::error::Error;
use crate::lorawan::encoder::FrameBuilder;
use crate::lorawan::{crypto, FCtrl, MType};
use crate::store::PendingFrame;

pub(super) fn encode_unicast<A: Application, M: MacHandler>(
    engine: &MacEngine<A, M>,
    devaddr: u32,
    mtype: MType,
    ack: bool,
    fopts: &[u8],
    tx: &TxData,
) -> Result<Vec<u8>, Error> {
    engine.store.atomic(|t| {
        let link = t.links.get_mut(&devaddr).ok_or(Error::UnknownDevAddr(devaddr))?;
        link.fcntdown = link.fcntdown.wrapping_add(1);
        let fcnt = link.fcntdown;

        let (fport, frm_payload) = encrypt_payload(
            tx,
            &link.nwkskey,
            &link.appskey,
            devaddr,
            fcnt,
        );

        let fctrl = FCtrl {
            adr: matches!(link.adr_flag_set, Some(true)),
            adr_ack_req: false,
            ack,
            f_pending: tx.pending,
            f_opts_len: fopts.len() as u8,
        };
        let builder = FrameBuilder {
            mtype,
            dev_addr: devaddr,
            fctrl,
            fcnt: (fcnt & 0xffff) as u16,
            fopts: fopts.to_vec(),
            fport,
            frm_payload,
        };
        let mut phy = builder.body();
        let mic = crypto::data_mic(&link.nwkskey, crypto::DOWN, devaddr, fcnt, &phy);
        phy.extend_from_slice(&mic);

        t.pending.insert(
            devaddr,
            PendingFrame { devaddr, confirmed: tx.confirmed, phy: phy.clone() },
        );
        debug!("downlink for DevAddr {:08X}: {} FCnt={} ({} bytes)", devaddr, mtype, fcnt, phy.len());
        Ok(phy)
    })
}

/// Multicast shares the unicast assembly but uses the group keys and
/// counter, carries no FOpts, never ACKs and must not be confirmed.
pub(super) fn encode_multicast<A: Application, M: MacHandler>(
    engine: &MacEngine<A, M>,
    devaddr: u32,
    tx: &TxData,
) -> Result<Vec<u8>, Error> {
    if tx.confirmed {
        return Err(Error::NotAllowed);
    }
    engine.store.atomic(|t| {
        let group = t.multicast.get_mut(&devaddr).ok_or(Error::UnknownDevAddr(devaddr))?;
        group.fcntdown = group.fcntdown.wrapping_add(1);
        let fcnt = group.fcntdown;

        let (fport, frm_payload) =
            encrypt_payload(tx, &group.nwkskey, &group.appskey, devaddr, fcnt);

        let builder = FrameBuilder {
            mtype: MType::UnconfirmedDataDown,
            dev_addr: devaddr,
            fctrl: FCtrl::default(),
            fcnt: (fcnt & 0xffff) as u16,
            fopts: Vec::new(),
            fport,
            frm_payload,
        };
        let mut phy = builder.body();
        let mic = crypto::data_mic(&group.nwkskey, crypto::DOWN, devaddr, fcnt, &phy);
        phy.extend_from_slice(&mic);
        Ok(phy)
    })
}

fn encrypt_payload(
    tx: &TxData,
    nwkskey: &[u8; 16],
    appskey: &[u8; 16],
    devaddr: u32,
    fcnt: u32,
) -> (Option<u8>, Vec<u8>) {
    match (tx.port, tx.data.is_empty()) {
        (None, true) => (None, Vec::new()),
        (port, _) => {
            // Application data without an explicit port defaults to port 1.
            let port = port.unwrap_or(1);
            let key = if port == 0 { nwkskey } else { appskey };
            (Some(port), crypto::cipher(key, crypto::DOWN, devaddr, fcnt, &tx.data))
        }
    }
}
