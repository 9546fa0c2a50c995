//! Uplink engine: frame-counter discipline, MIC verification, payload
//! decryption, retransmission and replay handling, ADR tracking and the
//! reply decision.
//!
//! Counter classification, MIC check and the counter update run in a
//! single store transaction, so concurrent uplinks for one DevAddr are
//! linearised: the second sees the first's counter and classifies as a
//! retransmit or as the higher new value.

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::commands::MacHandler;
use super::{Action, MacEngine};
use crate::app::{AppResult, Application, RxData, TxData};
use crate::error::{Error, NodeId};
use crate::lorawan::{crypto, DataFrame, MType};
use crate::region::{Delay, RxQ};
use crate::store::{AdrParams, FcntCheck, Gateway, Link, RxFrame};

/// Largest accepted forward jump of the 16-bit wire counter.
const MAX_FCNT_GAP: u32 = 16_384;
/// A wire counter below this value may signal a device reset.
const MAX_LOST_AFTER_RESET: u16 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FcntClass {
    New,
    Retransmit,
    Reset,
}

pub(super) fn handle_uplink<A: Application, M: MacHandler>(
    engine: &MacEngine<A, M>,
    gateway: &Gateway,
    rxq: &RxQ,
    frame: &DataFrame,
    phy: &[u8],
) -> Result<Action, Error> {
    if engine.store.list_ignored().iter().any(|p| p.matches(frame.dev_addr)) {
        debug!("ignoring DevAddr {:08X}", frame.dev_addr);
        return Ok(Action::Ok);
    }

    let msg = &phy[..phy.len() - 4];
    let now = Utc::now();

    let (class, link) = engine.store.atomic(|t| {
        let link =
            t.links.get_mut(&frame.dev_addr).ok_or(Error::UnknownDevAddr(frame.dev_addr))?;
        let (class, fcnt) = classify_fcnt(link.fcnt_check, link.fcntup, frame.fcnt)
            .ok_or(Error::FcntGapTooLarge(frame.dev_addr, frame.fcnt))?;

        let expected =
            crypto::data_mic(&link.nwkskey, frame.mtype.dir(), frame.dev_addr, fcnt, msg);
        if expected != frame.mic {
            return Err(Error::BadMic(NodeId::DevAddr(frame.dev_addr)));
        }
        if frame.fport == Some(0) && !frame.fopts.is_empty() {
            return Err(Error::DoubleFopts);
        }

        match class {
            FcntClass::Retransmit => {}
            FcntClass::Reset => {
                link.fcntup = fcnt;
                link.adr_flag_use = false;
                link.adr_use = Some(link.region.default_adr());
                link.rxwin_use = link.region.default_rxwin();
                link.devstat_fcnt = None;
                link.last_qs.clear();
                link.last_reset = Some(now);
            }
            FcntClass::New => link.fcntup = fcnt,
        }
        Ok((class, link.clone()))
    })?;

    // FPort 0 carries MAC commands encrypted with the NwkSKey; anything
    // else is application data under the AppSKey. Direction is the low
    // MType bit even for MAC commands.
    let dir = frame.mtype.dir();
    let (fopts_in, app_data) = if frame.fport == Some(0) {
        let commands =
            crypto::cipher(&link.nwkskey, dir, frame.dev_addr, link.fcntup, &frame.frm_payload);
        (commands, Vec::new())
    } else {
        let data =
            crypto::cipher(&link.appskey, dir, frame.dev_addr, link.fcntup, &frame.frm_payload);
        (frame.fopts.clone(), data)
    };

    match class {
        FcntClass::Retransmit => {
            debug!("DevAddr {:08X}: retransmission of FCnt {}", frame.dev_addr, frame.fcnt);
            engine.store.put_rxframe(log_entry(gateway, rxq, &link, frame, app_data, now));
            if let Some(pending) = engine.store.get_pending(frame.dev_addr) {
                let txq = link.region.rx1_window(&link.rxwin_use, rxq, Delay::Data);
                return Ok(Action::Send { txq, phy: pending.phy });
            }
            return Ok(Action::Ok);
        }
        FcntClass::Reset => {
            warn!("DevAddr {:08X}: frame counters reset", frame.dev_addr);
            engine.store.delete_pending(frame.dev_addr);
            engine.store.purge_txframes(frame.dev_addr);
        }
        FcntClass::New => {}
    }

    process_new(engine, gateway, rxq, frame, link, fopts_in, app_data, now)
}

#[allow(clippy::too_many_arguments)]
fn process_new<A: Application, M: MacHandler>(
    engine: &MacEngine<A, M>,
    gateway: &Gateway,
    rxq: &RxQ,
    frame: &DataFrame,
    mut link: Link,
    fopts_in: Vec<u8>,
    app_data: Vec<u8>,
    now: DateTime<Utc>,
) -> Result<Action, Error> {
    let rx_dr = link.region.datar_to_dr(&rxq.datr);
    track_adr(&mut link, frame.fctrl.adr, rx_dr);

    let mut entry = log_entry(gateway, rxq, &link, frame, app_data.clone(), now);
    let fopts_out = engine.mac.handle(rxq, &mut link, &fopts_in, &mut entry)?;

    link.last_rx = Some(now);
    link.last_mac = Some(gateway.mac);
    link.last_rxq = Some(rxq.clone());
    engine.store.put_link(link.clone());
    engine.store.put_rxframe(entry);

    let pending = engine.store.get_pending(frame.dev_addr);
    let last_lost = pending.as_ref().map(|p| p.confirmed && !frame.fctrl.ack).unwrap_or(false);
    let confirmed_up = frame.mtype == MType::ConfirmedDataUp;
    let shall_reply = confirmed_up || frame.fctrl.adr_ack_req || !fopts_out.is_empty();

    let rx = RxData { fcnt: link.fcntup, port: frame.fport, data: app_data, last_lost, shall_reply };
    match engine.app.handle_rx(frame.dev_addr, &link.app, rx, rxq)? {
        AppResult::Retransmit => match pending {
            Some(p) => Ok(Action::Send { txq: engine.choose_tx(&link, rxq), phy: p.phy }),
            None => Ok(Action::Ok),
        },
        AppResult::Send(txdata) => reply(engine, &link, rxq, confirmed_up, fopts_out, txdata),
        AppResult::Ok => {
            if let Some(queued) = engine.store.next_txframe(frame.dev_addr) {
                reply(engine, &link, rxq, confirmed_up, fopts_out, queued.txdata)
            } else if shall_reply {
                reply(engine, &link, rxq, confirmed_up, fopts_out, TxData::default())
            } else {
                Ok(Action::Ok)
            }
        }
    }
}

fn reply<A: Application, M: MacHandler>(
    engine: &MacEngine<A, M>,
    link: &Link,
    rxq: &RxQ,
    ack: bool,
    fopts: Vec<u8>,
    txdata: TxData,
) -> Result<Action, Error> {
    let mtype =
        if txdata.confirmed { MType::ConfirmedDataDown } else { MType::UnconfirmedDataDown };
    let phy = super::downlink::encode_unicast(engine, link.devaddr, mtype, ack, &fopts, &txdata)?;
    Ok(Action::Send { txq: engine.choose_tx(link, rxq), phy })
}

fn log_entry(
    gateway: &Gateway,
    rxq: &RxQ,
    link: &Link,
    frame: &DataFrame,
    data: Vec<u8>,
    now: DateTime<Utc>,
) -> RxFrame {
    RxFrame {
        frid: 0,
        mac: gateway.mac,
        rxq: rxq.clone(),
        app: link.app.clone(),
        devaddr: link.devaddr,
        fcnt: link.fcntup,
        port: frame.fport,
        data,
        datetime: now,
        devstat: link.devstat,
    }
}

/// ADR tracking against the observed radio parameters. A changed ADR bit
/// or data rate restarts the quality window and the device-status cycle.
fn track_adr(link: &mut Link, adr_bit: bool, rx_dr: Option<u8>) {
    if link.adr_use.is_none() {
        link.adr_flag_use = adr_bit;
        link.adr_use = Some(AdrParams { power: None, datr: rx_dr, chans: None });
        return;
    }

    let mut changed = false;
    if adr_bit != link.adr_flag_use {
        link.adr_flag_use = adr_bit;
        changed = true;
    }
    if let Some(adr_use) = link.adr_use.as_mut() {
        if rx_dr.is_some() && adr_use.datr != rx_dr {
            adr_use.datr = rx_dr;
            changed = true;
        }
    }
    if changed {
        link.devstat_fcnt = None;
        link.last_qs.clear();
    }
}

/// Classify the 16-bit wire counter against the 32-bit session counter.
/// Returns the classification and the full counter value the frame was
/// authenticated with, or `None` when the gap is too large.
fn classify_fcnt(mode: FcntCheck, stored: u32, rx: u16) -> Option<(FcntClass, u32)> {
    let rx32 = u32::from(rx);

    if matches!(mode, FcntCheck::ResetAllowed | FcntCheck::Disabled)
        && rx32 < stored
        && rx < MAX_LOST_AFTER_RESET
    {
        return Some((FcntClass::Reset, rx32));
    }
    if mode == FcntCheck::Disabled {
        return Some((FcntClass::New, rx32));
    }
    // The wire carries 16 bits; compare against the low half so replays
    // are still recognised past 0xFFFF in strict-32 sessions.
    if rx == (stored & 0xffff) as u16 {
        return Some((FcntClass::Retransmit, stored));
    }
    let gap = rx32.wrapping_sub(stored) & 0xffff;
    if gap >= MAX_FCNT_GAP {
        return None;
    }
    match mode {
        FcntCheck::Strict32 => Some((FcntClass::New, stored.wrapping_add(gap))),
        _ => Some((FcntClass::New, rx32)),
    }
}
