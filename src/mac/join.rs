//! Join engine: over-the-air activation.
//!
//! A valid join-request replaces the device's session atomically: fresh
//! session keys derived from the AppKey, counters at zero, region-default
//! ADR and RX-window state, and any leftover downlink state purged. The
//! join-accept answers in the (longer) join RX1 window.

use chrono::Utc;
use rand::rngs::OsRng;
use rand::RngCore;
use tracing::{debug, info};

use super::commands::MacHandler;
use super::{Action, MacEngine};
use crate::app::Application;
use crate::error::{Error, NodeId};
use crate::lorawan::{crypto, encoder, JoinRequest};
use crate::region::{Delay, RxQ};
use crate::store::{Gateway, Link};

pub(super) fn handle_join_request<A: Application, M: MacHandler>(
    engine: &MacEngine<A, M>,
    gateway: &Gateway,
    rxq: &RxQ,
    request: &JoinRequest,
    phy: &[u8],
) -> Result<Action, Error> {
    let device = engine
        .store
        .get_device(request.dev_eui)
        .ok_or(Error::UnknownDevEui(request.dev_eui))?;

    if !device.can_join {
        debug!("join request from disabled DevEUI {:016X}", request.dev_eui);
        return Ok(Action::Ok);
    }

    let msg = &phy[..phy.len() - 4];
    if crypto::cmac4(&device.appkey, msg) != request.mic {
        return Err(Error::BadMic(NodeId::DevEui(request.dev_eui)));
    }

    let mut app_nonce = [0u8; 3];
    OsRng.fill_bytes(&mut app_nonce);
    let (nwkskey, appskey) =
        derive_session_keys(&device.appkey, &app_nonce, &gateway.netid, request.dev_nonce);

    let region = device.region;
    let now = Utc::now();

    let devaddr = engine.store.atomic(|t| {
        let dev =
            t.devices.get_mut(&request.dev_eui).ok_or(Error::UnknownDevEui(request.dev_eui))?;
        // An existing address is reused on re-join; its NwkID bits are not
        // re-validated against the current NetID.
        let devaddr = match dev.devaddr {
            Some(addr) => addr,
            None => allocate_devaddr(&gateway.netid),
        };
        dev.devaddr = Some(devaddr);
        dev.last_join = Some(now);

        let link = Link {
            devaddr,
            region,
            app: dev.app.clone(),
            nwkskey,
            appskey,
            fcntup: 0,
            fcntdown: 0,
            fcnt_check: dev.fcnt_check,
            adr_flag_use: false,
            adr_flag_set: dev.adr_flag_set,
            adr_use: Some(region.default_adr()),
            adr_set: dev.adr_set.clone(),
            rxwin_use: region.default_rxwin(),
            rxwin_set: dev.rxwin_set.clone(),
            last_mac: Some(gateway.mac),
            last_rxq: None,
            devstat: None,
            devstat_fcnt: None,
            last_qs: Vec::new(),
            last_rx: None,
            last_reset: Some(now),
        };
        t.links.insert(devaddr, link);
        t.pending.remove(&devaddr);
        t.purge_txframes(devaddr);
        Ok(devaddr)
    })?;

    engine.app.handle_join(devaddr, &device.app)?;

    // DLSettings: RX1DROffset 0, RX2DataRate from the region table.
    let dl_settings = region.rx2_dr() & 0x0f;
    let accept = encoder::encode_join_accept(
        &device.appkey,
        &app_nonce,
        &gateway.netid,
        devaddr,
        dl_settings,
        1,
    );

    info!("DevEUI {:016X} joined as DevAddr {:08X}", request.dev_eui, devaddr);
    let txq = region.rx1_window(&region.default_rxwin(), rxq, Delay::Join);
    Ok(Action::Send { txq, phy: accept })
}

/// Session keys per 1.0.1 §6.2.5:
/// `AES-ECB(AppKey, tag | AppNonce | NetID | DevNonce | pad)` with tag
/// 0x01 for the NwkSKey and 0x02 for the AppSKey.
pub fn derive_session_keys(
    app_key: &[u8; 16],
    app_nonce: &[u8; 3],
    net_id: &[u8; 3],
    dev_nonce: u16,
) -> ([u8; 16], [u8; 16]) {
    let mut block = [0u8; 16];
    block[1..4].copy_from_slice(app_nonce);
    block[4..7].copy_from_slice(net_id);
    block[7..9].copy_from_slice(&dev_nonce.to_le_bytes());

    block[0] = 0x01;
    let nwkskey = crypto::aes128_encrypt(app_key, &block);
    block[0] = 0x02;
    let appskey = crypto::aes128_encrypt(app_key, &block);
    (nwkskey, appskey)
}

/// `DevAddr = NwkID (low 7 bits of NetID) | 0 | random(24)`.
fn allocate_devaddr(net_id: &[u8; 3]) -> u32 {
    let nwkid = u32::from(net_id[2] & 0x7f);
    let mut random = [0u8; 4];
    OsRng.fill_bytes(&mut random[1..]);
    (nwkid << 25) | (u32::from_be_bytes(random) & 0x00ff_ffff)
}
