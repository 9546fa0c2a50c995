//! The stateful MAC engine: converts PHY payloads from the gateway
//! transport into application events and assembles the downlinks
//! transmitted in the device receive windows.

pub mod commands;
mod downlink;
mod join;
mod uplink;

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::app::{Application, TxData};
use crate::error::Error;
use crate::lorawan::{self, Frame, MType};
use crate::region::{Delay, RxQ, TxQ, TxTime};
use crate::store::{Link, SessionStore, TxFrame};
use crate::util;
use commands::MacHandler;

pub use join::derive_session_keys;

/// What the gateway transport should do with a processed frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Transmit `phy` in the named window.
    Send { txq: TxQ, phy: Vec<u8> },
    /// Nothing to send.
    Ok,
}

#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    /// Worst-case server-side processing time budgeted before a frame
    /// reaches the gateway; decides whether RX1 is still reachable.
    pub preprocessing_delay_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { preprocessing_delay_ms: 50 }
    }
}

/// Gateway status report (the `stat` object of a PUSH_DATA).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Stat {
    pub time: Option<String>,
    pub lati: Option<f64>,
    pub long: Option<f64>,
    pub alti: Option<f64>,
    pub rxnb: Option<u32>,
    pub rxok: Option<u32>,
    pub rxfw: Option<u32>,
    pub ackr: Option<f64>,
    pub dwnb: Option<u32>,
    pub txnb: Option<u32>,
    pub desc: Option<String>,
}

/// The MAC protocol engine. One instance serves every gateway and device;
/// all shared state lives in the session store, so `process_frame` may be
/// called concurrently from a pool of worker tasks.
pub struct MacEngine<A, M> {
    store: Arc<SessionStore>,
    app: A,
    mac: M,
    preprocessing_delay_ms: u64,
}

impl<A: Application, M: MacHandler> MacEngine<A, M> {
    pub fn new(store: Arc<SessionStore>, app: A, mac: M, config: EngineConfig) -> Self {
        Self { store, app, mac, preprocessing_delay_ms: config.preprocessing_delay_ms }
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// Process a PHY payload received by `gateway`.
    pub fn process_frame(&self, gateway: [u8; 8], rxq: RxQ, phy: &[u8]) -> Result<Action, Error> {
        let gw = self.store.get_gateway(&gateway).ok_or(Error::UnknownMac(gateway))?;
        let frame = lorawan::decode_phy_payload(phy)?;
        debug!("{} via gateway {}", frame, hex::encode(gateway));

        match frame {
            Frame::JoinRequest(jr) => join::handle_join_request(self, &gw, &rxq, &jr, phy),
            Frame::Data(df) if df.mtype.is_uplink() => {
                uplink::handle_uplink(self, &gw, &rxq, &df, phy)
            }
            other => {
                // Downlink MTypes and proprietary frames are not addressed
                // to the network server.
                debug!("dropping {}", other);
                Ok(Action::Ok)
            }
        }
    }

    /// Update the gateway row from a status report.
    pub fn process_status(&self, gateway: [u8; 8], stat: Stat) -> Result<(), Error> {
        let mut gw = self.store.get_gateway(&gateway).ok_or(Error::UnknownMac(gateway))?;
        gw.last_rx = Some(Utc::now());
        if let (Some(lat), Some(lon)) = (stat.lati, stat.long) {
            if lat != 0.0 || lon != 0.0 {
                gw.position = Some((lat, lon));
                // Some receivers report a position but zero altitude; keep
                // the position, drop the altitude.
                if let Some(alt) = stat.alti {
                    if alt != 0.0 {
                        gw.altitude = Some(alt);
                    }
                }
            }
        }
        if let Some(desc) = stat.desc.as_deref() {
            if !desc.is_empty() {
                gw.desc = Some(desc.to_string());
            }
        }
        self.store.put_gateway(gw);
        Ok(())
    }

    /// Server-initiated downlink (Class-C style): transmit on the RX2
    /// parameters at the caller-specified time.
    pub fn handle_downlink(&self, devaddr: u32, time: TxTime, tx: TxData) -> Result<Action, Error> {
        let link = self.store.get_link(devaddr).ok_or(Error::UnknownDevAddr(devaddr))?;
        let fopts = self.mac.build_fopts(&link);
        let mtype =
            if tx.confirmed { MType::ConfirmedDataDown } else { MType::UnconfirmedDataDown };
        let phy = downlink::encode_unicast(self, devaddr, mtype, false, &fopts, &tx)?;
        let txq = link.region.rf_group(&link.rxwin_use, time);
        info!("server-initiated downlink to DevAddr {:08X} ({} bytes)", devaddr, phy.len());
        Ok(Action::Send { txq, phy })
    }

    /// Queue a downlink for a Class-A device; it rides the receive window
    /// opened by the device's next uplink.
    pub fn queue_downlink(&self, devaddr: u32, tx: TxData) -> Result<(), Error> {
        if self.store.get_link(devaddr).is_none() {
            return Err(Error::UnknownDevAddr(devaddr));
        }
        self.store.queue_txframe(TxFrame { devaddr, txdata: tx, datetime: Utc::now() });
        Ok(())
    }

    /// Multicast downlink: the unicast path with the group keys and
    /// counter. Confirmed frames are not allowed.
    pub fn handle_multicast(&self, devaddr: u32, time: TxTime, tx: TxData) -> Result<Action, Error> {
        let group = self.store.get_multicast(devaddr).ok_or(Error::UnknownDevAddr(devaddr))?;
        let phy = downlink::encode_multicast(self, devaddr, &tx)?;
        let txq = group.region.rf_group(&group.region.default_rxwin(), time);
        info!("multicast downlink to DevAddr {:08X} ({} bytes)", devaddr, phy.len());
        Ok(Action::Send { txq, phy })
    }

    /// RX1 if the remaining window budget allows for our processing and
    /// the gateway round trip; RX2 otherwise.
    pub(crate) fn choose_tx(&self, link: &Link, rxq: &RxQ) -> TxQ {
        let elapsed = util::monotonic_ms().saturating_sub(rxq.srvtmst);
        if elapsed + self.preprocessing_delay_ms < link.region.rx1_delay_ms() {
            link.region.rx1_window(&link.rxwin_use, rxq, Delay::Data)
        } else {
            link.region.rx2_window(&link.rxwin_use, rxq, Delay::Data)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::LogApplication;
    use crate::store::Gateway;

    fn test_rxq() -> RxQ {
        RxQ {
            freq: 868.1,
            datr: "SF7BW125".into(),
            codr: Some("4/5".into()),
            rssi: -40.0,
            lsnr: Some(6.0),
            tmst: 1_000_000,
            srvtmst: util::monotonic_ms(),
        }
    }

    fn engine() -> MacEngine<LogApplication, commands::NullMacHandler> {
        let store = Arc::new(SessionStore::new());
        store.put_gateway(Gateway {
            mac: GW_MAC,
            netid: [0x00, 0x00, 0x13],
            last_rx: None,
            position: None,
            altitude: None,
            desc: None,
        });
        MacEngine::new(store, LogApplication, commands::NullMacHandler, EngineConfig::default())
    }

    const GW_MAC: [u8; 8] = [0xB8, 0x27, 0xEB, 0xFF, 0xFE, 0x00, 0x00, 0x01];

    #[test]
    fn test_process_status_updates_gateway() {
        let engine = engine();
        let stat = Stat {
            lati: Some(46.24),
            long: Some(6.05),
            alti: Some(432.0),
            desc: Some("roof".to_string()),
            ..Stat::default()
        };
        engine.process_status(GW_MAC, stat).unwrap();

        let gw = engine.store().get_gateway(&GW_MAC).unwrap();
        assert!(gw.last_rx.is_some());
        assert_eq!(gw.position, Some((46.24, 6.05)));
        assert_eq!(gw.altitude, Some(432.0));
        assert_eq!(gw.desc.as_deref(), Some("roof"));
    }

    #[test]
    fn test_process_status_keeps_position_drops_zero_altitude() {
        let engine = engine();
        let stat = Stat { lati: Some(46.24), long: Some(6.05), alti: Some(0.0), ..Stat::default() };
        engine.process_status(GW_MAC, stat).unwrap();

        let gw = engine.store().get_gateway(&GW_MAC).unwrap();
        assert_eq!(gw.position, Some((46.24, 6.05)));
        assert_eq!(gw.altitude, None);
    }

    #[test]
    fn test_process_status_ignores_zero_position_and_empty_desc() {
        let engine = engine();
        let stat = Stat {
            lati: Some(0.0),
            long: Some(0.0),
            desc: Some(String::new()),
            ..Stat::default()
        };
        engine.process_status(GW_MAC, stat).unwrap();

        let gw = engine.store().get_gateway(&GW_MAC).unwrap();
        assert_eq!(gw.position, None);
        assert_eq!(gw.desc, None);
    }

    #[test]
    fn test_process_status_unknown_gateway() {
        let engine = engine();
        let err = engine.process_status([0; 8], Stat::default()).unwrap_err();
        assert_eq!(err, Error::UnknownMac([0; 8]));
    }

    #[test]
    fn test_process_frame_unknown_gateway() {
        let engine = engine();
        let err = engine.process_frame([0; 8], test_rxq(), &[0x40]).unwrap_err();
        assert_eq!(err, Error::UnknownMac([0; 8]));
    }

    #[test]
    fn test_downlink_mtype_is_dropped_silently() {
        let engine = engine();
        // A well-formed unconfirmed *downlink* observed on the uplink path.
        let phy: Vec<u8> =
            vec![0x60, 0x04, 0x03, 0x02, 0x01, 0x00, 0x01, 0x00, 0xEF, 0xBE, 0xAD, 0xDE];
        let action = engine.process_frame(GW_MAC, test_rxq(), &phy).unwrap();
        assert_eq!(action, Action::Ok);
    }
}
