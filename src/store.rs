//! Transactional session store: gateways, devices, links (active
//! sessions), pending downlinks, queued downlinks, the RX frame log,
//! ignored-link patterns and multicast groups.
//!
//! All counter mutations (fcntup classification, fcntdown allocation, join
//! session replacement) run through [`SessionStore::atomic`], which holds
//! the table lock for the whole closure; per-DevAddr state transitions are
//! therefore linearised. Status and log writes use the plain accessors.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::app::TxData;
use crate::error::Error;
use crate::region::{Region, RxQ};

/// Application binding of a device: which handler receives its uplinks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppBinding {
    pub app: String,
    pub appid: String,
    pub appargs: Option<String>,
}

/// Frame-counter validation mode.
///
/// With 16 bits on the wire a genuine counter reset cannot be told apart
/// from a rollover past 0xFFFF; `ResetAllowed` trades replay strength for
/// surviving device reboots, `Disabled` is for lab use only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FcntCheck {
    #[serde(rename = "strict-16")]
    Strict16,
    #[serde(rename = "strict-32")]
    Strict32,
    #[serde(rename = "reset-allowed")]
    ResetAllowed,
    #[serde(rename = "disabled")]
    Disabled,
}

/// ADR state triple: TX power index, data-rate index, channel ranges.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdrParams {
    pub power: Option<u8>,
    pub datr: Option<u8>,
    pub chans: Option<Vec<(u8, u8)>>,
}

/// RX-window state: RX1 data-rate offset and RX2 frequency/data-rate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RxWinParams {
    pub rx1_dr_offset: u8,
    pub rx2_dr: u8,
    pub rx2_freq: f64,
}

/// Last reported device status (DevStatusAns).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DevStat {
    pub battery: u8,
    pub margin: i8,
}

/// Gateway row, keyed by the 8-byte MAC identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gateway {
    pub mac: [u8; 8],
    pub netid: [u8; 3],
    pub last_rx: Option<DateTime<Utc>>,
    pub position: Option<(f64, f64)>,
    pub altitude: Option<f64>,
    pub desc: Option<String>,
}

/// OTAA device row, keyed by DevEUI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub deveui: u64,
    pub appkey: [u8; 16],
    pub can_join: bool,
    pub region: Region,
    pub app: AppBinding,
    pub fcnt_check: FcntCheck,
    pub adr_flag_set: Option<bool>,
    pub adr_set: Option<AdrParams>,
    pub rxwin_set: Option<RxWinParams>,
    pub last_join: Option<DateTime<Utc>>,
    /// Current session address; absent before the first join.
    pub devaddr: Option<u32>,
}

/// Active session row, keyed by DevAddr. Session keys are immutable for
/// the lifetime of the row; a re-join replaces it atomically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Link {
    pub devaddr: u32,
    pub region: Region,
    pub app: AppBinding,
    pub nwkskey: [u8; 16],
    pub appskey: [u8; 16],
    pub fcntup: u32,
    pub fcntdown: u32,
    pub fcnt_check: FcntCheck,
    pub adr_flag_use: bool,
    pub adr_flag_set: Option<bool>,
    pub adr_use: Option<AdrParams>,
    pub adr_set: Option<AdrParams>,
    pub rxwin_use: RxWinParams,
    pub rxwin_set: Option<RxWinParams>,
    pub last_mac: Option<[u8; 8]>,
    pub last_rxq: Option<RxQ>,
    pub devstat: Option<DevStat>,
    pub devstat_fcnt: Option<u32>,
    /// Recent quality window: (RSSI, SNR) samples.
    pub last_qs: Vec<(f64, f64)>,
    pub last_rx: Option<DateTime<Utc>>,
    pub last_reset: Option<DateTime<Utc>>,
}

/// The most recently transmitted downlink for a DevAddr, kept so a
/// repeated uplink triggers re-transmission and a confirmed downlink is
/// retried until acknowledged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingFrame {
    pub devaddr: u32,
    pub confirmed: bool,
    pub phy: Vec<u8>,
}

/// Application downlink queued until the device's next uplink opens a
/// receive window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxFrame {
    pub devaddr: u32,
    pub txdata: TxData,
    pub datetime: DateTime<Utc>,
}

/// RX frame log entry, keyed by a monotonic frame id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RxFrame {
    pub frid: u64,
    pub mac: [u8; 8],
    pub rxq: RxQ,
    pub app: AppBinding,
    pub devaddr: u32,
    pub fcnt: u32,
    pub port: Option<u8>,
    /// Decrypted application payload.
    pub data: Vec<u8>,
    pub datetime: DateTime<Utc>,
    pub devstat: Option<DevStat>,
}

/// DevAddr pattern whose uplinks are dropped before MIC verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IgnoredLink {
    pub devaddr: u32,
    pub mask: Option<u32>,
}

impl IgnoredLink {
    pub fn matches(&self, devaddr: u32) -> bool {
        match self.mask {
            Some(mask) => devaddr & mask == self.devaddr,
            None => devaddr == self.devaddr,
        }
    }
}

/// Multicast group row, keyed by the multicast DevAddr. Shares the
/// downlink path with unicast but forbids confirmed frames and carries
/// no FOpts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MulticastGroup {
    pub devaddr: u32,
    pub region: Region,
    pub nwkskey: [u8; 16],
    pub appskey: [u8; 16],
    pub fcntdown: u32,
}

/// The mutable table set. [`SessionStore::atomic`] hands out `&mut Tables`
/// under the store lock.
#[derive(Debug, Default)]
pub struct Tables {
    pub gateways: BTreeMap<[u8; 8], Gateway>,
    pub devices: BTreeMap<u64, Device>,
    pub links: BTreeMap<u32, Link>,
    pub multicast: BTreeMap<u32, MulticastGroup>,
    pub ignored: Vec<IgnoredLink>,
    pub pending: BTreeMap<u32, PendingFrame>,
    pub txframes: Vec<TxFrame>,
    pub rxframes: BTreeMap<u64, RxFrame>,
    next_frid: u64,
}

impl Tables {
    pub fn append_rxframe(&mut self, mut frame: RxFrame) -> u64 {
        let frid = self.next_frid;
        self.next_frid += 1;
        frame.frid = frid;
        self.rxframes.insert(frid, frame);
        frid
    }

    pub fn purge_txframes(&mut self, devaddr: u32) {
        self.txframes.retain(|f| f.devaddr != devaddr);
    }
}

/// In-memory transactional store.
#[derive(Debug, Default)]
pub struct SessionStore {
    tables: Mutex<Tables>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` under the table lock. The closure's error aborts the
    /// transaction from the caller's point of view, but partial mutations
    /// are the closure's responsibility to avoid: mutate only after every
    /// validation step has passed.
    pub fn atomic<T>(&self, f: impl FnOnce(&mut Tables) -> Result<T, Error>) -> Result<T, Error> {
        f(&mut self.lock())
    }

    pub fn get_gateway(&self, mac: &[u8; 8]) -> Option<Gateway> {
        self.lock().gateways.get(mac).cloned()
    }

    pub fn put_gateway(&self, gateway: Gateway) {
        self.lock().gateways.insert(gateway.mac, gateway);
    }

    pub fn get_device(&self, deveui: u64) -> Option<Device> {
        self.lock().devices.get(&deveui).cloned()
    }

    pub fn put_device(&self, device: Device) {
        self.lock().devices.insert(device.deveui, device);
    }

    pub fn get_link(&self, devaddr: u32) -> Option<Link> {
        self.lock().links.get(&devaddr).cloned()
    }

    pub fn put_link(&self, link: Link) {
        self.lock().links.insert(link.devaddr, link);
    }

    pub fn get_multicast(&self, devaddr: u32) -> Option<MulticastGroup> {
        self.lock().multicast.get(&devaddr).cloned()
    }

    pub fn put_multicast(&self, group: MulticastGroup) {
        self.lock().multicast.insert(group.devaddr, group);
    }

    pub fn list_ignored(&self) -> Vec<IgnoredLink> {
        self.lock().ignored.clone()
    }

    pub fn add_ignored(&self, ignored: IgnoredLink) {
        self.lock().ignored.push(ignored);
    }

    pub fn get_pending(&self, devaddr: u32) -> Option<PendingFrame> {
        self.lock().pending.get(&devaddr).cloned()
    }

    pub fn put_pending(&self, pending: PendingFrame) {
        self.lock().pending.insert(pending.devaddr, pending);
    }

    pub fn delete_pending(&self, devaddr: u32) {
        self.lock().pending.remove(&devaddr);
    }

    /// Queue an application downlink for the device's next uplink.
    pub fn queue_txframe(&self, frame: TxFrame) {
        self.lock().txframes.push(frame);
    }

    /// Pop the oldest queued downlink for a DevAddr.
    pub fn next_txframe(&self, devaddr: u32) -> Option<TxFrame> {
        let mut tables = self.lock();
        let idx = tables.txframes.iter().position(|f| f.devaddr == devaddr)?;
        Some(tables.txframes.remove(idx))
    }

    pub fn purge_txframes(&self, devaddr: u32) {
        self.lock().purge_txframes(devaddr);
    }

    /// Append to the RX frame log; returns the assigned frame id.
    pub fn put_rxframe(&self, frame: RxFrame) -> u64 {
        self.lock().append_rxframe(frame)
    }

    pub fn list_rxframes(&self) -> Vec<RxFrame> {
        self.lock().rxframes.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link(devaddr: u32) -> Link {
        Link {
            devaddr,
            region: Region::EU868,
            app: AppBinding { app: "test".into(), appid: "1".into(), appargs: None },
            nwkskey: [2; 16],
            appskey: [1; 16],
            fcntup: 0,
            fcntdown: 0,
            fcnt_check: FcntCheck::Strict16,
            adr_flag_use: false,
            adr_flag_set: None,
            adr_use: None,
            adr_set: None,
            rxwin_use: Region::EU868.default_rxwin(),
            rxwin_set: None,
            last_mac: None,
            last_rxq: None,
            devstat: None,
            devstat_fcnt: None,
            last_qs: Vec::new(),
            last_rx: None,
            last_reset: None,
        }
    }

    #[test]
    fn test_atomic_mutation_is_visible() {
        let store = SessionStore::new();
        store.put_link(link(0x11223344));

        store
            .atomic(|t| {
                let l = t.links.get_mut(&0x11223344).ok_or(Error::UnknownDevAddr(0x11223344))?;
                l.fcntdown = l.fcntdown.wrapping_add(1);
                Ok(())
            })
            .unwrap();

        assert_eq!(store.get_link(0x11223344).unwrap().fcntdown, 1);
    }

    #[test]
    fn test_atomic_error_propagates() {
        let store = SessionStore::new();
        let err = store
            .atomic(|t| {
                t.links.get_mut(&1).ok_or(Error::UnknownDevAddr(1))?;
                Ok(())
            })
            .unwrap_err();
        assert_eq!(err, Error::UnknownDevAddr(1));
    }

    #[test]
    fn test_ignored_link_matching() {
        let exact = IgnoredLink { devaddr: 0x11223344, mask: None };
        assert!(exact.matches(0x11223344));
        assert!(!exact.matches(0x11223345));

        let masked = IgnoredLink { devaddr: 0x11000000, mask: Some(0xFF000000) };
        assert!(masked.matches(0x11FFFFFF));
        assert!(masked.matches(0x11000000));
        assert!(!masked.matches(0x12000000));
    }

    #[test]
    fn test_rxframe_ids_are_monotonic() {
        let store = SessionStore::new();
        let frame = RxFrame {
            frid: 0,
            mac: [0; 8],
            rxq: RxQ {
                freq: 868.1,
                datr: "SF7BW125".into(),
                codr: None,
                rssi: -40.0,
                lsnr: None,
                tmst: 0,
                srvtmst: 0,
            },
            app: AppBinding { app: "test".into(), appid: "1".into(), appargs: None },
            devaddr: 1,
            fcnt: 0,
            port: None,
            data: Vec::new(),
            datetime: Utc::now(),
            devstat: None,
        };
        let a = store.put_rxframe(frame.clone());
        let b = store.put_rxframe(frame);
        assert!(b > a);
        assert_eq!(store.list_rxframes().len(), 2);
    }

    #[test]
    fn test_txframe_queue_is_fifo_per_devaddr() {
        let store = SessionStore::new();
        let mk = |devaddr, port| TxFrame {
            devaddr,
            txdata: TxData { port: Some(port), ..TxData::default() },
            datetime: Utc::now(),
        };
        store.queue_txframe(mk(1, 1));
        store.queue_txframe(mk(2, 9));
        store.queue_txframe(mk(1, 2));

        assert_eq!(store.next_txframe(1).unwrap().txdata.port, Some(1));
        assert_eq!(store.next_txframe(1).unwrap().txdata.port, Some(2));
        assert!(store.next_txframe(1).is_none());
        store.purge_txframes(2);
        assert!(store.next_txframe(2).is_none());
    }
}
