//! Application dispatcher contract.
//!
//! The engine fans decoded uplinks out to the application bound to the
//! device and collects the application's downlink intent for the same
//! receive-window exchange.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::Error;
use crate::region::RxQ;
use crate::store::AppBinding;

/// Decoded uplink handed to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RxData {
    pub fcnt: u32,
    pub port: Option<u8>,
    /// Decrypted application payload.
    pub data: Vec<u8>,
    /// A confirmed downlink is outstanding and the device did not ACK it.
    pub last_lost: bool,
    /// The engine will answer in a receive window even without app data.
    pub shall_reply: bool,
}

/// Application downlink intent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxData {
    pub port: Option<u8>,
    pub data: Vec<u8>,
    pub confirmed: bool,
    /// Sets FPending: more data is waiting after this frame.
    pub pending: bool,
}

/// What the application wants done with the receive window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppResult {
    /// Nothing to send; the engine replies anyway if the MAC layer must.
    Ok,
    /// Re-send the pending downlink unchanged.
    Retransmit,
    /// Send a fresh downlink.
    Send(TxData),
}

pub trait Application: Send + Sync {
    fn handle_join(&self, devaddr: u32, app: &AppBinding) -> Result<(), Error>;

    fn handle_rx(
        &self,
        devaddr: u32,
        app: &AppBinding,
        rx: RxData,
        rxq: &RxQ,
    ) -> Result<AppResult, Error>;
}

/// Default dispatcher: logs every event and never initiates a downlink.
pub struct LogApplication;

impl Application for LogApplication {
    fn handle_join(&self, devaddr: u32, app: &AppBinding) -> Result<(), Error> {
        info!("join accepted: DevAddr={:08X} app={}/{}", devaddr, app.app, app.appid);
        Ok(())
    }

    fn handle_rx(
        &self,
        devaddr: u32,
        app: &AppBinding,
        rx: RxData,
        rxq: &RxQ,
    ) -> Result<AppResult, Error> {
        info!(
            "uplink: DevAddr={:08X} app={} FCnt={} port={:?} {} bytes (rssi={}, lost={})",
            devaddr,
            app.app,
            rx.fcnt,
            rx.port,
            rx.data.len(),
            rxq.rssi,
            rx.last_lost,
        );
        Ok(AppResult::Ok)
    }
}
