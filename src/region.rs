//! Regional PHY parameters, queried as pure functions of the region tag.
//!
//! Covers the two channel-plan families the server is deployed with: the
//! dynamic EU868 plan (RX1 answers on the uplink frequency) and the fixed
//! US915 plan (RX1 answers on one of eight 500 kHz downlink channels).

use serde::{Deserialize, Serialize};

use crate::store::{AdrParams, RxWinParams};

/// Radio-layer metadata for a received uplink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RxQ {
    /// Frequency in MHz
    pub freq: f64,
    /// LoRa datarate identifier (e.g., "SF7BW125")
    pub datr: String,
    /// LoRa coding rate (e.g., "4/5")
    pub codr: Option<String>,
    /// RSSI in dBm
    pub rssi: f64,
    /// LoRa signal-to-noise ratio
    pub lsnr: Option<f64>,
    /// Gateway concentrator timestamp (microseconds)
    pub tmst: u32,
    /// Server-monotonic receive timestamp (milliseconds)
    pub srvtmst: u64,
}

/// When a downlink leaves the gateway antenna.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxTime {
    /// Transmit as soon as the gateway can (Class-C style)
    Immediate,
    /// Gateway concentrator timestamp (microseconds)
    Timestamp(u32),
}

/// Radio-layer instructions for a downlink transmission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxQ {
    pub freq: f64,
    pub datr: String,
    pub codr: String,
    /// Transmit power in dBm
    pub power: i8,
    pub time: TxTime,
}

/// Which receive-window delay applies: the join windows open later than
/// the data windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delay {
    Join,
    Data,
}

const CODING_RATE: &str = "4/5";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Region {
    EU868,
    US915,
}

impl Region {
    /// Initial ADR state installed at join and restored on FCnt reset.
    pub fn default_adr(&self) -> AdrParams {
        match self {
            Region::EU868 => {
                AdrParams { power: Some(1), datr: Some(0), chans: Some(vec![(0, 2)]) }
            }
            Region::US915 => {
                AdrParams { power: Some(5), datr: Some(0), chans: Some(vec![(0, 71)]) }
            }
        }
    }

    /// Initial RX-window state installed at join and restored on FCnt reset.
    pub fn default_rxwin(&self) -> RxWinParams {
        match self {
            Region::EU868 => RxWinParams { rx1_dr_offset: 0, rx2_dr: 0, rx2_freq: 869.525 },
            Region::US915 => RxWinParams { rx1_dr_offset: 0, rx2_dr: 8, rx2_freq: 923.3 },
        }
    }

    /// RX1 delay for data uplinks, milliseconds (RxDelay is fixed to 1).
    pub fn rx1_delay_ms(&self) -> u64 {
        1000
    }

    /// RX2 data rate index announced in the join-accept DLSettings.
    pub fn rx2_dr(&self) -> u8 {
        self.default_rxwin().rx2_dr
    }

    /// Datarate identifier string to data-rate index.
    pub fn datar_to_dr(&self, datr: &str) -> Option<u8> {
        let dr = match (self, datr) {
            (Region::EU868, "SF12BW125") => 0,
            (Region::EU868, "SF11BW125") => 1,
            (Region::EU868, "SF10BW125") => 2,
            (Region::EU868, "SF9BW125") => 3,
            (Region::EU868, "SF8BW125") => 4,
            (Region::EU868, "SF7BW125") => 5,
            (Region::EU868, "SF7BW250") => 6,
            (Region::US915, "SF10BW125") => 0,
            (Region::US915, "SF9BW125") => 1,
            (Region::US915, "SF8BW125") => 2,
            (Region::US915, "SF7BW125") => 3,
            (Region::US915, "SF8BW500") => 4,
            _ => return None,
        };
        Some(dr)
    }

    /// Data-rate index to datarate identifier string, downlink rates included.
    pub fn dr_to_datar(&self, dr: u8) -> Option<&'static str> {
        let datr = match (self, dr) {
            (Region::EU868, 0) => "SF12BW125",
            (Region::EU868, 1) => "SF11BW125",
            (Region::EU868, 2) => "SF10BW125",
            (Region::EU868, 3) => "SF9BW125",
            (Region::EU868, 4) => "SF8BW125",
            (Region::EU868, 5) => "SF7BW125",
            (Region::EU868, 6) => "SF7BW250",
            (Region::US915, 0) => "SF10BW125",
            (Region::US915, 1) => "SF9BW125",
            (Region::US915, 2) => "SF8BW125",
            (Region::US915, 3) => "SF7BW125",
            (Region::US915, 4) => "SF8BW500",
            (Region::US915, 8) => "SF12BW500",
            (Region::US915, 9) => "SF11BW500",
            (Region::US915, 10) => "SF10BW500",
            (Region::US915, 11) => "SF9BW500",
            (Region::US915, 12) => "SF8BW500",
            (Region::US915, 13) => "SF7BW500",
            _ => return None,
        };
        Some(datr)
    }

    /// Build the RX1 transmission for an uplink received as `rxq`.
    pub fn rx1_window(&self, rxwin: &RxWinParams, rxq: &RxQ, delay: Delay) -> TxQ {
        let time = TxTime::Timestamp(rxq.tmst.wrapping_add(self.rx1_delay_us(delay)));
        match self {
            Region::EU868 => {
                let datr = match self.datar_to_dr(&rxq.datr) {
                    Some(dr) => {
                        let rx1_dr = dr.saturating_sub(rxwin.rx1_dr_offset);
                        self.dr_to_datar(rx1_dr).unwrap_or("SF12BW125").to_string()
                    }
                    None => rxq.datr.clone(),
                };
                TxQ { freq: rxq.freq, datr, codr: CODING_RATE.to_string(), power: 14, time }
            }
            Region::US915 => {
                let chan = us915_uplink_channel(rxq.freq);
                let freq = 923.3 + 0.6 * f64::from(chan % 8);
                let dr = self.datar_to_dr(&rxq.datr).unwrap_or(0);
                let rx1_dr = (dr + 10).saturating_sub(rxwin.rx1_dr_offset).clamp(8, 13);
                let datr = self.dr_to_datar(rx1_dr).unwrap_or("SF12BW500").to_string();
                TxQ { freq, datr, codr: CODING_RATE.to_string(), power: 27, time }
            }
        }
    }

    /// Build the RX2 transmission for an uplink received as `rxq`.
    pub fn rx2_window(&self, rxwin: &RxWinParams, rxq: &RxQ, delay: Delay) -> TxQ {
        let time = TxTime::Timestamp(rxq.tmst.wrapping_add(self.rx1_delay_us(delay) + 1_000_000));
        self.rx2_txq(rxwin, time)
    }

    /// Radio parameters for server-initiated and multicast transmissions:
    /// the RX2 settings at a caller-chosen time.
    pub fn rf_group(&self, rxwin: &RxWinParams, time: TxTime) -> TxQ {
        self.rx2_txq(rxwin, time)
    }

    fn rx2_txq(&self, rxwin: &RxWinParams, time: TxTime) -> TxQ {
        let datr = self
            .dr_to_datar(rxwin.rx2_dr)
            .or_else(|| self.dr_to_datar(self.default_rxwin().rx2_dr))
            .unwrap_or("SF12BW125")
            .to_string();
        let power = match self {
            Region::EU868 => 27,
            Region::US915 => 27,
        };
        TxQ { freq: rxwin.rx2_freq, datr, codr: CODING_RATE.to_string(), power, time }
    }

    fn rx1_delay_us(&self, delay: Delay) -> u32 {
        match delay {
            Delay::Join => 5_000_000,
            Delay::Data => 1_000_000,
        }
    }
}

// Uplink channel index from the carrier frequency: 64 narrow channels at
// 200 kHz spacing from 902.3 MHz, then 8 wide ones at 1.6 MHz from 903.0.
fn us915_uplink_channel(freq: f64) -> u32 {
    let ch = (freq - 902.3) / 0.2;
    if (ch - ch.round()).abs() < 0.05 && (0.0..64.0).contains(&ch.round()) {
        ch.round() as u32
    } else {
        64 + (((freq - 903.0) / 1.6).round().max(0.0) as u32)
    }
}
