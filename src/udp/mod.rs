//! Semtech UDP Packet Forwarder server.
//!
//! Receives PUSH_DATA/PULL_DATA from gateways, feeds decoded uplinks to
//! the MAC engine on worker tasks, and routes the engine's transmit
//! orders back as PULL_RESP to the gateway's last PULL_DATA address.

pub mod protocol;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use base64::Engine as _;
use tokio::net::UdpSocket;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::app::Application;
use crate::config::Config;
use crate::mac::{commands::MacHandler, Action, MacEngine};
use crate::region::{RxQ, TxQ, TxTime};
use crate::util;
use protocol::{GatewayEui, GwmpPacket, PullRespPayload, PushDataPayload, Rxpk, Txpk};

/// Tracks each gateway's downlink address (learned from PULL_DATA
/// keepalives). PULL_RESP packets go to the source address of the
/// gateway's most recent PULL_DATA.
#[derive(Debug, Clone, Default)]
pub struct GatewayTracker {
    inner: Arc<RwLock<HashMap<GatewayEui, SocketAddr>>>,
}

impl GatewayTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Update the tracked address for a gateway
    pub async fn set(&self, eui: GatewayEui, addr: SocketAddr) {
        let mut guard = self.inner.write().await;
        let changed = guard.insert(eui, addr) != Some(addr);
        if changed {
            info!("Gateway {} downlink address: {}", hex::encode(eui), addr);
        }
    }

    /// Get the tracked address (None if no PULL_DATA received yet)
    pub async fn get(&self, eui: &GatewayEui) -> Option<SocketAddr> {
        self.inner.read().await.get(eui).copied()
    }
}

/// Run the Semtech UDP Packet Forwarder server against the MAC engine.
pub async fn run_server<A, M>(
    config: &Config,
    engine: Arc<MacEngine<A, M>>,
) -> anyhow::Result<()>
where
    A: Application + 'static,
    M: MacHandler + 'static,
{
    let socket = Arc::new(UdpSocket::bind(&config.udp.bind).await?);
    info!("UDP server listening on {}", config.udp.bind);

    let tracker = GatewayTracker::new();

    let mut buf = vec![0u8; 65535];
    loop {
        let (len, src) = socket.recv_from(&mut buf).await?;
        debug!("Received {} bytes from {}", len, src);

        match GwmpPacket::parse(&buf[..len]) {
            Ok(packet) => {
                handle_packet(&socket, src, packet, &engine, &tracker).await;
            }
            Err(e) => {
                warn!("Failed to parse GWMP packet from {}: {}", src, e);
            }
        }
    }
}

async fn handle_packet<A, M>(
    socket: &Arc<UdpSocket>,
    src: SocketAddr,
    packet: GwmpPacket,
    engine: &Arc<MacEngine<A, M>>,
    tracker: &GatewayTracker,
) where
    A: Application + 'static,
    M: MacHandler + 'static,
{
    match packet {
        GwmpPacket::PushData { token, eui, json } => {
            debug!("PUSH_DATA from gateway {} (token: 0x{:04x})", hex::encode(eui), token);

            // Send ACK immediately
            let ack = GwmpPacket::push_ack(token);
            if let Err(e) = socket.send_to(&ack, src).await {
                error!("Failed to send PUSH_ACK to {}: {}", src, e);
            }

            match serde_json::from_str::<PushDataPayload>(&json) {
                Ok(payload) => {
                    for rxpk in payload.rxpk.unwrap_or_default() {
                        let engine = engine.clone();
                        let socket = socket.clone();
                        let tracker = tracker.clone();
                        // One worker task per received packet; per-DevAddr
                        // ordering comes from the store transactions.
                        tokio::spawn(async move {
                            process_rxpk(engine, socket, tracker, eui, rxpk).await;
                        });
                    }

                    if let Some(stat) = payload.stat {
                        if let Err(e) = engine.process_status(eui, stat) {
                            warn!("status report rejected: {}", e);
                        }
                    }
                }
                Err(e) => {
                    warn!("Failed to parse PUSH_DATA JSON: {}", e);
                    debug!("  Raw JSON: {}", json);
                }
            }
        }
        GwmpPacket::PullData { token, eui } => {
            debug!("PULL_DATA from gateway {} (token: 0x{:04x})", hex::encode(eui), token);

            // Track the gateway address for downlink delivery
            tracker.set(eui, src).await;

            let ack = GwmpPacket::pull_ack(token);
            if let Err(e) = socket.send_to(&ack, src).await {
                error!("Failed to send PULL_ACK to {}: {}", src, e);
            }
        }
        GwmpPacket::TxAck { token, eui, json } => {
            let gw = hex::encode(eui);
            let error = json
                .as_deref()
                .and_then(|body| serde_json::from_str::<serde_json::Value>(body).ok())
                .and_then(|parsed| {
                    parsed
                        .get("txpk_ack")
                        .and_then(|a| a.get("error"))
                        .and_then(|e| e.as_str())
                        .map(str::to_string)
                });
            match error.as_deref() {
                None | Some("NONE") => {
                    debug!("TX_ACK from gateway {} (token: 0x{:04x}): OK", gw, token);
                }
                Some(err) => {
                    warn!("TX_ACK from gateway {} (token: 0x{:04x}): ERROR: {}", gw, token, err);
                }
            }
        }
    }
}

async fn process_rxpk<A, M>(
    engine: Arc<MacEngine<A, M>>,
    socket: Arc<UdpSocket>,
    tracker: GatewayTracker,
    gateway_eui: GatewayEui,
    rxpk: Rxpk,
) where
    A: Application,
    M: MacHandler,
{
    debug!(
        "rxpk: freq={} MHz, rssi={} dBm, datr={}, size={} bytes",
        rxpk.freq, rxpk.rssi, rxpk.datr, rxpk.size
    );

    let phy = match base64_decode(&rxpk.data) {
        Ok(phy) => phy,
        Err(e) => {
            warn!("Failed to base64 decode rxpk data: {}", e);
            return;
        }
    };

    let rxq = RxQ {
        freq: rxpk.freq,
        datr: rxpk.datr.clone(),
        codr: rxpk.codr.clone(),
        rssi: rxpk.rssi,
        lsnr: rxpk.lsnr,
        tmst: rxpk.tmst.unwrap_or(0),
        srvtmst: util::monotonic_ms(),
    };

    match engine.process_frame(gateway_eui, rxq, &phy) {
        Ok(Action::Send { txq, phy }) => {
            send_downlink(&socket, &tracker, &gateway_eui, &txq, &phy).await;
        }
        Ok(Action::Ok) => {}
        Err(e) => {
            warn!("uplink from gateway {} rejected: {}", hex::encode(gateway_eui), e);
        }
    }
}

/// Send a PULL_RESP downlink to the tracked gateway address.
async fn send_downlink(
    socket: &UdpSocket,
    tracker: &GatewayTracker,
    gateway_eui: &GatewayEui,
    txq: &TxQ,
    phy: &[u8],
) {
    let Some(gw_addr) = tracker.get(gateway_eui).await else {
        warn!(
            "no downlink route to gateway {} (no PULL_DATA received yet)",
            hex::encode(gateway_eui)
        );
        return;
    };

    let payload = PullRespPayload { txpk: txpk_from(txq, phy) };
    let json = match serde_json::to_string(&payload) {
        Ok(json) => json,
        Err(e) => {
            error!("Failed to serialize txpk: {}", e);
            return;
        }
    };

    let token = rand::random::<u16>();
    let packet = GwmpPacket::pull_resp(token, &json);

    match socket.send_to(&packet, gw_addr).await {
        Ok(_) => {
            info!(
                "Sent PULL_RESP to gateway {} (token=0x{:04x}, {} bytes)",
                gw_addr,
                token,
                json.len()
            );
        }
        Err(e) => {
            error!("Failed to send PULL_RESP to {}: {}", gw_addr, e);
        }
    }
}

/// Build a txpk from the engine's transmit order.
pub fn txpk_from(txq: &TxQ, phy: &[u8]) -> Txpk {
    let (imme, tmst) = match txq.time {
        TxTime::Immediate => (Some(true), None),
        TxTime::Timestamp(t) => (None, Some(t)),
    };
    Txpk {
        imme,
        tmst,
        freq: txq.freq,
        rfch: Some(0),
        powe: Some(txq.power),
        modu: Some("LORA".to_string()),
        datr: txq.datr.clone(),
        codr: Some(txq.codr.clone()),
        ipol: Some(true), // Inverted polarity for downlink
        size: phy.len() as u16,
        data: base64::engine::general_purpose::STANDARD.encode(phy),
        ncrc: Some(true), // No CRC for downlink
    }
}

fn base64_decode(input: &str) -> anyhow::Result<Vec<u8>> {
    base64::engine::general_purpose::STANDARD
        .decode(input)
        .map_err(|e| anyhow::anyhow!("Base64 decode error: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gateway_tracker() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let tracker = GatewayTracker::new();
            let eui = [1, 2, 3, 4, 5, 6, 7, 8];
            assert!(tracker.get(&eui).await.is_none());

            let addr: SocketAddr = "127.0.0.1:1700".parse().unwrap();
            tracker.set(eui, addr).await;
            assert_eq!(tracker.get(&eui).await, Some(addr));

            // A second gateway does not disturb the first
            let eui2 = [8, 7, 6, 5, 4, 3, 2, 1];
            let addr2: SocketAddr = "127.0.0.1:1701".parse().unwrap();
            tracker.set(eui2, addr2).await;
            assert_eq!(tracker.get(&eui).await, Some(addr));
            assert_eq!(tracker.get(&eui2).await, Some(addr2));
        });
    }

    #[test]
    fn test_txpk_from_timestamped_order() {
        let txq = TxQ {
            freq: 869.525,
            datr: "SF12BW125".to_string(),
            codr: "4/5".to_string(),
            power: 27,
            time: TxTime::Timestamp(2_000_000),
        };
        let txpk = txpk_from(&txq, &[1, 2, 3, 4]);
        assert_eq!(txpk.tmst, Some(2_000_000));
        assert_eq!(txpk.imme, None);
        assert_eq!(txpk.freq, 869.525);
        assert_eq!(txpk.ipol, Some(true));
        assert_eq!(txpk.size, 4);
        assert_eq!(txpk.data, "AQIDBA==");
    }

    #[test]
    fn test_txpk_from_immediate_order() {
        let txq = TxQ {
            freq: 923.3,
            datr: "SF12BW500".to_string(),
            codr: "4/5".to_string(),
            power: 27,
            time: TxTime::Immediate,
        };
        let txpk = txpk_from(&txq, &[0xFF]);
        assert_eq!(txpk.imme, Some(true));
        assert_eq!(txpk.tmst, None);
    }
}
