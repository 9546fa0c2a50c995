//! TOML configuration: transport binding, engine timing, logging, and the
//! provisioning tables that seed the session store at startup.
//!
//! Identifiers and keys are hex strings. Frame-counter check modes:
//! `strict-16`, `strict-32`, `reset-allowed`, `disabled`. With only 16
//! counter bits on the wire a reset cannot be told apart from a rollover
//! past 0xFFFF, so pick `strict-32` for devices with persistent counters
//! and `reset-allowed` for devices that reboot with fresh counters.

use std::path::Path;

use serde::Deserialize;

use crate::region::Region;
use crate::store::{
    AppBinding, Device, FcntCheck, Gateway, IgnoredLink, MulticastGroup, SessionStore,
};

#[derive(Debug, Deserialize)]
pub struct Config {
    pub udp: UdpConfig,
    pub lorawan: LorawanConfig,
    pub logging: LoggingConfig,
    #[serde(default)]
    pub provisioning: Provisioning,
}

#[derive(Debug, Deserialize)]
pub struct UdpConfig {
    pub bind: String,
}

#[derive(Debug, Deserialize)]
pub struct LorawanConfig {
    /// Worst-case server-side processing budget in milliseconds, used to
    /// decide whether the RX1 window is still reachable.
    pub preprocessing_delay: u64,
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct Provisioning {
    #[serde(default)]
    pub gateways: Vec<GatewayConf>,
    #[serde(default)]
    pub devices: Vec<DeviceConf>,
    #[serde(default)]
    pub ignored: Vec<IgnoredConf>,
    #[serde(default)]
    pub multicast: Vec<MulticastConf>,
}

#[derive(Debug, Deserialize)]
pub struct GatewayConf {
    /// 8-byte MAC, hex
    pub mac: String,
    /// 3-byte NetID, hex
    pub netid: String,
    pub desc: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DeviceConf {
    /// 8-byte DevEUI, hex
    pub deveui: String,
    /// 16-byte AppKey, hex
    pub appkey: String,
    pub region: Region,
    #[serde(default = "default_true")]
    pub can_join: bool,
    #[serde(default = "default_fcnt_check")]
    pub fcnt_check: FcntCheck,
    pub app: String,
    #[serde(default)]
    pub appid: String,
    pub appargs: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct IgnoredConf {
    /// 4-byte DevAddr, hex
    pub devaddr: String,
    /// 4-byte mask, hex; exact match when absent
    pub mask: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct MulticastConf {
    pub devaddr: String,
    pub nwkskey: String,
    pub appskey: String,
    pub region: Region,
}

fn default_true() -> bool {
    true
}

fn default_fcnt_check() -> FcntCheck {
    FcntCheck::Strict16
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {:?}: {}", path, e))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse config file: {}", e))?;
        Ok(config)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            udp: UdpConfig { bind: "0.0.0.0:1680".to_string() },
            lorawan: LorawanConfig { preprocessing_delay: 50 },
            logging: LoggingConfig { level: "info".to_string() },
            provisioning: Provisioning::default(),
        }
    }
}

impl Provisioning {
    /// Seed the session store with the configured rows.
    pub fn seed(&self, store: &SessionStore) -> anyhow::Result<()> {
        for gw in &self.gateways {
            store.put_gateway(Gateway {
                mac: hex_array::<8>(&gw.mac)?,
                netid: hex_array::<3>(&gw.netid)?,
                last_rx: None,
                position: None,
                altitude: None,
                desc: gw.desc.clone(),
            });
        }
        for dev in &self.devices {
            store.put_device(Device {
                deveui: u64::from_be_bytes(hex_array::<8>(&dev.deveui)?),
                appkey: hex_array::<16>(&dev.appkey)?,
                can_join: dev.can_join,
                region: dev.region,
                app: AppBinding {
                    app: dev.app.clone(),
                    appid: dev.appid.clone(),
                    appargs: dev.appargs.clone(),
                },
                fcnt_check: dev.fcnt_check,
                adr_flag_set: None,
                adr_set: None,
                rxwin_set: None,
                last_join: None,
                devaddr: None,
            });
        }
        for ignored in &self.ignored {
            store.add_ignored(IgnoredLink {
                devaddr: u32::from_be_bytes(hex_array::<4>(&ignored.devaddr)?),
                mask: ignored
                    .mask
                    .as_deref()
                    .map(|m| hex_array::<4>(m).map(u32::from_be_bytes))
                    .transpose()?,
            });
        }
        for group in &self.multicast {
            store.put_multicast(MulticastGroup {
                devaddr: u32::from_be_bytes(hex_array::<4>(&group.devaddr)?),
                region: group.region,
                nwkskey: hex_array::<16>(&group.nwkskey)?,
                appskey: hex_array::<16>(&group.appskey)?,
                fcntdown: 0,
            });
        }
        Ok(())
    }
}

fn hex_array<const N: usize>(s: &str) -> anyhow::Result<[u8; N]> {
    let bytes = hex::decode(s.trim()).map_err(|e| anyhow::anyhow!("invalid hex {:?}: {}", s, e))?;
    bytes
        .try_into()
        .map_err(|v: Vec<u8>| anyhow::anyhow!("expected {} hex bytes, got {}", N, v.len()))
}
