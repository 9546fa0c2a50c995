//! MAC-command handler contract.
//!
//! The engine decrypts incoming FOpts (from FHDR or an FPort-0 payload)
//! and hands them here together with the mutable link row and the
//! RX-log entry under construction; the handler returns the FOpts bytes
//! to piggyback on the next downlink. ADR rate-steering, link checks and
//! device-status polling all live behind this seam.

use tracing::debug;

use crate::error::Error;
use crate::region::RxQ;
use crate::store::{Link, RxFrame};

pub trait MacHandler: Send + Sync {
    /// Process the uplink's MAC commands. May mutate ADR/RX-window
    /// desired state, `devstat`, `devstat_fcnt` and `last_qs` on the
    /// link, and annotate the RX-log entry.
    fn handle(
        &self,
        rxq: &RxQ,
        link: &mut Link,
        fopts: &[u8],
        rxframe: &mut RxFrame,
    ) -> Result<Vec<u8>, Error>;

    /// FOpts for a server-initiated downlink outside an uplink exchange.
    fn build_fopts(&self, link: &Link) -> Vec<u8>;
}

/// Default handler: records quality samples, answers nothing.
pub struct NullMacHandler;

impl MacHandler for NullMacHandler {
    fn handle(
        &self,
        rxq: &RxQ,
        link: &mut Link,
        fopts: &[u8],
        _rxframe: &mut RxFrame,
    ) -> Result<Vec<u8>, Error> {
        if !fopts.is_empty() {
            debug!(
                "DevAddr={:08X}: ignoring {} bytes of MAC commands: {}",
                link.devaddr,
                fopts.len(),
                hex::encode(fopts)
            );
        }
        if let Some(snr) = rxq.lsnr {
            link.last_qs.push((rxq.rssi, snr));
            if link.last_qs.len() > 50 {
                link.last_qs.remove(0);
            }
        }
        Ok(Vec::new())
    }

    fn build_fopts(&self, _link: &Link) -> Vec<u8> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::Region;
    use crate::store::{AppBinding, FcntCheck};

    fn link() -> Link {
        Link {
            devaddr: 0x11223344,
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

    fn rxq() -> RxQ {
        RxQ {
            freq: 868.1,
            datr: "SF7BW125".into(),
            codr: None,
            rssi: -42.0,
            lsnr: Some(7.5),
            tmst: 0,
            srvtmst: 0,
        }
    }

    #[test]
    fn test_null_handler_tracks_quality_and_stays_silent() {
        let mut link = link();
        let mut rxframe = RxFrame {
            frid: 0,
            mac: [0; 8],
            rxq: rxq(),
            app: link.app.clone(),
            devaddr: link.devaddr,
            fcnt: 0,
            port: None,
            data: Vec::new(),
            datetime: chrono::Utc::now(),
            devstat: None,
        };

        let out = NullMacHandler.handle(&rxq(), &mut link, &[0x02], &mut rxframe).unwrap();
        assert!(out.is_empty());
        assert_eq!(link.last_qs, vec![(-42.0, 7.5)]);
        assert!(NullMacHandler.build_fopts(&link).is_empty());
    }
}
