use std::time::Instant;

use once_cell::sync::Lazy;

static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Milliseconds since process start. Stamped on every received uplink
/// (`RxQ::srvtmst`) and read again when deciding between the RX1 and RX2
/// windows, so only differences are meaningful.
pub fn monotonic_ms() -> u64 {
    EPOCH.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_ms_does_not_go_backwards() {
        let a = monotonic_ms();
        let b = monotonic_ms();
        assert!(b >= a);
    }
}
