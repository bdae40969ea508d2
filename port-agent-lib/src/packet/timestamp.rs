#![forbid(unsafe_code)]

use std::time::{SystemTime, UNIX_EPOCH};

/// Offset between the POSIX epoch (1970) and the NTP era 0 epoch (1900).
const NTP_EPOCH_OFFSET: u64 = 2_208_988_800;

/// NTP-v4 timestamp: whole seconds since 1900 plus a 2^-32 fraction.
///
/// The on-wire form is eight bytes, fraction first then seconds, each
/// big-endian. Values are immutable once constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Timestamp {
    seconds: u32,
    fraction: u32,
}

impl Timestamp {
    /// Capture the current wall-clock time.
    pub fn now() -> Self {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let seconds = (since_epoch.as_secs() + NTP_EPOCH_OFFSET) as u32;
        let fraction = ((u64::from(since_epoch.subsec_micros()) << 32) / 1_000_000) as u32;
        Self { seconds, fraction }
    }

    pub fn from_parts(seconds: u32, fraction: u32) -> Self {
        Self { seconds, fraction }
    }

    pub fn seconds(&self) -> u32 {
        self.seconds
    }

    pub fn fraction(&self) -> u32 {
        self.fraction
    }

    /// Eight-byte wire form: big-endian fraction, then big-endian seconds.
    pub fn as_binary(&self) -> [u8; 8] {
        let mut out = [0u8; 8];
        out[..4].copy_from_slice(&self.fraction.to_be_bytes());
        out[4..].copy_from_slice(&self.seconds.to_be_bytes());
        out
    }

    pub fn from_binary(raw: [u8; 8]) -> Self {
        let fraction = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]);
        let seconds = u32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]);
        Self { seconds, fraction }
    }

    /// Seconds plus fractional part. Only for elapsed-time comparisons and
    /// log formatting, never a wire representation.
    pub fn as_double(&self) -> f64 {
        f64::from(self.seconds) + f64::from(self.fraction) / 2f64.powi(32)
    }

    /// Seconds elapsed between this timestamp and now.
    pub fn elapsed(&self) -> f64 {
        Timestamp::now().as_double() - self.as_double()
    }

    /// Decimal rendering used in the ASCII packet form.
    pub fn as_number(&self) -> String {
        format!("{:.4}", self.as_double())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_form_is_fraction_then_seconds_big_endian() {
        let ts = Timestamp::from_parts(0x0102_0304, 0xAABB_CCDD);
        assert_eq!(
            ts.as_binary(),
            [0xAA, 0xBB, 0xCC, 0xDD, 0x01, 0x02, 0x03, 0x04]
        );
        assert_eq!(Timestamp::from_binary(ts.as_binary()), ts);
    }

    #[test]
    fn now_is_past_the_posix_epoch_offset() {
        let ts = Timestamp::now();
        assert!(u64::from(ts.seconds()) > NTP_EPOCH_OFFSET);
    }

    #[test]
    fn as_double_combines_fraction() {
        let ts = Timestamp::from_parts(10, u32::MAX / 2 + 1);
        let value = ts.as_double();
        assert!((value - 10.5).abs() < 1e-6);
    }

    #[test]
    fn elapsed_is_non_negative() {
        let ts = Timestamp::now();
        assert!(ts.elapsed() >= 0.0);
    }
}
