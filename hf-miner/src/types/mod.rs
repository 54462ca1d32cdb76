//! Measurement types shared by the session and its reports.

use std::fmt;
use std::time::Duration;

/// Hashrate measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct HashRate(pub u64); // hashes per second

impl HashRate {
    /// Average rate of `hashes` performed over `elapsed`.
    pub fn from_hashes(hashes: u64, elapsed: Duration) -> Self {
        let secs = elapsed.as_secs_f64();
        if secs <= 0.0 {
            return Self(0);
        }
        Self((hashes as f64 / secs) as u64)
    }

    /// Create from megahashes per second
    pub fn from_megahashes(mh: f64) -> Self {
        Self((mh * 1_000_000.0) as u64)
    }

    /// Create from gigahashes per second
    pub fn from_gigahashes(gh: f64) -> Self {
        Self((gh * 1_000_000_000.0) as u64)
    }

    /// Get value as megahashes per second
    pub fn as_megahashes(&self) -> f64 {
        self.0 as f64 / 1_000_000.0
    }

    /// Get value as gigahashes per second
    pub fn as_gigahashes(&self) -> f64 {
        self.0 as f64 / 1_000_000_000.0
    }

    /// Get value as terahashes per second
    pub fn as_terahashes(&self) -> f64 {
        self.0 as f64 / 1_000_000_000_000.0
    }

    /// Format with the largest unit that keeps the value at or above one.
    pub fn to_human_readable(&self) -> String {
        if self.0 >= 1_000_000_000_000 {
            format!("{:.2} TH/s", self.as_terahashes())
        } else if self.0 >= 1_000_000_000 {
            format!("{:.2} GH/s", self.as_gigahashes())
        } else if self.0 >= 1_000_000 {
            format!("{:.2} MH/s", self.as_megahashes())
        } else {
            format!("{} H/s", self.0)
        }
    }
}

impl fmt::Display for HashRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_human_readable())
    }
}

impl From<HashRate> for f64 {
    fn from(rate: HashRate) -> Self {
        rate.0 as f64
    }
}

/// Expected rate of one GN die running at `clockrate_mhz`.
///
/// 0.768 GH/s per MHz, less 3% for cores lost to yield.
pub fn nominal_hash_rate(clockrate_mhz: u16) -> HashRate {
    let clock = f64::from(clockrate_mhz);
    HashRate::from_gigahashes(0.768 * clock - 0.03 * 0.768 * clock)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(999_999, "999999 H/s")]
    #[test_case(1_500_000, "1.50 MH/s")]
    #[test_case(17_179_869_184, "17.18 GH/s")]
    #[test_case(2_000_000_000_000, "2.00 TH/s")]
    fn human_readable(hashes_per_sec: u64, expected: &str) {
        assert_eq!(HashRate(hashes_per_sec).to_human_readable(), expected);
        assert_eq!(HashRate(hashes_per_sec).to_string(), expected);
    }

    #[test]
    fn rate_from_hashes() {
        // Two difficulty-34 nonces in four seconds.
        let rate = HashRate::from_hashes(2 << 34, Duration::from_secs(4));
        assert_eq!(rate, HashRate(1 << 33));
        assert_eq!(HashRate::from_hashes(100, Duration::ZERO), HashRate(0));
    }

    #[test]
    fn nominal_rate_at_600mhz() {
        let rate = nominal_hash_rate(600);
        assert!((rate.as_gigahashes() - 446.976).abs() < 1e-6);
    }
}
