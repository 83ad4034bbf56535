/// Nanosecond-resolution time value used throughout the PTP engine for both local
/// monotonic timestamps and PTP-domain timestamps. Signed so that differences and
/// corrections (which can be negative) compose without wrapping.
pub type Nanos = i64;

/// Seconds worth of nanoseconds beyond which a PtpTimestamp's seconds field is
/// considered malformed (2^54 ns, per the wire codec's sanity check).
const MAX_SECONDS_NANOS: u64 = 1 << 54;

/// A wire-format PTP timestamp: 48-bit seconds since the PTP epoch plus a 32-bit
/// nanoseconds-within-second remainder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PtpTimestamp {
    pub seconds: u64,
    pub nanoseconds: u32,
}

impl PtpTimestamp {
    /// Converts to a flat nanosecond count. Returns `None` if the nanoseconds field
    /// is out of range (>= 1e9) or the seconds field would overflow a sane range.
    pub fn to_nanos(&self) -> Option<Nanos> {
        if self.nanoseconds >= 1_000_000_000 {
            return None;
        }
        let seconds_ns = self.seconds.checked_mul(1_000_000_000)?;
        if seconds_ns > MAX_SECONDS_NANOS {
            return None;
        }
        let total = seconds_ns.checked_add(self.nanoseconds as u64)?;
        i64::try_from(total).ok()
    }

    pub fn from_nanos(nanos: Nanos) -> Self {
        let nanos = nanos.max(0) as u64;
        PtpTimestamp {
            seconds: nanos / 1_000_000_000,
            nanoseconds: (nanos % 1_000_000_000) as u32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_nanos() {
        let ts = PtpTimestamp { seconds: 1, nanoseconds: 2_000 };
        let nanos = ts.to_nanos().unwrap();
        assert_eq!(nanos, 1_000_002_000);
        assert_eq!(PtpTimestamp::from_nanos(nanos), ts);
    }

    #[test]
    fn rejects_nanoseconds_overflow() {
        let ts = PtpTimestamp { seconds: 0, nanoseconds: 1_000_000_000 };
        assert_eq!(ts.to_nanos(), None);
    }

    #[test]
    fn rejects_seconds_overflow() {
        let ts = PtpTimestamp { seconds: 1 << 50, nanoseconds: 0 };
        assert_eq!(ts.to_nanos(), None);
    }
}
