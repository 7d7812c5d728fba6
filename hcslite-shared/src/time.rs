//! Conversions between chrono timestamps and their protobuf encoding.

use chrono::{DateTime, TimeZone, Utc};

/// Convert a UTC timestamp into its protobuf representation.
pub fn to_proto(ts: DateTime<Utc>) -> prost_types::Timestamp {
    prost_types::Timestamp {
        seconds: ts.timestamp(),
        nanos: ts.timestamp_subsec_nanos() as i32,
    }
}

/// Convert a protobuf timestamp back to UTC. Out-of-range values clamp to
/// the epoch, matching the "default until set" exit-status contract.
pub fn from_proto(ts: &prost_types::Timestamp) -> DateTime<Utc> {
    Utc.timestamp_opt(ts.seconds, ts.nanos.max(0) as u32)
        .single()
        .unwrap_or(DateTime::UNIX_EPOCH)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_preserves_instant() {
        let now = Utc::now();
        let back = from_proto(&to_proto(now));
        assert_eq!(back.timestamp(), now.timestamp());
        assert_eq!(back.timestamp_subsec_nanos(), now.timestamp_subsec_nanos());
    }

    #[test]
    fn invalid_proto_clamps_to_epoch() {
        let bad = prost_types::Timestamp {
            seconds: i64::MAX,
            nanos: 0,
        };
        assert_eq!(from_proto(&bad).timestamp(), 0);
    }
}
