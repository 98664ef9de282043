use chrono::{TimeDelta, TimeZone, Utc};

use bincode::config::{self, Configuration};
use bincode::error::{DecodeError, EncodeError};

const BINCODE_CONFIG: Configuration = config::standard();

/// Timestamped probe sent over the data channel once the peer-to-peer path is
/// up. The answerer echoes it back unchanged so the offerer can measure the
/// round trip.
#[derive(Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct Probe {
    pub seq: u64,
    pub sent_at: i64,
}

impl Probe {
    pub fn new(seq: u64) -> Probe {
        Self {
            seq,
            sent_at: Utc::now().timestamp_nanos_opt().unwrap_or(0),
        }
    }

    pub fn sent_at(&self) -> String {
        Utc.timestamp_nanos(self.sent_at).to_rfc3339()
    }

    pub fn elapsed(&self) -> TimeDelta {
        Utc::now() - Utc.timestamp_nanos(self.sent_at)
    }

    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        bincode::encode_to_vec(self, BINCODE_CONFIG)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let (probe, _): (Probe, usize) = bincode::decode_from_slice(bytes, BINCODE_CONFIG)?;
        Ok(probe)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_survives_the_data_channel_encoding() {
        let probe = Probe::new(7);
        let bytes = probe.encode().unwrap();
        assert_eq!(Probe::decode(&bytes).unwrap(), probe);
    }

    #[test]
    fn garbage_is_not_a_probe() {
        assert!(Probe::decode(&[0xff]).is_err());
    }

    #[test]
    fn elapsed_is_not_negative_for_fresh_probes() {
        let probe = Probe::new(0);
        assert!(probe.elapsed() >= TimeDelta::zero());
    }
}
