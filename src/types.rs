//! Core identifier types shared across the allocator.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

/// Highest app number an instance can hand out. App numbers double as
/// IPv4 host offsets inside the DHCP range, so the space is capped at
/// one octet.
pub const APP_NUM_MAX: u16 = 255;

/// Identifier of a network instance (isolated virtual network on the host).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct NetworkInstanceId(pub Uuid);

impl NetworkInstanceId {
    pub fn new_v4() -> Self {
        NetworkInstanceId(Uuid::new_v4())
    }
}

impl fmt::Display for NetworkInstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifier of a workload attached to one or more network instances.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct WorkloadId(pub Uuid);

impl WorkloadId {
    pub fn new_v4() -> Self {
        WorkloadId(Uuid::new_v4())
    }
}

impl fmt::Display for WorkloadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Tag distinguishing independent number spaces in the registry. Only
/// underlay app numbers are managed today; the registry keys on the tag
/// so further spaces can coexist without colliding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NumberType {
    #[serde(rename = "appNumOnUnet")]
    AppNumOnUnet,
}

impl fmt::Display for NumberType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NumberType::AppNumOnUnet => write!(f, "appNumOnUnet"),
        }
    }
}

/// 48-bit hardware address, displayed as colon-separated hex octets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddr(pub [u8; 6]);

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

/// Error returned when a MAC address string cannot be parsed
#[derive(Debug, thiserror::Error)]
#[error("invalid MAC address: {0}")]
pub struct MacParseError(String);

impl FromStr for MacAddr {
    type Err = MacParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 6 {
            return Err(MacParseError(s.to_string()));
        }
        let mut octets = [0u8; 6];
        for (octet, part) in octets.iter_mut().zip(&parts) {
            if part.len() != 2 {
                return Err(MacParseError(s.to_string()));
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| MacParseError(s.to_string()))?;
        }
        Ok(MacAddr(octets))
    }
}

// MAC addresses key the status assignment maps, so they serialize as
// plain strings rather than byte arrays.
impl Serialize for MacAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MacAddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mac_round_trip() {
        let mac: MacAddr = "02:16:3e:00:01:0a".parse().unwrap();
        assert_eq!(mac, MacAddr([0x02, 0x16, 0x3e, 0x00, 0x01, 0x0a]));
        assert_eq!(mac.to_string(), "02:16:3e:00:01:0a");
    }

    #[test]
    fn test_mac_rejects_malformed() {
        assert!("02:16:3e:00:01".parse::<MacAddr>().is_err());
        assert!("02:16:3e:00:01:0a:ff".parse::<MacAddr>().is_err());
        assert!("02:16:3e:00:01:zz".parse::<MacAddr>().is_err());
        assert!("0216:3e:00:01:0a:1".parse::<MacAddr>().is_err());
        assert!("".parse::<MacAddr>().is_err());
    }

    #[test]
    fn test_mac_serializes_as_string() {
        let mac: MacAddr = "02:16:3e:00:01:0a".parse().unwrap();
        let json = serde_json::to_string(&mac).unwrap();
        assert_eq!(json, "\"02:16:3e:00:01:0a\"");
        let back: MacAddr = serde_json::from_str(&json).unwrap();
        assert_eq!(back, mac);
    }
}
