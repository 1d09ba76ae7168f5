//! Device identity: hardware-style address, advertised name, and the set of
//! devices found during one discovery pass.

use std::fmt;
use std::str::FromStr;

use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Six-byte address printed as `AA:BB:CC:DD:EE:FF`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceAddress([u8; 6]);

impl DeviceAddress {
    pub fn from_bytes(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }

    /// Random unicast, locally administered address.
    pub fn random() -> Self {
        let mut bytes = [0u8; 6];
        rand::thread_rng().fill_bytes(&mut bytes);
        bytes[0] = (bytes[0] | 0x02) & !0x01;
        Self(bytes)
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid device address {0:?}, expected AA:BB:CC:DD:EE:FF")]
pub struct AddressParseError(String);

impl FromStr for DeviceAddress {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || AddressParseError(s.to_string());
        let mut bytes = [0u8; 6];
        let mut parts = s.trim().split(':');
        for slot in bytes.iter_mut() {
            let part = parts.next().ok_or_else(err)?;
            if part.len() != 2 {
                return Err(err());
            }
            *slot = u8::from_str_radix(part, 16).map_err(|_| err())?;
        }
        if parts.next().is_some() {
            return Err(err());
        }
        Ok(Self(bytes))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub address: DeviceAddress,
    pub name: String,
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.address)
    }
}

/// Devices seen in the current pass, unique by address, in discovery order.
#[derive(Debug, Default, Clone)]
pub struct DiscoveredDevices {
    devices: Vec<Device>,
}

impl DiscoveredDevices {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the address was not seen yet in this pass.
    /// A repeat sighting only refreshes the name.
    pub fn insert(&mut self, device: Device) -> bool {
        match self.devices.iter_mut().find(|d| d.address == device.address) {
            Some(existing) => {
                existing.name = device.name;
                false
            }
            None => {
                self.devices.push(device);
                true
            }
        }
    }

    pub fn get(&self, address: &DeviceAddress) -> Option<&Device> {
        self.devices.iter().find(|d| &d.address == address)
    }

    pub fn clear(&mut self) {
        self.devices.clear();
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Device> {
        self.devices.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> DeviceAddress {
        s.parse().unwrap()
    }

    #[test]
    fn parse_and_display() {
        let a = addr("0a:1B:2c:3D:4e:5F");
        assert_eq!(a.as_bytes(), &[0x0a, 0x1b, 0x2c, 0x3d, 0x4e, 0x5f]);
        assert_eq!(a.to_string(), "0A:1B:2C:3D:4E:5F");
    }

    #[test]
    fn parse_rejects_malformed() {
        for bad in ["", "00:11:22:33:44", "00:11:22:33:44:55:66", "0:11:22:33:44:55", "GG:11:22:33:44:55"] {
            assert!(bad.parse::<DeviceAddress>().is_err(), "{bad}");
        }
    }

    #[test]
    fn random_is_local_unicast() {
        for _ in 0..32 {
            let a = DeviceAddress::random();
            assert_eq!(a.as_bytes()[0] & 0x03, 0x02);
        }
    }

    #[test]
    fn discovered_set_dedups_by_address() {
        let mut set = DiscoveredDevices::new();
        let a = addr("02:00:00:00:00:01");
        assert!(set.insert(Device { address: a, name: "one".into() }));
        assert!(!set.insert(Device { address: a, name: "renamed".into() }));
        assert!(set.insert(Device { address: addr("02:00:00:00:00:02"), name: "two".into() }));
        assert_eq!(set.len(), 2);
        assert_eq!(set.get(&a).map(|d| d.name.as_str()), Some("renamed"));

        set.clear();
        assert!(set.is_empty());
        assert!(set.insert(Device { address: a, name: "one".into() }));
    }
}
