//! LAN discovery messages and version.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::device::{Device, DeviceAddress};

/// Current protocol version. Carried in every advertisement.
pub const PROTOCOL_VERSION: u8 = 1;

/// Who is out there and where to reach them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Advertisement {
    pub protocol_version: u8,
    /// Only devices sharing a service id pair with each other.
    pub service_id: Uuid,
    pub address: DeviceAddress,
    pub name: String,
    /// TCP port the sender accepts links on.
    pub listen_port: u16,
}

impl Advertisement {
    pub fn device(&self) -> Device {
        Device {
            address: self.address,
            name: self.name.clone(),
        }
    }

    /// Same version, same service, not from `local`.
    pub fn is_peer_of(&self, service_id: &Uuid, local: &DeviceAddress) -> bool {
        self.protocol_version == PROTOCOL_VERSION
            && &self.service_id == service_id
            && &self.address != local
    }
}

/// Discovery datagrams. Encoding is bincode; framing is length-prefix (see wire module).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Sent by a device running a discovery pass.
    Beacon(Advertisement),
    /// Unicast answer to a beacon.
    DiscoveryResponse(Advertisement),
}

impl Message {
    pub fn advertisement(&self) -> &Advertisement {
        match self {
            Message::Beacon(ad) | Message::DiscoveryResponse(ad) => ad,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ad(service_id: Uuid, address: DeviceAddress) -> Advertisement {
        Advertisement {
            protocol_version: PROTOCOL_VERSION,
            service_id,
            address,
            name: "ridge".into(),
            listen_port: 46001,
        }
    }

    #[test]
    fn peer_filter() {
        let service = Uuid::new_v4();
        let me = DeviceAddress::random();
        let other = DeviceAddress::random();

        assert!(ad(service, other).is_peer_of(&service, &me));
        assert!(!ad(service, me).is_peer_of(&service, &me));
        assert!(!ad(Uuid::new_v4(), other).is_peer_of(&service, &me));

        let mut old = ad(service, other);
        old.protocol_version = PROTOCOL_VERSION + 1;
        assert!(!old.is_peer_of(&service, &me));
    }

    #[test]
    fn device_from_advertisement() {
        let a = DeviceAddress::random();
        let d = ad(Uuid::new_v4(), a).device();
        assert_eq!(d.address, a);
        assert_eq!(d.name, "ridge");
    }
}
