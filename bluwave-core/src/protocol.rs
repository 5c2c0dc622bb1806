//! Handshake and discovery messages, service identity constants.
//!
//! A connection has three phases: one unencrypted [`Hello`] frame each way,
//! one group-key frame from the host (AEAD under the pairwise key), then
//! chat frames (AEAD under the group key). Phases are positional; nothing
//! after the hello travels in the clear.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto::{DeviceId, PublicKey};

/// Current protocol version. A mismatch rejects the connection.
pub const PROTOCOL_VERSION: u8 = 1;

/// Well-known service name, matched between host and client builds.
pub const SERVICE_NAME: &str = "BluWaveChat";

/// Well-known 128-bit service UUID, matched between host and client builds.
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0xfa87c0d0_afac_11de_8a39_0800200c9a66);

/// First frame on every connection, both directions, in the clear.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hello {
    pub protocol_version: u8,
    pub service_uuid: Uuid,
    pub device_id: DeviceId,
    pub public_key: PublicKey,
    pub name: String,
}

impl Hello {
    pub fn new(device_id: DeviceId, public_key: PublicKey, name: String) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            service_uuid: SERVICE_UUID,
            device_id,
            public_key,
            name,
        }
    }

    /// Reject peers speaking another protocol or service.
    pub fn validate(&self) -> Result<(), HelloError> {
        if self.protocol_version != PROTOCOL_VERSION {
            return Err(HelloError::Version(self.protocol_version));
        }
        if self.service_uuid != SERVICE_UUID {
            return Err(HelloError::Service);
        }
        if self.device_id != DeviceId::from_public_key(self.public_key.as_bytes()) {
            return Err(HelloError::Identity);
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HelloError {
    #[error("unsupported protocol version {0}")]
    Version(u8),
    #[error("foreign service uuid")]
    Service,
    #[error("device id does not match public key")]
    Identity,
}

/// UDP discovery announce, multicast by a host while listening.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Announce {
    pub protocol_version: u8,
    pub service_uuid: Uuid,
    pub service_name: String,
    pub device_id: DeviceId,
    pub name: String,
    pub transport_port: u16,
}

impl Announce {
    pub fn matches_service(&self) -> bool {
        self.protocol_version == PROTOCOL_VERSION
            && self.service_uuid == SERVICE_UUID
            && self.service_name == SERVICE_NAME
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Keypair;

    fn sample_hello() -> Hello {
        let kp = Keypair::generate();
        Hello::new(kp.device_id(), kp.public_key().clone(), "Ada".into())
    }

    #[test]
    fn hello_roundtrip() {
        let hello = sample_hello();
        let bytes = hello.to_bytes().unwrap();
        let back = Hello::from_bytes(&bytes).unwrap();
        assert_eq!(back.device_id, hello.device_id);
        assert_eq!(back.name, "Ada");
        back.validate().unwrap();
    }

    #[test]
    fn hello_rejects_wrong_version() {
        let mut hello = sample_hello();
        hello.protocol_version = PROTOCOL_VERSION + 1;
        assert!(matches!(hello.validate(), Err(HelloError::Version(_))));
    }

    #[test]
    fn hello_rejects_foreign_service() {
        let mut hello = sample_hello();
        hello.service_uuid = Uuid::from_u128(0xdead_beef);
        assert!(matches!(hello.validate(), Err(HelloError::Service)));
    }

    #[test]
    fn hello_rejects_mismatched_identity() {
        let mut hello = sample_hello();
        hello.device_id = Keypair::generate().device_id();
        assert!(matches!(hello.validate(), Err(HelloError::Identity)));
    }

    #[test]
    fn announce_roundtrip_and_match() {
        let kp = Keypair::generate();
        let announce = Announce {
            protocol_version: PROTOCOL_VERSION,
            service_uuid: SERVICE_UUID,
            service_name: SERVICE_NAME.to_string(),
            device_id: kp.device_id(),
            name: "Lounge".into(),
            transport_port: 45760,
        };
        let back = Announce::from_bytes(&announce.to_bytes().unwrap()).unwrap();
        assert!(back.matches_service());
        assert_eq!(back.transport_port, 45760);

        let mut foreign = announce.clone();
        foreign.service_uuid = Uuid::from_u128(1);
        assert!(!foreign.matches_service());

        let mut renamed = announce;
        renamed.service_name = "SomeOtherChat".into();
        assert!(!renamed.matches_service());
    }
}
