use crate::error::SpindleError;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Identity of a reservation.
///
/// Rendered as 32 lowercase hex characters on the wire (HTTP parameters,
/// catalog rows, blob keys) and carried as 16 raw bytes inside the
/// scheduler heap and broker messages. Hex keys triple the heap's memory
/// footprint, so the raw form is the internal one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReservationId(Uuid);

impl ReservationId {
    /// Mint a fresh random identity.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse the 32-hex wire form.
    pub fn from_hex(s: &str) -> Result<Self, SpindleError> {
        Uuid::try_parse(s)
            .map(Self)
            .map_err(|_| SpindleError::InvalidUuid(s.to_string()))
    }

    /// Reconstitute from the 16-byte heap/broker form.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Reconstitute from a broker message body.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, SpindleError> {
        let arr: [u8; 16] = bytes
            .try_into()
            .map_err(|_| SpindleError::InvalidUuid(hex::encode(bytes)))?;
        Ok(Self::from_bytes(arr))
    }

    /// The 16-byte raw form.
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// The 32-hex wire form.
    pub fn to_hex(&self) -> String {
        self.0.simple().to_string()
    }
}

impl fmt::Display for ReservationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

impl Serialize for ReservationId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ReservationId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        ReservationId::from_hex(&s).map_err(D::Error::custom)
    }
}

/// A resolved job: the reservation's plugin plus the account fields the
/// plugin's arguments are drawn from. This is also the document shape
/// cached in the account cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub function_name: String,
    pub uuid: ReservationId,
    pub account: HashMap<String, String>,
}

impl Job {
    /// The service component of the function name (`svc/foo` → `svc`).
    pub fn service(&self) -> &str {
        service_of(&self.function_name)
    }
}

/// The service component of a plugin path (`svc/foo` → `svc`, bare names
/// map to themselves).
pub fn service_of(function_name: &str) -> &str {
    function_name.split('/').next().unwrap_or(function_name)
}
