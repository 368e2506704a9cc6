use std::fmt::{self, Debug, Display, Formatter};

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

/// A stable 128-bit replica identifier, chosen once at first initialization
/// and persisted. Totally ordered so it can break every tie deterministically.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClientId(u128);

impl ClientId {
    pub const fn new(raw: u128) -> Self {
        Self(raw)
    }

    /// Draw a fresh identifier. Called exactly once per replica lifetime;
    /// afterwards the id is read back from storage.
    pub fn generate() -> Self {
        Self(rand::random::<u128>())
    }

    pub fn as_u128(&self) -> u128 {
        self.0
    }

    pub fn to_hex(&self) -> String {
        format!("{:032x}", self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        u128::from_str_radix(s, 16).ok().map(Self)
    }
}

impl Display for ClientId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        // Short prefix is enough to tell replicas apart in logs.
        write!(f, "{}", &self.to_hex()[..8])
    }
}

impl Debug for ClientId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "ClientId({})", self.to_hex())
    }
}

// Serialized as a hex string so the id can key JSON maps.
impl Serialize for ClientId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ClientId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        ClientId::from_hex(&s).ok_or_else(|| de::Error::custom("malformed client id"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_round_trip() {
        let id = ClientId::new(0xdead_beef_0123_4567_89ab_cdef_0000_0001);
        assert_eq!(ClientId::from_hex(&id.to_hex()), Some(id));
    }

    #[test]
    fn total_order() {
        let a = ClientId::new(1);
        let b = ClientId::new(2);
        assert!(a < b);
    }

    #[test]
    fn serde_as_string() {
        let id = ClientId::new(7);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{:032x}\"", 7));
        let back: ClientId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
