//! Types dealing with endpoint identity.

/// Identifies a single endpoint process in the fabric.
///
/// The id is minted once when the endpoint is constructed and remains
/// stable for its lifetime. It travels in the handshake so peers can
/// detect duplicate connections to the same process.
#[derive(
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(transparent)]
pub struct EndpointId(pub uuid::Uuid);

impl EndpointId {
    /// Mint a fresh random endpoint id.
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// Construct an endpoint id from raw big-endian bytes.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(uuid::Uuid::from_bytes(bytes))
    }

    /// The raw 16 bytes of this id, as they appear on the wire.
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl std::fmt::Display for EndpointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::fmt::Debug for EndpointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_trip_bytes() {
        let id = EndpointId::random();
        assert_eq!(id, EndpointId::from_bytes(*id.as_bytes()));
    }

    #[test]
    fn random_ids_differ() {
        assert_ne!(EndpointId::random(), EndpointId::random());
    }
}
