use std::fmt;
use std::net::SocketAddr;

/// The kind of action a piece of replicated data carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataOperation {
    /// A key was registered for the first time.
    Add,
    /// An existing key's content changed.
    Change,
    /// A key was removed.
    Delete,
    /// A checksum batch used by the anti-entropy cycle.
    Verify,
    /// Full authoritative content, served in response to a pull.
    Snapshot,
}

impl DataOperation {
    /// Whether this operation mutates registry state (as opposed to the
    /// verification/pull control operations).
    pub fn is_mutation(&self) -> bool {
        matches!(self, Self::Add | Self::Change | Self::Delete)
    }
}

impl fmt::Display for DataOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Add => "add",
            Self::Change => "change",
            Self::Delete => "delete",
            Self::Verify => "verify",
            Self::Snapshot => "snapshot",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
/// Identifies one unit of replicated data.
///
/// A key is the pair of (resource key, resource type), optionally pinned to a
/// single target peer. Targeted and untargeted keys compare as distinct
/// values, which is what lets the delay queue keep one pending task per key
/// *per peer*.
pub struct DistroKey {
    resource_key: String,
    resource_type: String,
    target: Option<SocketAddr>,
}

impl DistroKey {
    /// Creates an untargeted key.
    pub fn new(resource_key: impl Into<String>, resource_type: impl Into<String>) -> Self {
        Self {
            resource_key: resource_key.into(),
            resource_type: resource_type.into(),
            target: None,
        }
    }

    /// Creates a key pinned to a single peer.
    pub fn with_target(
        resource_key: impl Into<String>,
        resource_type: impl Into<String>,
        target: SocketAddr,
    ) -> Self {
        Self {
            resource_key: resource_key.into(),
            resource_type: resource_type.into(),
            target: Some(target),
        }
    }

    pub fn resource_key(&self) -> &str {
        &self.resource_key
    }

    pub fn resource_type(&self) -> &str {
        &self.resource_type
    }

    pub fn target(&self) -> Option<SocketAddr> {
        self.target
    }

    /// Returns a copy of this key with the target peer stripped.
    pub fn untargeted(&self) -> Self {
        Self {
            resource_key: self.resource_key.clone(),
            resource_type: self.resource_type.clone(),
            target: None,
        }
    }

    /// Stable hash of (resource key, resource type), ignoring the target.
    ///
    /// Pushes, pulls and inbound applies for one logical key must land on the
    /// same worker lane regardless of which peer they involve.
    pub fn lane_hash(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(self.resource_key.as_bytes());
        hasher.update(b"/");
        hasher.update(self.resource_type.as_bytes());
        hasher.finalize()
    }
}

impl fmt::Display for DistroKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.target {
            Some(target) => write!(
                f,
                "{}/{} -> {target}",
                self.resource_type, self.resource_key
            ),
            None => write!(f, "{}/{}", self.resource_type, self.resource_key),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// The unit placed on the wire between peers: a key, an operation tag and an
/// opaque payload.
///
/// Payload encoding belongs to the storage/processor pair which produced it;
/// the engine only guarantees the key triple and operation tag survive the
/// round trip unchanged.
pub struct DistroData {
    key: DistroKey,
    operation: DataOperation,
    payload: Vec<u8>,
}

impl DistroData {
    pub fn new(key: DistroKey, operation: DataOperation, payload: Vec<u8>) -> Self {
        Self {
            key,
            operation,
            payload,
        }
    }

    pub fn key(&self) -> &DistroKey {
        &self.key
    }

    pub fn operation(&self) -> DataOperation {
        self.operation
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Content checksum used by the verification cycle.
    pub fn checksum(&self) -> u32 {
        crc32fast::hash(&self.payload)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Checksum of one key's content on the sending node.
pub struct KeyChecksum {
    pub resource_key: String,
    pub checksum: u32,
}

#[derive(Debug, Clone)]
/// A checksum batch broadcast by the verification cycle.
///
/// Covers every key of `resource_type` that `source` currently owns.
pub struct VerifyData {
    pub resource_type: String,
    pub source: SocketAddr,
    pub checksums: Vec<KeyChecksum>,
}

#[derive(Debug, Clone, Default)]
/// The receiving side's answer to a checksum batch: the keys whose local view
/// disagrees and must be pulled from the sender.
pub struct VerifyDiff {
    pub to_update: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn targeted_and_untargeted_keys_are_distinct() {
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let plain = DistroKey::new("svc-1", "ephemeral-instances");
        let pinned = DistroKey::with_target("svc-1", "ephemeral-instances", addr);

        assert_ne!(plain, pinned);
        assert_eq!(plain, pinned.untargeted());
        assert_eq!(plain.lane_hash(), pinned.lane_hash());
    }

    #[test]
    fn checksum_tracks_payload_content() {
        let key = DistroKey::new("svc-1", "ephemeral-instances");
        let a = DistroData::new(key.clone(), DataOperation::Change, b"10.0.0.1:80".to_vec());
        let b = DistroData::new(key.clone(), DataOperation::Change, b"10.0.0.1:80".to_vec());
        let c = DistroData::new(key, DataOperation::Change, b"10.0.0.2:80".to_vec());

        assert_eq!(a.checksum(), b.checksum());
        assert_ne!(a.checksum(), c.checksum());
    }
}
