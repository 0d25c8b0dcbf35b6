//! Typed ID definitions used across the scheduler.

use crate::{prefixed_id, IdError};

// =============================================================================
// Scheduler-generated IDs
// =============================================================================

prefixed_id! {
    /// An application whose formations the scheduler runs.
    AppId => "app";

    /// One immutable release of an application.
    ReleaseId => "rel";

    /// A single job instance. A replacement gets a new ID.
    JobId => "job";
}

// =============================================================================
// Host ID
// =============================================================================

/// Identity of a worker host, as published by discovery.
///
/// Hosts name themselves, so this is an opaque string rather than a ULID.
/// The only constraint is that it is non-empty and contains no whitespace
/// or path separators (it is embedded in URLs).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HostId(String);

impl HostId {
    /// Validates and wraps a host ID.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }
        if s.chars().any(|c| c.is_whitespace() || c == '/') {
            return Err(IdError::InvalidFormat {
                message: format!("host ID '{s}' contains whitespace or '/'"),
            });
        }
        Ok(Self(s.to_string()))
    }

    /// Returns the host ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for HostId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for HostId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl serde::Serialize for HostId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for HostId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Event Sequence Number
// =============================================================================

/// Position of a published job event in the global event order.
///
/// Sequence IDs start at 1; [`SequenceId::ZERO`] is the "nothing seen yet"
/// cursor a subscriber sends to replay all retained history.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SequenceId(u64);

impl SequenceId {
    /// The cursor that precedes every event.
    pub const ZERO: Self = Self(0);

    /// Creates a sequence ID from a raw value.
    #[must_use]
    pub const fn new(seq: u64) -> Self {
        Self(seq)
    }

    /// Returns the underlying value.
    #[must_use]
    pub const fn value(&self) -> u64 {
        self.0
    }

    /// Returns the next sequence ID.
    #[must_use]
    pub const fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl std::fmt::Display for SequenceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for SequenceId {
    fn from(seq: u64) -> Self {
        Self(seq)
    }
}

impl From<SequenceId> for u64 {
    fn from(seq: SequenceId) -> Self {
        seq.0
    }
}

impl serde::Serialize for SequenceId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_u64(self.0)
    }
}

impl<'de> serde::Deserialize<'de> for SequenceId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let seq = u64::deserialize(deserializer)?;
        Ok(Self(seq))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_job_id_roundtrip() {
        let id = JobId::new();
        let parsed: JobId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!(id.to_string().starts_with("job_"));
    }

    #[test]
    fn test_app_id_invalid_prefix() {
        let result: Result<AppId, _> = "rel_01HV4Z2WQXKJNM8GPQY6VBKC3D".parse();
        assert!(matches!(
            result.unwrap_err(),
            IdError::InvalidPrefix { expected: "app", .. }
        ));
    }

    #[test]
    fn test_release_id_missing_separator() {
        let result: Result<ReleaseId, _> = "rel01HV4Z2WQXKJNM8GPQY6VBKC3D".parse();
        assert!(matches!(result.unwrap_err(), IdError::MissingSeparator));
    }

    #[test]
    fn test_job_id_invalid_ulid() {
        let result: Result<JobId, _> = "job_invalid".parse();
        assert!(matches!(result.unwrap_err(), IdError::InvalidUlid(_)));
    }

    #[test]
    fn test_job_id_json_roundtrip() {
        let id = JobId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
        let parsed: JobId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_job_id_sortable() {
        let id1 = JobId::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let id2 = JobId::new();
        assert!(id1 < id2);
    }

    #[test]
    fn test_host_id_rejects_empty_and_slashes() {
        assert!(HostId::parse("").unwrap_err().is_empty());
        assert!(HostId::parse("host/1").is_err());
        assert!(HostId::parse("host 1").is_err());
        assert_eq!(HostId::parse("host-1").unwrap().as_str(), "host-1");
    }

    #[test]
    fn test_host_id_deserialize_validates() {
        let ok: HostId = serde_json::from_str("\"h1\"").unwrap();
        assert_eq!(ok.to_string(), "h1");
        assert!(serde_json::from_str::<HostId>("\"\"").is_err());
    }

    #[test]
    fn test_sequence_id_next() {
        assert_eq!(SequenceId::ZERO.next(), SequenceId::new(1));
        assert!(SequenceId::new(7) > SequenceId::ZERO);
    }

    #[test]
    fn test_all_id_prefixes_unique() {
        let prefixes = [AppId::PREFIX, ReleaseId::PREFIX, JobId::PREFIX];
        let unique: std::collections::HashSet<_> = prefixes.iter().collect();
        assert_eq!(prefixes.len(), unique.len(), "Duplicate ID prefixes found!");
    }

    proptest! {
        #[test]
        fn prop_host_id_accepts_plain_names(name in "[a-z0-9][a-z0-9.-]{0,30}") {
            let id = HostId::parse(&name).unwrap();
            prop_assert_eq!(id.as_str(), name.as_str());
        }
    }
}
