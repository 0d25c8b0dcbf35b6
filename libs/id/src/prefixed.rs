//! Prefixed ULID identifiers: `{prefix}_{ulid}`.
//!
//! The parsing and serde logic lives here once; [`prefixed_id!`] only stamps
//! out the newtype and forwards to it.

use std::fmt;
use std::marker::PhantomData;

use ulid::Ulid;

use crate::IdError;

/// Split `s` into its ULID after checking it carries `prefix`.
pub fn parse_prefixed(prefix: &'static str, s: &str) -> Result<Ulid, IdError> {
    if s.is_empty() {
        return Err(IdError::Empty);
    }
    let (actual, body) = s.split_once('_').ok_or(IdError::MissingSeparator)?;
    if actual != prefix {
        return Err(IdError::InvalidPrefix {
            expected: prefix,
            actual: actual.to_string(),
        });
    }
    body.parse::<Ulid>()
        .map_err(|e| IdError::InvalidUlid(e.to_string()))
}

/// Deserializes any string-keyed ID without an intermediate `String`.
pub struct IdVisitor<T>(PhantomData<T>);

impl<T> IdVisitor<T> {
    pub const fn new() -> Self {
        Self(PhantomData)
    }
}

impl<'de, T> serde::de::Visitor<'de> for IdVisitor<T>
where
    T: std::str::FromStr<Err = IdError>,
{
    type Value = T;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a prefixed ID string")
    }

    fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<T, E> {
        v.parse().map_err(E::custom)
    }
}

/// Declares ULID-backed ID newtypes rendered as `{prefix}_{ulid}`.
///
/// ```ignore
/// prefixed_id! {
///     /// A job instance.
///     JobId => "job";
/// }
/// ```
#[macro_export]
macro_rules! prefixed_id {
    ($($(#[$meta:meta])* $name:ident => $prefix:literal;)+) => {$(
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name($crate::Ulid);

        impl $name {
            pub const PREFIX: &'static str = $prefix;

            /// A fresh ID; later IDs sort after earlier ones.
            #[must_use]
            pub fn new() -> Self {
                Self($crate::Ulid::new())
            }

            pub fn parse(s: &str) -> Result<Self, $crate::IdError> {
                $crate::prefixed::parse_prefixed(Self::PREFIX, s).map(Self)
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}_{}", Self::PREFIX, self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                deserializer.deserialize_str($crate::prefixed::IdVisitor::new())
            }
        }
    )+};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_prefixed_checks_in_order() {
        assert_eq!(parse_prefixed("job", ""), Err(IdError::Empty));
        assert_eq!(
            parse_prefixed("job", "job01HV4Z4NYPLTRS0JTUA8XDME5F"),
            Err(IdError::MissingSeparator)
        );
        assert!(parse_prefixed("job", "app_01HV4Z4NYPLTRS0JTUA8XDME5F")
            .unwrap_err()
            .is_prefix_error());
        assert!(parse_prefixed("job", "job_01HV4Z4NYPLTRS0JTUA8XDME5F").is_ok());
    }

    #[test]
    fn test_deserialize_rejects_non_string() {
        assert!(serde_json::from_str::<crate::JobId>("42").is_err());
    }
}
