use crate::{IdError, Ulid};

/// Common surface of every prefixed id.
pub trait TypedId: Copy + Sized {
    const PREFIX: &'static str;

    fn from_ulid(ulid: Ulid) -> Self;

    fn ulid(&self) -> Ulid;
}

/// Strict `{prefix}_{ulid}` parse shared by all id types.
pub fn parse_prefixed<T: TypedId>(raw: &str) -> Result<T, IdError> {
    if raw.is_empty() {
        return Err(IdError::Empty);
    }
    let malformed = |reason: String| IdError::Malformed {
        id: raw.to_string(),
        reason,
    };
    let (prefix, body) = raw
        .split_once('_')
        .ok_or_else(|| malformed("no '_' separator".to_string()))?;
    if prefix != T::PREFIX {
        return Err(IdError::WrongKind {
            expected: T::PREFIX,
            found: prefix.to_string(),
        });
    }
    let ulid = Ulid::from_string(body).map_err(|e| malformed(e.to_string()))?;
    Ok(T::from_ulid(ulid))
}

/// Declare a ULID-backed id type rendered as `{prefix}_{ulid}`.
///
/// ```ignore
/// define_id!(NodeId, "node");
/// ```
#[macro_export]
macro_rules! define_id {
    ($name:ident, $prefix:literal) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name($crate::Ulid);

        impl $name {
            pub const PREFIX: &'static str = $prefix;

            /// Fresh id; later ids sort after earlier ones.
            #[must_use]
            pub fn new() -> Self {
                Self($crate::Ulid::new())
            }

            #[must_use]
            pub const fn from_ulid(ulid: $crate::Ulid) -> Self {
                Self(ulid)
            }

            pub fn parse(raw: &str) -> Result<Self, $crate::IdError> {
                $crate::parse_prefixed(raw)
            }
        }

        impl $crate::TypedId for $name {
            const PREFIX: &'static str = $prefix;

            fn from_ulid(ulid: $crate::Ulid) -> Self {
                Self(ulid)
            }

            fn ulid(&self) -> $crate::Ulid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}_{}", $prefix, self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::IdError;

            fn from_str(raw: &str) -> Result<Self, Self::Err> {
                $crate::parse_prefixed(raw)
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
                s.collect_str(self)
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
                let raw = <std::borrow::Cow<'de, str>>::deserialize(d)?;
                $crate::parse_prefixed(&raw).map_err(serde::de::Error::custom)
            }
        }
    };
}
