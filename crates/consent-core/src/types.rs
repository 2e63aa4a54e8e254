//! Strong type definitions for the consent ledger.
//!
//! All identifiers are newtypes to prevent misuse at compile time. Identifiers
//! minted by the outer platform (studies, users, permission slugs) are opaque
//! strings; identifiers minted by the ledger itself are 32-byte BLAKE3 digests
//! derived from the natural key they stand for.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Declares an opaque string identifier issued by the surrounding platform.
macro_rules! text_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap a raw identifier.
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Borrow the raw identifier.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

/// Declares a 32-byte content-derived identifier, serialized as lowercase hex.
macro_rules! digest_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub [u8; 32]);

        impl $name {
            /// Create from raw bytes.
            pub const fn from_bytes(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }

            /// Get the raw bytes.
            pub const fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }

            /// Convert to hex string.
            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }

            /// Parse from hex string.
            pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
                let bytes = hex::decode(s)?;
                if bytes.len() != 32 {
                    return Err(hex::FromHexError::InvalidStringLength);
                }
                let mut arr = [0u8; 32];
                arr.copy_from_slice(&bytes);
                Ok(Self(arr))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), &self.to_hex()[..16])
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }

        impl From<[u8; 32]> for $name {
            fn from(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }
        }

        impl TryFrom<&[u8]> for $name {
            type Error = std::array::TryFromSliceError;

            fn try_from(slice: &[u8]) -> Result<Self, Self::Error> {
                let arr: [u8; 32] = slice.try_into()?;
                Ok(Self(arr))
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_hex())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                Self::from_hex(&s).map_err(serde::de::Error::custom)
            }
        }
    };
}

text_id!(
    /// Identifier of a study, issued by the platform.
    StudyId
);

text_id!(
    /// Identifier of a platform user (participant or researcher).
    UserId
);

text_id!(
    /// Stable, human-readable permission key (the catalog slug).
    PermKey
);

digest_id!(
    /// Identifier of a catalog template, derived from its slug.
    TemplateId
);

digest_id!(
    /// Identifier of an enrollment, derived from `(study, participant)`.
    ///
    /// Re-enrolling after withdrawal therefore always lands on the same row.
    EnrollmentId
);

digest_id!(
    /// Identifier of a consent version, derived from `(enrollment, version)`.
    VersionId
);

impl TemplateId {
    /// Derive the template id for a slug.
    pub fn derive(slug: &PermKey) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"consent-template-v0:");
        hasher.update(slug.as_str().as_bytes());
        Self(*hasher.finalize().as_bytes())
    }
}

impl EnrollmentId {
    /// Derive the enrollment id for a `(study, participant)` pair.
    pub fn derive(study_id: &StudyId, participant_id: &UserId) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"consent-enrollment-v0:");
        update_framed(&mut hasher, study_id.as_str().as_bytes());
        update_framed(&mut hasher, participant_id.as_str().as_bytes());
        Self(*hasher.finalize().as_bytes())
    }
}

impl VersionId {
    /// Derive the id of version number `version` of an enrollment.
    pub fn derive(enrollment_id: &EnrollmentId, version: u32) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"consent-version-v0:");
        hasher.update(enrollment_id.as_bytes());
        hasher.update(&version.to_be_bytes());
        Self(*hasher.finalize().as_bytes())
    }
}

/// Length-prefix a field so that `("ab", "c")` and `("a", "bc")` differ.
fn update_framed(hasher: &mut blake3::Hasher, bytes: &[u8]) {
    hasher.update(&(bytes.len() as u64).to_be_bytes());
    hasher.update(bytes);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enrollment_id_is_stable() {
        let a = EnrollmentId::derive(&"study-1".into(), &"user-1".into());
        let b = EnrollmentId::derive(&"study-1".into(), &"user-1".into());
        assert_eq!(a, b);
    }

    #[test]
    fn test_enrollment_id_framing() {
        let a = EnrollmentId::derive(&"ab".into(), &"c".into());
        let b = EnrollmentId::derive(&"a".into(), &"bc".into());
        assert_ne!(a, b);
    }

    #[test]
    fn test_version_id_depends_on_number() {
        let enrollment = EnrollmentId::derive(&"s".into(), &"u".into());
        assert_ne!(VersionId::derive(&enrollment, 1), VersionId::derive(&enrollment, 2));
    }

    #[test]
    fn test_digest_id_hex_roundtrip() {
        let id = VersionId::from_bytes([0x42; 32]);
        let recovered = VersionId::from_hex(&id.to_hex()).unwrap();
        assert_eq!(id, recovered);
        assert!(VersionId::from_hex("abcd").is_err());
    }

    #[test]
    fn test_digest_id_serializes_as_hex() {
        let id = EnrollmentId::from_bytes([0xab; 32]);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", "ab".repeat(32)));
        let back: EnrollmentId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_text_id_display() {
        let study = StudyId::new("study-42");
        assert_eq!(study.to_string(), "study-42");
        assert_eq!(format!("{:?}", study), "StudyId(study-42)");
    }
}
