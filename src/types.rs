//! NewType wrappers and small value types shared across the orchestrator.
//!
//! The string wrappers keep qubit ids, project ids and task names from being
//! mixed up in signatures that take several of them.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Macro to generate a NewType wrapper with standard trait implementations.
macro_rules! newtype_string {
    (
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new instance.
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Get the inner value as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume and return the inner String.
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::borrow::Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }
    };
}

newtype_string!(
    /// Qubit id (`"7"`) or coupling id (`"7-8"`).
    ///
    /// Global and system tasks use the empty qid.
    Qid
);

newtype_string!(
    /// Project scope for the execution lock.
    ProjectId
);

newtype_string!(
    /// Chip identifier taken from the wiring description (e.g., "64Qv1").
    ChipId
);

newtype_string!(
    /// Name of a calibration task as registered in the task registry.
    TaskName
);

impl Qid {
    /// The qid used by global and system tasks.
    pub fn global() -> Self {
        Self(String::new())
    }

    pub fn is_global(&self) -> bool {
        self.0.is_empty()
    }

    /// Numeric value of a qubit id, `None` for coupling ids or garbage.
    pub fn qubit_index(&self) -> Option<u32> {
        self.0.parse().ok()
    }

    /// Splits a coupling id `"a-b"` into its two qubit ids.
    pub fn coupling_pair(&self) -> Option<(Qid, Qid)> {
        let (a, b) = self.0.split_once('-')?;
        if a.is_empty() || b.is_empty() || b.contains('-') {
            return None;
        }
        Some((Qid::new(a), Qid::new(b)))
    }
}

/// Field value with three states: not provided, explicitly null, or set.
///
/// When merged into a stored value, `Absent` keeps the old value, `Null`
/// clears it and `Value` overwrites it. Serde maps a missing field to
/// `Absent` (use `#[serde(default, skip_serializing_if = "Tristate::is_absent")]`),
/// `null` to `Null` and anything else to `Value`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Tristate<T> {
    #[default]
    Absent,
    Null,
    Value(T),
}

impl<T> Tristate<T> {
    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }

    pub fn as_option(&self) -> Option<&T> {
        match self {
            Self::Value(v) => Some(v),
            _ => None,
        }
    }

    /// Applies this patch on top of `current`.
    pub fn merge_into(self, current: Tristate<T>) -> Tristate<T> {
        match self {
            Self::Absent => current,
            other => other,
        }
    }
}

impl<T> From<Option<T>> for Tristate<T> {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => Self::Value(v),
            None => Self::Null,
        }
    }
}

impl<T: Serialize> Serialize for Tristate<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Value(v) => serializer.serialize_some(v),
            Self::Absent | Self::Null => serializer.serialize_none(),
        }
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Tristate<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Option::<T>::deserialize(deserializer).map(Tristate::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qid_creation() {
        let qid = Qid::new("12");
        assert_eq!(qid.as_str(), "12");
        assert_eq!(qid.qubit_index(), Some(12));
        assert!(!qid.is_global());
        assert!(Qid::global().is_global());
    }

    #[test]
    fn test_coupling_pair() {
        let pair = Qid::new("7-8").coupling_pair().unwrap();
        assert_eq!(pair, (Qid::new("7"), Qid::new("8")));
        assert!(Qid::new("7").coupling_pair().is_none());
        assert!(Qid::new("7-").coupling_pair().is_none());
        assert!(Qid::new("1-2-3").coupling_pair().is_none());
        assert_eq!(Qid::new("7-8").qubit_index(), None);
    }

    #[test]
    fn test_project_id_serde() {
        let id = ProjectId::new("proj-a");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"proj-a\"");
        let parsed: ProjectId = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_qid_ordering_is_lexical() {
        let mut ids = vec![Qid::new("10"), Qid::new("2")];
        ids.sort();
        assert_eq!(ids[0].as_str(), "10");
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Patch {
        #[serde(default, skip_serializing_if = "Tristate::is_absent")]
        error: Tristate<f64>,
    }

    #[test]
    fn test_tristate_serde() {
        let absent: Patch = serde_json::from_str("{}").unwrap();
        assert_eq!(absent.error, Tristate::Absent);

        let null: Patch = serde_json::from_str(r#"{"error": null}"#).unwrap();
        assert_eq!(null.error, Tristate::Null);

        let set: Patch = serde_json::from_str(r#"{"error": 0.5}"#).unwrap();
        assert_eq!(set.error, Tristate::Value(0.5));

        assert_eq!(serde_json::to_string(&absent).unwrap(), "{}");
        assert_eq!(serde_json::to_string(&null).unwrap(), r#"{"error":null}"#);
    }

    #[test]
    fn test_tristate_merge() {
        let current = Tristate::Value(1.0);
        assert_eq!(Tristate::Absent.merge_into(current), Tristate::Value(1.0));
        assert_eq!(Tristate::<f64>::Null.merge_into(current), Tristate::Null);
        assert_eq!(Tristate::Value(2.0).merge_into(current), Tristate::Value(2.0));
    }
}
