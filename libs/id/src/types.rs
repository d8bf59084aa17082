//! Typed ID definitions for the dispatch scheduler.
//!
//! `TaskToken` and `InboxId` are ULID-based and minted by this process.
//! `WorkerId` values come from worker advertisements and are kept opaque.

use crate::define_id;

// =============================================================================
// Generated IDs
// =============================================================================

// Staging attempt token. Written to the application record at dispatch time
// and compared before committing a completion reply: a newer attempt
// overwrites the token and silently invalidates any older in-flight attempt.
define_id!(TaskToken, "stg");

// Reply inbox for request/response correlation on the message bus.
define_id!(InboxId, "inbox");

// =============================================================================
// Worker Identity
// =============================================================================

/// Identifier of a fleet worker, as the worker advertises itself.
///
/// Opaque: the scheduler never parses or generates these.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkerId(String);

impl WorkerId {
    /// Wraps a worker-supplied identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for WorkerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for WorkerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl serde::Serialize for WorkerId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for WorkerId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(Self(s))
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
    fn test_task_token_roundtrip() {
        let token = TaskToken::new();
        let s = token.to_string();
        let parsed: TaskToken = s.parse().unwrap();
        assert_eq!(token, parsed);
    }

    #[test]
    fn test_task_token_prefix() {
        let token = TaskToken::new();
        assert!(token.to_string().starts_with("stg_"));
    }

    #[test]
    fn test_task_token_invalid_prefix() {
        let result: Result<TaskToken, _> = "inbox_01HV4Z2WQXKJNM8GPQY6VBKC3D".parse();
        assert!(result.unwrap_err().is_prefix_error());
    }

    #[test]
    fn test_task_token_missing_separator() {
        let result: Result<TaskToken, _> = "stg01HV4Z2WQXKJNM8GPQY6VBKC3D".parse();
        assert!(matches!(
            result.unwrap_err(),
            crate::IdError::MissingSeparator
        ));
    }

    #[test]
    fn test_task_token_empty() {
        let result: Result<TaskToken, _> = "".parse();
        assert!(matches!(result.unwrap_err(), crate::IdError::Empty));
    }

    #[test]
    fn test_task_token_invalid_ulid() {
        let result: Result<TaskToken, _> = "stg_invalid".parse();
        assert!(matches!(result.unwrap_err(), crate::IdError::InvalidUlid(_)));
    }

    #[test]
    fn test_inbox_id_sortable() {
        let id1 = InboxId::new();
        std::thread::sleep(std::time::Duration::from_millis(1));
        let id2 = InboxId::new();
        // ULIDs are time-ordered, so id1 < id2
        assert!(id1 < id2);
    }

    #[test]
    fn test_task_token_json_roundtrip() {
        let token = TaskToken::new();
        let json = serde_json::to_string(&token).unwrap();
        let parsed: TaskToken = serde_json::from_str(&json).unwrap();
        assert_eq!(token, parsed);
    }

    #[test]
    fn test_worker_id_display_and_serde() {
        let id = WorkerId::new("worker-7");
        assert_eq!(id.to_string(), "worker-7");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"worker-7\"");
        let parsed: WorkerId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, parsed);
    }

    proptest! {
        #[test]
        fn prop_worker_id_roundtrip(s in "[a-z0-9-]{1,32}") {
            let id = WorkerId::new(s.clone());
            prop_assert_eq!(id.as_str(), s.as_str());
            let json = serde_json::to_string(&id).unwrap();
            let parsed: WorkerId = serde_json::from_str(&json).unwrap();
            prop_assert_eq!(id, parsed);
        }
    }
}
