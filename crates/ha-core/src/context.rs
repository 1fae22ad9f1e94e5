//! Context attached to every fired event

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Identifies who or what caused an event
///
/// Registry mutations triggered by other mutations (for example a child
/// device losing its `via_device_id` when the parent is removed) carry a
/// child context so the causality chain can be followed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Context {
    /// Unique identifier for this context (ULID)
    pub id: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
}

impl Context {
    pub fn new() -> Self {
        Self {
            id: Ulid::new().to_string(),
            user_id: None,
            parent_id: None,
        }
    }

    /// Context for an action initiated by a user
    pub fn with_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            ..Self::new()
        }
    }

    /// Derive a context whose parent is this one
    pub fn child(&self) -> Self {
        Self {
            id: Ulid::new().to_string(),
            user_id: self.user_id.clone(),
            parent_id: Some(self.id.clone()),
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_context_links_parent() {
        let parent = Context::with_user("admin");
        let child = parent.child();

        assert_ne!(parent.id, child.id);
        assert_eq!(child.parent_id.as_deref(), Some(parent.id.as_str()));
        assert_eq!(child.user_id.as_deref(), Some("admin"));
    }

    #[test]
    fn test_optional_fields_skipped() {
        let value = serde_json::to_value(Context::new()).unwrap();
        assert!(value.get("user_id").is_none());
        assert!(value.get("parent_id").is_none());
    }
}
