//! Definitions: the remotely visible descriptors of exposed contexts.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Identifier of a definition, unique per owning Netron instance.
pub type DefId = u64;

/// What a context exposes: its class name, public members and optional twin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextDescriptor {
    /// Class name of the context. Used as the context id when none is given.
    pub name: String,
    /// Names of the methods and properties reachable remotely.
    pub members: BTreeSet<String>,
    /// Optional client-side twin descriptor, carried verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub twin: Option<String>,
}

impl ContextDescriptor {
    /// Create a descriptor with no public members.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            members: BTreeSet::new(),
            twin: None,
        }
    }

    /// Add public members.
    pub fn with_members<I, S>(mut self, members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.members.extend(members.into_iter().map(Into::into));
        self
    }

    /// Attach a twin descriptor.
    pub fn with_twin(mut self, twin: impl Into<String>) -> Self {
        self.twin = Some(twin.into());
        self
    }
}

/// Descriptor of a remotely addressable context.
///
/// A definition never changes after it is minted; mutating the context it
/// describes does not affect its id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Definition {
    /// Id assigned by the owning Netron.
    pub id: DefId,
    /// Context name, set only for strong (explicitly attached) contexts.
    #[serde(default)]
    pub ctx_id: Option<String>,
    /// Definition through which this one was produced.
    #[serde(default)]
    pub parent_id: Option<DefId>,
    /// Class name of the described context.
    pub name: String,
    /// Public member names.
    pub members: BTreeSet<String>,
    /// True for definitions minted ad hoc for returned or passed objects.
    #[serde(default)]
    pub weak: bool,
    /// True when calls on this definition are relayed to another peer.
    #[serde(default, rename = "$remote")]
    pub remote: bool,
    /// Optional twin descriptor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub twin: Option<String>,
}

impl Definition {
    /// Definition of a strong context attached under `ctx_id`.
    pub fn strong(id: DefId, ctx_id: impl Into<String>, descriptor: &ContextDescriptor) -> Self {
        Self {
            id,
            ctx_id: Some(ctx_id.into()),
            parent_id: None,
            name: descriptor.name.clone(),
            members: descriptor.members.clone(),
            weak: false,
            remote: false,
            twin: descriptor.twin.clone(),
        }
    }

    /// Ad hoc definition for an object handed out by reference.
    pub fn weak(id: DefId, parent_id: Option<DefId>, descriptor: &ContextDescriptor) -> Self {
        Self {
            id,
            ctx_id: None,
            parent_id,
            name: descriptor.name.clone(),
            members: descriptor.members.clone(),
            weak: true,
            remote: false,
            twin: descriptor.twin.clone(),
        }
    }

    /// Descriptor of the context this definition describes.
    pub fn descriptor(&self) -> ContextDescriptor {
        ContextDescriptor {
            name: self.name.clone(),
            members: self.members.clone(),
            twin: self.twin.clone(),
        }
    }

    /// Copy of this definition marked as relayed.
    pub fn into_remote(mut self) -> Self {
        self.remote = true;
        self
    }

    /// Whether `member` is publicly reachable.
    pub fn has_member(&self, member: &str) -> bool {
        self.members.contains(member)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn calc() -> ContextDescriptor {
        ContextDescriptor::new("Calculator").with_members(["add", "sub", "memory"])
    }

    #[test]
    fn test_strong_definition() {
        let def = Definition::strong(1, "calc", &calc());
        assert_eq!(def.ctx_id.as_deref(), Some("calc"));
        assert!(!def.weak);
        assert!(!def.remote);
        assert!(def.has_member("add"));
        assert!(!def.has_member("mul"));
    }

    #[test]
    fn test_weak_definition_links_parent() {
        let def = Definition::weak(5, Some(1), &calc());
        assert!(def.weak);
        assert_eq!(def.ctx_id, None);
        assert_eq!(def.parent_id, Some(1));
    }

    #[test]
    fn test_remote_flag_serialized_with_dollar() {
        let def = Definition::weak(9, Some(2), &calc()).into_remote();
        let json = serde_json::to_string(&def).unwrap();
        assert!(json.contains("\"$remote\":true"));
        let back: Definition = serde_json::from_str(&json).unwrap();
        assert_eq!(back, def);
    }
}
