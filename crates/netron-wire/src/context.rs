//! Local contexts and the values that flow through remote calls.

use crate::interface::Interface;
use async_trait::async_trait;
use netron_types::{ContextDescriptor, RemoteError};
use std::fmt;
use std::sync::Arc;

/// A local object made remotely addressable.
///
/// Implementations dispatch on the member name themselves; the protocol core
/// never inspects a context beyond its [`ContextDescriptor`]. Errors are
/// returned to the remote caller verbatim.
#[async_trait]
pub trait Context: Send + Sync + 'static {
    /// Class name and public members.
    fn descriptor(&self) -> ContextDescriptor;

    /// Call a method or read a property. Property reads receive a null
    /// argument.
    async fn invoke(&self, member: &str, args: Value) -> Result<Value, RemoteError>;

    /// Write a property, or call a method whose result is not wanted.
    async fn assign(&self, member: &str, value: Value) -> Result<(), RemoteError> {
        let _ = value;
        Err(RemoteError::new(
            "NotImplemented",
            format!("{} does not accept assignment to {member}", self.descriptor().name),
        ))
    }
}

/// A value passed to or returned from a remote member.
///
/// Plain data is carried as JSON. Local contexts travel by reference and
/// arrive on the other side as an [`Interface`]; interfaces already bound to
/// a peer are either handed back to their owner or forwarded onward.
#[derive(Clone)]
pub enum Value {
    /// Plain data.
    Plain(serde_json::Value),
    /// A local object passed by reference.
    Context(Arc<dyn Context>),
    /// A handle on a context living on some peer.
    Interface(Interface),
    /// A positional collection, processed element-wise.
    List(Vec<Value>),
}

impl Value {
    /// JSON null.
    pub fn null() -> Self {
        Self::Plain(serde_json::Value::Null)
    }

    /// Wrap a local object so it is passed by reference.
    pub fn context<C: Context>(ctx: C) -> Self {
        Self::Context(Arc::new(ctx))
    }

    /// Whether this is JSON null.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Plain(serde_json::Value::Null))
    }

    /// Plain JSON payload, if this is plain data.
    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Plain(v) => Some(v),
            _ => None,
        }
    }

    /// Consume into the interface, if this is one.
    pub fn into_interface(self) -> Option<Interface> {
        match self {
            Self::Interface(iface) => Some(iface),
            _ => None,
        }
    }

    /// Split a call payload into its positional arguments.
    ///
    /// Lists and JSON arrays yield their elements, null yields nothing, any
    /// other value is a single argument.
    pub fn into_args(self) -> Vec<Value> {
        match self {
            Self::List(items) => items,
            Self::Plain(serde_json::Value::Array(items)) => {
                items.into_iter().map(Self::Plain).collect()
            }
            Self::Plain(serde_json::Value::Null) => Vec::new(),
            other => vec![other],
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plain(v) => f.debug_tuple("Plain").field(v).finish(),
            Self::Context(ctx) => f
                .debug_tuple("Context")
                .field(&ctx.descriptor().name)
                .finish(),
            Self::Interface(iface) => f.debug_tuple("Interface").field(iface).finish(),
            Self::List(items) => f.debug_tuple("List").field(items).finish(),
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Self::Plain(v)
    }
}

impl From<Interface> for Value {
    fn from(iface: Interface) -> Self {
        Self::Interface(iface)
    }
}

impl From<Arc<dyn Context>> for Value {
    fn from(ctx: Arc<dyn Context>) -> Self {
        Self::Context(ctx)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Self::List(items)
    }
}

/// Identity of a context object, used to reuse its definition.
pub(crate) fn same_context(a: &Arc<dyn Context>, b: &Arc<dyn Context>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl Context for Echo {
        fn descriptor(&self) -> ContextDescriptor {
            ContextDescriptor::new("Echo").with_members(["echo"])
        }

        async fn invoke(&self, _member: &str, args: Value) -> Result<Value, RemoteError> {
            Ok(args)
        }
    }

    #[test]
    fn test_into_args() {
        assert!(Value::null().into_args().is_empty());
        assert_eq!(Value::Plain(json!([1, 2])).into_args().len(), 2);
        assert_eq!(
            Value::List(vec![Value::Plain(json!(1))]).into_args().len(),
            1
        );
        let single = Value::Plain(json!("x")).into_args();
        assert_eq!(single[0].as_json(), Some(&json!("x")));
    }

    #[test]
    fn test_same_context_identity() {
        let a: Arc<dyn Context> = Arc::new(Echo);
        let b: Arc<dyn Context> = Arc::new(Echo);
        assert!(same_context(&a, &a.clone()));
        assert!(!same_context(&a, &b));
    }

    #[tokio::test]
    async fn test_default_assign_rejects() {
        let err = Echo.assign("echo", Value::null()).await.unwrap_err();
        assert_eq!(err.kind, "NotImplemented");
    }

    #[test]
    fn test_debug_names_context() {
        let v = Value::context(Echo);
        assert_eq!(format!("{v:?}"), "Context(\"Echo\")");
    }
}
