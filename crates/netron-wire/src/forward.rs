//! Argument and result forwarding between user values and wire values.
//!
//! Outgoing values are scanned before they leave (`process_args_remote`):
//! local objects become weak definitions, interfaces owned by the receiving
//! peer travel back as plain references, and interfaces owned by anyone else
//! are wrapped in a remote stub so the receiver can reach them through us.
//! Incoming values are rehydrated symmetrically (`process_result`).
//!
//! The same two functions serve both directions of a call: a client encodes
//! its arguments and decodes the result, the serving side decodes the
//! arguments and encodes the result. Results are minted with the served
//! definition as parent, which is what links every remote stub of a relay
//! chain back to the context that produced it.

use crate::context::Value;
use crate::interface::Interface;
use crate::peer::{Peer, RemotePeer};
use crate::registry::{DefinitionRegistry, StubTarget};
use netron_types::{DefId, NetronError, NetronResult, WireValue};
use std::sync::Arc;

/// Encode a value for `peer_id`.
///
/// `parent_id` is the local definition the value is produced through, if
/// any. Interfaces in `value` are consumed: their handles move into a
/// remote stub, or are released once turned into a reference.
pub fn process_args_remote(
    registry: &DefinitionRegistry,
    peer_id: &str,
    value: Value,
    parent_id: Option<DefId>,
) -> NetronResult<WireValue> {
    match value {
        Value::Plain(v) => Ok(WireValue::Plain(v)),
        Value::Context(ctx) => Ok(WireValue::Definition(
            registry.attach_weak(ctx, parent_id, peer_id),
        )),
        Value::Interface(iface) => forward_interface(registry, peer_id, iface, parent_id),
        Value::List(items) => items
            .into_iter()
            .map(|item| process_args_remote(registry, peer_id, item, parent_id))
            .collect::<NetronResult<Vec<_>>>()
            .map(WireValue::List),
    }
}

fn forward_interface(
    registry: &DefinitionRegistry,
    peer_id: &str,
    iface: Interface,
    parent_id: Option<DefId>,
) -> NetronResult<WireValue> {
    if iface.peer_id() == peer_id {
        // Back to its owner.
        let def_id = iface.def_id();
        iface.release()?;
        return Ok(WireValue::Reference(def_id));
    }
    if iface.peer().is_local() {
        let definition = registry
            .definition(iface.def_id())
            .ok_or(NetronError::UnknownDefinition(iface.def_id()))?;
        iface.release()?;
        return Ok(WireValue::Definition(definition));
    }
    Ok(WireValue::Definition(
        registry.forward(iface, parent_id, peer_id),
    ))
}

/// Decode a value received from `peer`.
///
/// Definitions are recorded on the peer and bound to it as interfaces;
/// references resolve to the local object they name.
pub fn process_result(
    registry: &DefinitionRegistry,
    peer: &Arc<RemotePeer>,
    value: WireValue,
) -> NetronResult<Value> {
    match value {
        WireValue::Plain(v) => Ok(Value::Plain(v)),
        WireValue::Definition(definition) => {
            peer.remember_definition(&definition);
            let owner: Arc<dyn Peer> = Arc::clone(peer) as Arc<dyn Peer>;
            Ok(Value::Interface(Interface::bind(owner, definition)))
        }
        WireValue::Reference(def_id) => match registry.target(def_id)?.1 {
            StubTarget::Local(ctx) => Ok(Value::Context(ctx)),
            StubTarget::Forwarded(iface) => Ok(Value::Interface((*iface).clone())),
        },
        WireValue::List(items) => items
            .into_iter()
            .map(|item| process_result(registry, peer, item))
            .collect::<NetronResult<Vec<_>>>()
            .map(Value::List),
    }
}

/// Rehydrate a value produced by a local dispatch for a caller in this
/// process: local objects get a weak definition bound to the own peer.
pub fn process_local_result(
    registry: &DefinitionRegistry,
    own: &Arc<dyn Peer>,
    value: Value,
    parent_id: Option<DefId>,
) -> Value {
    match value {
        Value::Context(ctx) => {
            let definition = registry.attach_weak(ctx, parent_id, own.id());
            Value::Interface(Interface::bind(Arc::clone(own), definition))
        }
        Value::List(items) => Value::List(
            items
                .into_iter()
                .map(|item| process_local_result(registry, own, item, parent_id))
                .collect(),
        ),
        other => other,
    }
}
