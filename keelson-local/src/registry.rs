//! Global registry of local endpoints.
//!
//! Server channels claim their name here on bind; clients resolve the name
//! on connect. A name maps to exactly one serving channel, and the binding
//! disappears when that channel closes.

use std::io;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use keelson_core::channel::Channel;

use crate::transport::LocalBinding;

static LOCAL_REGISTRY: once_cell::sync::Lazy<DashMap<String, LocalBinding>> =
    once_cell::sync::Lazy::new(DashMap::new);

/// Claim a name for a serving channel.
pub(crate) fn bind(name: &str, binding: LocalBinding) -> io::Result<()> {
    if name.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "local endpoint name cannot be empty",
        ));
    }
    // A losing bind must not displace the winner's binding.
    match LOCAL_REGISTRY.entry(name.to_string()) {
        Entry::Occupied(_) => Err(io::Error::new(
            io::ErrorKind::AddrInUse,
            format!("local endpoint '{name}' is already bound"),
        )),
        Entry::Vacant(vacant) => {
            vacant.insert(binding);
            Ok(())
        }
    }
}

/// Resolve a name to its binding.
pub(crate) fn lookup(name: &str) -> Option<LocalBinding> {
    LOCAL_REGISTRY.get(name).map(|entry| entry.value().clone())
}

/// Release a name. When the owning channel is known, the binding is only
/// removed if it still belongs to that channel, so a re-bound name is not
/// stolen by a late close.
pub(crate) fn unbind(name: &str, channel: Option<&Channel>) {
    match channel {
        Some(channel) => {
            LOCAL_REGISTRY.remove_if(name, |_, binding| &binding.channel == channel);
        }
        None => {
            LOCAL_REGISTRY.remove(name);
        }
    }
}

/// Returns true while a serving channel holds the name.
#[must_use]
pub fn is_bound(name: &str) -> bool {
    LOCAL_REGISTRY.contains_key(name)
}

/// List all currently bound endpoint names. Primarily for debugging and
/// tests.
#[must_use]
pub fn bound_endpoints() -> Vec<String> {
    LOCAL_REGISTRY
        .iter()
        .map(|entry| entry.key().clone())
        .collect()
}
