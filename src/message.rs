//! Static type identity for payloads.
//!
//! The `MessageName` and `MessageFullName` headers come from a payload's
//! [`MessageDescriptor`]. By default the descriptor is derived from
//! [`std::any::type_name`]; types that need a stable wire name (shared with
//! other languages, or surviving a module move) override [`Message::descriptor`].

use serde::Serialize;

/// Name pair identifying a payload type on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageDescriptor {
    /// Short type name, e.g. `OrderPlaced`. Used for routing.
    pub name: &'static str,
    /// Fully-qualified type name, e.g. `shop::orders::OrderPlaced`.
    pub full_name: &'static str,
}

impl MessageDescriptor {
    /// Explicit descriptor.
    pub const fn new(name: &'static str, full_name: &'static str) -> Self {
        Self { name, full_name }
    }

    /// Descriptor derived from the Rust type path of `T`.
    pub fn of<T: ?Sized>() -> Self {
        let full_name = std::any::type_name::<T>();
        Self {
            name: short_name(full_name),
            full_name,
        }
    }
}

/// A payload that can be sent or published on the bus.
///
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct OrderPlaced { id: u64 }
///
/// impl Message for OrderPlaced {}
///
/// #[derive(Serialize, Deserialize)]
/// struct Ping;
///
/// impl Message for Ping {
///     fn descriptor() -> MessageDescriptor {
///         MessageDescriptor::new("Ping", "diagnostics.Ping")
///     }
/// }
/// ```
pub trait Message: Serialize + Send + Sync + 'static {
    /// Type identity written into the envelope headers.
    fn descriptor() -> MessageDescriptor
    where
        Self: Sized,
    {
        MessageDescriptor::of::<Self>()
    }
}

/// Last path segment of a type path, without generic arguments.
fn short_name(full_name: &'static str) -> &'static str {
    let base = full_name.split('<').next().unwrap_or(full_name);
    base.rsplit("::").next().unwrap_or(base)
}
