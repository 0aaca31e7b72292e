//! Subscription registry.
//!
//! Interest declarations collected during setup and replayed against the
//! broker, in registration order, when the bus starts. Append-only: no
//! deduplication, the broker's binding semantics decide what a duplicate
//! means.

use std::fmt;

/// Interest in messages published by an endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subscription {
    /// Publishing endpoint.
    pub endpoint: String,
    /// Message name to receive. Empty means every message from `endpoint`.
    pub message_name: String,
}

impl Subscription {
    /// Interest in one message type from `endpoint`.
    pub fn message(endpoint: impl Into<String>, message_name: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            message_name: message_name.into(),
        }
    }

    /// Interest in every message from `endpoint`.
    pub fn all(endpoint: impl Into<String>) -> Self {
        Self::message(endpoint, String::new())
    }

    /// True if this subscription covers every message from its endpoint.
    pub fn is_wildcard(&self) -> bool {
        self.message_name.is_empty()
    }
}

impl fmt::Display for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_wildcard() {
            write!(f, "{}/*", self.endpoint)
        } else {
            write!(f, "{}/{}", self.endpoint, self.message_name)
        }
    }
}

/// Ordered, append-only set of subscriptions.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionRegistry {
    entries: Vec<Subscription>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a narrow interest.
    pub fn subscribe_message(&mut self, endpoint: impl Into<String>, message_name: impl Into<String>) {
        self.entries
            .push(Subscription::message(endpoint, message_name));
    }

    /// Register a wildcard interest.
    pub fn subscribe(&mut self, endpoint: impl Into<String>) {
        self.entries.push(Subscription::all(endpoint));
    }

    /// Subscriptions in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Subscription> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registration_order_preserved() {
        let mut registry = SubscriptionRegistry::new();
        registry.subscribe_message("A", "Foo");
        registry.subscribe("B");
        registry.subscribe_message("C", "Bar");

        let entries: Vec<_> = registry.iter().cloned().collect();
        assert_eq!(
            entries,
            vec![
                Subscription::message("A", "Foo"),
                Subscription::all("B"),
                Subscription::message("C", "Bar"),
            ]
        );
    }

    #[test]
    fn test_duplicates_are_kept() {
        let mut registry = SubscriptionRegistry::new();
        registry.subscribe_message("A", "Foo");
        registry.subscribe_message("A", "Foo");
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_wildcard_has_empty_name() {
        let sub = Subscription::all("orders");
        assert!(sub.is_wildcard());
        assert_eq!(sub.message_name, "");
        assert_eq!(sub.to_string(), "orders/*");
        assert_eq!(Subscription::message("orders", "Placed").to_string(), "orders/Placed");
    }

    #[test]
    fn test_empty_registry() {
        let registry = SubscriptionRegistry::new();
        assert!(registry.is_empty());
        assert_eq!(registry.iter().count(), 0);
    }
}
