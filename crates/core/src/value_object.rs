//! Value object trait: equality by value, not identity.

/// Marker trait for value objects.
///
/// Value objects have no identity and are compared by their attribute values.
/// `Money` is the canonical example in this workspace: `40.00` equals `40.0`
/// regardless of where either came from.
///
/// Value objects are immutable; "modifying" one means producing a new value
/// (`Money::checked_add` returns a fresh `Money`).
pub trait ValueObject: Clone + PartialEq + core::fmt::Debug {}
