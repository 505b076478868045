//! Entity trait: identity + continuity.

/// Entity marker + minimal interface.
///
/// Accounts, transactions and entries are entities: two records with the same
/// id are the same record, regardless of their other fields.
pub trait Entity {
    /// Strongly-typed entity identifier.
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    /// Returns the entity identifier.
    fn id(&self) -> &Self::Id;
}
