//! Stable entity identity tokens.

use std::fmt;

/// Opaque identity of a tracked entity instance.
///
/// Tokens are issued by the heap when an entity is first registered and
/// never reused for the lifetime of that heap. Relation values, collection
/// diffs and command predicates all refer to entities through this token,
/// so two structurally equal entities remain distinct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityRef(u64);

impl EntityRef {
    /// Wrap a raw token value.
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw token value.
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_and_ordering() {
        let a = EntityRef::from_raw(1);
        let b = EntityRef::from_raw(2);
        assert_eq!(a.to_string(), "#1");
        assert!(a < b);
        assert_eq!(b.as_u64(), 2);
    }
}
