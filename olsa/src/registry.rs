//! Process wide ownership of opaque types.
//!
//! A `(advertisement type, opaque type)` pair belongs to at most one session at a time. Ownership
//! gates which origination and deletion requests a session may issue, and decides which
//! advertisements get flushed when a session goes away.

use std::collections::HashMap;

use crate::session::SessionId;

/// Identity of an opaque advertisement class: the advertisement type plus the opaque subtype.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpaqueTypeKey {
    pub lsa_type: u8,
    pub opaque_type: u8,
}

/// Marker error to indicate an opaque type is already owned by another session.
#[derive(Debug)]
pub struct TypeInUse;

/// Marker error to indicate an opaque type is not owned by the given session.
#[derive(Debug)]
pub struct NotRegistered;

/// The ownership table, shared by all sessions of one server.
#[derive(Debug, Default)]
pub struct OpaqueTypeRegistry {
    owners: HashMap<OpaqueTypeKey, SessionId>,
}

impl OpaqueTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `owner` as the owner of `key`. Re-registering a key the session already owns is
    /// allowed and changes nothing.
    pub fn register(&mut self, key: OpaqueTypeKey, owner: SessionId) -> Result<(), TypeInUse> {
        match self.owners.get(&key) {
            Some(&current) if current != owner => Err(TypeInUse),
            _ => {
                self.owners.insert(key, owner);
                Ok(())
            }
        }
    }

    /// Release `key`, which must be owned by `owner`.
    pub fn unregister(&mut self, key: OpaqueTypeKey, owner: SessionId) -> Result<(), NotRegistered> {
        match self.owners.get(&key) {
            Some(&current) if current == owner => {
                self.owners.remove(&key);
                Ok(())
            }
            _ => Err(NotRegistered),
        }
    }

    /// The current owner of `key`, if any.
    pub fn owner(&self, key: OpaqueTypeKey) -> Option<SessionId> {
        self.owners.get(&key).copied()
    }

    /// Whether `key` is currently owned by `owner`.
    pub fn is_owned_by(&self, key: OpaqueTypeKey, owner: SessionId) -> bool {
        self.owner(key) == Some(owner)
    }

    /// Drop every registration held by `owner`, returning the released keys.
    pub fn release_session(&mut self, owner: SessionId) -> Vec<OpaqueTypeKey> {
        let released: Vec<_> = self
            .owners
            .iter()
            .filter(|(_, &sid)| sid == owner)
            .map(|(&key, _)| key)
            .collect();
        for key in &released {
            self.owners.remove(key);
        }
        released
    }
}

#[cfg(test)]
mod tests {
    use super::{OpaqueTypeKey, OpaqueTypeRegistry};
    use crate::session::SessionId;

    const KEY: OpaqueTypeKey = OpaqueTypeKey {
        lsa_type: 10,
        opaque_type: 7,
    };

    #[test]
    fn single_owner_at_a_time() {
        let mut registry = OpaqueTypeRegistry::new();
        let first = SessionId::new(1);
        let second = SessionId::new(2);

        assert!(registry.register(KEY, first).is_ok());
        assert!(registry.register(KEY, second).is_err());
        assert_eq!(registry.owner(KEY), Some(first));

        // Re-registering your own key is fine.
        assert!(registry.register(KEY, first).is_ok());

        assert!(registry.unregister(KEY, second).is_err());
        assert!(registry.unregister(KEY, first).is_ok());
        assert!(registry.register(KEY, second).is_ok());
    }

    #[test]
    fn release_drops_all_keys_of_a_session() {
        let mut registry = OpaqueTypeRegistry::new();
        let owner = SessionId::new(1);
        let other = SessionId::new(2);
        let second_key = OpaqueTypeKey {
            lsa_type: 9,
            opaque_type: 3,
        };

        registry.register(KEY, owner).expect("key is free");
        registry.register(second_key, owner).expect("key is free");

        let mut released = registry.release_session(owner);
        released.sort_by_key(|key| key.lsa_type);
        assert_eq!(released, vec![second_key, KEY]);

        assert!(registry.register(KEY, other).is_ok());
        assert!(registry.release_session(owner).is_empty());
    }
}
