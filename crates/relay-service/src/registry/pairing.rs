//! Call pairing table.
//!
//! Symmetric: pairing `a` with `b` stores both directions, and removing
//! either side removes both.

use std::collections::HashMap;

use signaling_protocol::UserId;

use crate::errors::PairingError;

#[derive(Debug, Default)]
pub struct PairingTable {
    partners: HashMap<UserId, UserId>,
}

impl PairingTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pair two users.
    ///
    /// Re-pairing the same two users succeeds without change.
    ///
    /// # Errors
    ///
    /// - [`PairingError::SelfPairing`] if `a == b`
    /// - [`PairingError::AlreadyPaired`] if either user is paired with
    ///   someone else (the existing pairing wins)
    pub fn pair(&mut self, a: &UserId, b: &UserId) -> Result<(), PairingError> {
        if a == b {
            return Err(PairingError::SelfPairing(a.to_string()));
        }

        for (user, other) in [(a, b), (b, a)] {
            if let Some(existing) = self.partners.get(user) {
                if existing != other {
                    return Err(PairingError::AlreadyPaired {
                        user_id: user.to_string(),
                    });
                }
            }
        }

        self.partners.insert(a.clone(), b.clone());
        self.partners.insert(b.clone(), a.clone());
        Ok(())
    }

    /// Remove `user`'s pairing, returning the former partner.
    pub fn unpair(&mut self, user: &UserId) -> Option<UserId> {
        let partner = self.partners.remove(user)?;
        if self.partners.get(&partner) == Some(user) {
            self.partners.remove(&partner);
        }
        Some(partner)
    }

    #[must_use]
    pub fn partner_of(&self, user: &UserId) -> Option<&UserId> {
        self.partners.get(user)
    }

    /// Number of active pairings.
    #[must_use]
    pub fn len(&self) -> usize {
        self.partners.len() / 2
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.partners.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn uid(s: &str) -> UserId {
        UserId::parse(s).unwrap()
    }

    #[test]
    fn test_pair_is_symmetric() {
        let mut table = PairingTable::new();
        table.pair(&uid("pat1"), &uid("doc1")).unwrap();

        assert_eq!(table.partner_of(&uid("pat1")), Some(&uid("doc1")));
        assert_eq!(table.partner_of(&uid("doc1")), Some(&uid("pat1")));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_first_pairing_wins() {
        let mut table = PairingTable::new();
        table.pair(&uid("pat1"), &uid("doc1")).unwrap();

        let err = table.pair(&uid("pat2"), &uid("doc1")).unwrap_err();
        assert_eq!(
            err,
            PairingError::AlreadyPaired {
                user_id: "doc1".to_string()
            }
        );

        let err = table.pair(&uid("pat1"), &uid("doc2")).unwrap_err();
        assert_eq!(
            err,
            PairingError::AlreadyPaired {
                user_id: "pat1".to_string()
            }
        );

        assert_eq!(table.partner_of(&uid("doc1")), Some(&uid("pat1")));
        assert!(table.partner_of(&uid("pat2")).is_none());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_repairing_same_users_is_idempotent() {
        let mut table = PairingTable::new();
        table.pair(&uid("a"), &uid("b")).unwrap();
        table.pair(&uid("b"), &uid("a")).unwrap();
        table.pair(&uid("a"), &uid("b")).unwrap();
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_self_pairing_rejected() {
        let mut table = PairingTable::new();
        assert_eq!(
            table.pair(&uid("a"), &uid("a")),
            Err(PairingError::SelfPairing("a".to_string()))
        );
        assert!(table.is_empty());
    }

    #[test]
    fn test_unpair_removes_both_directions() {
        let mut table = PairingTable::new();
        table.pair(&uid("a"), &uid("b")).unwrap();

        assert_eq!(table.unpair(&uid("b")), Some(uid("a")));
        assert!(table.partner_of(&uid("a")).is_none());
        assert!(table.partner_of(&uid("b")).is_none());
        assert!(table.unpair(&uid("a")).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn test_unpair_frees_users_for_new_pairing() {
        let mut table = PairingTable::new();
        table.pair(&uid("a"), &uid("b")).unwrap();
        table.unpair(&uid("a"));

        table.pair(&uid("b"), &uid("c")).unwrap();
        assert_eq!(table.partner_of(&uid("c")), Some(&uid("b")));
    }
}
