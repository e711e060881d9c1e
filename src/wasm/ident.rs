//! Process-wide identifier registry for FFI dispatch.
//!
//! Before each guest call the host draws a random non-negative 31-bit token
//! and maps it to the serving (environment, instance index) pair. The token
//! is the guest's "self" reference: it does not encode location, so a module
//! cannot guess valid identifiers belonging to other instances.

use dashmap::DashMap;
use once_cell::sync::Lazy;
use rand::{rngs::OsRng, RngCore};
use uuid::Uuid;

static IDENTIFIERS: Lazy<DashMap<i32, InstanceRef>> = Lazy::new(DashMap::new);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct InstanceRef {
    pub env: Uuid,
    pub index: usize,
}

/// Registry entry scoped to one guest call; revoked on drop so a dying
/// worker cannot leak a live token.
pub(crate) struct IdentGuard {
    ident: i32,
}

impl IdentGuard {
    pub(crate) fn value(&self) -> i32 {
        self.ident
    }
}

impl Drop for IdentGuard {
    fn drop(&mut self) {
        IDENTIFIERS.remove(&self.ident);
    }
}

/// Issue a fresh identifier for the given instance, re-drawing on the
/// (vanishingly rare) collision with a live entry.
pub(crate) fn issue(env: Uuid, index: usize) -> IdentGuard {
    loop {
        // Uniform over [0, 2^31): the guest ABI passes a signed 32-bit int.
        let ident = (OsRng.next_u32() >> 1) as i32;
        match IDENTIFIERS.entry(ident) {
            dashmap::mapref::entry::Entry::Occupied(_) => continue,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(InstanceRef { env, index });
                return IdentGuard { ident };
            }
        }
    }
}

pub(crate) fn resolve(ident: i32) -> Option<InstanceRef> {
    IDENTIFIERS.get(&ident).map(|entry| *entry.value())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issue_resolve_round_trip() {
        let env = Uuid::new_v4();
        let guard = issue(env, 3);
        let found = resolve(guard.value()).expect("must resolve while guard lives");
        assert_eq!(found.env, env);
        assert_eq!(found.index, 3);
    }

    #[test]
    fn identifiers_are_unique_while_live() {
        let env = Uuid::new_v4();
        let guards: Vec<_> = (0..256).map(|i| issue(env, i)).collect();
        let mut seen = std::collections::HashSet::new();
        for guard in &guards {
            assert!(guard.value() >= 0, "identifier must be non-negative");
            assert!(seen.insert(guard.value()), "duplicate live identifier");
        }
    }

    #[test]
    fn drop_revokes_the_entry() {
        let guard = issue(Uuid::new_v4(), 0);
        let ident = guard.value();
        drop(guard);
        assert!(resolve(ident).is_none(), "revoked identifier must not resolve");
    }
}
