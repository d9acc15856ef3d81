//! The capability authority and its single unforgeable token.
//!
//! A [`Capability`] can only be constructed inside this crate, by
//! [`CapabilityAuthority::mint`], and the authority refuses to mint twice.
//! The type is neither `Clone` nor `Default` nor deserializable, so holding a
//! reference to one is the proof of authorization. Moving it moves the
//! authorization with it.

use std::fmt;

use rand::Rng;
use tracing::warn;

use crate::StoreError;

// ---------------------------------------------------------------------------
// Capability
// ---------------------------------------------------------------------------

/// Authorization token for privileged operations.
pub struct Capability {
    /// Binds the token to the authority that minted it.
    authority: u128,
}

impl fmt::Debug for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Capability(..)")
    }
}

// ---------------------------------------------------------------------------
// CapabilityAuthority
// ---------------------------------------------------------------------------

/// Mints exactly one [`Capability`] and checks presented tokens.
pub struct CapabilityAuthority {
    id: u128,
    minted: bool,
}

impl fmt::Debug for CapabilityAuthority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityAuthority")
            .field("minted", &self.minted)
            .finish_non_exhaustive()
    }
}

impl CapabilityAuthority {
    /// Create an authority with a fresh identity from the thread RNG.
    ///
    /// The identity is never derived from caller input, so no code outside
    /// the store can reconstruct it.
    pub(crate) fn new() -> Self {
        Self {
            id: rand::thread_rng().gen::<u128>(),
            minted: false,
        }
    }

    /// Mint the capability. Only the first call succeeds.
    pub fn mint(&mut self) -> Result<Capability, StoreError> {
        if self.minted {
            warn!("capability mint attempted after initialization");
            return Err(StoreError::Unauthorized);
        }
        self.minted = true;
        Ok(Capability {
            authority: self.id,
        })
    }

    /// Whether the capability has already been handed out.
    pub fn is_minted(&self) -> bool {
        self.minted
    }

    /// Whether `capability` was minted by this authority.
    pub fn check(&self, capability: &Capability) -> bool {
        capability.authority == self.id
    }

    /// [`check`](Self::check) as a precondition.
    pub fn require(&self, capability: &Capability) -> Result<(), StoreError> {
        if self.check(capability) {
            Ok(())
        } else {
            warn!("capability presented to the wrong authority");
            Err(StoreError::Unauthorized)
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mint_once() {
        let mut authority = CapabilityAuthority::new();
        let cap = authority.mint().unwrap();
        assert!(authority.is_minted());
        assert!(authority.check(&cap));
        assert!(matches!(authority.mint(), Err(StoreError::Unauthorized)));
    }

    #[test]
    fn foreign_capability_fails_check() {
        let mut ours = CapabilityAuthority::new();
        let mut theirs = CapabilityAuthority::new();
        let _mine = ours.mint().unwrap();
        let foreign = theirs.mint().unwrap();
        assert!(!ours.check(&foreign));
        assert!(matches!(
            ours.require(&foreign),
            Err(StoreError::Unauthorized)
        ));
    }

    #[test]
    fn independent_authorities_never_agree() {
        let mut first = CapabilityAuthority::new();
        let mut second = CapabilityAuthority::new();
        let cap = first.mint().unwrap();
        let other = second.mint().unwrap();
        assert!(!second.check(&cap));
        assert!(!first.check(&other));
    }

    #[test]
    fn debug_hides_secret() {
        let mut authority = CapabilityAuthority::new();
        let cap = authority.mint().unwrap();
        assert_eq!(format!("{cap:?}"), "Capability(..)");
    }
}
