//! Keyed hashing of DNS names, seeded once from the entropy source.
use super::entropy::EntropySource;
use crate::error::Error;
use ahash::RandomState;

#[derive(Debug)]
pub struct NameHash {
    state: RandomState,
}

impl NameHash {
    pub(super) fn create(entropy: &EntropySource) -> Result<Self, Error> {
        let state = RandomState::with_seeds(
            entropy.next_u64()?,
            entropy.next_u64()?,
            entropy.next_u64()?,
            entropy.next_u64()?,
        );
        Ok(Self { state })
    }

    /// A hasher builder sharing this hash's keys, for seeding hash maps.
    #[must_use]
    pub fn build_hasher(&self) -> RandomState {
        self.state.clone()
    }

    pub(super) fn destroy(self) {
        tracing::debug!("name hash destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name_hash() -> NameHash {
        NameHash::create(&EntropySource::create(None).unwrap()).unwrap()
    }

    #[test]
    fn hashers_share_their_keys() {
        let h = name_hash();
        let (a, b) = (h.build_hasher(), h.build_hasher());
        assert_eq!(a.hash_one("www.example."), b.hash_one("www.example."));
    }

    #[test]
    fn seeds_differ_between_instances() {
        let (a, b) = (name_hash().build_hasher(), name_hash().build_hasher());
        assert_ne!(a.hash_one("example."), b.hash_one("example."));
    }
}
