// entity.rs - Entity handles with generational indices
//
// Generational indices prevent stale entity handles from accessing wrong
// entities after destroy+reuse cycles. Every handle also carries the instance
// it belongs to, since staging and live ids are never interchangeable.

use serde::{Deserialize, Serialize};

/// Which ECS instance an entity id belongs to.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum InstanceKind {
    #[default]
    Staging,
    Live,
}

/// Entity handle with generational index for safety.
///
/// A generation of zero marks the null entity. The generation is incremented
/// each time an entity slot is reused, invalidating stale handles.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Entity {
    /// Slot index within the owning instance.
    pub index: u32,

    /// Generation counter for this slot (zero = null).
    pub generation: u32,

    /// Instance this id belongs to.
    pub instance: InstanceKind,
}

impl Entity {
    pub const NULL: Entity = Entity {
        index: 0,
        generation: 0,
        instance: InstanceKind::Staging,
    };

    pub(crate) fn new(index: u32, generation: u32, instance: InstanceKind) -> Self {
        debug_assert!(generation > 0 && generation < (1 << 31));
        Self {
            index,
            generation,
            instance,
        }
    }

    pub fn is_null(&self) -> bool {
        self.generation == 0
    }

    pub fn exists(&self) -> bool {
        !self.is_null()
    }

    pub fn is_live(&self) -> bool {
        self.exists() && self.instance == InstanceKind::Live
    }

    pub fn is_staging(&self) -> bool {
        self.exists() && self.instance == InstanceKind::Staging
    }

    /// Pack the entity into a single u64 for atomics and FFI.
    ///
    /// Layout: bit 63 = instance tag, bits 32..63 = generation, bits 0..32 =
    /// index. Zero is the null entity.
    pub fn to_bits(self) -> u64 {
        if self.is_null() {
            return 0;
        }
        let tag = match self.instance {
            InstanceKind::Staging => 0u64,
            InstanceKind::Live => 1u64,
        };
        (tag << 63) | ((self.generation as u64) << 32) | self.index as u64
    }

    /// Unpack an entity previously packed with [`Entity::to_bits`].
    pub fn from_bits(bits: u64) -> Self {
        if bits == 0 {
            return Entity::NULL;
        }
        let instance = if bits >> 63 == 1 {
            InstanceKind::Live
        } else {
            InstanceKind::Staging
        };
        Self {
            index: (bits & 0xFFFF_FFFF) as u32,
            generation: ((bits >> 32) & 0x7FFF_FFFF) as u32,
            instance,
        }
    }
}

impl std::fmt::Display for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_null() {
            return write!(f, "Entity(null)");
        }
        let tag = match self.instance {
            InstanceKind::Staging => "staging",
            InstanceKind::Live => "live",
        };
        write!(f, "Entity({}:{}.{})", tag, self.index, self.generation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bit_packing_round_trip() {
        let e = Entity::new(42, 7, InstanceKind::Live);
        assert_eq!(Entity::from_bits(e.to_bits()), e);

        let s = Entity::new(u32::MAX, 1, InstanceKind::Staging);
        assert_eq!(Entity::from_bits(s.to_bits()), s);

        assert_eq!(Entity::from_bits(0), Entity::NULL);
        assert!(Entity::from_bits(Entity::NULL.to_bits()).is_null());
    }
}
