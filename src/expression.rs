// Copyright 2024 Saptak Santra
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Type expressions: (component type, secondary key) in one 64-bit word
//!
//! ```text
//! bits 48..=63  component type id
//! bits 40..=47  key tag (none / relation / link / key / wildcard)
//! bits 32..=39  key world byte (relations) or link type id
//! bits  0..=31  key payload (target slot or hash)
//! ```
//!
//! The layout is chosen so that plain `u64` ordering is the total order used
//! by signatures: component id first, then key kind, then key payload.
//! Relation keys carry the target's slot and world but not its generation;
//! the world scrubs relation columns when their target despawns, so a
//! recycled slot can never be confused with the old target.

use std::fmt;

use crate::component::{Component, ComponentTypeId};
use crate::identity::{
    Identity, IdentityKind, WildcardKind, TAG_KEY, TAG_LINK, TAG_NONE, TAG_RELATION, TAG_WILDCARD,
};
use crate::error::{EcsError, Result};

const COMP_SHIFT: u32 = 48;
const KEY_TAG_SHIFT: u32 = 40;
const KEY_WORLD_SHIFT: u32 = 32;
const KEY_BITS_MASK: u64 = (1 << COMP_SHIFT) - 1;
const PAYLOAD_MASK: u64 = 0xFFFF_FFFF;

/// Packed (component type, secondary key) pair
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TypeExpr(u64);

impl TypeExpr {
    /// Plain (keyless) expression for `T`
    pub fn plain<T: Component>() -> TypeExpr {
        TypeExpr((ComponentTypeId::of::<T>().raw() as u64) << COMP_SHIFT)
    }

    /// Storage-grade expression for `T` under `key`
    ///
    /// Wildcards are match-only and never stored; passing one yields
    /// `InvalidKeyExpression`.
    pub fn with_key<T: Component>(key: Identity) -> Result<TypeExpr> {
        if key.is_wildcard() {
            return Err(EcsError::InvalidKeyExpression);
        }
        Ok(Self::matching::<T>(key))
    }

    /// Match-grade expression for `T` under `key`; wildcards permitted
    pub fn matching<T: Component>(key: Identity) -> TypeExpr {
        Self::from_parts(ComponentTypeId::of::<T>(), key)
    }

    pub(crate) fn from_parts(component: ComponentTypeId, key: Identity) -> TypeExpr {
        let comp = (component.raw() as u64) << COMP_SHIFT;
        let key_bits = match key.kind() {
            IdentityKind::None => 0,
            IdentityKind::Entity => {
                ((TAG_RELATION as u64) << KEY_TAG_SHIFT)
                    | ((key.world() as u64) << KEY_WORLD_SHIFT)
                    | key.index() as u64
            }
            IdentityKind::Object => {
                ((TAG_LINK as u64) << KEY_TAG_SHIFT)
                    | ((key.link_type() as u64) << KEY_WORLD_SHIFT)
                    | key.index() as u64
            }
            IdentityKind::Hash => {
                ((TAG_KEY as u64) << KEY_TAG_SHIFT)
                    | ((key.link_type() as u64) << KEY_WORLD_SHIFT)
                    | key.index() as u64
            }
            IdentityKind::Wildcard => {
                ((TAG_WILDCARD as u64) << KEY_TAG_SHIFT)
                    | key.wildcard_kind().map_or(0, |k| k as u64)
            }
        };
        TypeExpr(comp | key_bits)
    }

    /// Key bits for a relation targeting the given entity slot, used by the
    /// world's relation-target index.
    pub(crate) fn relation_key_bits(target: Identity) -> u64 {
        ((TAG_RELATION as u64) << KEY_TAG_SHIFT)
            | ((target.world() as u64) << KEY_WORLD_SHIFT)
            | target.index() as u64
    }

    /// Component type id of this expression
    pub fn component_id(self) -> ComponentTypeId {
        ComponentTypeId::from_raw((self.0 >> COMP_SHIFT) as u16)
    }

    pub(crate) fn key_tag(self) -> u8 {
        (self.0 >> KEY_TAG_SHIFT) as u8
    }

    /// Low 48 bits: the packed secondary key
    pub(crate) fn key_bits(self) -> u64 {
        self.0 & KEY_BITS_MASK
    }

    pub(crate) fn key_world(self) -> u8 {
        (self.0 >> KEY_WORLD_SHIFT) as u8
    }

    pub(crate) fn key_payload(self) -> u32 {
        (self.0 & PAYLOAD_MASK) as u32
    }

    /// True for plain (keyless) expressions
    pub fn is_plain(self) -> bool {
        self.key_tag() == TAG_NONE
    }

    /// True for relation-keyed expressions
    pub fn is_relation(self) -> bool {
        self.key_tag() == TAG_RELATION
    }

    /// True for match-only wildcard expressions
    pub fn is_wildcard(self) -> bool {
        self.key_tag() == TAG_WILDCARD
    }

    fn wildcard_kind(self) -> WildcardKind {
        match self.key_payload() {
            1 => WildcardKind::Any,
            2 => WildcardKind::AnyTarget,
            3 => WildcardKind::AnyEntity,
            4 => WildcardKind::AnyLink,
            _ => WildcardKind::Plain,
        }
    }

    /// Non-commutative matching: does this query expression cover `stored`?
    ///
    /// `stored` is expected to be storage-grade. Plain queries match plain
    /// slots only; concrete keys match bit-for-bit; wildcards match their
    /// key class. The component type must agree exactly in every case.
    pub fn matches(self, stored: TypeExpr) -> bool {
        if self.component_id() != stored.component_id() {
            return false;
        }
        match self.key_tag() {
            TAG_NONE => stored.key_tag() == TAG_NONE,
            TAG_WILDCARD => match self.wildcard_kind() {
                WildcardKind::Any => !stored.is_wildcard(),
                WildcardKind::AnyTarget => {
                    stored.key_tag() != TAG_NONE && !stored.is_wildcard()
                }
                WildcardKind::AnyEntity => stored.key_tag() == TAG_RELATION,
                WildcardKind::AnyLink => stored.key_tag() == TAG_LINK,
                WildcardKind::Plain => stored.key_tag() == TAG_NONE,
            },
            _ => self.key_bits() == stored.key_bits(),
        }
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for TypeExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.component_id().name();
        match self.key_tag() {
            TAG_NONE => write!(f, "{name}"),
            TAG_RELATION => write!(f, "{name}(E{}w{})", self.key_payload(), self.key_world()),
            TAG_LINK => write!(f, "{name}(O{}:{:08x})", self.key_world(), self.key_payload()),
            TAG_KEY => write!(f, "{name}(H{}:{:08x})", self.key_world(), self.key_payload()),
            _ => {
                let kind = match self.wildcard_kind() {
                    WildcardKind::Any => "*any",
                    WildcardKind::AnyTarget => "*target",
                    WildcardKind::AnyEntity => "*entity",
                    WildcardKind::AnyLink => "*link",
                    WildcardKind::Plain => "*plain",
                };
                write!(f, "{name}({kind})")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Likes;
    struct Color;

    #[test]
    fn test_expression_is_64_bits() {
        assert_eq!(std::mem::size_of::<TypeExpr>(), 8);
    }

    #[test]
    fn test_ordering_is_component_then_key() {
        let plain = TypeExpr::plain::<Likes>();
        let rel = TypeExpr::with_key::<Likes>(Identity::entity(0, 5, 1)).unwrap();
        let link = TypeExpr::with_key::<Likes>(Identity::linked(&"obj").unwrap()).unwrap();

        // Plain sorts before keyed, relations before links
        assert!(plain < rel);
        assert!(rel < link);
    }

    #[test]
    fn test_matching_asymmetry() {
        let target = Identity::entity(0, 5, 1);
        let plain = TypeExpr::plain::<Likes>();
        let rel = TypeExpr::with_key::<Likes>(target).unwrap();
        let other_rel =
            TypeExpr::with_key::<Likes>(Identity::entity(0, 6, 1)).unwrap();
        let any = TypeExpr::matching::<Likes>(Identity::ANY);
        let any_target = TypeExpr::matching::<Likes>(Identity::ANY_TARGET);
        let any_entity = TypeExpr::matching::<Likes>(Identity::ANY_ENTITY);
        let any_link = TypeExpr::matching::<Likes>(Identity::ANY_LINK);
        let plain_only = TypeExpr::matching::<Likes>(Identity::PLAIN);

        // Plain never opts into wildcards
        assert!(!plain.matches(any));
        assert!(any.matches(plain));
        assert!(any.matches(rel));

        // Concrete relations match only themselves
        assert!(rel.matches(rel));
        assert!(!rel.matches(other_rel));
        assert!(!rel.matches(plain));

        // Class wildcards
        assert!(any_target.matches(rel));
        assert!(!any_target.matches(plain));
        assert!(any_entity.matches(rel));
        assert!(plain_only.matches(plain));
        assert!(!plain_only.matches(rel));

        let link = TypeExpr::with_key::<Likes>(Identity::linked(&1u32).unwrap()).unwrap();
        assert!(any_link.matches(link));
        assert!(!any_link.matches(rel));
        assert!(any_target.matches(link));
    }

    #[test]
    fn test_component_must_match() {
        let likes = TypeExpr::plain::<Likes>();
        let color = TypeExpr::plain::<Color>();
        assert!(!likes.matches(color));
        assert!(!TypeExpr::matching::<Likes>(Identity::ANY).matches(color));
    }

    #[test]
    fn test_wildcards_are_not_storable() {
        assert_eq!(
            TypeExpr::with_key::<Likes>(Identity::ANY).unwrap_err(),
            EcsError::InvalidKeyExpression
        );
    }
}
