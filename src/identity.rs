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

//! Packed 64-bit identity values
//!
//! A single `Identity` word discriminates live entities, object links,
//! typed hash keys, query wildcards and the none value. Bit layout:
//!
//! ```text
//! bits  0..=31  index (entity slot, object hash or key hash)
//! bits 32..=39  world index, 255 = global sentinel
//! bits 40..=47  reserved flags
//! bits 48..=55  secondary-key tag
//! bits 56..=63  generation / link type id / wildcard kind
//! ```

use std::any::TypeId;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use parking_lot::Mutex;
use rustc_hash::FxHasher;

use crate::error::{EcsError, Result};

const INDEX_MASK: u64 = 0xFFFF_FFFF;
const WORLD_SHIFT: u32 = 32;
const TAG_SHIFT: u32 = 48;
const DECOR_SHIFT: u32 = 56;

/// World byte reserved for identities that belong to no world
pub(crate) const WORLD_GLOBAL: u8 = 255;

// Secondary-key tags. An identity carries the tag describing the role it
// plays when used as the secondary key of a type expression.
pub(crate) const TAG_NONE: u8 = 0;
pub(crate) const TAG_RELATION: u8 = 1;
pub(crate) const TAG_LINK: u8 = 2;
pub(crate) const TAG_KEY: u8 = 3;
pub(crate) const TAG_WILDCARD: u8 = 4;

/// Logical identity kinds (discriminated, not physical subtypes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityKind {
    None,
    Entity,
    Object,
    Hash,
    Wildcard,
}

/// Match-only key classes covered by the wildcard identities
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WildcardKind {
    /// Any key, including the plain (keyless) slot
    Any = 1,
    /// Any non-plain key
    AnyTarget = 2,
    /// Any entity-relation key
    AnyEntity = 3,
    /// Any object-link key
    AnyLink = 4,
    /// Exactly the plain slot
    Plain = 5,
}

/// Packed 64-bit handle
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Identity(u64);

const fn wildcard(kind: WildcardKind) -> Identity {
    Identity(
        ((kind as u64) << DECOR_SHIFT)
            | ((TAG_WILDCARD as u64) << TAG_SHIFT)
            | ((WORLD_GLOBAL as u64) << WORLD_SHIFT),
    )
}

impl Identity {
    /// The zero identity
    pub const NONE: Identity = Identity(0);

    /// Matches any key, plain included
    pub const ANY: Identity = wildcard(WildcardKind::Any);

    /// Matches any non-plain key
    pub const ANY_TARGET: Identity = wildcard(WildcardKind::AnyTarget);

    /// Matches any entity-relation key
    pub const ANY_ENTITY: Identity = wildcard(WildcardKind::AnyEntity);

    /// Matches any object-link key
    pub const ANY_LINK: Identity = wildcard(WildcardKind::AnyLink);

    /// Matches exactly the plain (keyless) slot
    pub const PLAIN: Identity = wildcard(WildcardKind::Plain);

    /// Construct a live entity identity
    ///
    /// # Panics
    /// Panics on a zero generation or a world index colliding with the
    /// global sentinel; both indicate a core bug.
    pub fn entity(world: u8, slot: u32, generation: u8) -> Identity {
        assert_ne!(generation, 0, "live entity generation must be non-zero");
        assert_ne!(world, WORLD_GLOBAL, "world index 255 is reserved");
        Identity(
            ((generation as u64) << DECOR_SHIFT)
                | ((TAG_RELATION as u64) << TAG_SHIFT)
                | ((world as u64) << WORLD_SHIFT)
                | slot as u64,
        )
    }

    /// Construct an object-link identity from an external object
    ///
    /// The object itself is never stored or dereferenced; only its hash and
    /// a per-process link type id survive.
    pub fn linked<O: Hash + 'static>(obj: &O) -> Result<Identity> {
        let type_id = link_type_id(TypeId::of::<O>())?;
        Ok(Identity(
            ((type_id as u64) << DECOR_SHIFT)
                | ((TAG_LINK as u64) << TAG_SHIFT)
                | ((WORLD_GLOBAL as u64) << WORLD_SHIFT)
                | hash32(obj) as u64,
        ))
    }

    /// Construct a strongly-typed hash-key identity
    pub fn keyed<K: Hash + 'static>(key: &K) -> Result<Identity> {
        let type_id = link_type_id(TypeId::of::<K>())?;
        Ok(Identity(
            ((type_id as u64) << DECOR_SHIFT)
                | ((TAG_KEY as u64) << TAG_SHIFT)
                | ((WORLD_GLOBAL as u64) << WORLD_SHIFT)
                | hash32(key) as u64,
        ))
    }

    /// Raw packed value
    pub fn raw(self) -> u64 {
        self.0
    }

    /// Low 32 bits: entity slot or object/key hash
    pub fn index(self) -> u32 {
        (self.0 & INDEX_MASK) as u32
    }

    /// World byte (255 for global identities)
    pub fn world(self) -> u8 {
        (self.0 >> WORLD_SHIFT) as u8
    }

    pub(crate) fn key_tag(self) -> u8 {
        (self.0 >> TAG_SHIFT) as u8
    }

    fn decoration(self) -> u8 {
        (self.0 >> DECOR_SHIFT) as u8
    }

    /// Discriminate the logical kind of this identity
    pub fn kind(self) -> IdentityKind {
        if self.0 == 0 {
            return IdentityKind::None;
        }
        if self.world() != WORLD_GLOBAL {
            return IdentityKind::Entity;
        }
        match self.key_tag() {
            TAG_LINK => IdentityKind::Object,
            TAG_KEY => IdentityKind::Hash,
            TAG_WILDCARD => IdentityKind::Wildcard,
            _ => IdentityKind::None,
        }
    }

    pub fn is_entity(self) -> bool {
        self.kind() == IdentityKind::Entity
    }

    pub fn is_wildcard(self) -> bool {
        self.kind() == IdentityKind::Wildcard
    }

    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    /// Entity generation; zero for non-entities
    pub fn generation(self) -> u8 {
        match self.kind() {
            IdentityKind::Entity => self.decoration(),
            _ => 0,
        }
    }

    /// Link/key type id; zero for non-object identities
    pub fn link_type(self) -> u8 {
        match self.kind() {
            IdentityKind::Object | IdentityKind::Hash => self.decoration(),
            _ => 0,
        }
    }

    /// Wildcard class of this identity, if any
    pub fn wildcard_kind(self) -> Option<WildcardKind> {
        if self.kind() != IdentityKind::Wildcard {
            return None;
        }
        Some(match self.decoration() {
            1 => WildcardKind::Any,
            2 => WildcardKind::AnyTarget,
            3 => WildcardKind::AnyEntity,
            4 => WildcardKind::AnyLink,
            _ => WildcardKind::Plain,
        })
    }

    /// Identity of the entity that will occupy this slot after a despawn.
    ///
    /// The generation wraps past 255 back to 1; it is never zero, so a
    /// recycled slot can always be told apart from its previous occupant.
    pub fn successor(self) -> Result<Identity> {
        if self.kind() != IdentityKind::Entity {
            return Err(EcsError::InvalidIdentityKind);
        }
        let next = (self.decoration() % u8::MAX) + 1;
        Ok(Identity(
            (self.0 & !(0xFF << DECOR_SHIFT)) | ((next as u64) << DECOR_SHIFT),
        ))
    }
}

impl Default for Identity {
    fn default() -> Self {
        Identity::NONE
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({self})")
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            IdentityKind::None => write!(f, "none"),
            IdentityKind::Entity => write!(
                f,
                "E{}v{}w{}",
                self.index(),
                self.generation(),
                self.world()
            ),
            IdentityKind::Object => write!(f, "O{}:{:08x}", self.link_type(), self.index()),
            IdentityKind::Hash => write!(f, "H{}:{:08x}", self.link_type(), self.index()),
            IdentityKind::Wildcard => match self.wildcard_kind() {
                Some(WildcardKind::Any) => write!(f, "*any"),
                Some(WildcardKind::AnyTarget) => write!(f, "*target"),
                Some(WildcardKind::AnyEntity) => write!(f, "*entity"),
                Some(WildcardKind::AnyLink) => write!(f, "*link"),
                _ => write!(f, "*plain"),
            },
        }
    }
}

/// Debug-only parsing of the `Display` forms. Object and hash identities
/// are not parseable; their link type ids are process-local.
impl FromStr for Identity {
    type Err = EcsError;

    fn from_str(s: &str) -> Result<Identity> {
        match s {
            "none" => return Ok(Identity::NONE),
            "*any" => return Ok(Identity::ANY),
            "*target" => return Ok(Identity::ANY_TARGET),
            "*entity" => return Ok(Identity::ANY_ENTITY),
            "*link" => return Ok(Identity::ANY_LINK),
            "*plain" => return Ok(Identity::PLAIN),
            _ => {}
        }
        let malformed = || EcsError::MalformedIdentity(s.to_string());
        let rest = s.strip_prefix('E').ok_or_else(malformed)?;
        let (slot, rest) = rest.split_once('v').ok_or_else(malformed)?;
        let (generation, world) = rest.split_once('w').ok_or_else(malformed)?;
        let slot: u32 = slot.parse().map_err(|_| malformed())?;
        let generation: u8 = generation.parse().map_err(|_| malformed())?;
        let world: u8 = world.parse().map_err(|_| malformed())?;
        if generation == 0 || world == WORLD_GLOBAL {
            return Err(malformed());
        }
        Ok(Identity::entity(world, slot, generation))
    }
}

fn hash32<T: Hash>(value: &T) -> u32 {
    let mut hasher = FxHasher::default();
    value.hash(&mut hasher);
    let h = hasher.finish();
    (h ^ (h >> 32)) as u32
}

// Link/key type ids are 8-bit and assigned on first use. A linear scan is
// fine here; the set of distinct link types is tiny in practice.
static LINK_TYPES: Mutex<Vec<TypeId>> = Mutex::new(Vec::new());

fn link_type_id(type_id: TypeId) -> Result<u8> {
    let mut types = LINK_TYPES.lock();
    if let Some(pos) = types.iter().position(|t| *t == type_id) {
        return Ok(pos as u8 + 1);
    }
    if types.len() >= u8::MAX as usize {
        return Err(EcsError::KeySpaceExhausted);
    }
    types.push(type_id);
    Ok(types.len() as u8)
}
