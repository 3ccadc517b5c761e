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

//! Entity slot pool and location metadata
//!
//! Slots are recycled through a free list. A despawned slot immediately
//! stores its successor identity (generation advanced), so stale handles
//! fail the identity comparison and new spawns reuse the slot cheaply.

use crate::identity::Identity;

/// Sentinel for meta fields of slots not currently placed in an archetype
pub(crate) const INVALID_LOCATION: u32 = u32::MAX;

/// Entity location in archetype (archetype id, row) plus current identity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityMeta {
    pub identity: Identity,
    pub archetype: u32,
    pub row: u32,
}

/// Slot allocator for one world
pub(crate) struct EntityPool {
    world: u8,
    metas: Vec<EntityMeta>,
    free: Vec<u32>,
}

impl EntityPool {
    pub fn new(world: u8) -> EntityPool {
        EntityPool {
            world,
            metas: Vec::new(),
            free: Vec::new(),
        }
    }

    /// Allocate an identity; location is invalid until the caller places
    /// the entity in an archetype.
    pub fn allocate(&mut self) -> Identity {
        if let Some(slot) = self.free.pop() {
            // Generation was advanced at release time
            self.metas[slot as usize].identity
        } else {
            let slot = self.metas.len() as u32;
            let identity = Identity::entity(self.world, slot, 1);
            self.metas.push(EntityMeta {
                identity,
                archetype: INVALID_LOCATION,
                row: INVALID_LOCATION,
            });
            identity
        }
    }

    pub fn reserve(&mut self, additional: usize) {
        let fresh = additional.saturating_sub(self.free.len());
        self.metas.reserve(fresh);
    }

    /// Recycle a slot; the stored identity advances to its successor
    pub fn release(&mut self, identity: Identity) {
        let slot = identity.index() as usize;
        let meta = &mut self.metas[slot];
        debug_assert_eq!(meta.identity, identity);
        // Entities always have a successor
        meta.identity = identity.successor().expect("entity identity");
        meta.archetype = INVALID_LOCATION;
        meta.row = INVALID_LOCATION;
        self.free.push(slot as u32);
    }

    /// Meta for a live entity with this exact identity
    pub fn meta(&self, identity: Identity) -> Option<&EntityMeta> {
        if !identity.is_entity() || identity.world() != self.world {
            return None;
        }
        let meta = self.metas.get(identity.index() as usize)?;
        (meta.identity == identity && meta.archetype != INVALID_LOCATION).then_some(meta)
    }

    pub fn meta_mut(&mut self, identity: Identity) -> Option<&mut EntityMeta> {
        if !identity.is_entity() || identity.world() != self.world {
            return None;
        }
        let meta = self.metas.get_mut(identity.index() as usize)?;
        (meta.identity == identity && meta.archetype != INVALID_LOCATION).then_some(meta)
    }

    /// Set the location of a just-allocated or migrated entity
    pub fn place(&mut self, identity: Identity, archetype: u32, row: u32) {
        let meta = &mut self.metas[identity.index() as usize];
        debug_assert_eq!(meta.identity, identity);
        meta.archetype = archetype;
        meta.row = row;
    }

    /// Number of live entities
    pub fn alive_count(&self) -> usize {
        self.metas.len() - self.free.len()
    }

    /// Number of slots waiting on the free list
    pub fn recycled_count(&self) -> usize {
        self.free.len()
    }
}
