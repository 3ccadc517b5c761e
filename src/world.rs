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

//! World: central entity and archetype storage
//!
//! The world owns every archetype and mediates all structural change.
//! While a lock is held the world is in deferred mode: structural
//! operations enqueue and apply FIFO when the last lock releases.

use std::cell::RefCell;
use std::sync::atomic::{AtomicUsize, Ordering};

use ahash::AHashMap;
use crossbeam::queue::SegQueue;
use parking_lot::Mutex;
use smallvec::SmallVec;

#[cfg(feature = "profiling")]
use tracing::info_span;

use crate::archetype::Archetype;
use crate::command::{DeferredOp, ErasedValue};
use crate::component::Component;
use crate::entity::{EntityMeta, EntityPool};
use crate::error::{EcsError, Result};
use crate::expression::TypeExpr;
use crate::identity::{Identity, IdentityKind};
use crate::query::{CachedMatches, Mask, QueryBuilder};
use crate::signature::Signature;
use crate::stream::{Stream, StreamTuple};

/// The empty-signature archetype is bootstrapped first and never moves
pub(crate) const EMPTY_ARCHETYPE: u32 = 0;

static WORLD_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Structural-mutation mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorldMode {
    /// Structural operations apply immediately
    Immediate,
    /// A lock is held; structural operations enqueue
    Deferred,
}

/// Central ECS world
pub struct World {
    /// Identity world byte for every entity spawned here
    index: u8,

    /// Slot metas and free list
    entities: EntityPool,

    /// All archetypes; index 0 is the empty archetype
    archetypes: Vec<Archetype>,

    /// Signature intern table
    archetype_index: AHashMap<Signature, u32>,

    /// Cache for archetype transitions: (source, expression, is_add)
    transitions: AHashMap<(u32, TypeExpr, bool), u32>,

    /// Relation key bits -> archetypes whose signatures carry that key
    relation_targets: AHashMap<u64, SmallVec<[u32; 4]>>,

    /// Mask -> matched archetypes, updated incrementally
    query_cache: RefCell<AHashMap<Mask, CachedMatches>>,

    /// Structural operations queued while locked
    deferred: SegQueue<DeferredOp>,

    /// Reentrant lock count; >0 means deferred mode
    lock_count: Mutex<u32>,
}

impl World {
    /// Create a new, empty world.
    ///
    /// World indices come from a process-global counter and wrap modulo 255;
    /// identities from two worlds that collide modulo 255 compare equal if
    /// slot and generation also coincide.
    pub fn new() -> Self {
        let index = (WORLD_COUNTER.fetch_add(1, Ordering::Relaxed) % 255) as u8;
        let mut world = Self {
            index,
            entities: EntityPool::new(index),

            // Start with reasonable defaults to avoid resize spikes
            archetypes: Vec::with_capacity(64),
            archetype_index: AHashMap::with_capacity(64),
            transitions: AHashMap::with_capacity(128),
            relation_targets: AHashMap::new(),
            query_cache: RefCell::new(AHashMap::with_capacity(32)),
            deferred: SegQueue::new(),
            lock_count: Mutex::new(0),
        };

        // Bootstrap the empty archetype (entities with no components).
        // It is always at index 0, which simplifies spawning.
        let id = world.get_or_create_archetype(&Signature::empty());
        debug_assert_eq!(id, EMPTY_ARCHETYPE);
        world
    }

    /// Identity world byte of this world
    pub fn index(&self) -> u8 {
        self.index
    }

    /// Current structural-mutation mode
    pub fn mode(&self) -> WorldMode {
        if *self.lock_count.lock() > 0 {
            WorldMode::Deferred
        } else {
            WorldMode::Immediate
        }
    }

    // ========== Entity lifecycle ==========

    /// Spawn a componentless entity into the empty archetype
    pub fn spawn(&mut self) -> Identity {
        let entity = self.entities.allocate();
        let row = self.archetypes[EMPTY_ARCHETYPE as usize].add_row(entity);
        self.entities.place(entity, EMPTY_ARCHETYPE, row as u32);
        entity
    }

    /// Spawn `count` entities in one batch
    pub fn spawn_n(&mut self, count: usize) -> Vec<Identity> {
        #[cfg(feature = "profiling")]
        let span = info_span!("world.spawn_n", count);
        #[cfg(feature = "profiling")]
        let _span_guard = span.enter();

        self.entities.reserve(count);
        let mut spawned = Vec::with_capacity(count);
        for _ in 0..count {
            spawned.push(self.spawn());
        }
        spawned
    }

    /// Check if an entity handle refers to a live entity in this world
    pub fn is_alive(&self, entity: Identity) -> bool {
        self.entities.meta(entity).is_some()
    }

    /// Despawn an entity immediately, dropping all its components.
    ///
    /// The slot recycles with an advanced generation; stale handles fail
    /// with `EntityNotAlive`. Relation components targeting the despawned
    /// entity are removed everywhere.
    pub fn despawn(&mut self, entity: Identity) -> Result<()> {
        let meta = *self.ensure_alive(entity)?;
        let archetype = &mut self.archetypes[meta.archetype as usize];
        if let Some(swapped) = archetype.remove_row(meta.row as usize)? {
            if let Some(m) = self.entities.meta_mut(swapped) {
                m.row = meta.row;
            }
        }
        self.entities.release(entity);
        self.scrub_relations(entity)?;
        Ok(())
    }

    // ========== Component access ==========

    /// Add a component under the given secondary key.
    ///
    /// Moves the entity to the archetype with the extended signature and
    /// backfills the new column. `key` is `Identity::NONE` for a plain
    /// component, a live entity for a relation, or a link/hash identity.
    pub fn add_component<T: Component>(
        &mut self,
        entity: Identity,
        key: Identity,
        value: T,
    ) -> Result<()> {
        let expr = TypeExpr::with_key::<T>(key)?;
        self.add_expr_with(entity, expr, |ptr| {
            // SAFETY: ptr is the uninitialized tail slot of the new column
            unsafe {
                std::ptr::write(ptr as *mut T, value);
            }
        })
    }

    /// Remove the component stored under the given key
    pub fn remove_component<T: Component>(&mut self, entity: Identity, key: Identity) -> Result<()> {
        let expr = TypeExpr::with_key::<T>(key)?;
        self.remove_expr(entity, expr)
    }

    /// Immutable reference to a component value
    pub fn get_component<T: Component>(&self, entity: Identity, key: Identity) -> Result<&T> {
        let expr = TypeExpr::with_key::<T>(key)?;
        let meta = self.ensure_alive(entity)?;
        let archetype = &self.archetypes[meta.archetype as usize];
        let column = archetype.column(expr).ok_or(EcsError::ComponentNotPresent)?;
        column.get::<T>(meta.row as usize)
    }

    /// Mutable reference to a component value.
    ///
    /// The reference is invalidated by any structural change to the entity;
    /// holding it across one is a contract violation.
    pub fn get_component_mut<T: Component>(
        &mut self,
        entity: Identity,
        key: Identity,
    ) -> Result<&mut T> {
        let expr = TypeExpr::with_key::<T>(key)?;
        let meta = *self.ensure_alive(entity)?;
        let archetype = &mut self.archetypes[meta.archetype as usize];
        let column = archetype
            .column_mut(expr)
            .ok_or(EcsError::ComponentNotPresent)?;
        column.get_mut::<T>(meta.row as usize)
    }

    /// Check for a component under the given key
    pub fn has_component<T: Component>(&self, entity: Identity, key: Identity) -> bool {
        match TypeExpr::with_key::<T>(key) {
            Ok(expr) => self
                .entities
                .meta(entity)
                .map(|meta| self.archetypes[meta.archetype as usize].signature().contains(expr))
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Every value of `T` on this entity whose key satisfies `match_key`
    /// (wildcards permitted), in signature order
    pub fn get_all<T: Component>(&self, entity: Identity, match_key: Identity) -> Result<Vec<&T>> {
        let expr = TypeExpr::matching::<T>(match_key);
        let meta = self.ensure_alive(entity)?;
        let archetype = &self.archetypes[meta.archetype as usize];
        archetype
            .match_columns(expr)
            .into_iter()
            .map(|idx| archetype.column_at(idx).get::<T>(meta.row as usize))
            .collect()
    }

    /// Signature of the archetype currently holding this entity
    pub fn signature_of(&self, entity: Identity) -> Result<&Signature> {
        let meta = self.ensure_alive(entity)?;
        Ok(self.archetypes[meta.archetype as usize].signature())
    }

    // ========== Queries ==========

    /// Fluent query builder over stream types `S`
    pub fn query<S: StreamTuple>(&mut self) -> QueryBuilder<'_, S> {
        QueryBuilder::new(self)
    }

    /// Stream over `S` with all-plain keys and no extra mask terms
    pub fn stream<S: StreamTuple>(&mut self) -> Stream<'_, S> {
        self.query::<S>().compile()
    }

    // ========== Deferral ==========

    /// Acquire the world lock, entering deferred mode.
    ///
    /// Locks are reentrant through nested iteration scopes. Dropping the
    /// last guard drains the deferred queue in FIFO order.
    pub fn lock(&mut self) -> WorldLock<'_> {
        self.begin_deferral();
        WorldLock { world: self }
    }

    pub(crate) fn begin_deferral(&self) {
        *self.lock_count.lock() += 1;
    }

    pub(crate) fn end_deferral(&mut self) {
        let drain = {
            let mut count = self.lock_count.lock();
            debug_assert!(*count > 0, "unbalanced world-lock release");
            *count -= 1;
            *count == 0
        };
        if drain {
            self.drain_deferred();
        }
    }

    pub(crate) fn deferred_ops(&self) -> Deferred<'_> {
        Deferred { world: self }
    }

    fn drain_deferred(&mut self) {
        #[cfg(feature = "profiling")]
        let span = info_span!("world.drain_deferred", queued = self.deferred.len());
        #[cfg(feature = "profiling")]
        let _span_guard = span.enter();

        // Ops invalidated by earlier entries (entity died, component state
        // changed) are dropped rather than surfaced; immediate-mode calls
        // still fail fast.
        while let Some(op) = self.deferred.pop() {
            match op {
                DeferredOp::Add {
                    entity,
                    expr,
                    value,
                } => {
                    let _ = self.add_erased(entity, expr, value);
                }
                DeferredOp::Remove { entity, expr } => {
                    let _ = self.remove_expr(entity, expr);
                }
                DeferredOp::Despawn { entity } => {
                    let _ = self.despawn(entity);
                }
                DeferredOp::Truncate { archetype, keep } => {
                    let _ = self.truncate_archetype(archetype, keep);
                }
            }
        }
    }

    // ========== Archetype management ==========

    /// Despawn entities off the tail of an archetype until at most `keep`
    /// rows remain
    pub fn truncate_archetype(&mut self, archetype: u32, keep: usize) -> Result<()> {
        loop {
            let Some(arch) = self.archetypes.get(archetype as usize) else {
                return Ok(());
            };
            if arch.len() <= keep {
                return Ok(());
            }
            let entity = *arch.entities().last().expect("non-empty archetype");
            self.despawn(entity)?;
        }
    }

    /// Get archetype by id
    pub fn archetype(&self, id: u32) -> Option<&Archetype> {
        self.archetypes.get(id as usize)
    }

    pub(crate) fn archetype_mut(&mut self, id: u32) -> Option<&mut Archetype> {
        self.archetypes.get_mut(id as usize)
    }

    /// All archetypes, empty archetype first
    pub fn archetypes(&self) -> &[Archetype] {
        &self.archetypes
    }

    pub fn archetype_count(&self) -> usize {
        self.archetypes.len()
    }

    /// Number of live entities
    pub fn entity_count(&self) -> usize {
        self.entities.alive_count()
    }

    /// Number of slots waiting on the free list
    pub fn recycled_entity_count(&self) -> usize {
        self.entities.recycled_count()
    }

    /// Matched archetype ids for a mask, through the incremental cache
    pub(crate) fn matched_archetypes(&self, mask: &Mask) -> Vec<u32> {
        let mut cache = self.query_cache.borrow_mut();
        if let Some(cached) = cache.get_mut(mask) {
            cached.update(&self.archetypes);
            return cached.matches.clone();
        }
        let cached = CachedMatches::new(mask.clone(), &self.archetypes);
        let matches = cached.matches.clone();
        cache.insert(mask.clone(), cached);
        matches
    }

    fn get_or_create_archetype(&mut self, signature: &Signature) -> u32 {
        if let Some(&id) = self.archetype_index.get(signature) {
            return id;
        }

        // Guard against signature explosion from runaway key cardinality
        if self.archetypes.len() >= 10_000 {
            panic!("Archetype limit exceeded (10,000) - runaway signature growth");
        }

        #[cfg(feature = "profiling")]
        let span = info_span!("world.create_archetype", total = self.archetypes.len());
        #[cfg(feature = "profiling")]
        let _span_guard = span.enter();

        let id = self.archetypes.len() as u32;
        for expr in signature.iter().filter(|e| e.is_relation()) {
            let entry = self.relation_targets.entry(expr.key_bits()).or_default();
            if !entry.contains(&id) {
                entry.push(id);
            }
        }
        self.archetypes.push(Archetype::new(signature.clone()));
        self.archetype_index.insert(signature.clone(), id);
        id
    }

    // ========== Internals ==========

    fn ensure_alive(&self, entity: Identity) -> Result<&EntityMeta> {
        if entity.kind() != IdentityKind::Entity {
            return Err(EcsError::InvalidIdentityKind);
        }
        self.entities.meta(entity).ok_or(EcsError::EntityNotAlive)
    }

    fn add_expr_with<W>(&mut self, entity: Identity, expr: TypeExpr, write: W) -> Result<()>
    where
        W: FnOnce(*mut u8),
    {
        debug_assert!(!expr.is_wildcard());
        let meta = *self.ensure_alive(entity)?;
        let source = meta.archetype;
        if self.archetypes[source as usize].signature().contains(expr) {
            return Err(EcsError::ComponentAlreadyPresent);
        }

        let destination = match self.transitions.get(&(source, expr, true)) {
            Some(&id) => id,
            None => {
                let signature = self.archetypes[source as usize].signature().add(expr);
                let id = self.get_or_create_archetype(&signature);
                self.transitions.insert((source, expr, true), id);
                id
            }
        };

        self.move_entity(entity, meta, destination, |archetype, _row| {
            let column = archetype.column_mut(expr).expect("destination column");
            write(column.push_uninit());
        })
    }

    pub(crate) fn add_erased(
        &mut self,
        entity: Identity,
        expr: TypeExpr,
        value: ErasedValue,
    ) -> Result<()> {
        debug_assert_eq!(value.component(), expr.component_id());
        self.add_expr_with(entity, expr, |ptr| {
            value.consume(|src| {
                let size = crate::component::component_info(expr.component_id()).size;
                if size > 0 {
                    // SAFETY: src is an initialized item, ptr an uninit slot
                    unsafe {
                        std::ptr::copy_nonoverlapping(src, ptr, size);
                    }
                }
            });
        })
    }

    fn remove_expr(&mut self, entity: Identity, expr: TypeExpr) -> Result<()> {
        let meta = *self.ensure_alive(entity)?;
        let source = meta.archetype;
        if !self.archetypes[source as usize].signature().contains(expr) {
            return Err(EcsError::ComponentNotPresent);
        }

        let destination = match self.transitions.get(&(source, expr, false)) {
            Some(&id) => id,
            None => {
                let signature = self.archetypes[source as usize].signature().remove(expr);
                let id = self.get_or_create_archetype(&signature);
                self.transitions.insert((source, expr, false), id);
                id
            }
        };

        self.move_entity(entity, meta, destination, |_, _| {})
    }

    /// Move an entity across archetypes: migrate shared columns, drop
    /// source-only columns, let `backfill` fill destination-only columns,
    /// then fix the swapped tail entity's meta.
    fn move_entity<F>(
        &mut self,
        entity: Identity,
        meta: EntityMeta,
        destination: u32,
        backfill: F,
    ) -> Result<()>
    where
        F: FnOnce(&mut Archetype, usize),
    {
        let source = meta.archetype;
        if source == destination {
            return Ok(());
        }
        let old_row = meta.row as usize;

        let (src, dst) = Self::two_archetypes(&mut self.archetypes, source, destination);
        let new_row = dst.add_row(entity);

        for dst_idx in 0..dst.column_count() {
            let expr = dst.column_at(dst_idx).expr();
            if let Some(src_idx) = src.column_position(expr) {
                src.column_at_mut(src_idx)
                    .migrate_row_to(dst.column_at_mut(dst_idx), old_row);
            }
        }

        backfill(dst, new_row);

        // Columns only in the source lose their value for this row
        for column in src.columns_mut() {
            if dst.column_position(column.expr()).is_none() {
                column.delete_swap(old_row)?;
            }
        }

        let swapped = src.swap_remove_identity(old_row);
        if let Some(swapped) = swapped {
            if let Some(m) = self.entities.meta_mut(swapped) {
                m.row = old_row as u32;
            }
        }
        self.entities.place(entity, destination, new_row as u32);
        Ok(())
    }

    fn two_archetypes(
        archetypes: &mut [Archetype],
        a: u32,
        b: u32,
    ) -> (&mut Archetype, &mut Archetype) {
        debug_assert_ne!(a, b);
        let (a, b) = (a as usize, b as usize);
        if a < b {
            let (left, right) = archetypes.split_at_mut(b);
            (&mut left[a], &mut right[0])
        } else {
            let (left, right) = archetypes.split_at_mut(a);
            (&mut right[0], &mut left[b])
        }
    }

    /// Strip every relation expression targeting a despawned entity. The
    /// affected entities migrate to the reduced archetype, dropping the
    /// relation columns; this keeps generation-less relation keys from
    /// aliasing across slot reuse.
    fn scrub_relations(&mut self, target: Identity) -> Result<()> {
        let key_bits = TypeExpr::relation_key_bits(target);
        // The index entry stays registered: the archetypes keep these
        // expressions in their signatures and may repopulate after the
        // slot recycles.
        let Some(archetype_ids) = self.relation_targets.get(&key_bits).cloned() else {
            return Ok(());
        };
        for archetype_id in archetype_ids {
            let signature = self.archetypes[archetype_id as usize].signature().clone();
            let stripped: Signature = signature
                .iter()
                .filter(|e| !(e.is_relation() && e.key_bits() == key_bits))
                .collect();
            if stripped == signature {
                continue;
            }
            let destination = self.get_or_create_archetype(&stripped);
            while let Some(&entity) = self.archetypes[archetype_id as usize].entities().first() {
                let meta = *self.entities.meta(entity).expect("meta coherence");
                self.move_entity(entity, meta, destination, |_, _| {})?;
            }
        }
        Ok(())
    }
}

impl Default for World {
    fn default() -> Self {
        Self::new()
    }
}

/// Scoped world lock: deferred mode while held, FIFO drain on last release
pub struct WorldLock<'w> {
    world: &'w mut World,
}

impl<'w> WorldLock<'w> {
    /// Handle for enqueuing structural operations
    pub fn ops(&self) -> Deferred<'_> {
        self.world.deferred_ops()
    }
}

impl std::ops::Deref for WorldLock<'_> {
    type Target = World;

    fn deref(&self) -> &World {
        self.world
    }
}

impl Drop for WorldLock<'_> {
    fn drop(&mut self) {
        self.world.end_deferral();
    }
}

/// Enqueue-only view of a locked world.
///
/// Every operation validates against current state, enqueues and reports
/// success; ops invalidated by earlier queue entries are dropped when the
/// queue drains.
#[derive(Clone, Copy)]
pub struct Deferred<'w> {
    world: &'w World,
}

impl<'w> Deferred<'w> {
    /// Read access to the locked world
    pub fn world(&self) -> &'w World {
        self.world
    }

    pub fn is_alive(&self, entity: Identity) -> bool {
        self.world.is_alive(entity)
    }

    /// Queue a despawn
    pub fn despawn(&self, entity: Identity) -> Result<()> {
        self.world.ensure_alive(entity)?;
        self.world.deferred.push(DeferredOp::Despawn { entity });
        Ok(())
    }

    /// Queue a component insertion
    pub fn add_component<T: Component>(
        &self,
        entity: Identity,
        key: Identity,
        value: T,
    ) -> Result<()> {
        let expr = TypeExpr::with_key::<T>(key)?;
        self.world.ensure_alive(entity)?;
        self.world.deferred.push(DeferredOp::Add {
            entity,
            expr,
            value: ErasedValue::new(value),
        });
        Ok(())
    }

    /// Queue a component removal
    pub fn remove_component<T: Component>(&self, entity: Identity, key: Identity) -> Result<()> {
        let expr = TypeExpr::with_key::<T>(key)?;
        self.world.ensure_alive(entity)?;
        self.world.deferred.push(DeferredOp::Remove { entity, expr });
        Ok(())
    }

    /// Queue an archetype truncation
    pub fn truncate(&self, archetype: u32, keep: usize) {
        self.world
            .deferred
            .push(DeferredOp::Truncate { archetype, keep });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq)]
    struct Position {
        x: f32,
        y: f32,
    }

    #[derive(Debug, Clone, Copy, PartialEq)]
    struct Hp(i32);

    #[test]
    fn test_spawn_despawn() -> Result<()> {
        let mut world = World::new();

        let entity = world.spawn();
        assert!(world.is_alive(entity));
        assert_eq!(world.entity_count(), 1);

        world.despawn(entity)?;
        assert!(!world.is_alive(entity));
        assert_eq!(world.entity_count(), 0);
        assert_eq!(world.recycled_entity_count(), 1);

        assert_eq!(world.despawn(entity).unwrap_err(), EcsError::EntityNotAlive);
        Ok(())
    }

    #[test]
    fn test_generation_recycling() -> Result<()> {
        let mut world = World::new();
        let e1 = world.spawn();
        world.despawn(e1)?;
        let e2 = world.spawn();

        assert_eq!(e2.index(), e1.index());
        assert_eq!(e2.generation(), e1.generation() + 1);
        assert_ne!(e1, e2);
        assert!(!world.is_alive(e1));
        assert!(world.is_alive(e2));
        Ok(())
    }

    #[test]
    fn test_add_and_get_component() -> Result<()> {
        let mut world = World::new();
        let e = world.spawn();

        world.add_component(e, Identity::NONE, Position { x: 1.0, y: 2.0 })?;
        assert!(world.has_component::<Position>(e, Identity::NONE));
        assert_eq!(
            *world.get_component::<Position>(e, Identity::NONE)?,
            Position { x: 1.0, y: 2.0 }
        );

        world.get_component_mut::<Position>(e, Identity::NONE)?.x = 5.0;
        assert_eq!(world.get_component::<Position>(e, Identity::NONE)?.x, 5.0);

        assert_eq!(
            world
                .add_component(e, Identity::NONE, Position { x: 0.0, y: 0.0 })
                .unwrap_err(),
            EcsError::ComponentAlreadyPresent
        );
        Ok(())
    }

    #[test]
    fn test_add_then_remove_restores_signature() -> Result<()> {
        let mut world = World::new();
        let e = world.spawn();
        world.add_component(e, Identity::NONE, Position { x: 0.0, y: 0.0 })?;
        let before = world.signature_of(e)?.clone();

        world.add_component(e, Identity::NONE, Hp(10))?;
        world.remove_component::<Hp>(e, Identity::NONE)?;

        assert_eq!(world.signature_of(e)?, &before);
        assert!(!world.has_component::<Hp>(e, Identity::NONE));
        assert_eq!(
            world
                .remove_component::<Hp>(e, Identity::NONE)
                .unwrap_err(),
            EcsError::ComponentNotPresent
        );
        Ok(())
    }

    #[test]
    fn test_signature_uniqueness() -> Result<()> {
        let mut world = World::new();
        for _ in 0..8 {
            let e = world.spawn();
            world.add_component(e, Identity::NONE, Hp(1))?;
        }

        // All eight entities share one archetype; no signature occurs twice
        for (i, a) in world.archetypes().iter().enumerate() {
            for b in world.archetypes().iter().skip(i + 1) {
                assert_ne!(a.signature(), b.signature());
            }
        }
        Ok(())
    }

    #[test]
    fn test_meta_coherence_after_migration() -> Result<()> {
        let mut world = World::new();
        let entities = world.spawn_n(16);
        for (i, &e) in entities.iter().enumerate() {
            world.add_component(e, Identity::NONE, Hp(i as i32))?;
        }
        // Migrating a middle entity swaps tails around in both archetypes
        world.add_component(entities[3], Identity::NONE, Position { x: 0.0, y: 0.0 })?;
        world.despawn(entities[7])?;

        for (arch_id, arch) in world.archetypes().iter().enumerate() {
            for (row, id) in arch.entities().iter().enumerate() {
                let meta = world.entities.meta(*id).expect("identity column coherent");
                assert_eq!(meta.archetype as usize, arch_id);
                assert_eq!(meta.row as usize, row);
            }
        }
        for &e in &entities {
            if world.is_alive(e) {
                let expected = entities.iter().position(|x| *x == e).unwrap() as i32;
                assert_eq!(*world.get_component::<Hp>(e, Identity::NONE)?, Hp(expected));
            }
        }
        Ok(())
    }

    #[test]
    fn test_relations_and_get_all() -> Result<()> {
        let mut world = World::new();
        let a = world.spawn();
        let b = world.spawn();
        let e = world.spawn();

        world.add_component(e, a, 1u32)?;
        world.add_component(e, b, 2u32)?;
        world.add_component(e, Identity::NONE, 3u32)?;

        let targeted = world.get_all::<u32>(e, Identity::ANY_TARGET)?;
        assert_eq!(targeted.len(), 2);
        let all = world.get_all::<u32>(e, Identity::ANY)?;
        assert_eq!(all.len(), 3);
        let plain = world.get_all::<u32>(e, Identity::NONE)?;
        assert_eq!(plain, vec![&3u32]);
        Ok(())
    }

    #[test]
    fn test_relation_scrubbed_on_target_despawn() -> Result<()> {
        let mut world = World::new();
        let target = world.spawn();
        let e = world.spawn();
        world.add_component::<i8>(e, target, 1)?;
        world.add_component::<i8>(e, Identity::NONE, 2)?;
        assert!(world.has_component::<i8>(e, target));

        world.despawn(target)?;

        assert!(world.is_alive(e));
        assert!(!world.has_component::<i8>(e, target));
        // Plain component survives
        assert_eq!(*world.get_component::<i8>(e, Identity::NONE)?, 2);

        // A recycled slot does not inherit the old relation
        let recycled = world.spawn();
        assert_eq!(recycled.index(), target.index());
        assert!(!world.has_component::<i8>(e, recycled));
        Ok(())
    }

    #[test]
    fn test_column_coherence_everywhere() -> Result<()> {
        let mut world = World::new();
        let entities = world.spawn_n(32);
        for (i, &e) in entities.iter().enumerate() {
            world.add_component(e, Identity::NONE, Hp(i as i32))?;
            if i % 3 == 0 {
                world.add_component(e, Identity::NONE, Position { x: 0.0, y: 0.0 })?;
            }
            if i % 5 == 0 {
                world.despawn(e)?;
            }
        }
        for arch in world.archetypes() {
            for idx in 0..arch.column_count() {
                assert_eq!(arch.column_at(idx).len(), arch.len());
            }
        }
        Ok(())
    }

    #[test]
    fn test_wildcard_keys_are_rejected_for_storage() {
        let mut world = World::new();
        let e = world.spawn();
        assert_eq!(
            world.add_component(e, Identity::ANY, Hp(1)).unwrap_err(),
            EcsError::InvalidKeyExpression
        );
    }

    #[test]
    fn test_lock_defers_and_drains_fifo() -> Result<()> {
        let mut world = World::new();
        let e = world.spawn();

        {
            let lock = world.lock();
            assert_eq!(lock.mode(), WorldMode::Deferred);
            let ops = lock.ops();
            ops.add_component(e, Identity::NONE, Hp(1))?;
            // Applied strictly after the add above
            ops.remove_component::<Hp>(e, Identity::NONE)?;
            ops.add_component(e, Identity::NONE, Hp(7))?;
            assert!(!lock.has_component::<Hp>(e, Identity::NONE));
        }

        assert_eq!(world.mode(), WorldMode::Immediate);
        assert_eq!(*world.get_component::<Hp>(e, Identity::NONE)?, Hp(7));
        Ok(())
    }

    #[test]
    fn test_reentrant_lock_drains_once() -> Result<()> {
        let mut world = World::new();
        let e = world.spawn();

        world.begin_deferral();
        world.begin_deferral();
        world.deferred_ops().despawn(e)?;

        // Inner release: still locked, nothing drains
        world.end_deferral();
        assert!(world.is_alive(e));
        assert_eq!(world.mode(), WorldMode::Deferred);

        // Outer release drains the queue
        world.end_deferral();
        assert!(!world.is_alive(e));
        assert_eq!(world.mode(), WorldMode::Immediate);
        Ok(())
    }

    #[test]
    fn test_truncate_archetype() -> Result<()> {
        let mut world = World::new();
        let entities = world.spawn_n(10);
        for &e in &entities {
            world.add_component(e, Identity::NONE, Hp(0))?;
        }
        let arch_id = world
            .archetypes()
            .iter()
            .position(|a| a.len() == 10)
            .unwrap() as u32;

        world.truncate_archetype(arch_id, 4)?;
        assert_eq!(world.archetype(arch_id).unwrap().len(), 4);
        assert_eq!(world.entity_count(), 4);
        Ok(())
    }

    #[test]
    fn test_version_monotonicity() -> Result<()> {
        let mut world = World::new();
        let e = world.spawn();
        world.add_component(e, Identity::NONE, Hp(0))?;

        let arch_id = world.entities.meta(e).unwrap().archetype;
        let v0 = world.archetype(arch_id).unwrap().version();
        world.add_component(e, Identity::NONE, Position { x: 0.0, y: 0.0 })?;
        let v1 = world.archetype(arch_id).unwrap().version();
        assert!(v1 > v0);
        Ok(())
    }
}
