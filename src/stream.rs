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

//! Typed streams: per-row iteration over the archetypes matched by a query
//!
//! A stream views a compiled query through 1..=5 ordered component types.
//! For every matched archetype, each stream slot selects the columns whose
//! expressions satisfy that slot's match key; iteration walks the Cartesian
//! product of the selections (slot 0 outermost), then the rows of each
//! combination. Combinations that would alias one column through two `&mut`
//! slots are skipped; slots with distinct component types never collide.
//!
//! Iteration runs inside a world-lock scope: structural changes requested
//! through the `Deferred` handle enqueue and apply when the scope ends.

use std::marker::PhantomData;

use smallvec::SmallVec;

#[cfg(feature = "profiling")]
use tracing::info_span;

use crate::archetype::{Archetype, Join};
use crate::component::Component;
use crate::error::EcsError;
use crate::expression::TypeExpr;
use crate::identity::Identity;
use crate::query::Mask;
use crate::world::{Deferred, World};

/// Largest supported stream arity
pub const MAX_STREAM_TYPES: usize = 5;

/// Tuple of component types viewed by a stream, arities 1..=5
pub trait StreamTuple: 'static {
    const ARITY: usize;

    /// Match expression per slot for the given per-slot keys
    fn matching_exprs(keys: &[Identity]) -> SmallVec<[TypeExpr; MAX_STREAM_TYPES]>;
}

/// Typed view over a compiled query
pub struct Stream<'w, S: StreamTuple> {
    world: &'w mut World,
    exprs: SmallVec<[TypeExpr; MAX_STREAM_TYPES]>,
    mask: Mask,
    _phantom: PhantomData<S>,
}

impl<'w, S: StreamTuple> Stream<'w, S> {
    pub(crate) fn new(
        world: &'w mut World,
        exprs: SmallVec<[TypeExpr; MAX_STREAM_TYPES]>,
        mask: Mask,
    ) -> Self {
        Self {
            world,
            exprs,
            mask,
            _phantom: PhantomData,
        }
    }

    /// Structural predicate this stream iterates
    pub fn mask(&self) -> &Mask {
        &self.mask
    }

    /// Number of tuples a full iteration visits
    pub fn count(&self) -> usize {
        let matched = self.world.matched_archetypes(&self.mask);
        let mut total = 0;
        for arch_id in matched {
            let Some(arch) = self.world.archetype(arch_id) else {
                continue;
            };
            if arch.is_empty() {
                continue;
            }
            let mut join = arch.cross_join(&self.exprs);
            while !join.is_done() {
                if !join.has_duplicates() {
                    total += arch.len();
                }
                if !join.advance() {
                    break;
                }
            }
        }
        total
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Overwrite every column of `T` matching `key` with copies of `value`
    /// across all matched archetypes
    pub fn blit<T: Component + Clone>(&mut self, value: T, key: Identity) {
        let expr = TypeExpr::matching::<T>(key);
        let matched = self.world.matched_archetypes(&self.mask);
        for arch_id in matched {
            let Some(arch) = self.world.archetype_mut(arch_id) else {
                continue;
            };
            let columns = arch.match_columns(expr);
            for idx in columns {
                arch.column_at_mut(idx).blit(value.clone());
            }
        }
    }
}

/// Per-step iterator over stream tuples
///
/// Holds a world lock for its whole lifetime; each step re-checks the
/// current archetype's version and panics on a structural change, which is
/// unreachable without raw access while the lock is held.
pub struct StreamIter<'a, S: StreamTuple> {
    world: *mut World,
    exprs: SmallVec<[TypeExpr; MAX_STREAM_TYPES]>,
    matched: Vec<u32>,
    cursor: usize,
    arch: *mut Archetype,
    join: Option<Join>,
    row: usize,
    len: usize,
    ids: *const Identity,
    cols: SmallVec<[*mut u8; MAX_STREAM_TYPES]>,
    version: u32,
    _phantom: PhantomData<&'a mut S>,
}

impl<S: StreamTuple> StreamIter<'_, S> {
    /// Position on a valid (archetype, combination, row); false when the
    /// iteration is exhausted.
    fn ensure_position(&mut self) -> bool {
        loop {
            if let Some(join) = self.join.as_ref() {
                if !join.is_done() && self.row < self.len {
                    return true;
                }
            }

            // Current combination exhausted: advance within the archetype
            if let Some(join) = self.join.as_mut() {
                let mut advanced = join.advance();
                while advanced && join.has_duplicates() {
                    advanced = join.advance();
                }
                if advanced {
                    self.row = 0;
                    self.load_columns();
                    continue;
                }
                self.join = None;
            }

            // Next matched archetype
            if self.cursor >= self.matched.len() {
                return false;
            }
            let arch_id = self.matched[self.cursor];
            self.cursor += 1;
            // SAFETY: world outlives the iterator; the lock keeps archetype
            // storage stable while we hold raw pointers into it
            let Some(arch) = (unsafe { (*self.world).archetype_mut(arch_id) }) else {
                continue;
            };
            if arch.is_empty() {
                continue;
            }
            let mut join = arch.cross_join(&self.exprs);
            while !join.is_done() && join.has_duplicates() {
                if !join.advance() {
                    break;
                }
            }
            if join.is_done() {
                continue;
            }
            self.version = arch.version();
            self.len = arch.len();
            self.ids = arch.entities().as_ptr();
            self.arch = arch as *mut Archetype;
            self.join = Some(join);
            self.row = 0;
            self.load_columns();
        }
    }

    fn load_columns(&mut self) {
        let join = self.join.as_ref().expect("active join");
        // SAFETY: arch set together with join and kept alive by the lock
        let arch = unsafe { &mut *self.arch };
        self.cols.clear();
        for slot in 0..join.arity() {
            self.cols.push(arch.column_at_mut(join.get(slot)).base_ptr());
        }
    }

    fn check_version(&self) {
        // SAFETY: arch is valid while positioned on it
        let arch = unsafe { &*self.arch };
        if arch.version() != self.version {
            panic!("{}", EcsError::StructurallyModifiedDuringIteration);
        }
    }
}

impl<S: StreamTuple> Drop for StreamIter<'_, S> {
    fn drop(&mut self) {
        // SAFETY: the iterator was created from an exclusive world borrow
        unsafe {
            (*self.world).end_deferral();
        }
    }
}

macro_rules! impl_stream_arity {
    ($arity:expr; $(($T:ident, $addr:ident, $ptr:ident, $idx:tt)),+) => {
        impl<$($T: Component),+> StreamTuple for ($($T,)+) {
            const ARITY: usize = $arity;

            fn matching_exprs(keys: &[Identity]) -> SmallVec<[TypeExpr; MAX_STREAM_TYPES]> {
                debug_assert_eq!(keys.len(), $arity);
                let mut exprs = SmallVec::new();
                $(exprs.push(TypeExpr::matching::<$T>(keys[$idx]));)+
                exprs
            }
        }

        impl<'w, $($T: Component),+> Stream<'w, ($($T,)+)> {
            /// Sequential iteration over `(entity, components...)`
            pub fn for_each<F>(&mut self, mut f: F)
            where
                F: FnMut(Identity, $(&mut $T),+),
            {
                self.run(|_, id, $($ptr),+| f(id, $($ptr),+));
            }

            /// Sequential iteration threading a uniform value through every
            /// call; the uniform is handed back afterwards
            pub fn for_each_uniform<U, F>(&mut self, mut uniform: U, mut f: F) -> U
            where
                F: FnMut(&mut U, Identity, $(&mut $T),+),
            {
                self.run(|_, id, $($ptr),+| f(&mut uniform, id, $($ptr),+));
                uniform
            }

            /// Sequential iteration with a handle for structural changes.
            ///
            /// Operations enqueued through the handle apply in FIFO order
            /// when the iteration scope ends.
            pub fn for_each_deferred<F>(&mut self, f: F)
            where
                F: FnMut(Deferred<'_>, Identity, $(&mut $T),+),
            {
                self.run(f);
            }

            fn run<F>(&mut self, mut f: F)
            where
                F: FnMut(Deferred<'_>, Identity, $(&mut $T),+),
            {
                let world: *mut World = self.world;
                // SAFETY: &mut self guarantees exclusive world access; raw
                // pointers confine the borrows to disjoint columns per call
                unsafe { (*world).begin_deferral() };
                let matched = unsafe { (*world).matched_archetypes(&self.mask) };

                #[cfg(feature = "profiling")]
                let span = info_span!("stream.for_each", archetypes = matched.len());
                #[cfg(feature = "profiling")]
                let _span_guard = span.enter();

                let ops = unsafe { (*world).deferred_ops() };
                for arch_id in matched {
                    let Some(arch) = (unsafe { (*world).archetype_mut(arch_id) }) else {
                        continue;
                    };
                    if arch.is_empty() {
                        continue;
                    }
                    let len = arch.len();
                    let ids = arch.entities().as_ptr();
                    let mut join = arch.cross_join(&self.exprs);
                    while !join.is_done() {
                        if !join.has_duplicates() {
                            $(let $ptr = arch.column_at_mut(join.get($idx)).base_ptr() as *mut $T;)+
                            for row in 0..len {
                                // SAFETY: row < len; columns are pairwise
                                // distinct, so the &mut views are disjoint
                                unsafe { f(ops, *ids.add(row), $(&mut *$ptr.add(row)),+) };
                            }
                        }
                        if !join.advance() {
                            break;
                        }
                    }
                }
                unsafe { (*world).end_deferral() };
            }

            /// Per-archetype, per-combination slice access
            pub fn raw<F>(&mut self, mut f: F)
            where
                F: FnMut(&[Identity], $(&mut [$T]),+),
            {
                self.raw_uniform((), |_, ids, $($ptr),+| f(ids, $($ptr),+));
            }

            /// Slice access threading a uniform value through every call
            pub fn raw_uniform<U, F>(&mut self, mut uniform: U, mut f: F) -> U
            where
                F: FnMut(&mut U, &[Identity], $(&mut [$T]),+),
            {
                let world: *mut World = self.world;
                // SAFETY: as in run(); slices of distinct columns are disjoint
                unsafe { (*world).begin_deferral() };
                let matched = unsafe { (*world).matched_archetypes(&self.mask) };
                for arch_id in matched {
                    let Some(arch) = (unsafe { (*world).archetype_mut(arch_id) }) else {
                        continue;
                    };
                    if arch.is_empty() {
                        continue;
                    }
                    let len = arch.len();
                    let ids = arch.entities().as_ptr();
                    let mut join = arch.cross_join(&self.exprs);
                    while !join.is_done() {
                        if !join.has_duplicates() {
                            $(let $ptr = arch.column_at_mut(join.get($idx)).base_ptr() as *mut $T;)+
                            // SAFETY: len rows initialized in every column
                            let id_slice = unsafe { std::slice::from_raw_parts(ids, len) };
                            $(let $addr = unsafe { std::slice::from_raw_parts_mut($ptr, len) };)+
                            f(&mut uniform, id_slice, $($addr),+);
                        }
                        if !join.advance() {
                            break;
                        }
                    }
                }
                unsafe { (*world).end_deferral() };
                uniform
            }

            /// Iterator form; tuples of `(entity, &mut components...)`
            pub fn iter(&mut self) -> StreamIter<'_, ($($T,)+)> {
                let world: *mut World = self.world;
                // SAFETY: lock released in StreamIter::drop
                unsafe { (*world).begin_deferral() };
                let matched = unsafe { (*world).matched_archetypes(&self.mask) };
                StreamIter {
                    world,
                    exprs: self.exprs.clone(),
                    matched,
                    cursor: 0,
                    arch: std::ptr::null_mut(),
                    join: None,
                    row: 0,
                    len: 0,
                    ids: std::ptr::null(),
                    cols: SmallVec::new(),
                    version: 0,
                    _phantom: PhantomData,
                }
            }

            /// Fan row chunks of every combination out to the rayon pool.
            ///
            /// `chunk_size` defaults to rows divided by the pool's thread
            /// count, floor 1. The call returns once every chunk finished;
            /// worker panics propagate to the caller.
            #[cfg(feature = "parallel")]
            pub fn parallel<F>(&mut self, f: F, chunk_size: Option<usize>)
            where
                F: Fn(Identity, $(&mut $T),+) + Send + Sync,
            {
                self.parallel_uniform((), move |_, id, $($ptr),+| f(id, $($ptr),+), chunk_size);
            }

            /// Parallel fan-out with a shared uniform parameter
            #[cfg(feature = "parallel")]
            pub fn parallel_uniform<U, F>(&mut self, uniform: U, f: F, chunk_size: Option<usize>) -> U
            where
                U: Sync,
                F: Fn(&U, Identity, $(&mut $T),+) + Send + Sync,
            {
                let world: *mut World = self.world;
                // SAFETY: exclusive world access for the whole fan-out; the
                // lock keeps the structural snapshot stable
                unsafe { (*world).begin_deferral() };
                let matched = unsafe { (*world).matched_archetypes(&self.mask) };

                #[cfg(feature = "profiling")]
                let span = info_span!("stream.parallel", archetypes = matched.len());
                #[cfg(feature = "profiling")]
                let _span_guard = span.enter();

                let shared = &uniform;
                let func = &f;
                for arch_id in matched {
                    let Some(arch) = (unsafe { (*world).archetype_mut(arch_id) }) else {
                        continue;
                    };
                    if arch.is_empty() {
                        continue;
                    }
                    let len = arch.len();
                    let chunk = chunk_size
                        .unwrap_or(len / rayon::current_num_threads())
                        .max(1);
                    // Pointers cross the job boundary as plain words
                    let ids_addr = arch.entities().as_ptr() as usize;
                    let mut join = arch.cross_join(&self.exprs);
                    while !join.is_done() {
                        if !join.has_duplicates() {
                            $(let $addr = arch.column_at_mut(join.get($idx)).base_ptr() as usize;)+
                            rayon::scope(|scope| {
                                let mut start = 0;
                                while start < len {
                                    let end = (start + chunk).min(len);
                                    scope.spawn(move |_| {
                                        let ids = ids_addr as *const Identity;
                                        $(let $ptr = $addr as *mut $T;)+
                                        for row in start..end {
                                            // SAFETY: jobs cover disjoint row
                                            // ranges of the same columns; no
                                            // row is visited by two jobs
                                            unsafe {
                                                func(
                                                    shared,
                                                    *ids.add(row),
                                                    $(&mut *$ptr.add(row)),+
                                                )
                                            };
                                        }
                                    });
                                    start = end;
                                }
                            });
                        }
                        if !join.advance() {
                            break;
                        }
                    }
                }
                unsafe { (*world).end_deferral() };
                uniform
            }
        }

        impl<'a, $($T: Component),+> Iterator for StreamIter<'a, ($($T,)+)> {
            type Item = (Identity, $(&'a mut $T),+);

            fn next(&mut self) -> Option<Self::Item> {
                if !self.ensure_position() {
                    return None;
                }
                self.check_version();
                let row = self.row;
                self.row += 1;
                // SAFETY: position validated; distinct columns per slot
                unsafe {
                    Some((
                        *self.ids.add(row),
                        $(&mut *(self.cols[$idx] as *mut $T).add(row)),+
                    ))
                }
            }
        }
    };
}

impl_stream_arity!(1; (C0, a0, p0, 0));
impl_stream_arity!(2; (C0, a0, p0, 0), (C1, a1, p1, 1));
impl_stream_arity!(3; (C0, a0, p0, 0), (C1, a1, p1, 1), (C2, a2, p2, 2));
impl_stream_arity!(4; (C0, a0, p0, 0), (C1, a1, p1, 1), (C2, a2, p2, 2), (C3, a3, p3, 3));
impl_stream_arity!(5; (C0, a0, p0, 0), (C1, a1, p1, 1), (C2, a2, p2, 2), (C3, a3, p3, 3), (C4, a4, p4, 4));

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;

    #[derive(Debug, Clone, Copy, PartialEq)]
    struct Position {
        x: f32,
        y: f32,
    }

    #[derive(Debug, Clone, Copy, PartialEq)]
    struct Velocity {
        x: f32,
        y: f32,
    }

    struct Likes(u32);

    #[test]
    fn test_for_each_visits_matching_entities() -> Result<()> {
        let mut world = World::new();
        for i in 0..4 {
            let e = world.spawn();
            world.add_component(e, Identity::NONE, Position { x: i as f32, y: 0.0 })?;
            if i % 2 == 0 {
                world.add_component(e, Identity::NONE, Velocity { x: 1.0, y: 2.0 })?;
            }
        }

        let mut seen = 0;
        world.stream::<(Position,)>().for_each(|_, pos| {
            pos.y += 1.0;
            seen += 1;
        });
        assert_eq!(seen, 4);

        let mut moved = 0;
        world.stream::<(Position, Velocity)>().for_each(|_, pos, vel| {
            pos.x += vel.x;
            moved += 1;
        });
        assert_eq!(moved, 2);
        Ok(())
    }

    #[test]
    fn test_uniform_threads_state() -> Result<()> {
        let mut world = World::new();
        for i in 0..10i64 {
            let e = world.spawn();
            world.add_component(e, Identity::NONE, i)?;
        }
        let sum = world
            .stream::<(i64,)>()
            .for_each_uniform(0i64, |acc, _, v| *acc += *v);
        assert_eq!(sum, 45);
        Ok(())
    }

    #[test]
    fn test_wildcard_cross_join_counts() -> Result<()> {
        let mut world = World::new();
        let a = world.spawn();
        let b = world.spawn();
        let x = world.spawn();
        world.add_component(x, a, Likes(1))?;
        world.add_component(x, b, Likes(2))?;
        world.add_component(x, Identity::NONE, Likes(4))?;

        let mut targeted = 0u32;
        world
            .query::<(Likes,)>()
            .matching(0, Identity::ANY_TARGET)
            .compile()
            .for_each(|_, likes| targeted += likes.0);
        assert_eq!(targeted, 3); // plain slot excluded

        let mut all = 0u32;
        world
            .query::<(Likes,)>()
            .matching(0, Identity::ANY)
            .compile()
            .for_each(|_, likes| all += likes.0);
        assert_eq!(all, 7);
        Ok(())
    }

    #[test]
    fn test_count_is_product_of_matches_and_rows() -> Result<()> {
        let mut world = World::new();
        let t1 = world.spawn();
        let t2 = world.spawn();
        for _ in 0..3 {
            let e = world.spawn();
            world.add_component(e, t1, Likes(0))?;
            world.add_component(e, t2, Likes(0))?;
            world.add_component(e, Identity::NONE, Position { x: 0.0, y: 0.0 })?;
        }

        // 2 matching Likes columns x 1 Position column x 3 rows
        let stream = world
            .query::<(Likes, Position)>()
            .matching(0, Identity::ANY_TARGET)
            .compile();
        assert_eq!(stream.count(), 6);
        Ok(())
    }

    #[test]
    fn test_iter_yields_tuples() -> Result<()> {
        let mut world = World::new();
        for i in 0..5u8 {
            let e = world.spawn();
            world.add_component(e, Identity::NONE, i)?;
        }
        let mut stream = world.stream::<(u8,)>();
        let mut values: Vec<u8> = stream.iter().map(|(_, v)| *v).collect();
        values.sort_unstable();
        assert_eq!(values, vec![0, 1, 2, 3, 4]);
        Ok(())
    }

    #[test]
    fn test_raw_slices() -> Result<()> {
        let mut world = World::new();
        for i in 0..6u16 {
            let e = world.spawn();
            world.add_component(e, Identity::NONE, i)?;
        }
        let mut total_rows = 0;
        world.stream::<(u16,)>().raw(|ids, values| {
            assert_eq!(ids.len(), values.len());
            total_rows += values.len();
            for v in values.iter_mut() {
                *v *= 2;
            }
        });
        assert_eq!(total_rows, 6);

        let doubled = world
            .stream::<(u16,)>()
            .for_each_uniform(0u32, |acc, _, v| *acc += *v as u32);
        assert_eq!(doubled, 2 * (0 + 1 + 2 + 3 + 4 + 5));
        Ok(())
    }

    #[test]
    fn test_blit_overwrites_matched_columns() -> Result<()> {
        let mut world = World::new();
        for _ in 0..4 {
            let e = world.spawn();
            world.add_component(e, Identity::NONE, 1u64)?;
        }
        world.stream::<(u64,)>().blit(9u64, Identity::NONE);
        let sum = world
            .stream::<(u64,)>()
            .for_each_uniform(0u64, |acc, _, v| *acc += *v);
        assert_eq!(sum, 36);
        Ok(())
    }

    #[test]
    fn test_deferred_despawn_during_iteration() -> Result<()> {
        let mut world = World::new();
        for i in 0..8i32 {
            let e = world.spawn();
            world.add_component(e, Identity::NONE, i)?;
        }

        world.stream::<(i32,)>().for_each_deferred(|ops, entity, v| {
            if *v % 2 == 0 {
                ops.despawn(entity).unwrap();
            }
        });

        // Queue drained when the iteration scope ended
        assert_eq!(world.stream::<(i32,)>().count(), 4);
        assert_eq!(world.entity_count(), 4);
        Ok(())
    }

    #[test]
    fn test_not_filter_excludes() -> Result<()> {
        let mut world = World::new();
        for i in 0..6 {
            let e = world.spawn();
            world.add_component(e, Identity::NONE, Position { x: 0.0, y: 0.0 })?;
            if i < 2 {
                world.add_component(e, Identity::NONE, Velocity { x: 0.0, y: 0.0 })?;
            }
        }
        let count = world
            .query::<(Position,)>()
            .not::<Velocity>()
            .compile()
            .count();
        assert_eq!(count, 4);
        Ok(())
    }
}
