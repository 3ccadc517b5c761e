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

//! Query masks and the fluent query builder
//!
//! A mask is the structural predicate of a query: expressions that must
//! match the signature, expressions that must not, and an optional
//! any-of group. Compiled masks are interned in the world's query cache,
//! which tracks matched archetypes incrementally.

use std::marker::PhantomData;

use smallvec::SmallVec;

use crate::archetype::Archetype;
use crate::component::Component;
use crate::expression::TypeExpr;
use crate::identity::Identity;
use crate::signature::Signature;
use crate::stream::{Stream, StreamTuple, MAX_STREAM_TYPES};
use crate::world::World;

/// Structural predicate over signatures
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Mask {
    has: SmallVec<[TypeExpr; 8]>,
    not: SmallVec<[TypeExpr; 8]>,
    any: SmallVec<[TypeExpr; 8]>,
}

impl Mask {
    pub fn new() -> Mask {
        Mask::default()
    }

    pub(crate) fn add_has(&mut self, expr: TypeExpr) {
        self.has.push(expr);
    }

    pub(crate) fn add_not(&mut self, expr: TypeExpr) {
        self.not.push(expr);
    }

    pub(crate) fn add_any(&mut self, expr: TypeExpr) {
        self.any.push(expr);
    }

    /// Canonicalize term order so equal predicates hash equally
    pub(crate) fn normalize(&mut self) {
        self.has.sort_unstable();
        self.has.dedup();
        self.not.sort_unstable();
        self.not.dedup();
        self.any.sort_unstable();
        self.any.dedup();
    }

    /// Does a signature satisfy this predicate?
    pub fn matches(&self, signature: &Signature) -> bool {
        self.has.iter().all(|t| signature.matches(*t))
            && !self.not.iter().any(|t| signature.matches(*t))
            && (self.any.is_empty() || self.any.iter().any(|t| signature.matches(*t)))
    }
}

/// Cached matches for one mask, extended as archetypes appear
pub(crate) struct CachedMatches {
    mask: Mask,
    pub matches: Vec<u32>,
    seen_archetypes: usize,
}

impl CachedMatches {
    pub fn new(mask: Mask, archetypes: &[Archetype]) -> CachedMatches {
        let matches = archetypes
            .iter()
            .enumerate()
            .filter(|(_, arch)| mask.matches(arch.signature()))
            .map(|(id, _)| id as u32)
            .collect();
        CachedMatches {
            mask,
            matches,
            seen_archetypes: archetypes.len(),
        }
    }

    /// Check only archetypes created since the last scan
    pub fn update(&mut self, archetypes: &[Archetype]) {
        let count = archetypes.len();
        if count > self.seen_archetypes {
            for (id, arch) in archetypes.iter().enumerate().skip(self.seen_archetypes) {
                if self.mask.matches(arch.signature()) {
                    self.matches.push(id as u32);
                }
            }
            self.seen_archetypes = count;
        }
    }
}

/// Fluent collector of query terms over stream types `S`
pub struct QueryBuilder<'w, S: StreamTuple> {
    world: &'w mut World,
    keys: SmallVec<[Identity; MAX_STREAM_TYPES]>,
    mask: Mask,
    _phantom: PhantomData<S>,
}

impl<'w, S: StreamTuple> QueryBuilder<'w, S> {
    pub(crate) fn new(world: &'w mut World) -> Self {
        Self {
            world,
            keys: (0..S::ARITY).map(|_| Identity::NONE).collect(),
            mask: Mask::new(),
            _phantom: PhantomData,
        }
    }

    /// Set the match key for one stream slot (default: plain).
    ///
    /// Wildcard keys turn the slot into a cross-join over every matching
    /// column of each archetype.
    pub fn matching(mut self, slot: usize, key: Identity) -> Self {
        assert!(slot < S::ARITY, "stream slot out of range");
        self.keys[slot] = key;
        self
    }

    /// Require a plain component without streaming it
    pub fn has<T: Component>(self) -> Self {
        self.has_keyed::<T>(Identity::NONE)
    }

    /// Require a keyed component without streaming it
    pub fn has_keyed<T: Component>(mut self, key: Identity) -> Self {
        self.mask.add_has(TypeExpr::matching::<T>(key));
        self
    }

    /// Exclude archetypes carrying a plain component
    pub fn not<T: Component>(self) -> Self {
        self.not_keyed::<T>(Identity::NONE)
    }

    /// Exclude archetypes carrying a matching keyed component
    pub fn not_keyed<T: Component>(mut self, key: Identity) -> Self {
        self.mask.add_not(TypeExpr::matching::<T>(key));
        self
    }

    /// Require at least one of the any-group components
    pub fn any<T: Component>(self) -> Self {
        self.any_keyed::<T>(Identity::NONE)
    }

    pub fn any_keyed<T: Component>(mut self, key: Identity) -> Self {
        self.mask.add_any(TypeExpr::matching::<T>(key));
        self
    }

    /// Compile into a stream, registering the mask with the world's
    /// query cache
    pub fn compile(self) -> Stream<'w, S> {
        let exprs = S::matching_exprs(&self.keys);
        let mut mask = self.mask;
        for &expr in &exprs {
            mask.add_has(expr);
        }
        mask.normalize();
        // Prime the cache so archetype registration is incremental from here
        self.world.matched_archetypes(&mask);
        Stream::new(self.world, exprs, mask)
    }
}
