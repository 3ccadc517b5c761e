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

//! Archetype signatures: sorted, deduplicated sets of type expressions
//!
//! A signature identifies an archetype. All operations are value-producing;
//! the world interns signatures in its archetype index, so canonical order
//! matters (packed `u64` order of the expressions).

use smallvec::SmallVec;

use crate::expression::TypeExpr;

/// Sorted, deduplicated expression set
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Signature {
    exprs: SmallVec<[TypeExpr; 8]>,
}

impl Signature {
    /// The empty signature (componentless entities)
    pub fn empty() -> Signature {
        Signature::default()
    }

    /// Build from arbitrary expressions, sorting and deduplicating
    pub fn from_exprs(exprs: impl IntoIterator<Item = TypeExpr>) -> Signature {
        let mut exprs: SmallVec<[TypeExpr; 8]> = exprs.into_iter().collect();
        exprs.sort_unstable();
        exprs.dedup();
        Signature { exprs }
    }

    /// New signature with `expr` included
    pub fn add(&self, expr: TypeExpr) -> Signature {
        match self.exprs.binary_search(&expr) {
            Ok(_) => self.clone(),
            Err(pos) => {
                let mut exprs = self.exprs.clone();
                exprs.insert(pos, expr);
                Signature { exprs }
            }
        }
    }

    /// New signature with `expr` excluded
    pub fn remove(&self, expr: TypeExpr) -> Signature {
        match self.exprs.binary_search(&expr) {
            Ok(pos) => {
                let mut exprs = self.exprs.clone();
                exprs.remove(pos);
                Signature { exprs }
            }
            Err(_) => self.clone(),
        }
    }

    /// Exact membership (no wildcard matching)
    pub fn contains(&self, expr: TypeExpr) -> bool {
        self.exprs.binary_search(&expr).is_ok()
    }

    /// Does any stored expression satisfy the given match expression?
    pub fn matches(&self, query: TypeExpr) -> bool {
        // Expressions sharing a component id are contiguous in sort order
        let lo = self
            .exprs
            .partition_point(|e| e.component_id() < query.component_id());
        self.exprs[lo..]
            .iter()
            .take_while(|e| e.component_id() == query.component_id())
            .any(|e| query.matches(*e))
    }

    /// Set union
    pub fn union(&self, other: &Signature) -> Signature {
        let mut exprs = self.exprs.clone();
        exprs.extend(other.exprs.iter().copied());
        exprs.sort_unstable();
        exprs.dedup();
        Signature { exprs }
    }

    /// True when the signatures share at least one expression
    pub fn intersects(&self, other: &Signature) -> bool {
        // Both sorted: linear merge walk
        let (mut a, mut b) = (self.exprs.iter().peekable(), other.exprs.iter().peekable());
        while let (Some(&x), Some(&y)) = (a.peek(), b.peek()) {
            match x.cmp(y) {
                std::cmp::Ordering::Equal => return true,
                std::cmp::Ordering::Less => {
                    a.next();
                }
                std::cmp::Ordering::Greater => {
                    b.next();
                }
            }
        }
        false
    }

    pub fn iter(&self) -> impl Iterator<Item = TypeExpr> + '_ {
        self.exprs.iter().copied()
    }

    pub fn as_slice(&self) -> &[TypeExpr] {
        &self.exprs
    }

    pub fn len(&self) -> usize {
        self.exprs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exprs.is_empty()
    }
}

impl FromIterator<TypeExpr> for Signature {
    fn from_iter<I: IntoIterator<Item = TypeExpr>>(iter: I) -> Signature {
        Signature::from_exprs(iter)
    }
}
