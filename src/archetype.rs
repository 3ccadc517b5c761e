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

//! Archetype storage: Structure of Arrays grouped by signature
//!
//! Every entity sharing a signature lives in the same archetype, one row
//! across all columns plus the implicit identity column. Structural
//! mutations bump the version counter so enumerators can detect shape
//! changes underneath them.

use std::sync::atomic::{AtomicU32, Ordering};

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::component::Component;
use crate::error::{EcsError, Result};
use crate::expression::TypeExpr;
use crate::identity::Identity;
use crate::signature::Signature;
use crate::storage::Column;

/// Archetype: all entities with one exact signature
pub struct Archetype {
    signature: Signature,
    entities: Vec<Identity>,
    columns: Vec<Column>,
    column_index: FxHashMap<TypeExpr, usize>,
    version: AtomicU32,
}

impl Archetype {
    /// Create an archetype with one column per signature expression
    pub(crate) fn new(signature: Signature) -> Archetype {
        let columns: Vec<Column> = signature.iter().map(Column::new).collect();
        let column_index = signature
            .iter()
            .enumerate()
            .map(|(idx, expr)| (expr, idx))
            .collect();
        Archetype {
            signature,
            entities: Vec::new(),
            columns,
            column_index,
            version: AtomicU32::new(0),
        }
    }

    /// Signature identifying this archetype
    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// Number of rows (entities)
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Identities in row order
    pub fn entities(&self) -> &[Identity] {
        &self.entities
    }

    pub fn iter_entities(&self) -> impl Iterator<Item = Identity> + '_ {
        self.entities.iter().copied()
    }

    /// Current structural version
    pub fn version(&self) -> u32 {
        self.version.load(Ordering::Acquire)
    }

    pub(crate) fn bump_version(&self) {
        self.version.fetch_add(1, Ordering::AcqRel);
    }

    /// Append a row for `identity`. Component columns are extended by the
    /// caller (migration or backfill); until then the row is incomplete.
    pub(crate) fn add_row(&mut self, identity: Identity) -> usize {
        let row = self.entities.len();
        self.entities.push(identity);
        self.bump_version();
        row
    }

    /// Remove a full row, dropping its values. Returns the identity swapped
    /// into `row`, if any, so the caller can fix its meta.
    pub(crate) fn remove_row(&mut self, row: usize) -> Result<Option<Identity>> {
        if row >= self.entities.len() {
            return Err(EcsError::RowOutOfBounds);
        }
        for column in &mut self.columns {
            column.delete_swap(row)?;
        }
        self.entities.swap_remove(row);
        self.bump_version();
        Ok(if row < self.entities.len() {
            Some(self.entities[row])
        } else {
            None
        })
    }

    /// Remove only the identity entry at `row` (columns already shrunk by a
    /// migration). Returns the identity swapped into `row`, if any.
    pub(crate) fn swap_remove_identity(&mut self, row: usize) -> Option<Identity> {
        self.entities.swap_remove(row);
        self.bump_version();
        if row < self.entities.len() {
            Some(self.entities[row])
        } else {
            None
        }
    }

    /// Column for an exact storage expression
    pub fn column(&self, expr: TypeExpr) -> Option<&Column> {
        self.column_index.get(&expr).map(|&idx| &self.columns[idx])
    }

    pub(crate) fn column_mut(&mut self, expr: TypeExpr) -> Option<&mut Column> {
        let idx = *self.column_index.get(&expr)?;
        Some(&mut self.columns[idx])
    }

    /// Position of a column in signature order
    pub fn column_position(&self, expr: TypeExpr) -> Option<usize> {
        self.column_index.get(&expr).copied()
    }

    pub fn column_at(&self, idx: usize) -> &Column {
        &self.columns[idx]
    }

    pub(crate) fn column_at_mut(&mut self, idx: usize) -> &mut Column {
        &mut self.columns[idx]
    }

    pub(crate) fn columns_mut(&mut self) -> &mut [Column] {
        &mut self.columns
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Indices of every column whose expression satisfies `query`,
    /// in signature order
    pub fn match_columns(&self, query: TypeExpr) -> SmallVec<[usize; 4]> {
        self.columns
            .iter()
            .enumerate()
            .filter(|(_, col)| query.matches(col.expr()))
            .map(|(idx, _)| idx)
            .collect()
    }

    /// Cross-join plan over one selection of matching columns per stream
    /// slot. Empty if any slot has no matching column.
    pub fn cross_join(&self, exprs: &[TypeExpr]) -> Join {
        Join::new(exprs.iter().map(|&e| self.match_columns(e)).collect())
    }

    /// Backfill a freshly added column until it covers every row
    pub fn fill_column<T: Component + Clone>(&mut self, expr: TypeExpr, value: T) -> Result<()> {
        let rows = self.entities.len();
        let column = self
            .column_mut(expr)
            .ok_or(EcsError::ComponentNotPresent)?;
        let missing = rows - column.len();
        column.append_n(value, missing);
        self.bump_version();
        Ok(())
    }
}

/// Odometer over the Cartesian product of per-slot column selections.
///
/// Slot 0 is the outermost counter; the last slot advances fastest. Every
/// combination is visited exactly once; a join with any empty slot yields
/// nothing.
pub struct Join {
    selections: SmallVec<[SmallVec<[usize; 4]>; 5]>,
    cursors: SmallVec<[usize; 5]>,
    done: bool,
}

impl Join {
    fn new(selections: SmallVec<[SmallVec<[usize; 4]>; 5]>) -> Join {
        let done = selections.is_empty() || selections.iter().any(|s| s.is_empty());
        let cursors = selections.iter().map(|_| 0).collect();
        Join {
            selections,
            cursors,
            done,
        }
    }

    /// True when no (further) combination exists
    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn arity(&self) -> usize {
        self.selections.len()
    }

    /// Column index selected for `slot` in the current combination
    pub fn get(&self, slot: usize) -> usize {
        self.selections[slot][self.cursors[slot]]
    }

    /// Total number of combinations (product of selection sizes)
    pub fn combinations(&self) -> usize {
        if self.selections.is_empty() {
            return 0;
        }
        self.selections.iter().map(|s| s.len()).product()
    }

    /// Step to the next combination; false once exhausted
    pub fn advance(&mut self) -> bool {
        if self.done {
            return false;
        }
        let mut slot = self.selections.len() - 1;
        loop {
            self.cursors[slot] += 1;
            if self.cursors[slot] < self.selections[slot].len() {
                return true;
            }
            if slot == 0 {
                self.done = true;
                return false;
            }
            self.cursors[slot] = 0;
            slot -= 1;
        }
    }

    /// Does the current combination select any column more than once?
    /// Such combinations cannot hand out disjoint `&mut` views.
    pub fn has_duplicates(&self) -> bool {
        let n = self.selections.len();
        for i in 0..n {
            for j in (i + 1)..n {
                if self.get(i) == self.get(j) {
                    return true;
                }
            }
        }
        false
    }
}
