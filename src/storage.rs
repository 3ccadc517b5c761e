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

//! Type-erased storage columns
//!
//! One column holds the values of a single type expression for every row of
//! an archetype. Values are stored densely as raw bytes; the layout and
//! drop glue come from the component registry. Zero-sized components are
//! supported through the explicit row count.

use crate::component::{component_info, Component, ComponentTypeId};
use crate::error::{EcsError, Result};
use crate::expression::TypeExpr;

/// Dense erased vector of component values
pub struct Column {
    expr: TypeExpr,
    component: ComponentTypeId,
    item_size: usize,
    item_align: usize,
    drop_fn: Option<unsafe fn(*mut u8)>,
    data: Vec<u8>,
    rows: usize,
}

impl Column {
    /// Create an empty column for the given storage expression
    pub(crate) fn new(expr: TypeExpr) -> Column {
        let component = expr.component_id();
        let info = component_info(component);
        Column {
            expr,
            component,
            item_size: info.size,
            item_align: info.align,
            drop_fn: info.drop_fn,
            data: Vec::new(),
            rows: 0,
        }
    }

    /// Storage expression this column holds values for
    pub fn expr(&self) -> TypeExpr {
        self.expr
    }

    /// Number of rows
    pub fn len(&self) -> usize {
        self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    /// Rows the column can hold without reallocating
    pub fn capacity(&self) -> usize {
        if self.item_size == 0 {
            usize::MAX
        } else {
            self.data.capacity() / self.item_size
        }
    }

    fn ptr_at(&self, row: usize) -> *const u8 {
        if self.item_size == 0 {
            // Aligned dangling pointer; valid for zero-sized reads
            self.item_align as *const u8
        } else {
            unsafe { self.data.as_ptr().add(row * self.item_size) }
        }
    }

    fn ptr_at_mut(&mut self, row: usize) -> *mut u8 {
        if self.item_size == 0 {
            self.item_align as *mut u8
        } else {
            unsafe { self.data.as_mut_ptr().add(row * self.item_size) }
        }
    }

    /// Base pointer for raw slice access; dangling (aligned) for ZSTs
    pub(crate) fn base_ptr(&mut self) -> *mut u8 {
        self.ptr_at_mut(0)
    }

    fn check_type<T: Component>(&self) {
        debug_assert_eq!(
            self.component,
            ComponentTypeId::of::<T>(),
            "typed column view with mismatched component type"
        );
    }

    /// Reference to the value at `row`
    pub fn get<T: Component>(&self, row: usize) -> Result<&T> {
        self.check_type::<T>();
        if row >= self.rows {
            return Err(EcsError::RowOutOfBounds);
        }
        // SAFETY: row bounds checked; the pointer is aligned and initialized
        Ok(unsafe { &*(self.ptr_at(row) as *const T) })
    }

    /// Mutable reference to the value at `row`
    pub fn get_mut<T: Component>(&mut self, row: usize) -> Result<&mut T> {
        self.check_type::<T>();
        if row >= self.rows {
            return Err(EcsError::RowOutOfBounds);
        }
        // SAFETY: row bounds checked; exclusive access through &mut self
        Ok(unsafe { &mut *(self.ptr_at_mut(row) as *mut T) })
    }

    /// Overwrite the value at `row`, dropping the previous one
    pub fn set<T: Component>(&mut self, row: usize, value: T) -> Result<()> {
        self.check_type::<T>();
        if row >= self.rows {
            return Err(EcsError::RowOutOfBounds);
        }
        let ptr = self.ptr_at_mut(row) as *mut T;
        // SAFETY: bounds checked; old value is initialized and dropped once
        unsafe {
            std::ptr::drop_in_place(ptr);
            std::ptr::write(ptr, value);
        }
        Ok(())
    }

    /// Append one value
    pub fn append<T: Component>(&mut self, value: T) {
        self.check_type::<T>();
        let ptr = self.push_uninit();
        // SAFETY: push_uninit reserved an item-sized slot at the tail
        unsafe {
            std::ptr::write(ptr as *mut T, value);
        }
    }

    /// Append `count` copies of a value
    pub fn append_n<T: Component + Clone>(&mut self, value: T, count: usize) {
        self.check_type::<T>();
        self.data.reserve(count * self.item_size);
        for _ in 0..count {
            self.append(value.clone());
        }
    }

    /// Overwrite every row with a copy of `value`
    pub fn blit<T: Component + Clone>(&mut self, value: T) {
        self.check_type::<T>();
        for row in 0..self.rows {
            let ptr = self.ptr_at_mut(row) as *mut T;
            // SAFETY: every row below self.rows is initialized
            unsafe {
                std::ptr::drop_in_place(ptr);
                std::ptr::write(ptr, value.clone());
            }
        }
    }

    /// Reserve a new tail slot and return its pointer. The caller must
    /// initialize the slot before any access.
    pub(crate) fn push_uninit(&mut self) -> *mut u8 {
        if self.item_size == 0 {
            self.rows += 1;
            return self.item_align as *mut u8;
        }
        self.data.reserve(self.item_size);
        // SAFETY: capacity reserved above; bytes are initialized by the caller
        unsafe {
            self.data.set_len((self.rows + 1) * self.item_size);
        }
        let row = self.rows;
        self.rows += 1;
        self.ptr_at_mut(row)
    }

    /// Append the value at `src` (an initialized item of this column's
    /// component type), taking ownership of it.
    pub(crate) fn append_erased(&mut self, src: *const u8) {
        let dst = self.push_uninit();
        if self.item_size > 0 {
            // SAFETY: src and dst are distinct allocations of item_size bytes
            unsafe {
                std::ptr::copy_nonoverlapping(src, dst, self.item_size);
            }
        }
    }

    /// Remove the value at `row`, dropping it; the last row moves in
    pub fn delete_swap(&mut self, row: usize) -> Result<()> {
        if row >= self.rows {
            return Err(EcsError::RowOutOfBounds);
        }
        if let Some(drop_fn) = self.drop_fn {
            // SAFETY: the row is initialized and will be overwritten/forgotten
            unsafe {
                drop_fn(self.ptr_at_mut(row));
            }
        }
        self.swap_tail_into(row);
        Ok(())
    }

    /// Remove the value at `row` without dropping it (value was moved out)
    pub(crate) fn delete_swap_forget(&mut self, row: usize) {
        debug_assert!(row < self.rows);
        self.swap_tail_into(row);
    }

    fn swap_tail_into(&mut self, row: usize) {
        let last = self.rows - 1;
        if self.item_size > 0 {
            if row != last {
                // SAFETY: row != last, so the ranges cannot overlap
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        self.ptr_at(last),
                        self.ptr_at_mut(row),
                        self.item_size,
                    );
                }
            }
            self.data.truncate(last * self.item_size);
        }
        self.rows = last;
    }

    /// Move the value at `row` to the tail of `other`, shrinking self
    pub(crate) fn migrate_row_to(&mut self, other: &mut Column, row: usize) {
        debug_assert_eq!(self.component, other.component);
        debug_assert_eq!(self.item_size, other.item_size);
        debug_assert!(row < self.rows);
        other.append_erased(self.ptr_at(row));
        self.delete_swap_forget(row);
    }
}

impl Drop for Column {
    fn drop(&mut self) {
        if let Some(drop_fn) = self.drop_fn {
            for row in 0..self.rows {
                // SAFETY: every row below self.rows is initialized
                unsafe {
                    drop_fn(self.ptr_at_mut(row));
                }
            }
        }
    }
}
