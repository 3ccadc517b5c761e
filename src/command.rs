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

//! Deferred structural operations
//!
//! While a world lock is held, structural changes are recorded as tagged
//! operations and drained FIFO when the last lock releases. Operations
//! invalidated by earlier entries in the queue (despawning an entity that
//! is already gone, adding a component that meanwhile appeared) are dropped
//! during the drain; immediate-mode calls still fail fast.

use std::alloc::{alloc, dealloc, Layout};
use std::fmt;
use std::ptr::NonNull;

use crate::component::{component_info, Component, ComponentTypeId};
use crate::expression::TypeExpr;
use crate::identity::Identity;

/// One queued structural change
pub(crate) enum DeferredOp {
    Add {
        entity: Identity,
        expr: TypeExpr,
        value: ErasedValue,
    },
    Remove {
        entity: Identity,
        expr: TypeExpr,
    },
    Despawn {
        entity: Identity,
    },
    Truncate {
        archetype: u32,
        keep: usize,
    },
}

impl fmt::Debug for DeferredOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeferredOp::Add { entity, expr, .. } => f
                .debug_struct("Add")
                .field("entity", entity)
                .field("expr", expr)
                .finish_non_exhaustive(),
            DeferredOp::Remove { entity, expr } => f
                .debug_struct("Remove")
                .field("entity", entity)
                .field("expr", expr)
                .finish(),
            DeferredOp::Despawn { entity } => {
                f.debug_tuple("Despawn").field(entity).finish()
            }
            DeferredOp::Truncate { archetype, keep } => f
                .debug_struct("Truncate")
                .field("archetype", archetype)
                .field("keep", keep)
                .finish(),
        }
    }
}

/// Owned, type-erased component value awaiting insertion
///
/// The payload lives in a properly aligned allocation; if the op never
/// applies (queue dropped), the value is dropped through the registry glue.
pub(crate) struct ErasedValue {
    component: ComponentTypeId,
    ptr: NonNull<u8>,
    size: usize,
    align: usize,
    drop_fn: Option<unsafe fn(*mut u8)>,
}

// SAFETY: the payload type is constrained to Component (Send + Sync) at
// construction; the raw pointer is uniquely owned.
unsafe impl Send for ErasedValue {}

impl ErasedValue {
    pub fn new<T: Component>(value: T) -> ErasedValue {
        let info = component_info(ComponentTypeId::of::<T>());
        let ptr = if info.size == 0 {
            // Aligned dangling pointer; valid for zero-sized writes
            NonNull::new(info.align as *mut u8).expect("non-zero align")
        } else {
            let layout = Layout::new::<T>();
            // SAFETY: layout has non-zero size here
            let raw = unsafe { alloc(layout) };
            NonNull::new(raw).unwrap_or_else(|| std::alloc::handle_alloc_error(layout))
        };
        // SAFETY: ptr is properly aligned for T and uniquely owned
        unsafe {
            std::ptr::write(ptr.as_ptr() as *mut T, value);
        }
        ErasedValue {
            component: ComponentTypeId::of::<T>(),
            ptr,
            size: info.size,
            align: info.align,
            drop_fn: info.drop_fn,
        }
    }

    pub fn component(&self) -> ComponentTypeId {
        self.component
    }

    /// Hand the initialized payload pointer to `write`, which must take
    /// ownership of the value (the bytes are not dropped afterwards).
    pub fn consume(self, write: impl FnOnce(*const u8)) {
        write(self.ptr.as_ptr());
        self.free_allocation();
        std::mem::forget(self);
    }

    fn free_allocation(&self) {
        if self.size > 0 {
            // SAFETY: allocated in new() with this exact layout
            unsafe {
                dealloc(
                    self.ptr.as_ptr(),
                    Layout::from_size_align_unchecked(self.size, self.align),
                );
            }
        }
    }
}

impl Drop for ErasedValue {
    fn drop(&mut self) {
        if let Some(drop_fn) = self.drop_fn {
            // SAFETY: payload still owned and initialized
            unsafe {
                drop_fn(self.ptr.as_ptr());
            }
        }
        self.free_allocation();
    }
}
