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

//! Component trait and the runtime component registry
//!
//! Component types get a monotonic 16-bit id on first use, together with an
//! erased layout descriptor (size, align, drop). Storage columns are keyed
//! by id and recover typed views through an id check.

use std::any::{type_name, TypeId};
use std::sync::OnceLock;

use ahash::AHashMap;
use parking_lot::RwLock;

/// Marker trait for components
///
/// Components must be 'static (no borrowed data)
pub trait Component: 'static + Send + Sync {}

/// Automatically implement Component for all valid types
impl<T: 'static + Send + Sync> Component for T {}

/// Monotonic per-process component type id
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ComponentTypeId(u16);

impl ComponentTypeId {
    /// Id for `T`, registering it on first use
    pub fn of<T: Component>() -> ComponentTypeId {
        let type_id = TypeId::of::<T>();
        {
            let reg = registry().read();
            if let Some(&id) = reg.ids.get(&type_id) {
                return ComponentTypeId(id);
            }
        }

        let mut reg = registry().write();
        // Double-check: another thread may have registered between locks
        if let Some(&id) = reg.ids.get(&type_id) {
            return ComponentTypeId(id);
        }
        if reg.infos.len() > u16::MAX as usize {
            panic!("component registry exhausted (65,536 distinct component types)");
        }
        let id = reg.infos.len() as u16;
        reg.infos.push(ComponentInfo {
            type_id,
            name: type_name::<T>(),
            size: std::mem::size_of::<T>(),
            align: std::mem::align_of::<T>(),
            drop_fn: if std::mem::needs_drop::<T>() {
                Some(|ptr| unsafe {
                    std::ptr::drop_in_place(ptr as *mut T);
                })
            } else {
                None
            },
        });
        reg.ids.insert(type_id, id);
        ComponentTypeId(id)
    }

    pub(crate) fn from_raw(raw: u16) -> ComponentTypeId {
        ComponentTypeId(raw)
    }

    pub fn raw(self) -> u16 {
        self.0
    }

    /// Registered type name, for diagnostics
    pub fn name(self) -> &'static str {
        component_info(self).name
    }
}

/// Erased layout descriptor for one component type
#[derive(Debug, Clone, Copy)]
pub(crate) struct ComponentInfo {
    #[allow(dead_code)] // Used by debug assertions in typed column views
    pub type_id: TypeId,
    pub name: &'static str,
    pub size: usize,
    pub align: usize,
    pub drop_fn: Option<unsafe fn(*mut u8)>,
}

struct Registry {
    ids: AHashMap<TypeId, u16>,
    infos: Vec<ComponentInfo>,
}

fn registry() -> &'static RwLock<Registry> {
    static REGISTRY: OnceLock<RwLock<Registry>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        RwLock::new(Registry {
            ids: AHashMap::with_capacity(64),
            infos: Vec::with_capacity(64),
        })
    })
}

pub(crate) fn component_info(id: ComponentTypeId) -> ComponentInfo {
    registry().read().infos[id.raw() as usize]
}
