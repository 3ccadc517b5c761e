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

//! Keyed-Archetype ECS
//!
//! Archetype-based entity storage where every component slot carries an
//! optional secondary key: none (plain), an entity-relation target, an
//! object link, or a typed hash key. Queries match keys exactly or through
//! wildcards, and streams cross-join every matching column per archetype.

pub mod archetype;
pub mod command;
pub mod component;
pub mod entity;
pub mod error;
pub mod expression;
pub mod identity;
pub mod prelude;
pub mod query;
pub mod signature;
pub mod storage;
pub mod stream;
pub mod world;

// Re-exports for convenience
pub use archetype::Archetype;
pub use component::{Component, ComponentTypeId};
pub use entity::EntityMeta;
pub use error::{EcsError, Result};
pub use expression::TypeExpr;
pub use identity::{Identity, IdentityKind, WildcardKind};
pub use query::{Mask, QueryBuilder};
pub use signature::Signature;
pub use storage::Column;
pub use stream::{Stream, StreamIter, StreamTuple, MAX_STREAM_TYPES};
pub use world::{Deferred, World, WorldLock, WorldMode};
