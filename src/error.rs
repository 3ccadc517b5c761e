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

//! Error types

use std::fmt;

/// ECS error type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EcsError {
    /// Entity handle is stale or was despawned
    EntityNotAlive,

    /// Component slot already occupied on this entity
    ComponentAlreadyPresent,

    /// Component slot absent on this entity
    ComponentNotPresent,

    /// Row index past the end of a storage column
    RowOutOfBounds,

    /// Operation requires a different identity kind (e.g. successor of a non-entity)
    InvalidIdentityKind,

    /// Wildcard or otherwise non-storable key used where a concrete key is required
    InvalidKeyExpression,

    /// More than 255 distinct link/key types registered
    KeySpaceExhausted,

    /// Identity string could not be parsed
    MalformedIdentity(String),

    /// Archetype changed shape underneath a live iterator
    StructurallyModifiedDuringIteration,
}

impl fmt::Display for EcsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EcsError::EntityNotAlive => write!(f, "Entity is not alive"),
            EcsError::ComponentAlreadyPresent => write!(f, "Component already present"),
            EcsError::ComponentNotPresent => write!(f, "Component not present"),
            EcsError::RowOutOfBounds => write!(f, "Row out of bounds"),
            EcsError::InvalidIdentityKind => write!(f, "Invalid identity kind"),
            EcsError::InvalidKeyExpression => write!(f, "Invalid key expression"),
            EcsError::KeySpaceExhausted => write!(f, "Key space exhausted (max 255 link types)"),
            EcsError::MalformedIdentity(s) => write!(f, "Malformed identity: {s}"),
            EcsError::StructurallyModifiedDuringIteration => {
                write!(f, "Archetype structurally modified during iteration")
            }
        }
    }
}

impl std::error::Error for EcsError {}

/// Result type alias
pub type Result<T> = std::result::Result<T, EcsError>;
