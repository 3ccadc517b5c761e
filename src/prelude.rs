//! Convenient re-exports of commonly used types.
//!
//! The prelude can be imported with:
//! ```
//! use keyed_ecs::prelude::*;
//! ```

pub use crate::component::Component;
pub use crate::error::{EcsError, Result};
pub use crate::expression::TypeExpr;
pub use crate::identity::{Identity, IdentityKind, WildcardKind};
pub use crate::query::{Mask, QueryBuilder};
pub use crate::signature::Signature;
pub use crate::stream::{Stream, StreamTuple};
pub use crate::world::{Deferred, World, WorldLock, WorldMode};
