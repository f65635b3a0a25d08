//! # STRATA Context
//!
//! Configuration-driven hosting for the `strata_alloc` family.
//!
//! ## Design Principles
//!
//! 1. **Explicit injection** - Consumers receive `&AllocatorContext`, never a global
//! 2. **Reserve once** - Every arena is allocated by [`ArenaSet::from_config`] at startup
//! 3. **Ordered teardown** - Allocators are dropped in reverse construction order, then the arenas
//! 4. **External configuration** - The allocator layout lives in a TOML file
//!
//! ## Example
//!
//! ```rust,ignore
//! use strata_context::ArenaSet;
//!
//! let mut arenas = ArenaSet::load("config/allocators.toml")?;
//! let context = arenas.build_context()?;
//!
//! let textures = context.handles("textures").unwrap();
//! let handle = textures.allocate();
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::perf)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod context;
pub mod error;

pub use config::{BuddyConfig, ContextConfig, HandleConfig, PoolConfig, ScratchConfig};
pub use context::{AllocatorContext, ArenaSet};
pub use error::{ContextError, ContextResult};
