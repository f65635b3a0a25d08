//! # Context Configuration
//!
//! One TOML document describes every allocator a process needs:
//!
//! ```toml
//! [[pools]]
//! name = "particles"
//! block_size = 64
//! capacity = 4096
//! concurrent = true
//!
//! [[handles]]
//! name = "textures"
//! capacity = 1024
//!
//! [buddy]
//! arena_bytes = 1048576
//! min_block_size = 256
//!
//! [scratch]
//! bytes = 65536
//! concurrent = true
//! ```
//!
//! The whole document is validated before any arena is reserved, so a bad
//! config never leaves half-built allocators behind.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use strata_alloc::{BlockPool, BuddyAllocator, IndexAllocator, Local};

use crate::error::{ContextError, ContextResult};

/// A named fixed-block pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PoolConfig {
    /// Lookup name.
    pub name: String,
    /// Bytes per block.
    pub block_size: usize,
    /// Number of blocks.
    pub capacity: usize,
    /// Build the lock-free variant.
    #[serde(default)]
    pub concurrent: bool,
}

/// A named index (handle) allocator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HandleConfig {
    /// Lookup name.
    pub name: String,
    /// Number of handles.
    pub capacity: usize,
    /// Build the lock-free variant.
    #[serde(default)]
    pub concurrent: bool,
}

/// The buddy allocator. At most one per context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct BuddyConfig {
    /// Arena size, a power of two.
    pub arena_bytes: usize,
    /// Smallest block, a power of two.
    pub min_block_size: usize,
}

impl Default for BuddyConfig {
    fn default() -> Self {
        Self {
            arena_bytes: 1 << 20,
            min_block_size: 256,
        }
    }
}

/// The per-tick scratch allocator. At most one per context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ScratchConfig {
    /// Arena size.
    pub bytes: usize,
    /// Build the lock-free variant.
    pub concurrent: bool,
}

impl Default for ScratchConfig {
    fn default() -> Self {
        Self {
            bytes: 64 * 1024,
            concurrent: false,
        }
    }
}

/// Full allocator layout for a context.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContextConfig {
    /// Fixed-block pools, built in order.
    #[serde(default)]
    pub pools: Vec<PoolConfig>,
    /// Handle allocators, built in order.
    #[serde(default)]
    pub handles: Vec<HandleConfig>,
    /// Optional buddy allocator.
    #[serde(default)]
    pub buddy: Option<BuddyConfig>,
    /// Optional scratch allocator.
    #[serde(default)]
    pub scratch: Option<ScratchConfig>,
}

impl ContextConfig {
    /// Parses and validates a TOML document.
    ///
    /// # Errors
    ///
    /// [`ContextError::Parse`] for malformed TOML or unknown keys, otherwise
    /// any error from [`ContextConfig::validate`].
    pub fn from_toml_str(source: &str) -> ContextResult<Self> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a TOML file.
    ///
    /// # Errors
    ///
    /// [`ContextError::Io`] if the file cannot be read, otherwise as
    /// [`ContextConfig::from_toml_str`].
    pub fn load(path: impl AsRef<Path>) -> ContextResult<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| ContextError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&source)?;
        tracing::info!(
            path = %path.display(),
            pools = config.pools.len(),
            handles = config.handles.len(),
            buddy = config.buddy.is_some(),
            scratch = config.scratch.is_some(),
            "allocator config loaded"
        );
        Ok(config)
    }

    /// Checks every allocator's geometry and name without reserving memory.
    ///
    /// # Errors
    ///
    /// - [`ContextError::InvalidConfig`] for empty names or an empty scratch arena
    /// - [`ContextError::DuplicateName`] for repeated pool or handle names
    /// - [`ContextError::Alloc`] for geometry an allocator would reject
    /// - [`ContextError::InvalidConfig`] if the arenas together exceed
    ///   `isize::MAX` bytes
    pub fn validate(&self) -> ContextResult<()> {
        let mut seen = HashSet::new();
        for pool in &self.pools {
            check_name("pool", &pool.name, &mut seen)?;
            BlockPool::<Local>::validate(pool.block_size, pool.capacity)
                .map_err(ContextError::alloc("pool", &pool.name))?;
        }

        seen.clear();
        for handles in &self.handles {
            check_name("handles", &handles.name, &mut seen)?;
            IndexAllocator::<Local>::validate(handles.capacity).map_err(ContextError::alloc("handles", &handles.name))?;
        }

        if let Some(buddy) = &self.buddy {
            BuddyAllocator::bookkeeping_bytes(buddy.arena_bytes, buddy.min_block_size)
                .map_err(ContextError::alloc("buddy", "buddy"))?;
        }

        if let Some(scratch) = &self.scratch {
            if scratch.bytes == 0 {
                return Err(ContextError::InvalidConfig("scratch arena must not be empty".into()));
            }
        }

        match self.checked_reserved_bytes() {
            Some(total) if isize::try_from(total).is_ok() => Ok(()),
            _ => Err(ContextError::InvalidConfig(format!(
                "arenas exceed the addressable limit of {} bytes",
                isize::MAX
            ))),
        }
    }

    /// Total bytes of arena and bookkeeping this config reserves.
    ///
    /// Saturates at `usize::MAX` for a config that [`ContextConfig::validate`]
    /// would reject as too large.
    #[must_use]
    pub fn reserved_bytes(&self) -> usize {
        self.checked_reserved_bytes().unwrap_or(usize::MAX)
    }

    fn checked_reserved_bytes(&self) -> Option<usize> {
        let pools = self
            .pools
            .iter()
            .try_fold(0usize, |total, p| total.checked_add(p.block_size.checked_mul(p.capacity)?))?;
        let handles = self.handles.iter().try_fold(0usize, |total, h| {
            total.checked_add(h.capacity.checked_mul(IndexAllocator::<Local>::required_bytes(1))?)
        })?;
        let buddy = match self.buddy {
            Some(b) => {
                let bookkeeping = BuddyAllocator::bookkeeping_bytes(b.arena_bytes, b.min_block_size).unwrap_or(0);
                b.arena_bytes.checked_add(bookkeeping)?
            }
            None => 0,
        };
        let scratch = self.scratch.map_or(0, |s| s.bytes);
        pools.checked_add(handles)?.checked_add(buddy)?.checked_add(scratch)
    }
}

fn check_name<'c>(kind: &'static str, name: &'c str, seen: &mut HashSet<&'c str>) -> ContextResult<()> {
    if name.is_empty() {
        return Err(ContextError::InvalidConfig(format!("{kind} name must not be empty")));
    }
    if !seen.insert(name) {
        return Err(ContextError::DuplicateName {
            kind,
            name: name.to_owned(),
        });
    }
    Ok(())
}
