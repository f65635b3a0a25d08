//! # Allocator Context
//!
//! Explicit hosting for allocators that would otherwise live in global
//! find-or-create registries.
//!
//! ```text
//! ContextConfig ──validate──► ArenaSet ──build_context(&mut)──► AllocatorContext<'_>
//!                              owns every                       borrows every arena,
//!                              HeapArena                        passed to consumers by &
//! ```
//!
//! The context borrows the arena set, so the arenas cannot be freed while
//! any allocator is alive. Dropping the context tears allocators down in
//! reverse construction order: scratch, buddy, handles, pools.

use parking_lot::Mutex;
use strata_alloc::{
    AllocError, BlockPool, BuddyAllocator, ConcurrentBlockPool, ConcurrentIndexAllocator,
    ConcurrentLinearAllocator, HeapArena, IndexAllocator, LinearAllocator, Local,
};

use crate::config::ContextConfig;
use crate::error::{ContextError, ContextResult};

/// Every arena a context needs, reserved up front.
///
/// This is the only place the context touches the global allocator.
pub struct ArenaSet {
    config: ContextConfig,
    pool_arenas: Vec<HeapArena>,
    handle_arenas: Vec<HeapArena>,
    /// Payload, then bookkeeping.
    buddy_arenas: Option<(HeapArena, HeapArena)>,
    scratch_arena: Option<HeapArena>,
}

impl ArenaSet {
    /// Validates `config` and reserves its arenas.
    ///
    /// # Errors
    ///
    /// Any error from [`ContextConfig::validate`].
    pub fn from_config(config: ContextConfig) -> ContextResult<Self> {
        config.validate()?;

        let pool_arenas = config
            .pools
            .iter()
            .map(|p| HeapArena::new(BlockPool::<Local>::required_bytes(p.block_size, p.capacity)))
            .collect();
        let handle_arenas = config
            .handles
            .iter()
            .map(|h| HeapArena::new(IndexAllocator::<Local>::required_bytes(h.capacity)))
            .collect();
        let buddy_arenas = match config.buddy {
            Some(buddy) => {
                let bookkeeping = BuddyAllocator::bookkeeping_bytes(buddy.arena_bytes, buddy.min_block_size)
                    .map_err(ContextError::alloc("buddy", "buddy"))?;
                Some((HeapArena::new(buddy.arena_bytes), HeapArena::new(bookkeeping)))
            }
            None => None,
        };
        let scratch_arena = config.scratch.map(|s| HeapArena::new(s.bytes));

        tracing::info!(reserved_bytes = config.reserved_bytes(), "allocator arenas reserved");

        Ok(Self {
            config,
            pool_arenas,
            handle_arenas,
            buddy_arenas,
            scratch_arena,
        })
    }

    /// Loads a TOML file and reserves its arenas.
    ///
    /// # Errors
    ///
    /// Any error from [`ContextConfig::load`].
    pub fn load(path: impl AsRef<std::path::Path>) -> ContextResult<Self> {
        Self::from_config(ContextConfig::load(path)?)
    }

    /// The validated configuration.
    #[must_use]
    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// Bytes held by all arenas.
    #[must_use]
    pub fn reserved_bytes(&self) -> usize {
        let pairs = self.buddy_arenas.iter().flat_map(|(payload, book)| [payload, book]);
        self.pool_arenas
            .iter()
            .chain(&self.handle_arenas)
            .chain(pairs)
            .chain(&self.scratch_arena)
            .map(HeapArena::len)
            .sum()
    }

    /// Binds every configured allocator to its arena.
    ///
    /// Arenas are zeroed first, so a set can host a fresh context after the
    /// previous one was torn down.
    ///
    /// # Errors
    ///
    /// [`ContextError::Alloc`] if an allocator rejects its arena. Validation
    /// in [`ArenaSet::from_config`] makes this unreachable for arenas sized
    /// by the set itself.
    pub fn build_context(&mut self) -> ContextResult<AllocatorContext<'_>> {
        let Self {
            config,
            pool_arenas,
            handle_arenas,
            buddy_arenas,
            scratch_arena,
        } = self;

        let mut pools = Vec::with_capacity(config.pools.len());
        for (pool, arena) in config.pools.iter().zip(pool_arenas.iter_mut()) {
            arena.clear();
            let memory = arena.as_bytes_mut();
            let hosted = if pool.concurrent {
                PoolSlot::Shared(ConcurrentBlockPool::initialize(memory, pool.block_size, pool.capacity).map_err(
                    ContextError::alloc("pool", &pool.name),
                )?)
            } else {
                PoolSlot::Local(
                    BlockPool::<Local>::initialize(memory, pool.block_size, pool.capacity)
                        .map_err(ContextError::alloc("pool", &pool.name))?,
                )
            };
            pools.push(Named {
                name: pool.name.clone(),
                hosted,
            });
        }

        let mut handles = Vec::with_capacity(config.handles.len());
        for (spec, arena) in config.handles.iter().zip(handle_arenas.iter_mut()) {
            arena.clear();
            let links: &mut [u32] = bytemuck::try_cast_slice_mut(arena.as_bytes_mut())
                .map_err(|_| ContextError::alloc("handles", &spec.name)(AllocError::MisalignedArena { alignment: 4 }))?;
            let hosted = if spec.concurrent {
                HandleSlot::Shared(
                    ConcurrentIndexAllocator::initialize(links, spec.capacity)
                        .map_err(ContextError::alloc("handles", &spec.name))?,
                )
            } else {
                HandleSlot::Local(
                    IndexAllocator::<Local>::initialize(links, spec.capacity)
                        .map_err(ContextError::alloc("handles", &spec.name))?,
                )
            };
            handles.push(Named {
                name: spec.name.clone(),
                hosted,
            });
        }

        let buddy = match (config.buddy, buddy_arenas.as_mut()) {
            (Some(spec), Some((payload, book))) => {
                let allocator = BuddyAllocator::create(payload.as_bytes_mut(), spec.min_block_size, book.as_bytes_mut())
                    .map_err(ContextError::alloc("buddy", "buddy"))?;
                Some(Mutex::new(allocator))
            }
            _ => None,
        };

        let scratch = match (config.scratch, scratch_arena.as_mut()) {
            (Some(spec), Some(arena)) if spec.concurrent => {
                Some(ScratchSlot::Shared(ConcurrentLinearAllocator::initialize(arena.as_bytes_mut())))
            }
            (Some(_), Some(arena)) => Some(ScratchSlot::Local(LinearAllocator::initialize(arena.as_bytes_mut()))),
            _ => None,
        };

        tracing::info!(
            pools = pools.len(),
            handles = handles.len(),
            buddy = buddy.is_some(),
            scratch = scratch.is_some(),
            "allocator context built"
        );

        Ok(AllocatorContext {
            pools,
            handles,
            buddy,
            scratch,
        })
    }
}

impl std::fmt::Debug for ArenaSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArenaSet")
            .field("pools", &self.pool_arenas.len())
            .field("handles", &self.handle_arenas.len())
            .field("buddy", &self.buddy_arenas.is_some())
            .field("scratch", &self.scratch_arena.is_some())
            .field("reserved_bytes", &self.reserved_bytes())
            .finish()
    }
}

struct Named<T> {
    name: String,
    hosted: T,
}

enum PoolSlot<'a> {
    Local(BlockPool<'a>),
    Shared(ConcurrentBlockPool<'a>),
}

enum HandleSlot<'a> {
    Local(IndexAllocator<'a>),
    Shared(ConcurrentIndexAllocator<'a>),
}

enum ScratchSlot<'a> {
    Local(LinearAllocator<'a>),
    Shared(ConcurrentLinearAllocator<'a>),
}

fn find<'c, T>(entries: &'c [Named<T>], name: &str) -> Option<&'c T> {
    entries.iter().find(|e| e.name == name).map(|e| &e.hosted)
}

/// Allocators built from one [`ArenaSet`], passed to consumers by reference.
///
/// The context itself is not `Sync` when it hosts single-threaded
/// allocators. References to the concurrent allocators it hands out are, so
/// worker threads receive those references rather than the context.
///
/// # Example
///
/// ```rust
/// use strata_context::{ArenaSet, ContextConfig};
///
/// let config = ContextConfig::from_toml_str(r#"
///     [[pools]]
///     name = "particles"
///     block_size = 64
///     capacity = 256
///     concurrent = true
///
///     [scratch]
///     bytes = 4096
/// "#).unwrap();
///
/// let mut arenas = ArenaSet::from_config(config).unwrap();
/// let mut context = arenas.build_context().unwrap();
///
/// let particles = context.concurrent_pool("particles").unwrap();
/// let slot = particles.allocate().unwrap();
/// particles.deallocate(slot);
///
/// assert!(context.scratch().unwrap().allocate(64, 16).is_some());
/// context.reset_scratch();
/// context.teardown();
/// ```
pub struct AllocatorContext<'a> {
    pools: Vec<Named<PoolSlot<'a>>>,
    handles: Vec<Named<HandleSlot<'a>>>,
    buddy: Option<Mutex<BuddyAllocator<'a>>>,
    scratch: Option<ScratchSlot<'a>>,
}

impl<'a> AllocatorContext<'a> {
    /// Single-threaded pool named `name`.
    #[must_use]
    pub fn pool(&self, name: &str) -> Option<&BlockPool<'a>> {
        match find(&self.pools, name)? {
            PoolSlot::Local(pool) => Some(pool),
            PoolSlot::Shared(_) => None,
        }
    }

    /// Lock-free pool named `name`.
    #[must_use]
    pub fn concurrent_pool(&self, name: &str) -> Option<&ConcurrentBlockPool<'a>> {
        match find(&self.pools, name)? {
            PoolSlot::Shared(pool) => Some(pool),
            PoolSlot::Local(_) => None,
        }
    }

    /// Single-threaded handle allocator named `name`.
    #[must_use]
    pub fn handles(&self, name: &str) -> Option<&IndexAllocator<'a>> {
        match find(&self.handles, name)? {
            HandleSlot::Local(handles) => Some(handles),
            HandleSlot::Shared(_) => None,
        }
    }

    /// Lock-free handle allocator named `name`.
    #[must_use]
    pub fn concurrent_handles(&self, name: &str) -> Option<&ConcurrentIndexAllocator<'a>> {
        match find(&self.handles, name)? {
            HandleSlot::Shared(handles) => Some(handles),
            HandleSlot::Local(_) => None,
        }
    }

    /// The buddy allocator, serialized by a mutex the caller locks per use.
    #[must_use]
    pub fn buddy(&self) -> Option<&Mutex<BuddyAllocator<'a>>> {
        self.buddy.as_ref()
    }

    /// Single-threaded scratch allocator.
    #[must_use]
    pub fn scratch(&self) -> Option<&LinearAllocator<'a>> {
        match self.scratch.as_ref()? {
            ScratchSlot::Local(scratch) => Some(scratch),
            ScratchSlot::Shared(_) => None,
        }
    }

    /// Lock-free scratch allocator.
    #[must_use]
    pub fn concurrent_scratch(&self) -> Option<&ConcurrentLinearAllocator<'a>> {
        match self.scratch.as_ref()? {
            ScratchSlot::Shared(scratch) => Some(scratch),
            ScratchSlot::Local(_) => None,
        }
    }

    /// Rewinds the scratch allocator for the next tick.
    pub fn reset_scratch(&mut self) {
        match &mut self.scratch {
            Some(ScratchSlot::Local(scratch)) => scratch.reset(),
            Some(ScratchSlot::Shared(scratch)) => scratch.reset(),
            None => {}
        }
    }

    /// Tears every allocator down in reverse construction order.
    ///
    /// # Panics
    ///
    /// Panics if any allocator still has live allocations.
    pub fn teardown(self) {
        drop(self);
    }
}

impl Drop for AllocatorContext<'_> {
    fn drop(&mut self) {
        if let Some(scratch) = self.scratch.take() {
            tracing::info!("tearing down scratch allocator");
            drop(scratch);
        }
        if let Some(buddy) = self.buddy.take() {
            tracing::info!("tearing down buddy allocator");
            buddy.into_inner().deinitialize();
        }
        while let Some(entry) = self.handles.pop() {
            tracing::info!(name = %entry.name, "tearing down handle allocator");
            match entry.hosted {
                HandleSlot::Local(handles) => handles.deinitialize(),
                HandleSlot::Shared(handles) => handles.deinitialize(),
            }
        }
        while let Some(entry) = self.pools.pop() {
            tracing::info!(name = %entry.name, "tearing down pool");
            match entry.hosted {
                PoolSlot::Local(pool) => pool.deinitialize(),
                PoolSlot::Shared(pool) => pool.deinitialize(),
            }
        }
    }
}

impl std::fmt::Debug for AllocatorContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllocatorContext")
            .field("pools", &self.pools.iter().map(|e| e.name.as_str()).collect::<Vec<_>>())
            .field("handles", &self.handles.iter().map(|e| e.name.as_str()).collect::<Vec<_>>())
            .field("buddy", &self.buddy.is_some())
            .field("scratch", &self.scratch.is_some())
            .finish()
    }
}
