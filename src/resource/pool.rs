use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::foundation::error::{BackdropError, BackdropResult};
use crate::foundation::memory::{Allocation, CostTier, MemoryArena};

/// The two resource kinds the cache provisions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize)]
pub enum ResourceClass {
    /// Uncompressed block bodies, `tableSize` bytes each.
    BlockStorage,
    /// Per-worker compositing scratch.
    CompositeContext,
}

impl ResourceClass {
    fn index(self) -> usize {
        match self {
            Self::BlockStorage => 0,
            Self::CompositeContext => 1,
        }
    }
}

/// Identity of a pinned resource: `blockLinearIndex * depth + depthOffset` for block storage.
///
/// The depth is also tagged into the high bits, so ids fixed at different depths never alias
/// one another.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(pub u64);

impl ResourceId {
    const READER_BIT: u64 = 1 << 63;
    const DEPTH_SHIFT: u32 = 44;

    /// Id of the block-storage resource backing `linear` at nesting level `offset`.
    pub fn for_block(linear: usize, depth: u32, offset: u32) -> Self {
        debug_assert!(offset < depth);
        let index = linear as u64 * u64::from(depth) + u64::from(offset);
        Self((u64::from(depth) << Self::DEPTH_SHIFT) | index)
    }

    /// Private id space for reloading spilled blocks on behalf of a reader.
    pub(crate) fn reader(owner: OwnerId) -> Self {
        Self(Self::READER_BIT | owner.0)
    }
}

/// Owner of fixed resources; one per compositing context.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OwnerId(pub u64);

/// A fixed (or retained) resource buffer.
#[derive(Clone)]
pub struct ResourceHandle {
    class: ResourceClass,
    slot: usize,
    generation: u64,
    id: ResourceId,
    buffer: Arc<Mutex<Box<[u8]>>>,
}

impl std::fmt::Debug for ResourceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceHandle")
            .field("class", &self.class)
            .field("slot", &self.slot)
            .field("id", &self.id)
            .finish()
    }
}

impl ResourceHandle {
    /// Identity this handle was fixed under.
    pub fn id(&self) -> ResourceId {
        self.id
    }

    /// Buffer length in bytes.
    pub fn len(&self) -> usize {
        self.buffer.lock().len()
    }

    /// `true` for zero-sized buffers.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read the buffer.
    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.buffer.lock())
    }

    /// Write the buffer.
    pub fn with_bytes_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        f(&mut self.buffer.lock())
    }

    pub(crate) fn same_buffer(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.buffer, &other.buffer)
    }
}

/// Result of [`ResourcePool::fix`].
#[derive(Debug)]
pub enum FixOutcome {
    /// Every requested id is pinned, in request order.
    Fixed(Vec<ResourceHandle>),
    /// The pool cannot grant the request within its maximum.
    Exhausted,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum EntryState {
    Free,
    Fixed(OwnerId),
    /// Unpinned but still backing a retained block.
    Retained,
}

struct Entry {
    id: Option<ResourceId>,
    state: EntryState,
    buffer: Arc<Mutex<Box<[u8]>>>,
    _alloc: Allocation,
}

#[derive(Default)]
struct PoolClass {
    generation: u64,
    entry_size: usize,
    min: usize,
    max: usize,
    entries: Vec<Option<Entry>>,
    by_id: HashMap<ResourceId, usize>,
    resizes: u64,
}

enum Pick {
    Existing(usize),
    Recycle(usize),
    New,
}

impl PoolClass {
    fn live(&self) -> usize {
        self.entries.iter().flatten().count()
    }

    fn count(&self, pred: impl Fn(EntryState) -> bool) -> usize {
        self.entries
            .iter()
            .flatten()
            .filter(|e| pred(e.state))
            .count()
    }

    fn held_by_others(&self, owner: OwnerId) -> bool {
        self.entries
            .iter()
            .flatten()
            .any(|e| matches!(e.state, EntryState::Fixed(o) if o != owner))
    }

    /// Plan slots for `ids`; `None` when the request cannot be satisfied right now.
    fn plan(&self, owner: OwnerId, ids: &[ResourceId]) -> Option<Vec<Pick>> {
        let mut taken = vec![false; self.entries.len()];
        let mut picks: Vec<Option<Pick>> = Vec::with_capacity(ids.len());

        for id in ids {
            match self.by_id.get(id).copied() {
                Some(i) => {
                    let entry = self.entries[i].as_ref()?;
                    match entry.state {
                        EntryState::Fixed(o) if o != owner => return None,
                        _ => {
                            taken[i] = true;
                            picks.push(Some(Pick::Existing(i)));
                        }
                    }
                }
                None => picks.push(None),
            }
        }

        let mut live = self.live();
        let mut free = self
            .entries
            .iter()
            .enumerate()
            .filter(|(i, e)| {
                !taken[*i] && e.as_ref().is_some_and(|e| e.state == EntryState::Free)
            })
            .map(|(i, _)| i);

        let mut out = Vec::with_capacity(ids.len());
        for pick in picks {
            let pick = match pick {
                Some(p) => p,
                None => match free.next() {
                    Some(i) => Pick::Recycle(i),
                    None if live < self.max => {
                        live += 1;
                        Pick::New
                    }
                    None => return None,
                },
            };
            out.push(pick);
        }
        Some(out)
    }
}

/// Bounded, thread-safe pool of identity-addressed buffers, shared across pages.
///
/// `fix` pins buffers for one owner, waiting while other owners hold entries and reporting
/// [`FixOutcome::Exhausted`] when the request can never fit. The pool never holds more than
/// `max` entries per class.
pub struct ResourcePool {
    arena: Arc<MemoryArena>,
    classes: Mutex<[PoolClass; 2]>,
    freed: Condvar,
}

impl std::fmt::Debug for ResourcePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourcePool").finish_non_exhaustive()
    }
}

impl ResourcePool {
    /// Empty pool charging its buffers to `arena`.
    pub fn new(arena: Arc<MemoryArena>) -> Arc<Self> {
        Arc::new(Self {
            arena,
            classes: Mutex::new(Default::default()),
            freed: Condvar::new(),
        })
    }

    /// Change the entry size; the pool gets a new identity and drops every free entry.
    pub fn resize(&self, class: ResourceClass, entry_size: usize) -> BackdropResult<()> {
        let mut classes = self.classes.lock();
        let c = &mut classes[class.index()];
        if c.entries.iter().flatten().any(|e| e.state != EntryState::Free) {
            return Err(BackdropError::validation(format!(
                "cannot resize {class:?} pool while resources are in use"
            )));
        }
        c.entries.clear();
        c.by_id.clear();
        c.generation += 1;
        c.entry_size = entry_size;
        c.resizes += 1;
        tracing::debug!(?class, entry_size, generation = c.generation, "resource pool resized");
        Ok(())
    }

    /// Set the bounds, pre-allocating up to `min` entries and trimming free ones above `max`.
    pub fn set_min_max(&self, class: ResourceClass, min: usize, max: usize) -> BackdropResult<()> {
        if min > max {
            return Err(BackdropError::validation(format!(
                "resource pool min {min} exceeds max {max}"
            )));
        }
        let mut classes = self.classes.lock();
        let c = &mut classes[class.index()];

        let mut live = c.live();
        for slot in c.entries.iter_mut() {
            if live <= max {
                break;
            }
            if slot.as_ref().is_some_and(|e| e.state == EntryState::Free) {
                if let Some(e) = slot.take()
                    && let Some(id) = e.id
                {
                    c.by_id.remove(&id);
                }
                live -= 1;
            }
        }

        while live < min {
            let entry = self.new_entry(c.entry_size)?;
            push_entry(c, entry);
            live += 1;
        }
        c.min = min;
        c.max = max;
        tracing::debug!(?class, min, max, "resource pool bounds updated");
        Ok(())
    }

    /// Pin buffers for `ids` on behalf of `owner`, all or nothing.
    ///
    /// Ids the owner already holds, and retained entries with a matching id, are reused as-is.
    pub fn fix(
        &self,
        class: ResourceClass,
        owner: OwnerId,
        ids: &[ResourceId],
        timeout: Duration,
    ) -> BackdropResult<FixOutcome> {
        let deadline = Instant::now() + timeout;
        let mut classes = self.classes.lock();

        loop {
            let c = &mut classes[class.index()];
            if ids.len() > c.max {
                return Ok(FixOutcome::Exhausted);
            }
            if let Some(picks) = c.plan(owner, ids) {
                let new_count = picks.iter().filter(|p| matches!(p, Pick::New)).count();
                let mut fresh = Vec::with_capacity(new_count);
                for _ in 0..new_count {
                    fresh.push(self.new_entry(c.entry_size)?);
                }

                let mut handles = Vec::with_capacity(ids.len());
                for (id, pick) in ids.iter().zip(picks) {
                    let slot = match pick {
                        Pick::Existing(i) | Pick::Recycle(i) => i,
                        Pick::New => match fresh.pop() {
                            Some(e) => push_entry(c, e),
                            None => unreachable!("planned entries were allocated"),
                        },
                    };
                    handles.push(assign(c, class, slot, *id, owner));
                }
                return Ok(FixOutcome::Fixed(handles));
            }

            if !c.held_by_others(owner) {
                return Ok(FixOutcome::Exhausted);
            }
            if self.freed.wait_until(&mut classes, deadline).timed_out() {
                return Ok(FixOutcome::Exhausted);
            }
        }
    }

    /// Return a fixed or retained entry to the free set.
    pub fn release(&self, handle: &ResourceHandle) {
        let mut classes = self.classes.lock();
        let c = &mut classes[handle.class.index()];
        if let Some(entry) = live_entry(c, handle) {
            entry.state = EntryState::Free;
        }
        drop(classes);
        self.freed.notify_all();
    }

    /// Unpin a fixed entry while its buffer keeps backing a block.
    ///
    /// Refused (returns `false`) when retaining it would leave fewer than `keep_free` entries
    /// available for fixing.
    pub fn detach(&self, handle: &ResourceHandle, keep_free: usize) -> bool {
        let mut classes = self.classes.lock();
        let c = &mut classes[handle.class.index()];
        let retained = c.count(|s| s == EntryState::Retained);
        if retained + 1 + keep_free > c.max {
            return false;
        }
        match live_entry(c, handle) {
            Some(entry) if matches!(entry.state, EntryState::Fixed(_)) => {
                entry.state = EntryState::Retained;
                drop(classes);
                self.freed.notify_all();
                true
            }
            _ => false,
        }
    }

    /// Entries currently pinned.
    pub fn fixed_count(&self, class: ResourceClass) -> usize {
        self.classes.lock()[class.index()].count(|s| matches!(s, EntryState::Fixed(_)))
    }

    /// Entries pinned by `owner`.
    pub fn fixed_by(&self, class: ResourceClass, owner: OwnerId) -> usize {
        self.classes.lock()[class.index()].count(|s| s == EntryState::Fixed(owner))
    }

    /// Entries backing retained blocks.
    pub fn retained_count(&self, class: ResourceClass) -> usize {
        self.classes.lock()[class.index()].count(|s| s == EntryState::Retained)
    }

    /// Entries currently allocated.
    pub fn live_count(&self, class: ResourceClass) -> usize {
        self.classes.lock()[class.index()].live()
    }

    /// `(min, max)` bounds.
    pub fn bounds(&self, class: ResourceClass) -> (usize, usize) {
        let classes = self.classes.lock();
        (classes[class.index()].min, classes[class.index()].max)
    }

    /// Current entry size.
    pub fn entry_size(&self, class: ResourceClass) -> usize {
        self.classes.lock()[class.index()].entry_size
    }

    /// How many times the class changed identity.
    pub fn resize_count(&self, class: ResourceClass) -> u64 {
        self.classes.lock()[class.index()].resizes
    }

    fn new_entry(&self, size: usize) -> BackdropResult<Entry> {
        let alloc = self.arena.try_alloc(size, CostTier::Moderate)?;
        Ok(Entry {
            id: None,
            state: EntryState::Free,
            buffer: Arc::new(Mutex::new(vec![0u8; size].into_boxed_slice())),
            _alloc: alloc,
        })
    }
}

fn push_entry(c: &mut PoolClass, entry: Entry) -> usize {
    if let Some(i) = c.entries.iter().position(Option::is_none) {
        c.entries[i] = Some(entry);
        i
    } else {
        c.entries.push(Some(entry));
        c.entries.len() - 1
    }
}

fn assign(
    c: &mut PoolClass,
    class: ResourceClass,
    slot: usize,
    id: ResourceId,
    owner: OwnerId,
) -> ResourceHandle {
    let generation = c.generation;
    let Some(entry) = c.entries[slot].as_mut() else {
        unreachable!("planned slot is live");
    };
    if let Some(old) = entry.id.replace(id)
        && old != id
    {
        c.by_id.remove(&old);
    }
    entry.state = EntryState::Fixed(owner);
    let buffer = Arc::clone(&entry.buffer);
    c.by_id.insert(id, slot);
    ResourceHandle {
        class,
        slot,
        generation,
        id,
        buffer,
    }
}

fn live_entry<'a>(c: &'a mut PoolClass, handle: &ResourceHandle) -> Option<&'a mut Entry> {
    if handle.generation != c.generation {
        return None;
    }
    c.entries
        .get_mut(handle.slot)?
        .as_mut()
        .filter(|e| Arc::ptr_eq(&e.buffer, &handle.buffer))
}

#[cfg(test)]
#[path = "../../tests/unit/resource/pool.rs"]
mod tests;
