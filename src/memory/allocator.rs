use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::memory::buffers::{Allocation, MemoryRegion, PhysicalBuffer, PhysicalId};

/// Alignment of every allocation start within a region
pub const ALLOCATION_ALIGNMENT: usize = 8;

/// Map from region to the allocator responsible for it.
///
/// The map owns the allocators; a target populates it once per schedule.
pub type AllocatorMap = HashMap<MemoryRegion, Box<dyn BufferAllocator>>;

/// Region allocator contract consumed by the scheduler.
///
/// `mark` must be called once per physical buffer, in buffer birth order.
/// After `finish`, no further `mark` calls are permitted and the final
/// placements can be queried. For two marked buffers with overlapping
/// lifetimes, implementations guarantee disjoint byte intervals.
pub trait BufferAllocator: Send + Sync {
    /// Reserve space for a buffer whose lifetime and size are known
    fn mark(&mut self, buffer: &PhysicalBuffer) -> Result<()>;

    /// Finalize; surfaces exhaustion of a bounded region
    fn finish(&mut self) -> Result<()>;

    /// Peak live bytes ever reserved
    fn max_usage(&self) -> usize;

    /// Final placements, keyed by physical buffer id
    fn allocations(&self) -> &HashMap<PhysicalId, Allocation>;
}

fn align_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

/// A byte range occupied until its buffer's lifetime ends
#[derive(Debug, Clone, Copy)]
struct LiveRange {
    start: usize,
    size: usize,
    /// Age after which the range may be reused
    end_age: usize,
}

impl LiveRange {
    fn end_offset(&self) -> usize {
        self.start + self.size
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FitPolicy {
    First,
    Best,
}

/// Shared free-list machinery behind the first-fit and best-fit allocators.
///
/// Because buffers arrive in birth order, releasing every range whose
/// lifetime ended at or before the incoming birth keeps the live set exact.
#[derive(Debug)]
struct FreeListState {
    policy: FitPolicy,
    capacity: Option<usize>,
    /// Live ranges, kept sorted by start offset
    live: Vec<LiveRange>,
    allocations: HashMap<PhysicalId, Allocation>,
    max_usage: usize,
    last_birth: usize,
    finished: bool,
}

impl FreeListState {
    fn new(policy: FitPolicy, capacity: Option<usize>) -> Self {
        Self {
            policy,
            capacity,
            live: Vec::new(),
            allocations: HashMap::new(),
            max_usage: 0,
            last_birth: 0,
            finished: false,
        }
    }

    fn mark(&mut self, buffer: &PhysicalBuffer) -> Result<()> {
        if self.finished {
            return Err(Error::InvalidAllocatorState(
                "mark called after finish".to_string(),
            ));
        }
        if buffer.lifetime.birth < self.last_birth {
            return Err(Error::InvalidAllocatorState(format!(
                "buffer {} marked out of birth order ({} after {})",
                buffer.id, buffer.lifetime.birth, self.last_birth
            )));
        }
        self.last_birth = buffer.lifetime.birth;

        // Ranges whose lifetime ended by this birth are free again.
        self.live.retain(|range| range.end_age > buffer.lifetime.birth);

        let size = align_up(buffer.size_bytes.max(1), ALLOCATION_ALIGNMENT);
        let start = self.find_start(size);

        let range = LiveRange {
            start,
            size,
            end_age: buffer.lifetime.end(),
        };
        let position = self
            .live
            .iter()
            .position(|r| r.start > start)
            .unwrap_or(self.live.len());
        self.live.insert(position, range);

        self.allocations.insert(buffer.id, Allocation { start, size });
        self.max_usage = self.max_usage.max(start + size);
        Ok(())
    }

    /// Choose a start offset for a range of `size` bytes among the gaps
    /// between live ranges, or past the last live range.
    fn find_start(&self, size: usize) -> usize {
        let mut chosen: Option<(usize, usize)> = None; // (start, gap size)
        let mut cursor = 0;
        for range in &self.live {
            if range.start > cursor {
                let gap = range.start - cursor;
                if gap >= size {
                    match self.policy {
                        FitPolicy::First => return cursor,
                        FitPolicy::Best => {
                            if chosen.map_or(true, |(_, best)| gap < best) {
                                chosen = Some((cursor, gap));
                            }
                        }
                    }
                }
            }
            cursor = cursor.max(range.end_offset());
        }
        match chosen {
            Some((start, _)) => start,
            None => cursor,
        }
    }

    fn finish(&mut self) -> Result<()> {
        self.finished = true;
        if let Some(capacity) = self.capacity {
            if self.max_usage > capacity {
                return Err(Error::AllocatorExhausted(format!(
                    "region needs {} bytes but is limited to {}",
                    self.max_usage, capacity
                )));
            }
        }
        Ok(())
    }
}

/// Lifetime-aware allocator taking the first adequate gap
#[derive(Debug)]
pub struct FirstFitAllocator {
    state: FreeListState,
}

impl FirstFitAllocator {
    pub fn new() -> Self {
        Self {
            state: FreeListState::new(FitPolicy::First, None),
        }
    }

    /// Bound the region to `capacity` bytes; exceeding it is reported by
    /// `finish`.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            state: FreeListState::new(FitPolicy::First, Some(capacity)),
        }
    }
}

impl Default for FirstFitAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferAllocator for FirstFitAllocator {
    fn mark(&mut self, buffer: &PhysicalBuffer) -> Result<()> {
        self.state.mark(buffer)
    }

    fn finish(&mut self) -> Result<()> {
        self.state.finish()
    }

    fn max_usage(&self) -> usize {
        self.state.max_usage
    }

    fn allocations(&self) -> &HashMap<PhysicalId, Allocation> {
        &self.state.allocations
    }
}

/// Lifetime-aware allocator taking the smallest adequate gap
#[derive(Debug)]
pub struct BestFitAllocator {
    state: FreeListState,
}

impl BestFitAllocator {
    pub fn new() -> Self {
        Self {
            state: FreeListState::new(FitPolicy::Best, None),
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            state: FreeListState::new(FitPolicy::Best, Some(capacity)),
        }
    }
}

impl Default for BestFitAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferAllocator for BestFitAllocator {
    fn mark(&mut self, buffer: &PhysicalBuffer) -> Result<()> {
        self.state.mark(buffer)
    }

    fn finish(&mut self) -> Result<()> {
        self.state.finish()
    }

    fn max_usage(&self) -> usize {
        self.state.max_usage
    }

    fn allocations(&self) -> &HashMap<PhysicalId, Allocation> {
        &self.state.allocations
    }
}

/// Bump allocator with no temporal reuse.
///
/// Used for regions whose buffers are all bound externally at once, where
/// reusing an address across disjoint lifetimes would alias distinct
/// bindings.
#[derive(Debug, Default)]
pub struct LinearAllocator {
    next: usize,
    capacity: Option<usize>,
    allocations: HashMap<PhysicalId, Allocation>,
    finished: bool,
}

impl LinearAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: Some(capacity),
            ..Self::default()
        }
    }
}

impl BufferAllocator for LinearAllocator {
    fn mark(&mut self, buffer: &PhysicalBuffer) -> Result<()> {
        if self.finished {
            return Err(Error::InvalidAllocatorState(
                "mark called after finish".to_string(),
            ));
        }
        let size = align_up(buffer.size_bytes.max(1), ALLOCATION_ALIGNMENT);
        self.allocations
            .insert(buffer.id, Allocation { start: self.next, size });
        self.next += size;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.finished = true;
        if let Some(capacity) = self.capacity {
            if self.next > capacity {
                return Err(Error::AllocatorExhausted(format!(
                    "region needs {} bytes but is limited to {}",
                    self.next, capacity
                )));
            }
        }
        Ok(())
    }

    fn max_usage(&self) -> usize {
        self.next
    }

    fn allocations(&self) -> &HashMap<PhysicalId, Allocation> {
        &self.allocations
    }
}
