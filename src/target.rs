use crate::memory::allocator::{AllocatorMap, FirstFitAllocator, LinearAllocator};
use crate::memory::buffers::MemoryRegion;

/// A compilation target supplying per-region allocators.
///
/// The scheduler asks the target to populate one allocator per region it
/// intends to place buffers in; the allocators' internal policy is opaque to
/// the scheduler.
pub trait Target: Send + Sync {
    fn register_allocators(&self, allocators: &mut AllocatorMap);
}

/// Default CPU target.
///
/// `Input`, `Rdata` and `Output` buffers are bound externally all at once,
/// so those regions use bump allocation; scratch `Data` buffers reuse
/// storage across disjoint lifetimes with a first-fit allocator.
#[derive(Debug, Default)]
pub struct CpuTarget {
    data_capacity: Option<usize>,
}

impl CpuTarget {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound the scratch data region to `capacity` bytes
    pub fn with_data_capacity(capacity: usize) -> Self {
        Self {
            data_capacity: Some(capacity),
        }
    }
}

impl Target for CpuTarget {
    fn register_allocators(&self, allocators: &mut AllocatorMap) {
        allocators.insert(MemoryRegion::Input, Box::new(LinearAllocator::new()));
        allocators.insert(MemoryRegion::Rdata, Box::new(LinearAllocator::new()));
        allocators.insert(MemoryRegion::Output, Box::new(LinearAllocator::new()));
        let data = match self.data_capacity {
            Some(capacity) => FirstFitAllocator::with_capacity(capacity),
            None => FirstFitAllocator::new(),
        };
        allocators.insert(MemoryRegion::Data, Box::new(data));
    }
}
