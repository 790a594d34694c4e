pub mod allocator;
pub mod buffers;
pub mod scheduler;

pub use allocator::{
    AllocatorMap,
    BestFitAllocator,
    BufferAllocator,
    FirstFitAllocator,
    LinearAllocator,
    ALLOCATION_ALIGNMENT,
};

pub use buffers::{
    Allocation,
    BufferId,
    Lifetime,
    LogicalBuffer,
    MemoryRegion,
    ParentDesc,
    PhysicalBuffer,
    PhysicalId,
};

pub use scheduler::{
    schedule,
    AllocationRecord,
    BufferAllocation,
    RegionUsage,
    ScheduleResult,
    ScheduleSummary,
    Scheduler,
};
