pub mod error;
pub mod layout;
pub mod memory;
pub mod model;
pub mod target;

// Re-export commonly used types
pub use error::{Error, Result};
pub use memory::allocator::{AllocatorMap, BestFitAllocator, BufferAllocator, FirstFitAllocator, LinearAllocator};
pub use memory::buffers::{Allocation, Lifetime, LogicalBuffer, MemoryRegion, PhysicalBuffer};
pub use memory::scheduler::{schedule, BufferAllocation, ScheduleResult, ScheduleSummary, Scheduler};
pub use model::{DataType, Graph, InputRef, Node, NodeAttributes, NodeId, OpKind, OutputRef, Shape};
pub use target::{CpuTarget, Target};
