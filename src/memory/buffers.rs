use crate::model::{DataType, OutputRef, Shape};

/// Index of a logical buffer in the scheduler's arena
pub type BufferId = usize;

/// Index of a physical buffer in the scheduler's arena
pub type PhysicalId = usize;

/// Logical memory region a buffer lives in.
///
/// Regions are the unit of allocation isolation: each has an independent
/// address space and its own allocator. `Input` and `Output` are bound to
/// caller-provided pointers, `Rdata` is serialized with the model, `Data`
/// is scratch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
pub enum MemoryRegion {
    Input,
    Rdata,
    Data,
    Output,
}

/// Liveness interval of a buffer in logical age units.
///
/// `birth` is the age at which the value first exists and `birth + age` the
/// age at which its last consumer has executed. `used_count` tracks the
/// remaining consumers during lifetime recording; a buffer is alive while it
/// is non-zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Lifetime {
    pub birth: usize,
    pub age: usize,
    pub used_count: usize,
}

impl Lifetime {
    pub fn end(&self) -> usize {
        self.birth + self.age
    }

    pub fn is_alive(&self) -> bool {
        self.used_count > 0
    }

    /// Whether two lifetime intervals share at least one age
    pub fn overlaps(&self, other: &Lifetime) -> bool {
        self.birth < other.end() && other.birth < self.end()
    }
}

/// "This buffer is a sub-rectangle of another": the enclosing buffer and the
/// per-axis offset of this buffer's origin within it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentDesc {
    pub buffer: BufferId,
    pub begin: Vec<usize>,
}

/// Abstract storage for one value on one IR edge
#[derive(Debug, Clone)]
pub struct LogicalBuffer {
    pub id: BufferId,
    /// The output connector this buffer belongs to
    pub owner: OutputRef,
    pub region: MemoryRegion,
    pub data_type: DataType,
    pub shape: Shape,
    pub lifetime: Lifetime,
    /// Present when this buffer aliases a sub-rectangle of another
    pub parent: Option<ParentDesc>,
    /// Back-pointer to the physical buffer, assigned at materialization
    pub physical: Option<PhysicalId>,
}

impl LogicalBuffer {
    pub fn new(id: BufferId, owner: OutputRef, region: MemoryRegion, data_type: DataType, shape: Shape) -> Self {
        Self {
            id,
            owner,
            region,
            data_type,
            shape,
            lifetime: Lifetime::default(),
            parent: None,
            physical: None,
        }
    }
}

/// Placement of a physical buffer inside its region's address space
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct Allocation {
    pub start: usize,
    pub size: usize,
}

/// Concrete storage shared by every logical buffer aliased to one root.
///
/// Region, byte size and lifetime are copied from the root logical buffer so
/// allocators can place the buffer without reaching back into the scheduler.
#[derive(Debug, Clone)]
pub struct PhysicalBuffer {
    pub id: PhysicalId,
    /// The root logical buffer this storage belongs to
    pub owner: BufferId,
    pub region: MemoryRegion,
    pub size_bytes: usize,
    pub lifetime: Lifetime,
    pub allocation: Option<Allocation>,
}
