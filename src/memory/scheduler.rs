use std::collections::HashMap;

use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::layout;
use crate::memory::allocator::AllocatorMap;
use crate::memory::buffers::{
    Allocation, BufferId, LogicalBuffer, MemoryRegion, ParentDesc, PhysicalBuffer, PhysicalId,
};
use crate::model::{DataType, Graph, InputRef, NodeAttributes, NodeId, OpKind, OutputRef, Shape};
use crate::target::Target;

/// Final placement of one output connector's value
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct BufferAllocation {
    pub region: MemoryRegion,
    pub data_type: DataType,
    /// Byte size of this value's own extent
    pub size_bytes: usize,
    pub shape: Shape,
    /// The enclosing shape when the value is a strict sub-rectangle of a
    /// larger buffer; equal to `shape` otherwise
    pub parent_shape: Shape,
    /// Row-major strides of `parent_shape`, in elements
    pub strides: Shape,
    /// Byte offset inside the region's address space
    pub start_byte: usize,
}

/// Output of a `schedule` call
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScheduleResult {
    /// Nodes to execute at runtime, in order; alias-folded operators are
    /// absent
    pub compute_sequence: Vec<NodeId>,
    /// Placement of every live output connector
    pub allocations: HashMap<OutputRef, BufferAllocation>,
    /// Peak bytes per region
    pub max_usages: HashMap<MemoryRegion, usize>,
}

/// One allocation row of a schedule summary
#[derive(Debug, Clone, serde::Serialize)]
pub struct AllocationRecord {
    pub node: String,
    pub output_index: usize,
    #[serde(flatten)]
    pub allocation: BufferAllocation,
}

/// Per-region peak usage row of a schedule summary
#[derive(Debug, Clone, serde::Serialize)]
pub struct RegionUsage {
    pub region: MemoryRegion,
    pub bytes: usize,
}

/// Flattened, serializable view of a schedule for downstream tooling
#[derive(Debug, Clone, serde::Serialize)]
pub struct ScheduleSummary {
    pub compute_sequence: Vec<String>,
    pub allocations: Vec<AllocationRecord>,
    pub max_usages: Vec<RegionUsage>,
}

impl ScheduleResult {
    /// Flatten the schedule into name-keyed, deterministically ordered rows
    pub fn summary(&self, graph: &Graph) -> ScheduleSummary {
        let compute_sequence = self
            .compute_sequence
            .iter()
            .map(|&id| graph.node(id).name.clone())
            .collect();

        let mut keys: Vec<OutputRef> = self.allocations.keys().copied().collect();
        keys.sort();
        let allocations = keys
            .into_iter()
            .map(|conn| AllocationRecord {
                node: graph.node(conn.node).name.clone(),
                output_index: conn.index,
                allocation: self.allocations[&conn].clone(),
            })
            .collect();

        let mut max_usages: Vec<RegionUsage> = self
            .max_usages
            .iter()
            .map(|(&region, &bytes)| RegionUsage { region, bytes })
            .collect();
        max_usages.sort_by_key(|usage| usage.region);

        ScheduleSummary {
            compute_sequence,
            allocations,
            max_usages,
        }
    }
}

/// Initial region of an output connector's value
fn decide_memory_region(graph: &Graph, conn: OutputRef) -> MemoryRegion {
    match graph.node(conn.node).op {
        OpKind::Input => MemoryRegion::Input,
        OpKind::Constant => MemoryRegion::Rdata,
        _ => {
            let consumers = &graph.output(conn).consumers;
            if consumers
                .iter()
                .any(|c| matches!(graph.node(c.node).op, OpKind::Output))
            {
                MemoryRegion::Output
            } else {
                MemoryRegion::Data
            }
        }
    }
}

/// Memory scheduler over a frozen graph.
///
/// Runs as a pipeline of passes rooted at the graph's output connectors:
/// logical buffer construction, alias analysis, concat index fixing,
/// lifetime fixing, compute-sequence emission, physical buffer
/// materialization, region allocation and allocation assignment. The graph
/// is only mutated through `ACTION` attribute clearance.
pub struct Scheduler<'g> {
    graph: &'g mut Graph,
    order: Vec<NodeId>,
    logical_buffers: Vec<LogicalBuffer>,
    buffer_map: HashMap<OutputRef, BufferId>,
    physical_buffers: Vec<PhysicalBuffer>,
}

/// Schedule a graph against a target's allocators
pub fn schedule(graph: &mut Graph, target: &dyn Target) -> Result<ScheduleResult> {
    Scheduler::new(graph)?.schedule(target)
}

impl<'g> Scheduler<'g> {
    /// Create a scheduler rooted at the graph's output connectors
    pub fn new(graph: &'g mut Graph) -> Result<Self> {
        let outputs = graph.output_connectors();
        if outputs.is_empty() {
            return Err(Error::InvalidGraph(
                "graph has no output connectors to schedule".to_string(),
            ));
        }
        let order = graph.execution_order(&outputs)?;
        Ok(Self {
            graph,
            order,
            logical_buffers: Vec::new(),
            buffer_map: HashMap::new(),
            physical_buffers: Vec::new(),
        })
    }

    /// Run every pass and produce the schedule
    pub fn schedule(mut self, target: &dyn Target) -> Result<ScheduleResult> {
        let mut result = ScheduleResult::default();

        self.make_logical_buffers()?;
        self.analyze_buffer_alias()?;
        self.fix_concat_indices()?;
        self.fix_lifetime()?;
        self.generate_compute_sequence(&mut result);
        self.make_physical_buffers()?;
        self.allocate_physical_buffers(target, &mut result)?;
        self.assign_allocations(&mut result)?;

        Ok(result)
    }

    fn buffer_id(&self, conn: OutputRef) -> Result<BufferId> {
        self.buffer_map.get(&conn).copied().ok_or_else(|| {
            Error::InvalidGraph(format!(
                "no logical buffer recorded for output {} of node '{}'",
                conn.index,
                self.graph.node(conn.node).name
            ))
        })
    }

    fn input_connection(&self, input: InputRef) -> Result<OutputRef> {
        self.graph.connection(input).ok_or_else(|| {
            Error::InvalidGraph(format!(
                "input {} of node '{}' has no upstream producer",
                input.index,
                self.graph.node(input.node).name
            ))
        })
    }

    /// Pass 1: create one logical buffer per live output connector and
    /// record its lifetime under a logical age clock.
    ///
    /// Visiting a node creates buffers for its outputs, advances the clock
    /// by one (aging every live buffer), then releases one use of each
    /// consumed buffer. Buffers feeding graph outputs are never released,
    /// since output sinks are not part of the walk.
    fn make_logical_buffers(&mut self) -> Result<()> {
        let order = self.order.clone();
        let mut cnt_age = 0;
        for &node_id in &order {
            for index in 0..self.graph.node(node_id).outputs.len() {
                self.allocate_buffer(OutputRef { node: node_id, index }, cnt_age);
            }

            cnt_age += 1;
            for buffer in &mut self.logical_buffers {
                if buffer.lifetime.is_alive() {
                    buffer.lifetime.age += 1;
                }
            }

            for index in 0..self.graph.node(node_id).inputs.len() {
                let conn = self.input_connection(InputRef { node: node_id, index })?;
                self.release_buffer(conn)?;
            }
        }
        debug!(buffers = self.logical_buffers.len(), ages = cnt_age, "recorded logical buffers");
        Ok(())
    }

    fn allocate_buffer(&mut self, conn: OutputRef, birth: usize) {
        if self.buffer_map.contains_key(&conn) {
            return;
        }
        let out = self.graph.output(conn);
        let id = self.logical_buffers.len();
        let mut buffer = LogicalBuffer::new(
            id,
            conn,
            decide_memory_region(self.graph, conn),
            out.data_type,
            out.shape.clone(),
        );
        buffer.lifetime.birth = birth;
        buffer.lifetime.used_count = out.consumers.len();
        self.buffer_map.insert(conn, id);
        self.logical_buffers.push(buffer);
    }

    fn release_buffer(&mut self, conn: OutputRef) -> Result<()> {
        if let Some(&id) = self.buffer_map.get(&conn) {
            let lifetime = &mut self.logical_buffers[id].lifetime;
            if !lifetime.is_alive() {
                return Err(Error::LifetimeViolation(format!(
                    "buffer {} released after its use count reached zero",
                    id
                )));
            }
            lifetime.used_count -= 1;
        }
        Ok(())
    }

    /// Pass 2: record parent/offset aliases for layout-preserving operators
    /// and clear their `ACTION` attribute so they compile to no runtime
    /// work.
    fn analyze_buffer_alias(&mut self) -> Result<()> {
        let order = self.order.clone();
        for &node_id in &order {
            match self.graph.node(node_id).op.clone() {
                OpKind::Bitcast => self.alias_bitcast(node_id)?,
                OpKind::Concat { axis } => self.alias_concat(node_id, axis)?,
                _ => {}
            }
        }
        Ok(())
    }

    fn alias_bitcast(&mut self, node_id: NodeId) -> Result<()> {
        let input = self.input_connection(InputRef { node: node_id, index: 0 })?;
        let output = OutputRef { node: node_id, index: 0 };
        let in_id = self.buffer_id(input)?;
        let out_id = self.buffer_id(output)?;

        // A bitcast into the output region pulls its producer there, so the
        // producer writes the output bytes directly.
        if self.logical_buffers[out_id].region == MemoryRegion::Output
            && self.logical_buffers[in_id].region == MemoryRegion::Data
        {
            self.logical_buffers[in_id].region = MemoryRegion::Output;
            trace!(node = %self.graph.node(node_id).name, "promoted bitcast producer to output region");
        }

        // Input and rdata sources must be physically copied into the output
        // region; every other combination shares storage.
        let out_region = self.logical_buffers[out_id].region;
        let in_region = self.logical_buffers[in_id].region;
        if out_region != MemoryRegion::Output
            || (in_region != MemoryRegion::Input && in_region != MemoryRegion::Rdata)
        {
            let rank = self.logical_buffers[in_id].shape.len();
            self.logical_buffers[out_id].parent = Some(ParentDesc {
                buffer: in_id,
                begin: vec![0; rank],
            });
            self.graph.clear_action(node_id);
            trace!(node = %self.graph.node(node_id).name, "folded bitcast");
        }
        Ok(())
    }

    fn alias_concat(&mut self, node_id: NodeId, axis: usize) -> Result<()> {
        let input_count = self.graph.node(node_id).inputs.len();
        if input_count == 0 {
            return Err(Error::InvalidGraph(format!(
                "concat '{}' has no inputs",
                self.graph.node(node_id).name
            )));
        }

        // The concat must be a plain byte-append along the outermost varying
        // axis for its inputs to alias into the output.
        let first = self.input_connection(InputRef { node: node_id, index: 0 })?;
        let first_shape = &self.graph.output(first).shape;
        if axis >= first_shape.len() {
            return Err(Error::InvalidGraph(format!(
                "concat '{}' axis {} out of range for rank {}",
                self.graph.node(node_id).name,
                axis,
                first_shape.len()
            )));
        }
        if axis != 0 && !first_shape[..axis].iter().all(|&dim| dim == 1) {
            return Ok(());
        }

        // Input and rdata sources must be copied, and slice outputs are
        // already sub-rectangles of something else.
        for index in 0..input_count {
            let conn = self.input_connection(InputRef { node: node_id, index })?;
            let buffer = &self.logical_buffers[self.buffer_id(conn)?];
            if matches!(buffer.region, MemoryRegion::Input | MemoryRegion::Rdata) {
                return Ok(());
            }
            if matches!(self.graph.node(conn.node).op, OpKind::Slice) {
                return Ok(());
            }
        }

        // Two concat consumers would both claim this output as their child;
        // the parent relation could not stay a forest.
        let output = OutputRef { node: node_id, index: 0 };
        let concat_consumers = self
            .graph
            .output(output)
            .consumers
            .iter()
            .filter(|c| matches!(self.graph.node(c.node).op, OpKind::Concat { .. }))
            .count();
        if concat_consumers >= 2 {
            return Ok(());
        }

        // Parent offsets are filled by the index-fixing pass.
        self.graph.clear_action(node_id);
        trace!(node = %self.graph.node(node_id).name, "folded concat");
        Ok(())
    }

    /// Pass 3: compute per-input offsets of folded concats and collapse
    /// chains of folded concats onto their final output buffer.
    fn fix_concat_indices(&mut self) -> Result<()> {
        let order = self.order.clone();
        for &node_id in &order {
            let OpKind::Concat { axis } = self.graph.node(node_id).op else {
                continue;
            };
            if self.graph.node(node_id).attributes.contains(NodeAttributes::ACTION) {
                continue;
            }

            // Initial indices: each input starts where the previous one ends
            // along the concat axis.
            let out_conn = OutputRef { node: node_id, index: 0 };
            let out_id = self.buffer_id(out_conn)?;
            let input_count = self.graph.node(node_id).inputs.len();
            let mut input_ids = Vec::with_capacity(input_count);
            let mut cnt_begin = vec![0; self.logical_buffers[out_id].shape.len()];
            for index in 0..input_count {
                let conn = self.input_connection(InputRef { node: node_id, index })?;
                let in_id = self.buffer_id(conn)?;
                self.logical_buffers[in_id].parent = Some(ParentDesc {
                    buffer: out_id,
                    begin: cnt_begin.clone(),
                });
                cnt_begin[axis] += self.logical_buffers[in_id].shape[axis];
                input_ids.push(in_id);
            }

            // Chain collapsing: while this concat's output feeds another
            // folded concat, re-parent this concat and its inputs one hop
            // up, adding the prefix offset of this output among the parent's
            // inputs. Offsets compose additively because every hop appends
            // along the outer-contiguous axis.
            let mut child = node_id;
            loop {
                let Some((parent, parent_axis)) = self.folded_concat_consumer(child) else {
                    break;
                };
                let child_out = OutputRef { node: child, index: 0 };
                let parent_inputs = self.graph.node(parent).inputs.len();
                let mut prefix = 0;
                let mut child_index = None;
                for index in 0..parent_inputs {
                    let conn = self.input_connection(InputRef { node: parent, index })?;
                    if conn == child_out {
                        child_index = Some(index);
                        break;
                    }
                    prefix += self.graph.output(conn).shape[parent_axis];
                }
                if child_index.is_none() {
                    return Err(Error::InvalidGraph(format!(
                        "concat '{}' does not consume the output of '{}'",
                        self.graph.node(parent).name,
                        self.graph.node(child).name
                    )));
                }

                let mut child_begin = vec![0; self.graph.output(child_out).shape.len()];
                child_begin[parent_axis] += prefix;

                let child_buf = self.buffer_id(child_out)?;
                let parent_buf = self.buffer_id(OutputRef { node: parent, index: 0 })?;
                self.logical_buffers[child_buf].parent = Some(ParentDesc {
                    buffer: parent_buf,
                    begin: child_begin.clone(),
                });
                for &in_id in &input_ids {
                    if let Some(desc) = self.logical_buffers[in_id].parent.as_mut() {
                        desc.buffer = parent_buf;
                        for (offset, step) in desc.begin.iter_mut().zip(child_begin.iter()) {
                            *offset += step;
                        }
                    }
                }

                child = parent;
            }
        }
        Ok(())
    }

    /// The folded concat consuming `node`'s output, if there is one
    fn folded_concat_consumer(&self, node: NodeId) -> Option<(NodeId, usize)> {
        let output = OutputRef { node, index: 0 };
        for consumer in &self.graph.output(output).consumers {
            let consumer_node = self.graph.node(consumer.node);
            if let OpKind::Concat { axis } = consumer_node.op {
                if consumer_node.attributes.contains(NodeAttributes::ACTION) {
                    return None;
                }
                return Some((consumer.node, axis));
            }
        }
        None
    }

    /// Pass 4: compress every parent chain to its root, then widen each
    /// root's lifetime to cover all of its aliases.
    fn fix_lifetime(&mut self) -> Result<()> {
        // Concat offsets are already accumulated to the chain root, so a
        // non-root ancestor's descriptor can be adopted wholesale. A cycle
        // here means the chain collapsing above mis-parented something.
        for id in 0..self.logical_buffers.len() {
            let mut steps = 0;
            while let Some(desc) = self.logical_buffers[id].parent.clone() {
                let Some(grand) = self.logical_buffers[desc.buffer].parent.clone() else {
                    break;
                };
                debug_assert!(
                    steps <= self.logical_buffers.len(),
                    "cycle in buffer parent chain"
                );
                if steps > self.logical_buffers.len() {
                    return Err(Error::InvalidGraph(
                        "cycle detected in buffer parent chain".to_string(),
                    ));
                }
                self.logical_buffers[id].parent = Some(grand);
                steps += 1;
            }
        }

        // Aliased storage must stay live across every view of it.
        for id in 0..self.logical_buffers.len() {
            let Some(desc) = self.logical_buffers[id].parent.clone() else {
                continue;
            };
            let lifetime = self.logical_buffers[id].lifetime;
            let root = &mut self.logical_buffers[desc.buffer].lifetime;
            let birth = lifetime.birth.min(root.birth);
            let end = lifetime.end().max(root.end());
            root.birth = birth;
            root.age = end - birth;
        }
        Ok(())
    }

    /// Pass 5: emit every node whose `ACTION` attribute survived, in
    /// topological order.
    fn generate_compute_sequence(&self, result: &mut ScheduleResult) {
        for &node_id in &self.order {
            if self.graph.node(node_id).attributes.contains(NodeAttributes::ACTION) {
                result.compute_sequence.push(node_id);
            }
        }
        debug!(nodes = result.compute_sequence.len(), "generated compute sequence");
    }

    /// Pass 6: one physical buffer per aliasing root; every non-root points
    /// at its root's physical buffer.
    fn make_physical_buffers(&mut self) -> Result<()> {
        for id in 0..self.logical_buffers.len() {
            if self.logical_buffers[id].parent.is_some() {
                continue;
            }
            let physical_id = self.physical_buffers.len();
            let buffer = &self.logical_buffers[id];
            self.physical_buffers.push(PhysicalBuffer {
                id: physical_id,
                owner: id,
                region: buffer.region,
                size_bytes: layout::size_in_bytes(buffer.data_type, &buffer.shape)?,
                lifetime: buffer.lifetime,
                allocation: None,
            });
            self.logical_buffers[id].physical = Some(physical_id);
        }

        for id in 0..self.logical_buffers.len() {
            if let Some(desc) = self.logical_buffers[id].parent.clone() {
                self.logical_buffers[id].physical = self.logical_buffers[desc.buffer].physical;
            }
        }
        debug!(physical = self.physical_buffers.len(), "materialized physical buffers");
        Ok(())
    }

    /// Pass 7a: feed every physical buffer to its region's allocator in
    /// birth order (ids break ties) and collect placements and peaks.
    fn allocate_physical_buffers(
        &mut self,
        target: &dyn Target,
        result: &mut ScheduleResult,
    ) -> Result<()> {
        let mut allocators: AllocatorMap = HashMap::new();
        target.register_allocators(&mut allocators);

        let mut order: Vec<PhysicalId> = (0..self.physical_buffers.len()).collect();
        order.sort_by_key(|&id| (self.physical_buffers[id].lifetime.birth, id));

        for &id in &order {
            let buffer = &self.physical_buffers[id];
            let allocator = allocators.get_mut(&buffer.region).ok_or_else(|| {
                Error::InvalidGraph(format!(
                    "target registered no allocator for region {:?}",
                    buffer.region
                ))
            })?;
            allocator.mark(buffer)?;
        }

        for (&region, allocator) in allocators.iter_mut() {
            allocator.finish()?;
            result.max_usages.insert(region, allocator.max_usage());
            debug!(?region, peak = allocator.max_usage(), "region allocation finished");
        }

        for buffer in &mut self.physical_buffers {
            let allocator = allocators.get(&buffer.region).ok_or_else(|| {
                Error::InvalidGraph(format!(
                    "target registered no allocator for region {:?}",
                    buffer.region
                ))
            })?;
            let allocation = allocator.allocations().get(&buffer.id).ok_or_else(|| {
                Error::InvalidAllocatorState(format!(
                    "allocator returned no placement for physical buffer {}",
                    buffer.id
                ))
            })?;
            buffer.allocation = Some(*allocation);
        }
        Ok(())
    }

    /// Pass 7b: translate allocator placements plus alias offsets into the
    /// final per-connector allocation records.
    fn assign_allocations(&self, result: &mut ScheduleResult) -> Result<()> {
        for &node_id in &self.order {
            for index in 0..self.graph.node(node_id).outputs.len() {
                let conn = OutputRef { node: node_id, index };
                let buffer = &self.logical_buffers[self.buffer_id(conn)?];
                let physical_id = buffer.physical.ok_or_else(|| {
                    Error::InvalidGraph(format!(
                        "logical buffer {} was never materialized",
                        buffer.id
                    ))
                })?;
                let physical = &self.physical_buffers[physical_id];
                let root = &self.logical_buffers[physical.owner];
                let allocation: Allocation = physical.allocation.ok_or_else(|| {
                    Error::InvalidAllocatorState(format!(
                        "physical buffer {} has no placement",
                        physical.id
                    ))
                })?;

                // A bitcast shares storage at a different shape, but its
                // consumers index in the bitcast's own shape.
                let is_bitcast = matches!(self.graph.node(node_id).op, OpKind::Bitcast);
                let parent_shape = if buffer.parent.is_some() && !is_bitcast {
                    root.shape.clone()
                } else {
                    buffer.shape.clone()
                };
                let strides = layout::contiguous_strides(&parent_shape);

                let mut start_byte = allocation.start;
                if let Some(desc) = &buffer.parent {
                    start_byte += buffer.data_type.size_in_bytes()
                        * layout::element_offset(&strides, &desc.begin);
                }

                result.allocations.insert(
                    conn,
                    BufferAllocation {
                        region: root.region,
                        data_type: buffer.data_type,
                        size_bytes: layout::size_in_bytes(buffer.data_type, &buffer.shape)?,
                        shape: buffer.shape.clone(),
                        parent_shape,
                        strides,
                        start_byte,
                    },
                );
            }
        }
        Ok(())
    }
}
