use std::collections::HashSet;

use crate::error::{Error, Result};

/// Unique identifier for a node in the graph
pub type NodeId = usize;

/// Shape of a tensor value
pub type Shape = Vec<usize>;

/// Element types the scheduler distinguishes when sizing buffers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum DataType {
    Float16,
    BFloat16,
    Float32,
    Float64,
    Int8,
    Int16,
    Int32,
    Int64,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Bool,
}

impl DataType {
    /// Get the size in bytes
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DataType::Float16 => 2,
            DataType::BFloat16 => 2,
            DataType::Float32 => 4,
            DataType::Float64 => 8,
            DataType::Int8 => 1,
            DataType::Int16 => 2,
            DataType::Int32 => 4,
            DataType::Int64 => 8,
            DataType::Uint8 => 1,
            DataType::Uint16 => 2,
            DataType::Uint32 => 4,
            DataType::Uint64 => 8,
            DataType::Bool => 1,
        }
    }
}

/// Operator kind of a node.
///
/// Only the opcodes the scheduler inspects are reified as variants; every
/// other executable operator is carried opaquely as `Compute` with its
/// operator name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpKind {
    /// Graph input placeholder, bound by the caller at runtime
    Input,
    /// Graph output sink, bound by the caller at runtime
    Output,
    /// Weight or other constant serialized with the model
    Constant,
    /// Pure reshape with no data movement
    Bitcast,
    /// Concatenation along `axis`
    Concat { axis: usize },
    /// Sub-rectangle extraction
    Slice,
    /// Opaque executable operator (Add, MatMul, ...)
    Compute(String),
}

impl OpKind {
    /// Whether a node of this kind performs runtime work when scheduled
    pub fn performs_work(&self) -> bool {
        !matches!(self, OpKind::Input | OpKind::Output | OpKind::Constant)
    }
}

/// Per-node attribute bitset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NodeAttributes(u32);

impl NodeAttributes {
    pub const NONE: NodeAttributes = NodeAttributes(0);
    /// The node must execute at runtime; cleared when an operator is folded
    /// into an aliasing relationship.
    pub const ACTION: NodeAttributes = NodeAttributes(1 << 0);

    pub fn contains(self, other: NodeAttributes) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: NodeAttributes) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: NodeAttributes) {
        self.0 &= !other.0;
    }
}

/// Address of a value-producing endpoint: output `index` of node `node`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OutputRef {
    pub node: NodeId,
    pub index: usize,
}

/// Address of a value-consuming endpoint: input `index` of node `node`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InputRef {
    pub node: NodeId,
    pub index: usize,
}

/// A value-consuming endpoint and its upstream connection
#[derive(Debug, Clone)]
pub struct InputConnector {
    pub connection: Option<OutputRef>,
}

/// A value-producing endpoint
#[derive(Debug, Clone)]
pub struct OutputConnector {
    pub data_type: DataType,
    pub shape: Shape,
    /// Input connectors consuming this value, in wiring order
    pub consumers: Vec<InputRef>,
}

/// A node in the computation graph
#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub op: OpKind,
    pub attributes: NodeAttributes,
    pub inputs: Vec<InputConnector>,
    pub outputs: Vec<OutputConnector>,
}

/// A frozen computation graph.
///
/// Nodes are stored in an arena and addressed by insertion-order ids; the
/// builder methods keep producer/consumer links consistent in both
/// directions. An importer builds the graph, the scheduler only reads it
/// (aside from clearing `ACTION` attributes).
#[derive(Debug, Clone, Default)]
pub struct Graph {
    pub nodes: Vec<Node>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node, wiring its input connectors to the given upstream outputs
    pub fn add_node(
        &mut self,
        name: impl Into<String>,
        op: OpKind,
        inputs: &[OutputRef],
        outputs: Vec<(DataType, Shape)>,
    ) -> NodeId {
        let id = self.nodes.len();
        let attributes = if op.performs_work() {
            NodeAttributes::ACTION
        } else {
            NodeAttributes::NONE
        };

        let mut input_connectors = Vec::with_capacity(inputs.len());
        for (index, &conn) in inputs.iter().enumerate() {
            input_connectors.push(InputConnector { connection: Some(conn) });
            self.nodes[conn.node].outputs[conn.index]
                .consumers
                .push(InputRef { node: id, index });
        }

        self.nodes.push(Node {
            id,
            name: name.into(),
            op,
            attributes,
            inputs: input_connectors,
            outputs: outputs
                .into_iter()
                .map(|(data_type, shape)| OutputConnector {
                    data_type,
                    shape,
                    consumers: Vec::new(),
                })
                .collect(),
        });
        id
    }

    /// Add a graph input placeholder
    pub fn add_input(&mut self, name: impl Into<String>, data_type: DataType, shape: Shape) -> OutputRef {
        let node = self.add_node(name, OpKind::Input, &[], vec![(data_type, shape)]);
        OutputRef { node, index: 0 }
    }

    /// Add a constant tensor
    pub fn add_constant(&mut self, name: impl Into<String>, data_type: DataType, shape: Shape) -> OutputRef {
        let node = self.add_node(name, OpKind::Constant, &[], vec![(data_type, shape)]);
        OutputRef { node, index: 0 }
    }

    /// Add an opaque executable operator with a single output
    pub fn add_compute(
        &mut self,
        name: impl Into<String>,
        op_type: impl Into<String>,
        inputs: &[OutputRef],
        data_type: DataType,
        shape: Shape,
    ) -> OutputRef {
        let node = self.add_node(name, OpKind::Compute(op_type.into()), inputs, vec![(data_type, shape)]);
        OutputRef { node, index: 0 }
    }

    /// Add a reshape-only bitcast; the element type is inherited from the input
    pub fn add_bitcast(&mut self, name: impl Into<String>, input: OutputRef, shape: Shape) -> OutputRef {
        let data_type = self.output(input).data_type;
        let node = self.add_node(name, OpKind::Bitcast, &[input], vec![(data_type, shape)]);
        OutputRef { node, index: 0 }
    }

    /// Add a concatenation along `axis`; the output shape is derived from the
    /// inputs, which must agree on rank and on every non-axis dimension.
    pub fn add_concat(&mut self, name: impl Into<String>, axis: usize, inputs: &[OutputRef]) -> Result<OutputRef> {
        let first = inputs
            .first()
            .ok_or_else(|| Error::InvalidGraph("concat requires at least one input".to_string()))?;
        let mut shape = self.output(*first).shape.clone();
        if axis >= shape.len() {
            return Err(Error::InvalidGraph(format!(
                "concat axis {} out of range for rank {}",
                axis,
                shape.len()
            )));
        }
        for conn in &inputs[1..] {
            let other = &self.output(*conn).shape;
            if other.len() != shape.len() {
                return Err(Error::InvalidGraph(format!(
                    "concat inputs disagree on rank: {} vs {}",
                    shape.len(),
                    other.len()
                )));
            }
            for (dim, (&a, &b)) in shape.iter().zip(other.iter()).enumerate() {
                if dim != axis && a != b {
                    return Err(Error::InvalidGraph(format!(
                        "concat inputs disagree on dimension {dim}: {a} vs {b}"
                    )));
                }
            }
            shape[axis] += other[axis];
        }
        let data_type = self.output(*first).data_type;
        let node = self.add_node(name, OpKind::Concat { axis }, inputs, vec![(data_type, shape)]);
        Ok(OutputRef { node, index: 0 })
    }

    /// Add a slice producing a sub-rectangle of the input
    pub fn add_slice(&mut self, name: impl Into<String>, input: OutputRef, shape: Shape) -> OutputRef {
        let data_type = self.output(input).data_type;
        let node = self.add_node(name, OpKind::Slice, &[input], vec![(data_type, shape)]);
        OutputRef { node, index: 0 }
    }

    /// Add a graph output sink consuming `input`
    pub fn add_output(&mut self, name: impl Into<String>, input: OutputRef) -> NodeId {
        self.add_node(name, OpKind::Output, &[input], Vec::new())
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    pub fn output(&self, conn: OutputRef) -> &OutputConnector {
        &self.nodes[conn.node].outputs[conn.index]
    }

    /// Upstream output connected to the given input, if any
    pub fn connection(&self, input: InputRef) -> Option<OutputRef> {
        self.nodes[input.node].inputs[input.index].connection
    }

    /// Clear the ACTION attribute on a node.
    ///
    /// The one graph mutation the scheduler performs.
    pub fn clear_action(&mut self, id: NodeId) {
        self.nodes[id].attributes.remove(NodeAttributes::ACTION);
    }

    /// The connectors feeding the graph's output sinks, in node id order
    pub fn output_connectors(&self) -> Vec<OutputRef> {
        let mut connectors = Vec::new();
        for node in &self.nodes {
            if matches!(node.op, OpKind::Output) {
                for input in &node.inputs {
                    if let Some(conn) = input.connection {
                        connectors.push(conn);
                    }
                }
            }
        }
        connectors
    }

    /// Topological order of the subgraph reachable from the given output
    /// connectors, producers strictly before consumers. Output sinks
    /// themselves are not part of the walk.
    pub fn execution_order(&self, outputs: &[OutputRef]) -> Result<Vec<NodeId>> {
        let mut visited = HashSet::new();
        let mut visiting = HashSet::new();
        let mut order = Vec::new();
        for conn in outputs {
            self.visit_producers(conn.node, &mut visited, &mut visiting, &mut order)?;
        }
        Ok(order)
    }

    fn visit_producers(
        &self,
        node_id: NodeId,
        visited: &mut HashSet<NodeId>,
        visiting: &mut HashSet<NodeId>,
        order: &mut Vec<NodeId>,
    ) -> Result<()> {
        if visited.contains(&node_id) {
            return Ok(());
        }
        if visiting.contains(&node_id) {
            return Err(Error::InvalidGraph(format!(
                "cycle detected at node '{}'",
                self.nodes[node_id].name
            )));
        }

        visiting.insert(node_id);
        for input in &self.nodes[node_id].inputs {
            if let Some(conn) = input.connection {
                self.visit_producers(conn.node, visited, visiting, order)?;
            }
        }
        visiting.remove(&node_id);
        visited.insert(node_id);
        order.push(node_id);

        Ok(())
    }
}
