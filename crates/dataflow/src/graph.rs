use mirrordb_value::Value;
use std::any::Any;
use std::collections::BTreeMap;

pub type Diff = i64;

/// One batch of multiset changes on a stream.
pub type Delta = Vec<(Value, Diff)>;

/// A stateful dataflow node.
///
/// `flush` consumes whatever has accumulated on the input ports since the
/// last step and appends the resulting output delta to `out`.
pub trait Operator: Send {
    fn flush(&mut self, inputs: &mut [Delta], out: &mut Delta);

    /// Downcast access for operators that carry out-of-band controls
    /// (the sliding window's `set_window`, the ordered state's cursor).
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

struct Node {
    op: Box<dyn Operator>,
    /// Input buffers, one per port.
    pending: Vec<Delta>,
    /// Downstream edges as (node, port).
    downstream: Vec<(NodeId, usize)>,
}

/// Builder enforcing that producers are created before their consumers, so
/// a single in-order pass per step suffices.
#[derive(Default)]
pub struct GraphBuilder {
    nodes: Vec<Node>,
    inputs: BTreeMap<String, NodeId>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a named input stream.
    pub fn add_input(&mut self, name: impl Into<String>) -> NodeId {
        let id = self.push(Box::new(crate::InputOp), 1);
        self.inputs.insert(name.into(), id);
        id
    }

    /// Add an operator fed by `upstream` (one port per upstream node, in
    /// order). All upstream nodes must already exist.
    pub fn add_node(&mut self, op: Box<dyn Operator>, upstream: &[NodeId]) -> NodeId {
        let id = self.push(op, upstream.len());
        for (port, &up) in upstream.iter().enumerate() {
            debug_assert!(up.0 < id.0, "edges must flow forward");
            self.nodes[up.0].downstream.push((id, port));
        }
        id
    }

    pub fn finish(self, output: NodeId) -> Graph {
        Graph {
            nodes: self.nodes,
            inputs: self.inputs,
            output,
        }
    }

    fn push(&mut self, op: Box<dyn Operator>, ports: usize) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            op,
            pending: vec![Vec::new(); ports.max(1)],
            downstream: Vec::new(),
        });
        id
    }
}

pub struct Graph {
    nodes: Vec<Node>,
    inputs: BTreeMap<String, NodeId>,
    output: NodeId,
}

impl Graph {
    pub fn input_names(&self) -> impl Iterator<Item = &str> {
        self.inputs.keys().map(String::as_str)
    }

    pub fn has_input(&self, name: &str) -> bool {
        self.inputs.contains_key(name)
    }

    /// Queue a delta on a named input. Takes effect on the next [`step`].
    ///
    /// [`step`]: Graph::step
    pub fn push_input(&mut self, name: &str, delta: Delta) {
        if delta.is_empty() {
            return;
        }
        let Some(&id) = self.inputs.get(name) else {
            log::error!("push_input on unknown input stream {name:?}");
            return;
        };
        self.nodes[id.0].pending[0].extend(delta);
    }

    /// Run all pending work through the graph and return the output delta.
    pub fn step(&mut self) -> Delta {
        let mut result = Vec::new();
        for i in 0..self.nodes.len() {
            if self.nodes[i].pending.iter().all(Vec::is_empty) {
                continue;
            }
            let mut out = Vec::new();
            {
                let node = &mut self.nodes[i];
                node.op.flush(&mut node.pending, &mut out);
                for buf in &mut node.pending {
                    buf.clear();
                }
            }
            if out.is_empty() {
                continue;
            }
            if NodeId(i) == self.output {
                result.extend(out.iter().cloned());
            }
            let downstream = self.nodes[i].downstream.clone();
            for (target, port) in downstream {
                self.nodes[target.0].pending[port].extend(out.iter().cloned());
            }
        }
        result
    }

    /// Mutable access to an operator's concrete type, for out-of-band
    /// control hooks.
    pub fn with_operator<T: 'static, R>(&mut self, id: NodeId, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        self.nodes
            .get_mut(id.0)
            .and_then(|n| n.op.as_any_mut().downcast_mut::<T>())
            .map(f)
    }

    /// Re-run a node with no new input, collecting what it emits (used to
    /// replay a window after its bounds change).
    pub fn replay_from(&mut self, id: NodeId) -> Delta {
        let mut out = Vec::new();
        {
            let node = &mut self.nodes[id.0];
            node.op.flush(&mut node.pending, &mut out);
            for buf in &mut node.pending {
                buf.clear();
            }
        }
        if out.is_empty() {
            return Vec::new();
        }
        let mut result = if id == self.output { out.clone() } else { Vec::new() };
        // Propagate downstream of the replayed node.
        let downstream = self.nodes[id.0].downstream.clone();
        for (target, port) in downstream {
            self.nodes[target.0].pending[port].extend(out.iter().cloned());
        }
        for i in (id.0 + 1)..self.nodes.len() {
            if self.nodes[i].pending.iter().all(Vec::is_empty) {
                continue;
            }
            let mut step_out = Vec::new();
            {
                let node = &mut self.nodes[i];
                node.op.flush(&mut node.pending, &mut step_out);
                for buf in &mut node.pending {
                    buf.clear();
                }
            }
            if step_out.is_empty() {
                continue;
            }
            if NodeId(i) == self.output {
                result.extend(step_out.iter().cloned());
            }
            let downstream = self.nodes[i].downstream.clone();
            for (target, port) in downstream {
                self.nodes[target.0].pending[port].extend(step_out.iter().cloned());
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Filter, Map};
    use mirrordb_value::row;

    #[test]
    fn linear_pipeline_propagates_deltas() {
        let mut b = GraphBuilder::new();
        let input = b.add_input("x");
        let filtered = b.add_node(
            Box::new(Filter::new(|row: &Value| {
                row.get("n").and_then(Value::as_int).unwrap_or(0) > 1
            })),
            &[input],
        );
        let mapped = b.add_node(
            Box::new(Map::new(|row: &Value| {
                row.get("n").cloned().unwrap_or(Value::Null)
            })),
            &[filtered],
        );
        let mut g = b.finish(mapped);

        g.push_input("x", vec![(row! { "n" => 1 }, 1), (row! { "n" => 2 }, 1)]);
        let out = g.step();
        assert_eq!(out, vec![(Value::Int(2), 1)]);
        assert!(g.step().is_empty(), "no pending work, no output");
    }
}
