use crate::{
    conv,
    descriptor::{EdgeDescriptor, NodeDescriptor, NodeKind},
    error::Error,
    transfer::TransferFunction,
};
use anyhow::Result;
use std::collections::{HashMap, VecDeque};

/// A compiled node.
#[derive(Debug)]
pub(crate) struct Node {
    pub(crate) name: String,
    pub(crate) kind: NodeKind,
    pub(crate) function: TransferFunction,
    pub(crate) width: usize,
    pub(crate) size: [usize; 3],
    /// Incoming edges, in declaration order.
    pub(crate) incoming: Vec<usize>,
    /// Outgoing edges, in declaration order.
    pub(crate) outgoing: Vec<usize>,
    /// Forward contributions per slot, sum of the source widths of `incoming`.
    pub(crate) fan_in: usize,
    /// Backward contributions per slot, sum of the destination widths of `outgoing`.
    pub(crate) fan_out: usize,
}

impl Node {
    pub(crate) fn is_input(&self) -> bool {
        self.kind == NodeKind::Input
    }
    pub(crate) fn is_output(&self) -> bool {
        self.outgoing.is_empty()
    }
}

/// A compiled edge.
#[derive(Debug)]
pub(crate) struct Edge {
    pub(crate) descriptor: EdgeDescriptor,
    pub(crate) input: usize,
    pub(crate) output: usize,
    /// Position of this edge's contributions within a destination slot.
    pub(crate) input_offset: usize,
    /// Position of this edge's contributions within a source slot, backward.
    pub(crate) output_offset: usize,
}

impl Edge {
    pub(crate) fn filter(&self) -> [usize; 3] {
        self.descriptor.filter
    }
    pub(crate) fn stride(&self) -> [usize; 3] {
        self.descriptor.stride
    }
}

/// A validated, acyclic, sized graph.
#[derive(Debug)]
pub(crate) struct Graph {
    pub(crate) nodes: Vec<Node>,
    pub(crate) edges: Vec<Edge>,
    /// Topological order of node indices.
    pub(crate) order: Vec<usize>,
    node_index: HashMap<String, usize>,
    edge_index: HashMap<String, usize>,
    output_size: [usize; 3],
}

fn invalid(owner: &str, key: &str, value: impl std::fmt::Debug) -> Error {
    Error::InvalidOption {
        owner: owner.into(),
        key: key.into(),
        value: format!("{value:?}"),
    }
}

impl Graph {
    pub(crate) fn new(
        nodes: Vec<NodeDescriptor>,
        edges: Vec<EdgeDescriptor>,
        output_size: [usize; 3],
    ) -> Result<Self> {
        if output_size.contains(&0) {
            return Err(invalid("network", "output_size", output_size).into());
        }
        let mut node_index = HashMap::with_capacity(nodes.len());
        for (index, node) in nodes.iter().enumerate() {
            if node.width == 0 {
                return Err(invalid(&node.name, "size", node.width).into());
            }
            if node_index.insert(node.name.clone(), index).is_some() {
                return Err(Error::DuplicateName {
                    kind: "node",
                    name: node.name.clone(),
                }
                .into());
            }
        }
        let mut nodes: Vec<Node> = nodes
            .into_iter()
            .map(|node| Node {
                name: node.name,
                kind: node.kind,
                function: node.function,
                width: node.width,
                size: [0; 3],
                incoming: Vec::new(),
                outgoing: Vec::new(),
                fan_in: 0,
                fan_out: 0,
            })
            .collect();
        let mut edge_index = HashMap::with_capacity(edges.len());
        let mut compiled = Vec::with_capacity(edges.len());
        for (index, descriptor) in edges.into_iter().enumerate() {
            if descriptor.filter.contains(&0) {
                return Err(invalid(&descriptor.name, "size", descriptor.filter).into());
            }
            descriptor.init.validate(&descriptor.name)?;
            if descriptor.stride.contains(&0) {
                return Err(invalid(&descriptor.name, "stride", descriptor.stride).into());
            }
            if edge_index.insert(descriptor.name.clone(), index).is_some() {
                return Err(Error::DuplicateName {
                    kind: "edge",
                    name: descriptor.name,
                }
                .into());
            }
            let endpoint = |node: &str| {
                node_index.get(node).copied().ok_or_else(|| Error::UnknownNode {
                    edge: descriptor.name.clone(),
                    node: node.into(),
                })
            };
            let input = endpoint(&descriptor.input)?;
            let output = endpoint(&descriptor.output)?;
            let input_offset = nodes[output].fan_in;
            nodes[output].fan_in += nodes[input].width;
            nodes[output].incoming.push(index);
            let output_offset = nodes[input].fan_out;
            nodes[input].fan_out += nodes[output].width;
            nodes[input].outgoing.push(index);
            compiled.push(Edge {
                descriptor,
                input,
                output,
                input_offset,
                output_offset,
            });
        }
        for node in nodes.iter() {
            match node.kind {
                NodeKind::Input if !node.incoming.is_empty() => {
                    return Err(Error::InvalidGraph(format!(
                        "input node {:?} has incoming edges",
                        node.name
                    ))
                    .into());
                }
                NodeKind::Input if node.outgoing.is_empty() => {
                    return Err(Error::InvalidGraph(format!(
                        "input node {:?} has no outgoing edges",
                        node.name
                    ))
                    .into());
                }
                NodeKind::Transfer if node.incoming.is_empty() => {
                    return Err(Error::InvalidGraph(format!(
                        "transfer node {:?} has no incoming edges",
                        node.name
                    ))
                    .into());
                }
                _ => (),
            }
        }
        if !nodes.iter().any(Node::is_input) {
            return Err(Error::InvalidGraph("no input nodes".into()).into());
        }
        let order = topological_order(&nodes, &compiled)?;
        let mut graph = Self {
            nodes,
            edges: compiled,
            order,
            node_index,
            edge_index,
            output_size,
        };
        let sizes = graph.sizes(output_size)?;
        for (node, size) in graph.nodes.iter_mut().zip(sizes) {
            node.size = size;
        }
        Ok(graph)
    }
    /// Node sizes needed to produce `output_size` at every output node.
    fn sizes(&self, output_size: [usize; 3]) -> Result<Vec<[usize; 3]>> {
        let mut sizes: Vec<Option<[usize; 3]>> = vec![None; self.nodes.len()];
        for &n in self.order.iter().rev() {
            let node = &self.nodes[n];
            if node.is_output() {
                sizes[n] = Some(output_size);
                continue;
            }
            for &e in node.outgoing.iter() {
                let edge = &self.edges[e];
                let Some(output) = sizes[edge.output] else {
                    continue;
                };
                let size = conv::input_shape(output, edge.filter(), edge.stride());
                match sizes[n] {
                    None => sizes[n] = Some(size),
                    Some(first) if first != size => {
                        return Err(Error::SizeMismatch {
                            node: node.name.clone(),
                            first,
                            second: size,
                        }
                        .into())
                    }
                    Some(_) => (),
                }
            }
        }
        Ok(sizes.into_iter().map(|x| x.unwrap_or([0; 3])).collect())
    }
    /// Spatial input extent consumed per output voxel, maximum over input nodes.
    pub(crate) fn field_of_view(&self) -> [usize; 3] {
        let mut fov = vec![[1; 3]; self.nodes.len()];
        for &n in self.order.iter().rev() {
            for &e in self.nodes[n].outgoing.iter() {
                let edge = &self.edges[e];
                let size = conv::input_shape(fov[edge.output], edge.filter(), edge.stride());
                for a in 0..3 {
                    fov[n][a] = fov[n][a].max(size[a]);
                }
            }
        }
        let mut output = [1; 3];
        for (node, fov) in self.nodes.iter().zip(fov) {
            if node.is_input() {
                for a in 0..3 {
                    output[a] = output[a].max(fov[a]);
                }
            }
        }
        output
    }
    pub(crate) fn output_size(&self) -> [usize; 3] {
        self.output_size
    }
    pub(crate) fn node(&self, name: &str) -> Result<usize> {
        self.node_index.get(name).copied().ok_or_else(|| {
            Error::NotFound {
                kind: "node",
                name: name.into(),
            }
            .into()
        })
    }
    pub(crate) fn edge(&self, name: &str) -> Result<usize> {
        self.edge_index.get(name).copied().ok_or_else(|| {
            Error::NotFound {
                kind: "edge",
                name: name.into(),
            }
            .into()
        })
    }
    pub(crate) fn inputs(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.nodes.len()).filter(|n| self.nodes[*n].is_input())
    }
    pub(crate) fn outputs(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.nodes.len()).filter(|n| self.nodes[*n].is_output())
    }
}

/// Kahn's algorithm, ties broken by declaration order.
fn topological_order(nodes: &[Node], edges: &[Edge]) -> Result<Vec<usize>> {
    let mut remaining: Vec<usize> = nodes.iter().map(|node| node.incoming.len()).collect();
    let mut ready: VecDeque<usize> = (0..nodes.len()).filter(|n| remaining[*n] == 0).collect();
    let mut order = Vec::with_capacity(nodes.len());
    while let Some(n) = ready.pop_front() {
        order.push(n);
        for &e in nodes[n].outgoing.iter() {
            let output = edges[e].output;
            remaining[output] -= 1;
            if remaining[output] == 0 {
                ready.push_back(output);
            }
        }
    }
    if order.len() < nodes.len() {
        let nodes = nodes
            .iter()
            .zip(remaining)
            .filter(|(_, remaining)| *remaining > 0)
            .map(|(node, _)| node.name.clone())
            .collect();
        return Err(Error::Cycle { nodes }.into());
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn relu(name: &str, width: usize) -> NodeDescriptor {
        NodeDescriptor::transfer(name, TransferFunction::RectifyLinear, width)
    }

    fn error(result: Result<Graph>) -> Error {
        result
            .unwrap_err()
            .downcast::<Error>()
            .unwrap()
    }

    #[test]
    fn sizes_and_offsets() -> Result<()> {
        let graph = Graph::new(
            vec![
                NodeDescriptor::input("input", 2),
                relu("hidden", 3),
                relu("output", 1),
            ],
            vec![
                EdgeDescriptor::conv("a", "input", "hidden", [3; 3]),
                EdgeDescriptor::conv("b", "hidden", "output", [2, 2, 1]).with_stride([2, 2, 1]),
                EdgeDescriptor::conv("skip", "input", "output", [4, 4, 3]).with_stride([2, 2, 1]),
            ],
            [4, 4, 4],
        )?;
        assert_eq!(graph.nodes[2].size, [4, 4, 4]);
        assert_eq!(graph.nodes[1].size, [8, 8, 4]);
        assert_eq!(graph.nodes[0].size, [10, 10, 6]);
        assert_eq!(graph.nodes[2].fan_in, 3 + 2);
        assert_eq!(graph.edges[2].input_offset, 3);
        assert_eq!(graph.nodes[0].fan_out, 3 + 1);
        assert_eq!(graph.edges[2].output_offset, 3);
        assert_eq!(graph.order, vec![0, 1, 2]);
        assert_eq!(graph.outputs().collect::<Vec<_>>(), vec![2]);
        Ok(())
    }

    #[test]
    fn field_of_view() -> Result<()> {
        let graph = Graph::new(
            vec![
                NodeDescriptor::input("input", 1),
                relu("a", 1),
                relu("b", 1),
            ],
            vec![
                EdgeDescriptor::conv("e1", "input", "a", [3, 5, 1]).with_stride([2, 1, 1]),
                EdgeDescriptor::conv("e2", "a", "b", [4, 2, 1]),
            ],
            [3; 3],
        )?;
        // 1 + sum (f - 1) * product of the strides between the edge and the input
        assert_eq!(graph.field_of_view(), [1 + 2 + 3 * 2, 1 + 4 + 1, 1]);
        assert_eq!(graph.nodes[0].size, [13, 8, 3]);
        Ok(())
    }

    #[test]
    fn rejects_malformed_graphs() {
        let cycle = Graph::new(
            vec![NodeDescriptor::input("in", 1), relu("a", 1), relu("b", 1)],
            vec![
                EdgeDescriptor::conv("in_a", "in", "a", [1; 3]),
                EdgeDescriptor::conv("a_b", "a", "b", [1; 3]),
                EdgeDescriptor::conv("b_a", "b", "a", [1; 3]),
            ],
            [1; 3],
        );
        assert!(matches!(error(cycle), Error::Cycle { nodes } if nodes == ["a", "b"]));
        let dangling = Graph::new(
            vec![NodeDescriptor::input("in", 1), relu("a", 1)],
            vec![EdgeDescriptor::conv("e", "in", "missing", [1; 3])],
            [1; 3],
        );
        assert_eq!(
            error(dangling),
            Error::UnknownNode {
                edge: "e".into(),
                node: "missing".into()
            }
        );
        let duplicate = Graph::new(
            vec![NodeDescriptor::input("in", 1), relu("in", 1)],
            Vec::new(),
            [1; 3],
        );
        assert!(matches!(error(duplicate), Error::DuplicateName { kind: "node", .. }));
        let orphan = Graph::new(
            vec![NodeDescriptor::input("in", 1), relu("a", 1), relu("b", 1)],
            vec![EdgeDescriptor::conv("e", "in", "a", [1; 3])],
            [1; 3],
        );
        assert!(matches!(error(orphan), Error::InvalidGraph(_)));
        let mismatch = Graph::new(
            vec![NodeDescriptor::input("in", 1), relu("a", 1), relu("b", 1)],
            vec![
                EdgeDescriptor::conv("in_a", "in", "a", [3; 3]),
                EdgeDescriptor::conv("a_b", "a", "b", [3; 3]),
                EdgeDescriptor::conv("in_b", "in", "b", [3; 3]),
            ],
            [2; 3],
        );
        assert!(matches!(error(mismatch), Error::SizeMismatch { .. }));
        let zero_stride = Graph::new(
            vec![NodeDescriptor::input("in", 1), relu("a", 1)],
            vec![EdgeDescriptor::conv("e", "in", "a", [1; 3]).with_stride([1, 0, 1])],
            [1; 3],
        );
        assert!(matches!(error(zero_stride), Error::InvalidOption { .. }));
    }
}
