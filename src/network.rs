use crate::{
    conv::ConvStrategy,
    descriptor::{self, EdgeDescriptor, NodeDescriptor, Options},
    error::Error,
    volume::Volume,
};
use anyhow::{bail, Result};
use ndarray::Array3;
use rand::{rngs::SmallRng, SeedableRng};
use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

mod edge;
use edge::EdgeFilters;
mod graph;
use graph::Graph;
/// Optimizers.
pub mod optimizer;
pub use optimizer::Sgd;
mod pass;
use pass::PassContext;
mod scheduler;
use scheduler::Scheduler;


/// Network builders.
pub mod builder {
    use super::*;

    /// Builder for creating a [`Network`].
    #[derive(Debug, Clone)]
    pub struct NetworkBuilder {
        nodes: Vec<NodeDescriptor>,
        edges: Vec<EdgeDescriptor>,
        output_size: [usize; 3],
        threads: Option<usize>,
        max_batch: usize,
        optimizer: Sgd,
        seed: Option<u64>,
    }

    impl NetworkBuilder {
        pub(super) fn new() -> Self {
            Self {
                nodes: Vec::new(),
                edges: Vec::new(),
                output_size: [1; 3],
                threads: None,
                max_batch: 1,
                optimizer: Sgd::default(),
                seed: None,
            }
        }
        /// The nodes.
        pub fn nodes(self, nodes: Vec<NodeDescriptor>) -> Self {
            Self { nodes, ..self }
        }
        /// The edges.
        pub fn edges(self, edges: Vec<EdgeDescriptor>) -> Self {
            Self { edges, ..self }
        }
        /// Compiles nodes and edges from option maps.
        ///
        /// **Errors**
        ///
        /// See [`NodeDescriptor::from_options`] and [`EdgeDescriptor::from_options`].
        pub fn options(self, nodes: &[Options], edges: &[Options]) -> Result<Self> {
            let (nodes, edges) = descriptor::compile(nodes, edges)?;
            Ok(Self {
                nodes,
                edges,
                ..self
            })
        }
        /// Spatial size of every output node. Default is 1.
        pub fn output_size(self, output_size: [usize; 3]) -> Self {
            Self {
                output_size,
                ..self
            }
        }
        /// Worker threads. Defaults to the available parallelism.
        pub fn threads(self, threads: usize) -> Self {
            Self {
                threads: Some(threads),
                ..self
            }
        }
        /// Maximum samples per pass. Default is 1.
        pub fn max_batch(self, max_batch: usize) -> Self {
            Self { max_batch, ..self }
        }
        /// The optimizer. Default is [`Sgd::default()`].
        pub fn optimizer(self, optimizer: Sgd) -> Self {
            Self { optimizer, ..self }
        }
        /// Seed for filter initialization. Defaults to entropy.
        pub fn seed(self, seed: u64) -> Self {
            Self {
                seed: Some(seed),
                ..self
            }
        }
        /// Builds the network.
        ///
        /// **Errors**
        /// - The graph is malformed, see [`Error`].
        /// - `threads` or `max_batch` is 0.
        /// - The thread pool could not be created.
        pub fn build(self) -> Result<Network> {
            let Self {
                nodes,
                edges,
                output_size,
                threads,
                max_batch,
                optimizer,
                seed,
            } = self;
            let threads = threads.unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(|threads| threads.get())
                    .unwrap_or(1)
            });
            for (key, value) in [("threads", threads), ("max_batch", max_batch)] {
                if value == 0 {
                    return Err(Error::InvalidOption {
                        owner: "network".into(),
                        key: key.into(),
                        value: value.to_string(),
                    }
                    .into());
                }
            }
            let graph = Graph::new(nodes, edges, output_size)?;
            let mut rng = if let Some(seed) = seed {
                SmallRng::seed_from_u64(seed)
            } else {
                SmallRng::from_entropy()
            };
            let edges = (0..graph.edges.len())
                .map(|e| EdgeFilters::new(&graph, e, &mut rng))
                .collect::<Result<_>>()?;
            let scheduler = Scheduler::new(threads)?;
            tracing::debug!(
                nodes = graph.nodes.len(),
                edges = graph.edges.len(),
                threads,
                max_batch,
                field_of_view = ?graph.field_of_view(),
                "built network"
            );
            Ok(Network {
                graph,
                edges,
                optimizer,
                scheduler,
                max_batch,
                activations: None,
                conv_nanos: AtomicU64::new(0),
            })
        }
    }
}
use builder::*;

/// Node outputs of the last forward pass.
#[derive(Debug)]
struct Activations {
    batch: usize,
    volumes: Vec<Vec<Volume>>,
}

/// A trainable 3-D convolutional network.
///
/// Nodes hold `batch * width` volumes per pass, ordered sample major. Edges fully connect
/// their endpoints with one filter per pair of channels.
///
/// ```
/// # use anyhow::Result;
/// # use std::collections::HashMap;
/// # use cubenet::{descriptor::{EdgeDescriptor, NodeDescriptor}, transfer::TransferFunction, Network, Volume};
/// # fn main() -> Result<()> {
/// let mut network = Network::builder()
///     .nodes(vec![
///         NodeDescriptor::input("input", 1),
///         NodeDescriptor::transfer("output", TransferFunction::Logistics, 1),
///     ])
///     .edges(vec![EdgeDescriptor::conv("conv", "input", "output", [3, 3, 3])])
///     .output_size([4, 4, 4])
///     .threads(2)
///     .build()?;
/// assert_eq!(network.input_size("input")?, [6, 6, 6]);
/// let inputs = HashMap::from([("input".to_string(), vec![Volume::zeros([6, 6, 6])?])]);
/// let outputs = network.forward(inputs)?;
/// let grads = HashMap::from([("output".to_string(), vec![Volume::zeros([4, 4, 4])?])]);
/// network.backward(grads)?;
/// # assert_eq!(outputs["output"][0].shape3(), [4, 4, 4]);
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Network {
    graph: Graph,
    edges: Vec<EdgeFilters>,
    optimizer: Sgd,
    scheduler: Scheduler,
    max_batch: usize,
    activations: Option<Activations>,
    conv_nanos: AtomicU64,
}

impl Network {
    /// A builder for creating a [`Network`].
    pub fn builder() -> NetworkBuilder {
        NetworkBuilder::new()
    }
    fn context(&self, batch: usize) -> PassContext<'_> {
        PassContext {
            graph: &self.graph,
            edges: &self.edges,
            scheduler: &self.scheduler,
            conv_nanos: &self.conv_nanos,
            batch,
        }
    }
    /// Validates `volumes` against `nodes`, returning the batch and the volumes per node.
    fn collect_volumes(
        &self,
        mut volumes: HashMap<String, Vec<Volume>>,
        nodes: Vec<usize>,
        batch: Option<usize>,
    ) -> Result<(usize, Vec<(usize, Vec<Volume>)>)> {
        let mut expected: Vec<String> = nodes
            .iter()
            .map(|n| self.graph.nodes[*n].name.clone())
            .collect();
        expected.sort();
        let mut found: Vec<String> = volumes.keys().cloned().collect();
        found.sort();
        if expected != found {
            return Err(Error::MissingVolume { expected, found }.into());
        }
        let mut batch = batch;
        let mut output = Vec::with_capacity(nodes.len());
        for n in nodes {
            let node = &self.graph.nodes[n];
            let slots = volumes.remove(&node.name).unwrap_or_default();
            let count = slots.len();
            let node_batch = count / node.width;
            if count == 0
                || count % node.width != 0
                || node_batch > self.max_batch
                || batch.map_or(false, |batch| batch != node_batch)
            {
                return Err(Error::InvalidBatch {
                    name: node.name.clone(),
                    count,
                    width: node.width,
                    max_batch: self.max_batch,
                }
                .into());
            }
            batch.replace(node_batch);
            for (index, volume) in slots.iter().enumerate() {
                if volume.shape3() != node.size {
                    return Err(Error::ShapeMismatch {
                        name: node.name.clone(),
                        index,
                        expected: node.size,
                        found: volume.shape3(),
                    }
                    .into());
                }
            }
            output.push((n, slots));
        }
        let Some(batch) = batch else {
            bail!("Expected at least one node!");
        };
        Ok((batch, output))
    }
    /// Runs a forward pass.
    ///
    /// `inputs` maps every input node to `batch * width` volumes of
    /// [`.input_size()`](Self::input_size), ordered sample major. Returns copies of the
    /// output nodes' volumes, the pass keeps its activations for [`.backward()`](Self::backward).
    ///
    /// **Errors**
    /// - [`Error::MissingVolume`] if the names differ from the input nodes.
    /// - [`Error::InvalidBatch`] if a count is not a multiple of the width, the batches
    ///   differ, or the batch exceeds `max_batch`.
    /// - [`Error::ShapeMismatch`] for a volume of the wrong shape.
    /// - [`Error::OutOfMemory`] if a volume could not be allocated.
    pub fn forward(
        &mut self,
        inputs: HashMap<String, Vec<Volume>>,
    ) -> Result<HashMap<String, Vec<Volume>>> {
        self.activations = None;
        let (batch, inputs) = self.collect_volumes(inputs, self.graph.inputs().collect(), None)?;
        let volumes = pass::forward(&self.context(batch), inputs)?;
        let mut outputs = HashMap::new();
        for n in self.graph.outputs() {
            let slots = volumes[n]
                .iter()
                .map(Volume::try_clone)
                .collect::<Result<Vec<_>>>()?;
            outputs.insert(self.graph.nodes[n].name.clone(), slots);
        }
        self.activations = Some(Activations { batch, volumes });
        Ok(outputs)
    }
    fn backward_impl(
        &mut self,
        grads: HashMap<String, Vec<Volume>>,
        input_gradients: bool,
    ) -> Result<Vec<Vec<Volume>>> {
        let Some(batch) = self.activations.as_ref().map(|x| x.batch) else {
            return Err(Error::NoForwardPass.into());
        };
        let (batch, grads) =
            self.collect_volumes(grads, self.graph.outputs().collect(), Some(batch))?;
        let Some(activations) = self.activations.take() else {
            return Err(Error::NoForwardPass.into());
        };
        pass::backward(
            &self.context(batch),
            self.optimizer,
            &activations.volumes,
            grads,
            input_gradients,
        )
    }
    /// Runs a backward pass and updates the filters.
    ///
    /// `grads` maps every output node to the gradient of the loss with respect to its
    /// volumes, in the layout returned by [`.forward()`](Self::forward). Consumes the
    /// activations, each backward needs a fresh forward.
    ///
    /// **Errors**
    /// - [`Error::NoForwardPass`] without a preceding forward.
    /// - As [`.forward()`](Self::forward), the batch must match the forward pass.
    pub fn backward(&mut self, grads: HashMap<String, Vec<Volume>>) -> Result<()> {
        self.backward_impl(grads, false)?;
        Ok(())
    }
    /// Like [`.backward()`](Self::backward), also returning the gradients with respect to the
    /// input volumes.
    pub fn backward_with_input_gradients(
        &mut self,
        grads: HashMap<String, Vec<Volume>>,
    ) -> Result<HashMap<String, Vec<Volume>>> {
        let mut deltas = self.backward_impl(grads, true)?;
        let mut output = HashMap::new();
        for n in self.graph.inputs() {
            let node = &self.graph.nodes[n];
            let slots = std::mem::take(&mut deltas[n]);
            if slots.is_empty() {
                bail!("Expected input gradients for {:?}!", node.name);
            }
            output.insert(node.name.clone(), slots);
        }
        Ok(output)
    }
    /// The optimizer.
    pub fn optimizer(&self) -> &Sgd {
        &self.optimizer
    }
    /// Sets the learning rate used by following backward passes.
    pub fn set_learning_rate(&mut self, learning_rate: f32) {
        self.optimizer.set_learning_rate(learning_rate);
    }
    /// Sets the momentum used by following backward passes.
    pub fn set_momentum(&mut self, momentum: f32) {
        self.optimizer.set_momentum(momentum);
    }
    /// Sets the weight decay used by following backward passes.
    pub fn set_weight_decay(&mut self, weight_decay: f32) {
        self.optimizer.set_weight_decay(weight_decay);
    }
    /// Spatial input extent that determines one output voxel.
    ///
    /// `1 + sum (f - 1) * s` along a path from an input, where `s` is the product of the
    /// strides between the edge and the input. The maximum over paths.
    pub fn field_of_view(&self) -> [usize; 3] {
        self.graph.field_of_view()
    }
    /// Spatial size of every output node.
    pub fn output_size(&self) -> [usize; 3] {
        self.graph.output_size()
    }
    /// Spatial size of input node `name`.
    pub fn input_size(&self, name: &str) -> Result<[usize; 3]> {
        let node = &self.graph.nodes[self.graph.node(name)?];
        if !node.is_input() {
            return Err(Error::NotFound {
                kind: "input node",
                name: name.into(),
            }
            .into());
        }
        Ok(node.size)
    }
    /// Spatial size of node `name`.
    pub fn node_size(&self, name: &str) -> Result<[usize; 3]> {
        Ok(self.graph.nodes[self.graph.node(name)?].size)
    }
    /// Names of the input nodes, in declaration order.
    pub fn input_names(&self) -> Vec<&str> {
        self.graph
            .inputs()
            .map(|n| self.graph.nodes[n].name.as_str())
            .collect()
    }
    /// Names of the output nodes, in declaration order.
    pub fn output_names(&self) -> Vec<&str> {
        self.graph
            .outputs()
            .map(|n| self.graph.nodes[n].name.as_str())
            .collect()
    }
    /// Worker threads.
    pub fn threads(&self) -> usize {
        self.scheduler.threads()
    }
    /// Maximum samples per pass.
    pub fn max_batch(&self) -> usize {
        self.max_batch
    }
    fn edge_filters(&self, edge: &str) -> Result<&EdgeFilters> {
        Ok(&self.edges[self.graph.edge(edge)?])
    }
    /// Copies the filters of `edge`, filter `(i, j)` at `i * width(output) + j`.
    pub fn weights(&self, edge: &str) -> Result<Vec<Array3<f32>>> {
        Ok(self
            .edge_filters(edge)?
            .filters
            .iter()
            .map(|filter| filter.read().weights.clone())
            .collect())
    }
    /// Replaces the filters of `edge`, in the layout of [`.weights()`](Self::weights).
    ///
    /// **Errors**
    /// - The number of filters differs.
    /// - [`Error::ShapeMismatch`] if a filter has the wrong shape.
    pub fn set_weights(&mut self, edge: &str, weights: Vec<Array3<f32>>) -> Result<()> {
        let e = self.graph.edge(edge)?;
        let shape = self.graph.edges[e].filter();
        let filters = &mut self.edges[e].filters;
        if weights.len() != filters.len() {
            bail!(
                "Expected {} filters for edge {edge:?}, found {}!",
                filters.len(),
                weights.len()
            );
        }
        for (index, weights) in weights.iter().enumerate() {
            let (x, y, z) = weights.dim();
            if [x, y, z] != shape {
                return Err(Error::ShapeMismatch {
                    name: edge.into(),
                    index,
                    expected: shape,
                    found: [x, y, z],
                }
                .into());
            }
        }
        for (filter, weights) in filters.iter_mut().zip(weights) {
            filter.get_mut().weights = weights;
        }
        Ok(())
    }
    /// The biases of `edge`, one per output channel, empty if the edge has no bias.
    pub fn biases(&self, edge: &str) -> Result<Vec<f32>> {
        Ok(self
            .edge_filters(edge)?
            .biases
            .iter()
            .map(|bias| bias.read().value)
            .collect())
    }
    /// Replaces the biases of `edge`.
    ///
    /// **Errors**
    /// - The edge has no bias.
    /// - The number of biases differs from the width of the output node.
    pub fn set_biases(&mut self, edge: &str, biases: &[f32]) -> Result<()> {
        let e = self.graph.edge(edge)?;
        if !self.graph.edges[e].descriptor.bias {
            bail!("Expected edge {edge:?} to have a bias!");
        }
        let current = &mut self.edges[e].biases;
        if biases.len() != current.len() {
            bail!(
                "Expected {} biases for edge {edge:?}, found {}!",
                current.len(),
                biases.len()
            );
        }
        for (bias, value) in current.iter_mut().zip(biases) {
            bias.get_mut().value = *value;
        }
        Ok(())
    }
    /// The convolution strategy of `edge`.
    pub fn edge_strategy(&self, edge: &str) -> Result<ConvStrategy> {
        Ok(self.edge_filters(edge)?.strategy)
    }
    /// Time spent in convolution kernels since the last call, summed over workers.
    pub(crate) fn take_conv_time(&self) -> Duration {
        Duration::from_nanos(self.conv_nanos.swap(0, Ordering::Relaxed))
    }
}
