use super::{graph::Graph, optimizer::Sgd};
use crate::{conv::ConvStrategy, descriptor::ConvMode, volume::Volume};
use anyhow::Result;
use ndarray::{Array3, ArrayView3};
use parking_lot::RwLock;
use rand::Rng;

/// Learned state of one filter.
#[derive(Debug)]
pub(crate) struct Filter {
    pub(crate) weights: Array3<f32>,
    /// Allocated on the first update with momentum.
    velocity: Option<Array3<f32>>,
}

impl Filter {
    pub(crate) fn new(weights: Array3<f32>) -> Self {
        Self {
            weights,
            velocity: None,
        }
    }
    /// Applies one optimizer step with the batch summed gradient.
    pub(crate) fn update(&mut self, optimizer: &Sgd, grad: ArrayView3<f32>, batch: usize) {
        optimizer.update(&mut self.weights, &mut self.velocity, grad, batch);
    }
}

/// Learned bias of one output channel of an edge.
#[derive(Debug, Default)]
pub(crate) struct Bias {
    pub(crate) value: f32,
    velocity: f32,
}

impl Bias {
    pub(crate) fn update(&mut self, optimizer: &Sgd, grad: f32, batch: usize) {
        optimizer.update_bias(&mut self.value, &mut self.velocity, grad, batch);
    }
}

/// Filters of one edge, `width(input) * width(output)` of them.
///
/// Filter `(i, j)` connecting input channel `i` to output channel `j` is at
/// `i * width(output) + j`. An edge with a bias has one per output channel, added once
/// to the channel's sum.
#[derive(Debug)]
pub(crate) struct EdgeFilters {
    pub(crate) strategy: ConvStrategy,
    pub(crate) filters: Vec<RwLock<Filter>>,
    /// Empty without bias.
    pub(crate) biases: Vec<RwLock<Bias>>,
    pub(crate) outputs: usize,
}

impl EdgeFilters {
    /// Initializes the filters of edge `e`.
    pub(crate) fn new<R: Rng>(graph: &Graph, e: usize, rng: &mut R) -> Result<Self> {
        let edge = &graph.edges[e];
        let descriptor = &edge.descriptor;
        let input = &graph.nodes[edge.input];
        let output = &graph.nodes[edge.output];
        let strategy = match descriptor.mode {
            ConvMode::Auto => ConvStrategy::select(input.size, edge.filter(), edge.stride()),
            ConvMode::Direct => ConvStrategy::Direct,
            ConvMode::Fft => ConvStrategy::Fft,
        };
        tracing::trace!(
            edge = %descriptor.name,
            input = ?input.size,
            filter = ?edge.filter(),
            stride = ?edge.stride(),
            ?strategy,
            mode = ?descriptor.mode,
            "selected convolution strategy"
        );
        let filter_volume = edge.filter().iter().product::<usize>();
        let fan_in = input.width * filter_volume;
        let fan_out = output.width * filter_volume;
        let filters = (0..input.width * output.width)
            .map(|_| {
                let mut weights = Array3::zeros(edge.filter());
                descriptor.init.fill(&mut weights, fan_in, fan_out, rng)?;
                Ok(RwLock::new(Filter::new(weights)))
            })
            .collect::<Result<_>>()?;
        let biases = if descriptor.bias {
            (0..output.width).map(|_| RwLock::default()).collect()
        } else {
            Vec::new()
        };
        Ok(Self {
            strategy,
            filters,
            biases,
            outputs: output.width,
        })
    }
    pub(crate) fn filter(&self, i: usize, j: usize) -> &RwLock<Filter> {
        &self.filters[i * self.outputs + j]
    }
}

/// Adds the biases of channel `j` of every incoming edge that has one, in edge order.
pub(crate) fn add_biases(output: &mut Volume, edges: &[EdgeFilters], incoming: &[usize], j: usize) {
    for &e in incoming {
        if let Some(bias) = edges[e].biases.get(j) {
            let bias = bias.read().value;
            output.map_inplace(|x| *x += bias);
        }
    }
}
