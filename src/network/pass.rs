//! Forward and backward task graphs.
//!
//! Slots of a node are laid out sample major, `slot = sample * width + channel`.
//! Each slot has one contribution cell per producer, so sums are always taken in the
//! same order regardless of which worker finished first.
//!
//! FFT edges share spectra between tasks: each input, delta and filter is transformed
//! once per pass and dropped after its last user.

use super::{
    edge::{add_biases, EdgeFilters},
    graph::Graph,
    optimizer::Sgd,
    scheduler::{Countdown, Scheduler, Shared},
};
use crate::{
    conv::{
        fft::{self, Spectrum},
        ConvStrategy,
    },
    error::Error,
    volume::Volume,
};
use anyhow::{anyhow, Result};
use ndarray::ArrayView3;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Instant,
};

/// Read only state shared by the tasks of a pass.
pub(super) struct PassContext<'a> {
    pub(super) graph: &'a Graph,
    pub(super) edges: &'a [EdgeFilters],
    pub(super) scheduler: &'a Scheduler,
    /// Nanoseconds spent in convolution kernels, summed over workers.
    pub(super) conv_nanos: &'a AtomicU64,
    pub(super) batch: usize,
}

impl PassContext<'_> {
    fn timed<T>(&self, f: impl FnOnce() -> T) -> T {
        let start = Instant::now();
        let output = f();
        let nanos = u64::try_from(start.elapsed().as_nanos()).unwrap_or(u64::MAX);
        self.conv_nanos.fetch_add(nanos, Ordering::Relaxed);
        output
    }
    fn slots(&self, node: usize) -> usize {
        self.batch * self.graph.nodes[node].width
    }
    /// Edge tasks of one pass, `batch * width(input) * width(output)` per edge.
    fn edge_tasks(&self) -> usize {
        self.graph
            .edges
            .iter()
            .map(|edge| self.slots(edge.input) * self.graph.nodes[edge.output].width)
            .sum()
    }
}

type Cell = Mutex<Option<Volume>>;

fn cells<T>(len: usize, f: impl FnMut(usize) -> T) -> Vec<T> {
    (0..len).map(f).collect()
}

/// Takes every contribution and sums them in order.
fn sum(contributions: &[Cell]) -> Result<Volume> {
    let mut iter = contributions.iter().map(|cell| cell.lock().take());
    let mut total = iter
        .next()
        .flatten()
        .ok_or_else(|| anyhow!("Expected a contribution!"))?;
    for contribution in iter {
        let contribution = contribution.ok_or_else(|| anyhow!("Expected a contribution!"))?;
        *total += &*contribution;
    }
    Ok(total)
}

/// The spectrum in `cell`, transforming `x` spread by `stride` over `extent` on first use.
fn spectrum(
    context: &PassContext,
    cell: &Shared<Spectrum>,
    x: ArrayView3<f32>,
    stride: [usize; 3],
    extent: [usize; 3],
) -> Result<Arc<Spectrum>> {
    cell.get_or_try_init(|| context.timed(|| Spectrum::new(x, stride, extent)))
}

fn is_fft(context: &PassContext, e: usize) -> bool {
    context.edges[e].strategy == ConvStrategy::Fft
}

fn publish(cell: &OnceCell<Volume>, volume: Volume) -> Result<()> {
    cell.set(volume)
        .map_err(|_| anyhow!("Expected slot to be published once!"))
}

fn published(cell: &OnceCell<Volume>) -> Result<&Volume> {
    cell.get()
        .ok_or_else(|| anyhow!("Expected slot to be published!"))
}

fn into_volumes(cells: Vec<Vec<OnceCell<Volume>>>) -> Vec<Vec<Volume>> {
    cells
        .into_iter()
        .map(|slots| slots.into_iter().filter_map(OnceCell::into_inner).collect())
        .collect()
}

#[derive(Debug, Clone, Copy)]
enum ForwardTask {
    /// All contributions of the slot arrived.
    Node { node: usize, slot: usize },
    /// Correlate input channel `i` of `sample` with filter `(i, j)`.
    Edge {
        edge: usize,
        sample: usize,
        i: usize,
        j: usize,
    },
}

/// Spectra of an FFT edge, all at the input extent.
struct ForwardSpectra {
    /// Per input slot, used by every output channel.
    inputs: Vec<Shared<Spectrum>>,
    /// Per filter, used by every sample.
    filters: Vec<Shared<Spectrum>>,
}

struct Forward<'a> {
    context: &'a PassContext<'a>,
    outputs: Vec<Vec<OnceCell<Volume>>>,
    contributions: Vec<Vec<Cell>>,
    countdowns: Vec<Vec<Countdown>>,
    /// `None` for direct edges.
    spectra: Vec<Option<ForwardSpectra>>,
}

impl Forward<'_> {
    fn run(&self, task: ForwardTask, ready: &mut Vec<ForwardTask>) -> Result<()> {
        match task {
            ForwardTask::Node { node, slot } => self.node(node, slot, ready),
            ForwardTask::Edge { edge, sample, i, j } => self.edge(edge, sample, i, j, ready),
        }
    }
    fn node(&self, n: usize, slot: usize, ready: &mut Vec<ForwardTask>) -> Result<()> {
        let graph = self.context.graph;
        let node = &graph.nodes[n];
        if !node.is_input() {
            let fan_in = node.fan_in;
            let mut output = sum(&self.contributions[n][slot * fan_in..(slot + 1) * fan_in])?;
            add_biases(
                &mut output,
                self.context.edges,
                &node.incoming,
                slot % node.width,
            );
            node.function.apply_mut(&mut *output);
            if output.shape3() != node.size {
                return Err(Error::ShapeMismatch {
                    name: node.name.clone(),
                    index: slot,
                    expected: node.size,
                    found: output.shape3(),
                }
                .into());
            }
            publish(&self.outputs[n][slot], output)?;
        }
        let sample = slot / node.width;
        let i = slot % node.width;
        for &e in node.outgoing.iter() {
            let width = graph.nodes[graph.edges[e].output].width;
            ready.extend((0..width).map(|j| ForwardTask::Edge {
                edge: e,
                sample,
                i,
                j,
            }));
        }
        Ok(())
    }
    fn edge(
        &self,
        e: usize,
        sample: usize,
        i: usize,
        j: usize,
        ready: &mut Vec<ForwardTask>,
    ) -> Result<()> {
        let graph = self.context.graph;
        let edge = &graph.edges[e];
        let source = &graph.nodes[edge.input];
        let target = &graph.nodes[edge.output];
        let filters = &self.context.edges[e];
        let source_slot = sample * source.width + i;
        let input = published(&self.outputs[edge.input][source_slot])?;
        let f = i * target.width + j;
        let output = if let Some(spectra) = &self.spectra[e] {
            let context = self.context;
            let x = spectrum(
                context,
                &spectra.inputs[source_slot],
                input.view(),
                [1; 3],
                source.size,
            )?;
            let w = spectra.filters[f].get_or_try_init(|| {
                let filter = filters.filters[f].read();
                context.timed(|| Spectrum::new(filter.weights.view(), [1; 3], source.size))
            })?;
            let output = context.timed(|| fft::correlate(&x, &w, edge.stride(), target.size));
            drop((x, w));
            spectra.inputs[source_slot].release();
            spectra.filters[f].release();
            output?
        } else {
            let filter = filters.filter(i, j).read();
            self.context.timed(|| {
                filters
                    .strategy
                    .forward(input.view(), filter.weights.view(), edge.stride())
            })?
        };
        let slot = sample * target.width + j;
        *self.contributions[edge.output][slot * target.fan_in + edge.input_offset + i].lock() =
            Some(output);
        if self.countdowns[edge.output][slot].arrive() {
            ready.push(ForwardTask::Node {
                node: edge.output,
                slot,
            });
        }
        Ok(())
    }
}

/// Runs the forward pass.
///
/// `inputs` holds the validated slots of each input node. Returns the outputs of every
/// node, indexed by node.
pub(super) fn forward(
    context: &PassContext,
    inputs: Vec<(usize, Vec<Volume>)>,
) -> Result<Vec<Vec<Volume>>> {
    let graph = context.graph;
    let nodes = graph.nodes.len();
    let outputs: Vec<Vec<OnceCell<Volume>>> =
        cells(nodes, |n| cells(context.slots(n), |_| OnceCell::new()));
    let mut seeds = Vec::new();
    for (n, volumes) in inputs {
        for (slot, volume) in volumes.into_iter().enumerate() {
            publish(&outputs[n][slot], volume)?;
            seeds.push(ForwardTask::Node { node: n, slot });
        }
    }
    let pass = Forward {
        context,
        outputs,
        contributions: cells(nodes, |n| {
            cells(context.slots(n) * graph.nodes[n].fan_in, |_| Mutex::new(None))
        }),
        countdowns: cells(nodes, |n| {
            cells(context.slots(n), |_| Countdown::new(graph.nodes[n].fan_in))
        }),
        spectra: cells(graph.edges.len(), |e| {
            is_fft(context, e).then(|| {
                let edge = &graph.edges[e];
                ForwardSpectra {
                    inputs: cells(context.slots(edge.input), |_| {
                        Shared::new(graph.nodes[edge.output].width)
                    }),
                    filters: cells(context.edges[e].filters.len(), |_| {
                        Shared::new(context.batch)
                    }),
                }
            })
        }),
    };
    tracing::debug!(
        batch = context.batch,
        seeds = seeds.len(),
        edge_tasks = context.edge_tasks(),
        "forward pass"
    );
    context
        .scheduler
        .run(seeds, |task, ready| pass.run(task, ready))?;
    let Forward { outputs, .. } = pass;
    let outputs = into_volumes(outputs);
    for (n, slots) in outputs.iter().enumerate() {
        if slots.len() != context.slots(n) {
            return Err(anyhow!(
                "Expected {} outputs for node {:?}, found {}!",
                context.slots(n),
                graph.nodes[n].name,
                slots.len()
            ));
        }
    }
    Ok(outputs)
}

#[derive(Debug, Clone, Copy)]
enum BackwardTask {
    /// All gradient contributions of the slot arrived.
    Node { node: usize, slot: usize },
    /// Propagates the delta of output channel `j` of `sample` through filter `(i, j)`.
    Edge {
        edge: usize,
        sample: usize,
        i: usize,
        j: usize,
    },
    /// Every sample contributed its gradient to filter `filter`.
    Update { edge: usize, filter: usize },
    /// Every sample contributed its gradient to the bias of output channel `channel`.
    BiasUpdate { edge: usize, channel: usize },
}

/// Spectra of an FFT edge.
struct BackwardSpectra {
    /// Per input slot at the input extent.
    inputs: Vec<Shared<Spectrum>>,
    /// Per output slot, deltas spread by the stride at the input extent.
    deltas: Vec<Shared<Spectrum>>,
    /// Per output slot, deltas at the full convolution extent when that differs from the
    /// input extent and input gradients are needed.
    full_deltas: Vec<Shared<Spectrum>>,
    /// Per filter at the full convolution extent, empty without input gradients.
    filters: Vec<Shared<Spectrum>>,
    full_extent: [usize; 3],
}

impl BackwardSpectra {
    fn new(context: &PassContext, e: usize, propagate: bool) -> Self {
        let graph = context.graph;
        let edge = &graph.edges[e];
        let source = &graph.nodes[edge.input];
        let target = &graph.nodes[edge.output];
        let full_extent = fft::full_extent(target.size, edge.filter(), edge.stride());
        let separate = propagate && full_extent != source.size;
        let delta_users = if propagate && !separate {
            2 * source.width
        } else {
            source.width
        };
        Self {
            inputs: cells(context.slots(edge.input), |_| Shared::new(target.width)),
            deltas: cells(context.slots(edge.output), |_| Shared::new(delta_users)),
            full_deltas: if separate {
                cells(context.slots(edge.output), |_| Shared::new(source.width))
            } else {
                Vec::new()
            },
            filters: if propagate {
                cells(context.edges[e].filters.len(), |_| Shared::new(context.batch))
            } else {
                Vec::new()
            },
            full_extent,
        }
    }
}

struct Backward<'a> {
    context: &'a PassContext<'a>,
    optimizer: Sgd,
    activations: &'a [Vec<Volume>],
    input_gradients: bool,
    deltas: Vec<Vec<OnceCell<Volume>>>,
    /// Per node, `max(fan_out, 1)` cells per slot, output nodes hold the supplied gradient.
    contributions: Vec<Vec<Cell>>,
    countdowns: Vec<Vec<Countdown>>,
    /// Per edge, `batch` cells per filter.
    gradients: Vec<Vec<Cell>>,
    updates: Vec<Vec<Countdown>>,
    /// Per edge with bias, `batch` cells per output channel.
    bias_gradients: Vec<Vec<Mutex<Option<f32>>>>,
    bias_updates: Vec<Vec<Countdown>>,
    /// `None` for direct edges.
    spectra: Vec<Option<BackwardSpectra>>,
}

impl Backward<'_> {
    fn run(&self, task: BackwardTask, ready: &mut Vec<BackwardTask>) -> Result<()> {
        match task {
            BackwardTask::Node { node, slot } => self.node(node, slot, ready),
            BackwardTask::Edge { edge, sample, i, j } => self.edge(edge, sample, i, j, ready),
            BackwardTask::Update { edge, filter } => self.update(edge, filter),
            BackwardTask::BiasUpdate { edge, channel } => self.update_bias(edge, channel),
        }
    }
    fn propagates(&self, e: usize) -> bool {
        let graph = self.context.graph;
        !graph.nodes[graph.edges[e].input].is_input() || self.input_gradients
    }
    fn node(&self, n: usize, slot: usize, ready: &mut Vec<BackwardTask>) -> Result<()> {
        let context = self.context;
        let graph = context.graph;
        let node = &graph.nodes[n];
        let cells = node.fan_out.max(1);
        let mut delta = sum(&self.contributions[n][slot * cells..(slot + 1) * cells])?;
        if node.is_input() {
            return publish(&self.deltas[n][slot], delta);
        }
        node.function
            .gradient_mut(&mut *delta, &*self.activations[n][slot]);
        let sample = slot / node.width;
        let j = slot % node.width;
        for &e in node.incoming.iter() {
            if context.edges[e].biases.is_empty() {
                continue;
            }
            *self.bias_gradients[e][j * context.batch + sample].lock() = Some(delta.sum());
            if self.bias_updates[e][j].arrive() {
                ready.push(BackwardTask::BiasUpdate {
                    edge: e,
                    channel: j,
                });
            }
        }
        publish(&self.deltas[n][slot], delta)?;
        for &e in node.incoming.iter() {
            let width = graph.nodes[graph.edges[e].input].width;
            ready.extend((0..width).map(|i| BackwardTask::Edge {
                edge: e,
                sample,
                i,
                j,
            }));
        }
        Ok(())
    }
    fn edge(
        &self,
        e: usize,
        sample: usize,
        i: usize,
        j: usize,
        ready: &mut Vec<BackwardTask>,
    ) -> Result<()> {
        let context = self.context;
        let graph = context.graph;
        let edge = &graph.edges[e];
        let source = &graph.nodes[edge.input];
        let target = &graph.nodes[edge.output];
        let source_slot = sample * source.width + i;
        let target_slot = sample * target.width + j;
        let delta = published(&self.deltas[edge.output][target_slot])?;
        let filter = i * target.width + j;
        if self.propagates(e) {
            let grad = self.input_gradient(e, target_slot, filter, delta)?;
            *self.contributions[edge.input][source_slot * source.fan_out + edge.output_offset + j]
                .lock() = Some(grad);
            if self.countdowns[edge.input][source_slot].arrive() {
                ready.push(BackwardTask::Node {
                    node: edge.input,
                    slot: source_slot,
                });
            }
        }
        let grad = self.filter_gradient(e, source_slot, target_slot, delta)?;
        *self.gradients[e][filter * context.batch + sample].lock() = Some(grad);
        if self.updates[e][filter].arrive() {
            ready.push(BackwardTask::Update { edge: e, filter });
        }
        Ok(())
    }
    fn input_gradient(
        &self,
        e: usize,
        target_slot: usize,
        f: usize,
        delta: &Volume,
    ) -> Result<Volume> {
        let context = self.context;
        let edge = &context.graph.edges[e];
        let source = &context.graph.nodes[edge.input];
        let filters = &context.edges[e];
        let Some(spectra) = &self.spectra[e] else {
            let filter = filters.filters[f].read();
            return context.timed(|| {
                filters.strategy.backward_input(
                    delta.view(),
                    filter.weights.view(),
                    edge.stride(),
                    source.size,
                )
            });
        };
        let cell = if spectra.full_deltas.is_empty() {
            &spectra.deltas[target_slot]
        } else {
            &spectra.full_deltas[target_slot]
        };
        let g = spectrum(
            context,
            cell,
            delta.view(),
            edge.stride(),
            spectra.full_extent,
        )?;
        let w = spectra.filters[f].get_or_try_init(|| {
            let filter = filters.filters[f].read();
            context.timed(|| Spectrum::new(filter.weights.view(), [1; 3], spectra.full_extent))
        })?;
        let grad = context.timed(|| fft::convolve(&g, &w, source.size));
        drop((g, w));
        cell.release();
        spectra.filters[f].release();
        grad
    }
    fn filter_gradient(
        &self,
        e: usize,
        source_slot: usize,
        target_slot: usize,
        delta: &Volume,
    ) -> Result<Volume> {
        let context = self.context;
        let edge = &context.graph.edges[e];
        let source = &context.graph.nodes[edge.input];
        let input = &self.activations[edge.input][source_slot];
        let Some(spectra) = &self.spectra[e] else {
            return context.timed(|| {
                context.edges[e].strategy.backward_filter(
                    input.view(),
                    delta.view(),
                    edge.stride(),
                    edge.filter(),
                )
            });
        };
        let x = spectrum(
            context,
            &spectra.inputs[source_slot],
            input.view(),
            [1; 3],
            source.size,
        )?;
        let g = spectrum(
            context,
            &spectra.deltas[target_slot],
            delta.view(),
            edge.stride(),
            source.size,
        )?;
        let grad = context.timed(|| fft::correlate(&x, &g, [1; 3], edge.filter()));
        drop((x, g));
        spectra.inputs[source_slot].release();
        spectra.deltas[target_slot].release();
        grad
    }
    fn update(&self, e: usize, filter: usize) -> Result<()> {
        let batch = self.context.batch;
        let grad = sum(&self.gradients[e][filter * batch..(filter + 1) * batch])?;
        self.context.edges[e].filters[filter]
            .write()
            .update(&self.optimizer, grad.view(), batch);
        Ok(())
    }
    fn update_bias(&self, e: usize, channel: usize) -> Result<()> {
        let batch = self.context.batch;
        let mut grad = 0.;
        for cell in self.bias_gradients[e][channel * batch..(channel + 1) * batch].iter() {
            grad += cell
                .lock()
                .take()
                .ok_or_else(|| anyhow!("Expected a bias gradient!"))?;
        }
        self.context.edges[e].biases[channel]
            .write()
            .update(&self.optimizer, grad, batch);
        Ok(())
    }
}

/// Runs the backward pass and updates every filter and bias.
///
/// `grads` holds the validated output gradients of each output node. If
/// `input_gradients`, returns the gradients of the input nodes (other nodes are empty).
pub(super) fn backward(
    context: &PassContext,
    optimizer: Sgd,
    activations: &[Vec<Volume>],
    grads: Vec<(usize, Vec<Volume>)>,
    input_gradients: bool,
) -> Result<Vec<Vec<Volume>>> {
    let graph = context.graph;
    let nodes = graph.nodes.len();
    let edges = graph.edges.len();
    let contributions: Vec<Vec<Cell>> = cells(nodes, |n| {
        cells(context.slots(n) * graph.nodes[n].fan_out.max(1), |_| {
            Mutex::new(None)
        })
    });
    let mut seeds = Vec::new();
    for (n, volumes) in grads {
        for (slot, volume) in volumes.into_iter().enumerate() {
            *contributions[n][slot].lock() = Some(volume);
            seeds.push(BackwardTask::Node { node: n, slot });
        }
    }
    let propagates =
        |e: usize| !graph.nodes[graph.edges[e].input].is_input() || input_gradients;
    let pass = Backward {
        context,
        optimizer,
        activations,
        input_gradients,
        deltas: cells(nodes, |n| cells(context.slots(n), |_| OnceCell::new())),
        contributions,
        countdowns: cells(nodes, |n| {
            cells(context.slots(n), |_| Countdown::new(graph.nodes[n].fan_out))
        }),
        gradients: cells(edges, |e| {
            cells(context.edges[e].filters.len() * context.batch, |_| {
                Mutex::new(None)
            })
        }),
        updates: cells(edges, |e| {
            cells(context.edges[e].filters.len(), |_| {
                Countdown::new(context.batch)
            })
        }),
        bias_gradients: cells(edges, |e| {
            cells(context.edges[e].biases.len() * context.batch, |_| {
                Mutex::new(None)
            })
        }),
        bias_updates: cells(edges, |e| {
            cells(context.edges[e].biases.len(), |_| {
                Countdown::new(context.batch)
            })
        }),
        spectra: cells(edges, |e| {
            is_fft(context, e).then(|| BackwardSpectra::new(context, e, propagates(e)))
        }),
    };
    tracing::debug!(
        batch = context.batch,
        seeds = seeds.len(),
        edge_tasks = context.edge_tasks(),
        input_gradients,
        "backward pass"
    );
    context
        .scheduler
        .run(seeds, |task, ready| pass.run(task, ready))?;
    if !input_gradients {
        return Ok(Vec::new());
    }
    let Backward { deltas, .. } = pass;
    let mut deltas = into_volumes(deltas);
    for (n, node) in graph.nodes.iter().enumerate() {
        if !node.is_input() {
            deltas[n].clear();
        }
    }
    Ok(deltas)
}
