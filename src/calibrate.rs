use crate::{
    conv::ConvStrategy,
    descriptor::{ConvMode, EdgeDescriptor, NodeDescriptor},
    error::Error,
    network::Network,
    volume::Volume,
};
use anyhow::Result;
use ndarray::Array3;
use rand::{rngs::SmallRng, Rng, SeedableRng};
use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

/// Average cost of one forward + backward round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timing {
    /// Wall time per round.
    pub total: Duration,
    /// Time per round and worker spent in convolution kernels.
    pub compute: Duration,
}

fn random_volumes(
    rng: &mut SmallRng,
    names: Vec<&str>,
    count: impl Fn(&str) -> Result<(usize, [usize; 3])>,
) -> Result<HashMap<String, Vec<Volume>>> {
    let mut volumes = HashMap::with_capacity(names.len());
    for name in names {
        let (count, shape) = count(name)?;
        let slots = (0..count)
            .map(|_| {
                let array = Array3::from_shape_simple_fn(shape, || rng.gen_range(-1f32..1.));
                Volume::from_array(array.view())
            })
            .collect::<Result<_>>()?;
        volumes.insert(name.to_string(), slots);
    }
    Ok(volumes)
}

fn widths(nodes: &[NodeDescriptor]) -> HashMap<&str, usize> {
    nodes
        .iter()
        .map(|node| (node.name.as_str(), node.width))
        .collect()
}

/// Measures the average forward + backward round of a network.
///
/// Builds the network with batch 1, runs one warm up round to fill the volume pool and
/// the FFT plan cache, then averages over `rounds`. Weights are not changed.
///
/// **Errors**
/// - `rounds` is 0.
/// - The network could not be built or a pass failed.
pub fn benchmark(
    nodes: &[NodeDescriptor],
    edges: &[EdgeDescriptor],
    output_size: [usize; 3],
    threads: usize,
    rounds: usize,
) -> Result<Timing> {
    if rounds == 0 {
        return Err(Error::InvalidOption {
            owner: "benchmark".into(),
            key: "rounds".into(),
            value: rounds.to_string(),
        }
        .into());
    }
    let mut network = Network::builder()
        .nodes(nodes.to_vec())
        .edges(edges.to_vec())
        .output_size(output_size)
        .threads(threads)
        .seed(0)
        .build()?;
    network.set_learning_rate(0.);
    let widths = widths(nodes);
    let width = |name: &str| widths.get(name).copied().unwrap_or(1);
    let mut rng = SmallRng::seed_from_u64(0);
    let input_names: Vec<&str> = network.input_names();
    let inputs = random_volumes(&mut rng, input_names, |name| {
        Ok((width(name), network.input_size(name)?))
    })?;
    let grads = random_volumes(&mut rng, network.output_names(), |name| {
        Ok((width(name), output_size))
    })?;
    let copy = |volumes: &HashMap<String, Vec<Volume>>| -> Result<HashMap<String, Vec<Volume>>> {
        volumes
            .iter()
            .map(|(name, slots)| {
                let slots = slots.iter().map(Volume::try_clone).collect::<Result<_>>()?;
                Ok((name.clone(), slots))
            })
            .collect()
    };
    let round = |network: &mut Network| -> Result<()> {
        network.forward(copy(&inputs)?)?;
        network.backward(copy(&grads)?)
    };
    round(&mut network)?;
    network.take_conv_time();
    let start = Instant::now();
    for _ in 0..rounds {
        round(&mut network)?;
    }
    let total = start.elapsed();
    let compute = network.take_conv_time();
    let rounds = rounds as u32;
    let timing = Timing {
        total: total / rounds,
        compute: compute / (rounds * network.threads() as u32),
    };
    tracing::debug!(?timing, threads, "benchmark");
    Ok(timing)
}

/// Chooses the convolution strategy of every edge by measurement.
///
/// Starts from the strategies the cost model selects (or the explicit modes), then flips
/// one edge at a time, keeping a flip only if the round gets faster. Every edge's `mode`
/// is overwritten with the chosen strategy. Returns the best timing.
pub fn optimize(
    nodes: &[NodeDescriptor],
    edges: &mut [EdgeDescriptor],
    output_size: [usize; 3],
    threads: usize,
    rounds: usize,
) -> Result<Timing> {
    let network = Network::builder()
        .nodes(nodes.to_vec())
        .edges(edges.to_vec())
        .output_size(output_size)
        .threads(1)
        .seed(0)
        .build()?;
    for edge in edges.iter_mut() {
        edge.mode = mode(network.edge_strategy(&edge.name)?);
    }
    drop(network);
    let mut best = benchmark(nodes, edges, output_size, threads, rounds)?;
    tracing::info!(?best, "initial strategies");
    for index in 0..edges.len() {
        let previous = edges[index].mode;
        edges[index].mode = flip(previous);
        let timing = benchmark(nodes, edges, output_size, threads, rounds)?;
        let edge = &edges[index];
        if timing.total < best.total {
            tracing::info!(edge = %edge.name, mode = ?edge.mode, ?timing, "keeping flipped strategy");
            best = timing;
        } else {
            tracing::info!(edge = %edge.name, mode = ?previous, ?timing, "reverting flipped strategy");
            edges[index].mode = previous;
        }
    }
    Ok(best)
}

fn mode(strategy: ConvStrategy) -> ConvMode {
    match strategy {
        ConvStrategy::Direct => ConvMode::Direct,
        ConvStrategy::Fft => ConvMode::Fft,
    }
}

fn flip(mode: ConvMode) -> ConvMode {
    match mode {
        ConvMode::Direct => ConvMode::Fft,
        ConvMode::Fft | ConvMode::Auto => ConvMode::Direct,
    }
}
