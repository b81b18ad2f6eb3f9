use anyhow::Result;
use approx::assert_abs_diff_eq;
use cubenet::{
    calibrate,
    descriptor::{self, ConvMode, Options},
    init::Init,
    loss,
    transfer::TransferFunction,
    EdgeDescriptor, Error, Network, NodeDescriptor, Sgd, Volume,
};
use libtest_mimic::{Arguments, Trial};
use ndarray::Array3;
use rand::{rngs::SmallRng, Rng, SeedableRng};
use std::collections::HashMap;

fn main() {
    let args = Arguments::from_args();
    let tests = vec![
        trial("training_reduces_loss", training_reduces_loss),
        trial("strategies_agree", strategies_agree),
        trial("options_network", options_network),
        trial("batched_forward", batched_forward),
        trial("optimized_edges_build", optimized_edges_build),
        trial("backward_requires_forward", backward_requires_forward),
    ];
    libtest_mimic::run(&args, tests).exit()
}

fn trial(name: &str, f: fn() -> Result<()>) -> Trial {
    Trial::test(name, move || f().map_err(|e| format!("{e:?}").into()))
}

fn random_volume(rng: &mut SmallRng, shape: [usize; 3]) -> Result<Volume> {
    let array = Array3::from_shape_simple_fn(shape, || rng.gen_range(-1f32..1.));
    Volume::from_array(array.view())
}

fn named(name: &str, volumes: Vec<Volume>) -> HashMap<String, Vec<Volume>> {
    HashMap::from([(name.to_string(), volumes)])
}

fn three_layer(mode: ConvMode) -> (Vec<NodeDescriptor>, Vec<EdgeDescriptor>) {
    (
        vec![
            NodeDescriptor::input("input", 1),
            NodeDescriptor::transfer("hidden", TransferFunction::Tanh { a: 1., b: 1. }, 3),
            NodeDescriptor::transfer("output", TransferFunction::Logistics, 1),
        ],
        vec![
            EdgeDescriptor::conv("conv1", "input", "hidden", [3; 3])
                .with_stride([2, 2, 1])
                .with_mode(mode),
            EdgeDescriptor::conv("conv2", "hidden", "output", [2; 3])
                .with_bias(true)
                .with_mode(mode),
        ],
    )
}

fn training_reduces_loss() -> Result<()> {
    let (nodes, edges) = three_layer(ConvMode::Auto);
    let mut network = Network::builder()
        .nodes(nodes)
        .edges(edges)
        .output_size([4; 3])
        .threads(2)
        .optimizer(Sgd::builder().learning_rate(0.01).momentum(0.5).build())
        .seed(3)
        .build()?;
    let mut rng = SmallRng::seed_from_u64(11);
    let input = random_volume(&mut rng, network.input_size("input")?)?;
    let label = Volume::from_elem([4; 3], 1.)?;
    let mut losses = Vec::new();
    for _ in 0..40 {
        let mut outputs = network.forward(named("input", vec![input.try_clone()?]))?;
        let prediction = outputs.remove("output").unwrap().remove(0);
        let loss = loss::square_loss(&prediction, &label)?;
        losses.push(loss.loss);
        network.backward(named("output", vec![loss.gradient]))?;
    }
    let first = losses[0];
    let last = *losses.last().unwrap();
    assert!(last < 0.5 * first, "{losses:?}");
    Ok(())
}

fn strategies_agree() -> Result<()> {
    let build = |mode| {
        let (nodes, edges) = three_layer(mode);
        Network::builder()
            .nodes(nodes)
            .edges(edges)
            .output_size([3, 4, 2])
            .threads(3)
            .seed(5)
            .build()
    };
    let mut direct = build(ConvMode::Direct)?;
    let mut fft = build(ConvMode::Fft)?;
    assert_eq!(direct.edge_strategy("conv1")?, cubenet::ConvStrategy::Direct);
    assert_eq!(fft.edge_strategy("conv1")?, cubenet::ConvStrategy::Fft);
    let mut rng = SmallRng::seed_from_u64(2);
    let input = random_volume(&mut rng, direct.input_size("input")?)?;
    let grad = random_volume(&mut rng, [3, 4, 2])?;
    let run = |network: &mut Network| -> Result<(Array3<f32>, Array3<f32>)> {
        let mut outputs = network.forward(named("input", vec![input.try_clone()?]))?;
        let output = outputs.remove("output").unwrap().remove(0).into_array();
        let mut deltas =
            network.backward_with_input_gradients(named("output", vec![grad.try_clone()?]))?;
        let delta = deltas.remove("input").unwrap().remove(0).into_array();
        Ok((output, delta))
    };
    let (direct_output, direct_delta) = run(&mut direct)?;
    let (fft_output, fft_delta) = run(&mut fft)?;
    let scale = |x: &Array3<f32>| x.iter().fold(1f32, |m, x| m.max(x.abs()));
    assert_abs_diff_eq!(
        direct_output,
        fft_output,
        epsilon = 1e-4 * scale(&direct_output)
    );
    assert_abs_diff_eq!(
        direct_delta,
        fft_delta,
        epsilon = 1e-4 * scale(&direct_delta)
    );
    for edge in ["conv1", "conv2"] {
        for (a, b) in direct.weights(edge)?.iter().zip(fft.weights(edge)?.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-4 * scale(a));
        }
    }
    Ok(())
}

fn options_network() -> Result<()> {
    let nodes = [
        Options::new().push("name", "input").push("type", "input").push("size", 1),
        Options::new()
            .push("name", "hidden")
            .push("type", "transfer")
            .push("function", "rectify_linear")
            .push("size", 2),
        Options::new()
            .push("name", "output")
            .push("type", "transfer")
            .push("function", "linear")
            .push("function_args", "2,0.5")
            .push("size", 1),
    ];
    let edges = [
        Options::new()
            .push("name", "e1")
            .push("type", "conv")
            .push("input", "input")
            .push("output", "hidden")
            .push("size", "3,3,1")
            .push("init", "gaussian")
            .push("init_args", "0,0.1"),
        Options::new()
            .push("name", "e2")
            .push("type", "conv")
            .push("input", "hidden")
            .push("output", "output")
            .push("size", "2")
            .push("stride", "1")
            .push("fft", "0"),
    ];
    let (node_descriptors, edge_descriptors) = descriptor::compile(&nodes, &edges)?;
    assert_eq!(
        edge_descriptors[0].init,
        Init::Gaussian {
            mean: 0.,
            sigma: 0.1
        }
    );
    let json = serde_json::to_string(&edge_descriptors)?;
    let parsed: Vec<EdgeDescriptor> = serde_json::from_str(&json)?;
    assert_eq!(parsed, edge_descriptors);
    assert_eq!(node_descriptors[2].to_options().get("function"), Some("linear"));

    let network = Network::builder()
        .options(&nodes, &edges)?
        .output_size([5, 5, 5])
        .threads(1)
        .build()?;
    assert_eq!(network.field_of_view(), [4, 4, 2]);
    assert_eq!(network.input_size("input")?, [8, 8, 6]);
    assert_eq!(network.node_size("hidden")?, [6, 6, 6]);
    assert_eq!(network.edge_strategy("e2")?, cubenet::ConvStrategy::Direct);
    assert_eq!(network.input_names(), ["input"]);
    assert_eq!(network.output_names(), ["output"]);
    Ok(())
}

fn batched_forward() -> Result<()> {
    let (nodes, edges) = three_layer(ConvMode::Direct);
    let mut batched = Network::builder()
        .nodes(nodes.clone())
        .edges(edges.clone())
        .output_size([2; 3])
        .max_batch(2)
        .seed(9)
        .build()?;
    let mut single = Network::builder()
        .nodes(nodes)
        .edges(edges)
        .output_size([2; 3])
        .seed(9)
        .build()?;
    let mut rng = SmallRng::seed_from_u64(4);
    let shape = batched.input_size("input")?;
    let samples = [random_volume(&mut rng, shape)?, random_volume(&mut rng, shape)?];
    let outputs = batched.forward(named(
        "input",
        samples.iter().map(Volume::try_clone).collect::<Result<_>>()?,
    ))?;
    assert_eq!(outputs["output"].len(), 2);
    for (sample, output) in samples.iter().zip(outputs["output"].iter()) {
        let expected = single.forward(named("input", vec![sample.try_clone()?]))?;
        assert_eq!(**output, *expected["output"][0]);
    }
    let err = single
        .forward(named(
            "input",
            samples.iter().map(Volume::try_clone).collect::<Result<_>>()?,
        ))
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<Error>(),
        Some(Error::InvalidBatch { .. })
    ));
    Ok(())
}

fn optimized_edges_build() -> Result<()> {
    let (nodes, mut edges) = three_layer(ConvMode::Auto);
    let timing = calibrate::optimize(&nodes, &mut edges, [3; 3], 2, 1)?;
    assert!(timing.total >= timing.compute / 2);
    assert!(edges.iter().all(|edge| edge.mode != ConvMode::Auto));
    let network = Network::builder()
        .nodes(nodes)
        .edges(edges.clone())
        .output_size([3; 3])
        .build()?;
    for edge in edges.iter() {
        let strategy = network.edge_strategy(&edge.name)?;
        let expected = match edge.mode {
            ConvMode::Fft => cubenet::ConvStrategy::Fft,
            _ => cubenet::ConvStrategy::Direct,
        };
        assert_eq!(strategy, expected);
    }
    Ok(())
}

fn backward_requires_forward() -> Result<()> {
    let (nodes, edges) = three_layer(ConvMode::Auto);
    let mut network = Network::builder()
        .nodes(nodes)
        .edges(edges)
        .output_size([2; 3])
        .build()?;
    let grad = Volume::zeros([2; 3])?;
    let err = network.backward(named("output", vec![grad])).unwrap_err();
    assert_eq!(err.downcast_ref::<Error>(), Some(&Error::NoForwardPass));
    Ok(())
}
