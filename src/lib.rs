/*!
# **cubenet**
A training engine for volumetric (3-D) convolutional networks.

A network is a directed acyclic graph of nodes (layers of volumes with a transfer function)
and edges (learned 3-D convolutions with an optional stride). Forward and backward passes
are split into per-volume tasks that a fixed pool of workers executes as their inputs
become ready. Each convolution runs either directly or through the FFT, see
[`ConvStrategy`].

# Example
```
# use cubenet::{descriptor::{EdgeDescriptor, NodeDescriptor}, transfer::TransferFunction, Network, Volume};
# use std::collections::HashMap;
# fn main() -> anyhow::Result<()> {
let mut network = Network::builder()
    .nodes(vec![
        NodeDescriptor::input("input", 1),
        NodeDescriptor::transfer("output", TransferFunction::Logistics, 1),
    ])
    .edges(vec![EdgeDescriptor::conv("conv", "input", "output", [3; 3])])
    .output_size([4; 3])
    .threads(2)
    .build()?;
let input = Volume::zeros(network.input_size("input")?)?;
let outputs = network.forward(HashMap::from([("input".to_string(), vec![input])]))?;
let prediction = &outputs["output"][0];
let label = Volume::from_elem([4; 3], 1.)?;
let loss = cubenet::loss::binomial_cross_entropy(prediction, &label)?;
network.backward(HashMap::from([("output".to_string(), vec![loss.gradient])]))?;
# Ok(())
# }
```
*/
#![deny(unsafe_code)]

/// Measured selection of convolution strategies.
pub mod calibrate;
/// 3-D convolution.
pub mod conv;
/// Node and edge descriptors.
pub mod descriptor;
mod error;
/// Weight initialization.
pub mod init;
pub mod loss;
/// Networks.
pub mod network;
/// Transfer functions.
pub mod transfer;
/// Pooled volumes.
pub mod volume;

pub use conv::ConvStrategy;
pub use descriptor::{EdgeDescriptor, NodeDescriptor, Options};
pub use error::Error;
pub use network::{builder::NetworkBuilder, Network, Sgd};
pub use volume::Volume;
