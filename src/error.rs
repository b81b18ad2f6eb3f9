use thiserror::Error as ThisError;

/// Errors reported by graph construction and passes.
///
/// Public functions return [`anyhow::Result`]; use
/// [`downcast_ref`](anyhow::Error::downcast_ref) to inspect the variant.
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
pub enum Error {
    /// Two nodes or two edges share a name.
    #[error("Duplicate {kind} name {name:?}!")]
    DuplicateName {
        /// "node" or "edge".
        kind: &'static str,
        /// The repeated name.
        name: String,
    },
    /// An edge references a node that does not exist.
    #[error("Edge {edge:?} references unknown node {node:?}!")]
    UnknownNode {
        /// The edge.
        edge: String,
        /// The missing endpoint.
        node: String,
    },
    /// A node or edge name was not found.
    #[error("Unknown {kind} {name:?}!")]
    NotFound {
        /// "node" or "edge".
        kind: &'static str,
        /// The name.
        name: String,
    },
    /// The graph contains a cycle through the listed nodes.
    #[error("Graph has a cycle through {nodes:?}!")]
    Cycle {
        /// Nodes that could not be ordered.
        nodes: Vec<String>,
    },
    /// A required option is absent.
    #[error("{owner:?} is missing option {key:?}!")]
    MissingOption {
        /// Node or edge name (or "<unnamed>").
        owner: String,
        /// The key.
        key: String,
    },
    /// An option could not be parsed.
    #[error("{owner:?} has invalid option {key:?} = {value:?}!")]
    InvalidOption {
        /// Node or edge name.
        owner: String,
        /// The key.
        key: String,
        /// The raw value.
        value: String,
    },
    /// The transfer function name is not supported.
    #[error("Unknown transfer function {0:?}!")]
    UnknownTransferFunction(String),
    /// The node or edge type is not supported.
    #[error("{owner:?} has unsupported type {kind:?}!")]
    UnsupportedType {
        /// Node or edge name.
        owner: String,
        /// The type.
        kind: String,
    },
    /// The graph structure is invalid.
    #[error("Invalid graph: {0}")]
    InvalidGraph(String),
    /// Sizes derived along different paths disagree.
    #[error("Node {node:?} has inconsistent sizes {first:?} and {second:?}!")]
    SizeMismatch {
        /// The node.
        node: String,
        /// Size derived first.
        first: [usize; 3],
        /// Conflicting size.
        second: [usize; 3],
    },
    /// A supplied volume does not have the expected shape.
    #[error("Expected {name:?} volume {index} to have shape {expected:?}, found {found:?}!")]
    ShapeMismatch {
        /// Node name.
        name: String,
        /// Slot index.
        index: usize,
        /// Expected shape.
        expected: [usize; 3],
        /// Found shape.
        found: [usize; 3],
    },
    /// A node is absent from the supplied volumes, or an unknown name was supplied.
    #[error("Expected volumes for {expected:?}, found {found:?}!")]
    MissingVolume {
        /// Names required.
        expected: Vec<String>,
        /// Names supplied.
        found: Vec<String>,
    },
    /// The number of supplied volumes is not a valid batch.
    #[error("{name:?} received {count} volumes for width {width}, max batch {max_batch}!")]
    InvalidBatch {
        /// Node name.
        name: String,
        /// Volumes supplied.
        count: usize,
        /// Node width.
        width: usize,
        /// Configured maximum batch.
        max_batch: usize,
    },
    /// `backward` was called before `forward`.
    #[error("Backward requires a preceding forward pass!")]
    NoForwardPass,
    /// A volume could not be allocated.
    #[error("Out of memory allocating volume {shape:?}!")]
    OutOfMemory {
        /// The requested shape.
        shape: [usize; 3],
    },
}
