use crate::{error::Error, init::Init, transfer::TransferFunction};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt::Display};

/// String key value options describing a node or an edge.
///
/// ```
/// # use cubenet::descriptor::Options;
/// let options = Options::new()
///     .push("name", "conv1")
///     .push("type", "conv")
///     .push("size", "5,5,5")
///     .push("input", "input")
///     .push("output", "hidden");
/// assert_eq!(options.get("size"), Some("5,5,5"));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Options {
    map: BTreeMap<String, String>,
}

impl Options {
    /// Empty options.
    pub fn new() -> Self {
        Self::default()
    }
    /// Sets `key` to `value`, replacing a previous value.
    pub fn push(mut self, key: impl Into<String>, value: impl Display) -> Self {
        self.map.insert(key.into(), value.to_string());
        self
    }
    /// The value of `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.map.get(key).map(String::as_str)
    }
    /// Iterates over key value pairs in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.map.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
    fn owner(&self) -> String {
        self.get("name").unwrap_or("<unnamed>").to_string()
    }
    fn require(&self, key: &str) -> Result<&str> {
        self.get(key).ok_or_else(|| {
            Error::MissingOption {
                owner: self.owner(),
                key: key.into(),
            }
            .into()
        })
    }
    fn invalid(&self, key: &str) -> Error {
        Error::InvalidOption {
            owner: self.owner(),
            key: key.into(),
            value: self.get(key).unwrap_or_default().into(),
        }
    }
    fn parse_usize(&self, key: &str) -> Result<usize> {
        let value = self.require(key)?;
        match value.trim().parse::<usize>() {
            Ok(x) if x > 0 => Ok(x),
            _ => Err(self.invalid(key).into()),
        }
    }
    /// Parses `"x,y,z"`, a single value applies to all axes.
    fn parse_dim3(&self, key: &str) -> Result<[usize; 3]> {
        let value = self.require(key)?;
        let values = value
            .split(',')
            .map(|x| x.trim().parse::<usize>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| self.invalid(key))?;
        let dim = match values.as_slice() {
            [x] => [*x; 3],
            [x, y, z] => [*x, *y, *z],
            _ => return Err(self.invalid(key).into()),
        };
        if dim.contains(&0) {
            return Err(self.invalid(key).into());
        }
        Ok(dim)
    }
    fn parse_bool(&self, key: &str) -> Result<Option<bool>> {
        match self.get(key).map(str::trim) {
            None => Ok(None),
            Some("1" | "true") => Ok(Some(true)),
            Some("0" | "false") => Ok(Some(false)),
            Some(_) => Err(self.invalid(key).into()),
        }
    }
    fn parse_bias(&self) -> Result<bool> {
        Ok(self.parse_bool("bias")?.unwrap_or(false))
    }
}

impl<K: Into<String>, V: Display> FromIterator<(K, V)> for Options {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        iter.into_iter()
            .fold(Self::new(), |options, (k, v)| options.push(k, v))
    }
}

/// Node role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// Receives volumes from the caller, has no incoming edges.
    Input,
    /// Sums incoming contributions and applies a transfer function.
    Transfer,
}

/// A node of the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    /// Unique name.
    pub name: String,
    /// Role.
    pub kind: NodeKind,
    /// Non-linearity, ignored for input nodes.
    #[serde(default)]
    pub function: TransferFunction,
    /// Number of feature maps.
    pub width: usize,
}

impl NodeDescriptor {
    /// An input node of `width` channels.
    pub fn input(name: impl Into<String>, width: usize) -> Self {
        Self {
            name: name.into(),
            kind: NodeKind::Input,
            function: TransferFunction::identity(),
            width,
        }
    }
    /// A transfer node of `width` channels applying `function`.
    pub fn transfer(name: impl Into<String>, function: TransferFunction, width: usize) -> Self {
        Self {
            name: name.into(),
            kind: NodeKind::Transfer,
            function,
            width,
        }
    }
    /// Compiles `options`.
    ///
    /// Keys: `name`, `type` (`input` | `transfer`), `size` (the width), `function`
    /// (default `linear`) and `function_args`.
    pub fn from_options(options: &Options) -> Result<Self> {
        let name = options.require("name")?;
        let kind = match options.require("type")? {
            "input" => NodeKind::Input,
            "transfer" => NodeKind::Transfer,
            kind => {
                return Err(Error::UnsupportedType {
                    owner: name.into(),
                    kind: kind.into(),
                }
                .into())
            }
        };
        let width = options.parse_usize("size")?;
        let function = match (kind, options.get("function")) {
            (NodeKind::Transfer, Some(function)) => {
                TransferFunction::parse(function.trim(), options.get("function_args"))?
            }
            _ => TransferFunction::identity(),
        };
        Ok(Self {
            name: name.into(),
            kind,
            function,
            width,
        })
    }
    /// The options that compile back into `self`.
    pub fn to_options(&self) -> Options {
        let options = Options::new()
            .push("name", &self.name)
            .push("size", self.width);
        match self.kind {
            NodeKind::Input => options.push("type", "input"),
            NodeKind::Transfer => {
                let options = options
                    .push("type", "transfer")
                    .push("function", self.function.name());
                match self.function {
                    TransferFunction::Linear { a, b } | TransferFunction::Tanh { a, b } => {
                        options.push("function_args", format!("{a},{b}"))
                    }
                    _ => options,
                }
            }
        }
    }
}

/// How an edge picks its convolution strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConvMode {
    /// By the cost model, see [`ConvStrategy::select`](crate::ConvStrategy::select).
    #[default]
    Auto,
    /// Always direct.
    Direct,
    /// Always FFT.
    Fft,
}

/// A convolutional edge of the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeDescriptor {
    /// Unique name.
    pub name: String,
    /// Source node.
    pub input: String,
    /// Destination node.
    pub output: String,
    /// Filter shape.
    pub filter: [usize; 3],
    /// Stride.
    #[serde(default = "unit_stride")]
    pub stride: [usize; 3],
    /// Weight initialization.
    #[serde(default)]
    pub init: Init,
    /// Whether each output channel has a learned bias.
    #[serde(default)]
    pub bias: bool,
    /// Convolution strategy selection.
    #[serde(default)]
    pub mode: ConvMode,
}

fn unit_stride() -> [usize; 3] {
    [1; 3]
}

impl EdgeDescriptor {
    /// A convolution from `input` to `output` with `filter`.
    ///
    /// Defaults:
    /// - stride: 1
    /// - init: [`Init::Xavier`]
    /// - bias: false
    /// - mode: [`ConvMode::Auto`]
    pub fn conv(
        name: impl Into<String>,
        input: impl Into<String>,
        output: impl Into<String>,
        filter: [usize; 3],
    ) -> Self {
        Self {
            name: name.into(),
            input: input.into(),
            output: output.into(),
            filter,
            stride: unit_stride(),
            init: Init::default(),
            bias: false,
            mode: ConvMode::Auto,
        }
    }
    /// With `stride`.
    pub fn with_stride(self, stride: [usize; 3]) -> Self {
        Self { stride, ..self }
    }
    /// With `init`.
    pub fn with_init(self, init: Init) -> Self {
        Self { init, ..self }
    }
    /// With or without bias.
    pub fn with_bias(self, bias: bool) -> Self {
        Self { bias, ..self }
    }
    /// With `mode`.
    pub fn with_mode(self, mode: ConvMode) -> Self {
        Self { mode, ..self }
    }
    /// Compiles `options`.
    ///
    /// Keys: `name`, `type` (`conv`), `input`, `output`, `size` (`"x,y,z"`), `stride`
    /// (default 1), `init` (default `xavier`), `init_args`, `bias` (default false) and
    /// `fft` (`auto`, `0`/`false`/`direct`, `1`/`true`/`fft`, default `auto`).
    pub fn from_options(options: &Options) -> Result<Self> {
        let name = options.require("name")?;
        let kind = options.require("type")?;
        if kind != "conv" {
            return Err(Error::UnsupportedType {
                owner: name.into(),
                kind: kind.into(),
            }
            .into());
        }
        let input = options.require("input")?;
        let output = options.require("output")?;
        let filter = options.parse_dim3("size")?;
        let stride = if options.get("stride").is_some() {
            options.parse_dim3("stride")?
        } else {
            unit_stride()
        };
        let init = match options.get("init") {
            Some(init) => Init::parse(name, init.trim(), options.get("init_args"))?,
            None => Init::default(),
        };
        let bias = options.parse_bias()?;
        let mode = match options.get("fft").map(str::trim) {
            None | Some("auto") => ConvMode::Auto,
            Some("0" | "false" | "direct") => ConvMode::Direct,
            Some("1" | "true" | "fft") => ConvMode::Fft,
            Some(_) => return Err(options.invalid("fft").into()),
        };
        Ok(Self {
            name: name.into(),
            input: input.into(),
            output: output.into(),
            filter,
            stride,
            init,
            bias,
            mode,
        })
    }
    /// The options that compile back into `self`.
    pub fn to_options(&self) -> Options {
        let dim3 = |[x, y, z]: [usize; 3]| format!("{x},{y},{z}");
        let mut options = Options::new()
            .push("name", &self.name)
            .push("type", "conv")
            .push("input", &self.input)
            .push("output", &self.output)
            .push("size", dim3(self.filter))
            .push("stride", dim3(self.stride))
            .push("init", self.init.name())
            .push("bias", u8::from(self.bias));
        if let Some(args) = self.init.args() {
            options = options.push("init_args", args);
        }
        match self.mode {
            ConvMode::Auto => options,
            ConvMode::Direct => options.push("fft", 0),
            ConvMode::Fft => options.push("fft", 1),
        }
    }
}

/// Compiles node and edge option lists.
pub fn compile(nodes: &[Options], edges: &[Options]) -> Result<(Vec<NodeDescriptor>, Vec<EdgeDescriptor>)> {
    let nodes = nodes
        .iter()
        .map(NodeDescriptor::from_options)
        .collect::<Result<_>>()?;
    let edges = edges
        .iter()
        .map(EdgeDescriptor::from_options)
        .collect::<Result<_>>()?;
    Ok((nodes, edges))
}
