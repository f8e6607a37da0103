//! Definition records handed over by the stencil language front-end
//!
//! The front-end parses the textual kernel and unrolls nothing: it produces
//! one [`InputDef`], one output [`Definition`] and a list of local
//! [`Definition`]s. Expressions stay opaque except for their store index
//! and the loads they perform.

use serde::{Deserialize, Serialize};

use crate::error::{StencilError, StencilResult};

/// Scalar element types understood by the back-ends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalarType {
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Int8,
    Int16,
    Int32,
    Int64,
    Half,
    Float,
    Double,
}

impl ScalarType {
    /// Width of one element in bits
    pub fn width(&self) -> u32 {
        match self {
            ScalarType::Uint8 | ScalarType::Int8 => 8,
            ScalarType::Uint16 | ScalarType::Int16 | ScalarType::Half => 16,
            ScalarType::Uint32 | ScalarType::Int32 | ScalarType::Float => 32,
            ScalarType::Uint64 | ScalarType::Int64 | ScalarType::Double => 64,
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, ScalarType::Half | ScalarType::Float | ScalarType::Double)
    }
}

impl std::fmt::Display for ScalarType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ScalarType::Uint8 => "uint8",
            ScalarType::Uint16 => "uint16",
            ScalarType::Uint32 => "uint32",
            ScalarType::Uint64 => "uint64",
            ScalarType::Int8 => "int8",
            ScalarType::Int16 => "int16",
            ScalarType::Int32 => "int32",
            ScalarType::Int64 => "int64",
            ScalarType::Half => "half",
            ScalarType::Float => "float",
            ScalarType::Double => "double",
        };
        write!(f, "{}", name)
    }
}

/// A read of `name` at a relative index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Load {
    pub name: String,
    pub idx: Vec<i64>,
}

impl Load {
    pub fn new(name: impl Into<String>, idx: Vec<i64>) -> Self {
        Self {
            name: name.into(),
            idx,
        }
    }
}

/// One expression alternative of a definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageExpr {
    /// Normalized store index
    pub idx: Vec<i64>,
    /// Every load performed by the expression
    pub loads: Vec<Load>,
    /// Source text, carried through for the emitters
    #[serde(default)]
    pub text: String,
}

impl StageExpr {
    pub fn new(idx: Vec<i64>, loads: Vec<Load>) -> Self {
        Self {
            idx,
            loads,
            text: String::new(),
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }
}

/// The primary input stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputDef {
    pub name: String,
    pub scalar_type: ScalarType,
    #[serde(default = "default_channels")]
    pub channel_count: usize,
}

impl InputDef {
    pub fn new(name: impl Into<String>, scalar_type: ScalarType) -> Self {
        Self {
            name: name.into(),
            scalar_type,
            channel_count: 1,
        }
    }

    pub fn with_channels(mut self, channel_count: usize) -> Self {
        self.channel_count = channel_count;
        self
    }
}

/// Whether a definition produces an intermediate or the pipeline result
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DefinitionKind {
    #[default]
    Local,
    Output,
}

/// A local or output tensor definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Definition {
    #[serde(default)]
    pub kind: DefinitionKind,
    pub name: String,
    pub scalar_type: ScalarType,
    #[serde(default = "default_channels")]
    pub channel_count: usize,
    pub exprs: Vec<StageExpr>,
    /// Tensor whose border values this definition keeps
    #[serde(default)]
    pub preserve_border: Option<String>,
}

fn default_channels() -> usize {
    1
}

impl Definition {
    pub fn local(name: impl Into<String>, scalar_type: ScalarType, exprs: Vec<StageExpr>) -> Self {
        Self {
            kind: DefinitionKind::Local,
            name: name.into(),
            scalar_type,
            channel_count: 1,
            exprs,
            preserve_border: None,
        }
    }

    pub fn output(name: impl Into<String>, scalar_type: ScalarType, exprs: Vec<StageExpr>) -> Self {
        Self {
            kind: DefinitionKind::Output,
            ..Self::local(name, scalar_type, exprs)
        }
    }

    pub fn with_channels(mut self, channel_count: usize) -> Self {
        self.channel_count = channel_count;
        self
    }

    pub fn is_output(&self) -> bool {
        self.kind == DefinitionKind::Output
    }

    /// Store index shared by every expression alternative.
    ///
    /// Disagreement means the front-end failed to normalize the definition.
    pub fn store_idx(&self) -> StencilResult<&[i64]> {
        let first = self.exprs.first().ok_or_else(|| {
            StencilError::internal(format!("tensor {} has no expression", self.name))
        })?;
        if let Some(other) = self.exprs.iter().find(|e| e.idx != first.idx) {
            return Err(StencilError::internal(format!(
                "normalization went wrong: tensor {} is stored at both {:?} and {:?}",
                self.name, first.idx, other.idx
            )));
        }
        Ok(&first.idx)
    }

    /// All loads across every expression alternative
    pub fn loads(&self) -> impl Iterator<Item = &Load> {
        self.exprs.iter().flat_map(|e| e.loads.iter())
    }

    /// Rename every load through `rename`
    pub fn mutate_loads(&mut self, rename: impl Fn(&str) -> String) {
        for load in self.exprs.iter_mut().flat_map(|e| e.loads.iter_mut()) {
            load.name = rename(&load.name);
        }
    }

    pub fn mutate_store(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// A local copy of this definition, used when an output is re-fed
    /// into the next iteration.
    pub fn to_local(&self) -> Definition {
        Definition {
            kind: DefinitionKind::Local,
            ..self.clone()
        }
    }

    pub fn set_preserve_border(&mut self, from: impl Into<String>) {
        self.preserve_border = Some(from.into());
    }
}
