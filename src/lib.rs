//! Stencil to Dataflow Scheduler
//!
//! This library takes the definitions of a stencil kernel (one input, one
//! output and a set of windowed local tensors), schedules them on a single
//! serialized time axis and synthesizes the reuse buffers and forwarding
//! network a streaming hardware pipeline needs.
//!
//! # Example
//!
//! ```rust
//! use stencil_dataflow::{Definition, InputDef, Load, ScalarType, StageExpr, Stencil, StencilConfig};
//!
//! let config = StencilConfig::new(vec![233, 0], 1); // 233-wide tiles, one lane
//! let output = Definition::output(
//!     "output",
//!     ScalarType::Uint16,
//!     vec![StageExpr::new(vec![0, 0], vec![Load::new("input", vec![0, 0]), Load::new("input", vec![0, 1])])],
//! );
//! let stencil = Stencil::new(config, InputDef::new("input", ScalarType::Uint16), output, vec![]).unwrap();
//! assert_eq!(stencil.output().offset, 233);
//! ```

pub mod ast;
pub mod config;
pub mod error;
pub mod forward;
pub mod graph;
pub mod report;
pub mod reuse;
pub mod schedule;
pub mod stencil;
pub mod tiling;
pub mod window;

pub use ast::*;
pub use config::{BorderPolicy, ClusterMode, StencilConfig};
pub use error::{SemanticWarning, StencilError, StencilResult};
pub use forward::{BufferParam, Forwarders, Forwarding, Param, Port};
pub use graph::{Graph, Stage, StageId, Tensor, TensorId};
pub use report::DataflowReport;
pub use reuse::{ReuseBuffer, ReusePlan};
pub use stencil::{Stencil, StencilProgram};
pub use tiling::{serialize, serialize_all, Window};

/// Parse a JSON stencil program and produce its dataflow report
pub fn compile(source: &str) -> StencilResult<DataflowReport> {
    let program = StencilProgram::from_json(source)?;
    let stencil = program.build()?;
    Ok(DataflowReport::new(&stencil))
}
