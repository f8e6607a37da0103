//! Flattened view of a scheduled stencil for the emitters
//!
//! A [`DataflowReport`] is a plain, serializable snapshot of everything the
//! back-ends read from a [`Stencil`]: tensors in production order, stage
//! windows and delays, reuse buffers and the forwarding network.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::ast::ScalarType;
use crate::config::{ClusterMode, StencilConfig};
use crate::graph::{StageId, TensorId};
use crate::reuse::ReuseBuffer;
use crate::stencil::Stencil;

#[derive(Debug, Clone, Serialize)]
pub struct TensorReport {
    pub name: String,
    pub scalar_type: ScalarType,
    pub channel_count: usize,
    pub idx: Vec<i64>,
    pub offset: i64,
    pub parent: Option<String>,
    pub children: Vec<String>,
    /// Stages receiving this tensor's border
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub preserve_border_to: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    pub name: String,
    pub idx: Vec<i64>,
    pub window: BTreeMap<String, Vec<Vec<i64>>>,
    pub offset: BTreeMap<String, Vec<i64>>,
    pub delay: BTreeMap<String, i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preserve_border_from: Option<String>,
}

/// One forwarding module with its ports rendered as signal names
#[derive(Debug, Clone, Serialize)]
pub struct ForwardingReport {
    pub offset: i64,
    pub func_name: String,
    pub outputs: Vec<String>,
    pub inputs: Vec<String>,
    pub params: Vec<String>,
    pub buffer: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplicatedReport {
    pub reuse_buffers: BTreeMap<String, ReuseBuffer>,
    pub next_fifo: BTreeMap<String, BTreeMap<i64, i64>>,
}

/// Complete dataflow description of one stencil
#[derive(Debug, Clone, Serialize)]
pub struct DataflowReport {
    pub config: StencilConfig,
    pub input: String,
    pub output: String,
    /// Production order, input first
    pub tensors: Vec<TensorReport>,
    pub stages: Vec<StageReport>,
    pub reuse_buffers: BTreeMap<String, ReuseBuffer>,
    pub forwardings: BTreeMap<String, Vec<ForwardingReport>>,
    pub forwarders: BTreeSet<usize>,
    pub forwarders_with_border: BTreeSet<(String, usize)>,
    /// Present only when clustering replicates modules
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replicated: Option<ReplicatedReport>,
    pub input_partition: usize,
    pub output_partition: usize,
    pub warnings: Vec<String>,
}

impl DataflowReport {
    pub fn new(stencil: &Stencil) -> Self {
        let graph = stencil.graph();
        let stage_name = |id: StageId| graph.stage(id).name.clone();
        let tensor_name = |id: TensorId| graph.tensor(id).name.clone();

        let tensors = stencil
            .chronological_tensors()
            .map(|t| TensorReport {
                name: t.name.clone(),
                scalar_type: t.scalar_type,
                channel_count: t.channel_count,
                idx: t.idx.clone(),
                offset: t.offset,
                parent: t.parent.map(stage_name),
                children: t.children.iter().copied().map(stage_name).collect(),
                preserve_border_to: t
                    .preserve_border_to
                    .iter()
                    .flatten()
                    .copied()
                    .map(stage_name)
                    .collect(),
            })
            .collect();

        let stages = stencil
            .stages_chronologically()
            .map(|s| StageReport {
                name: s.name.clone(),
                idx: s.idx.clone(),
                window: s.window.clone(),
                offset: s.offset.clone(),
                delay: s.delay.clone(),
                preserve_border_from: s.preserve_border_from.map(tensor_name),
            })
            .collect();

        let forwardings = stencil
            .producer_tensors()
            .filter_map(|t| {
                let modules = stencil.forwardings(&t.name)?;
                let reports = modules
                    .iter()
                    .map(|(&offset, fwd)| ForwardingReport {
                        offset,
                        func_name: fwd.func_name.clone(),
                        outputs: fwd.outputs.iter().map(ToString::to_string).collect(),
                        inputs: fwd.inputs.iter().map(ToString::to_string).collect(),
                        params: fwd.params.iter().map(ToString::to_string).collect(),
                        buffer: fwd.buffer.to_string(),
                    })
                    .collect();
                Some((t.name.clone(), reports))
            })
            .collect();

        let replicated = (stencil.config().cluster != ClusterMode::None).then(|| ReplicatedReport {
            reuse_buffers: stencil.replicated_reuse_buffers().clone(),
            next_fifo: stencil.replicated_next_fifo().clone(),
        });

        Self {
            config: stencil.config().clone(),
            input: stencil.input().name.clone(),
            output: stencil.output().name.clone(),
            tensors,
            stages,
            reuse_buffers: stencil.reuse_buffers().clone(),
            forwardings,
            forwarders: stencil.forwarders().plain.clone(),
            forwarders_with_border: stencil.forwarders_with_border().clone(),
            replicated,
            input_partition: stencil.input_partition(),
            output_partition: stencil.output_partition(),
            warnings: stencil.warnings().iter().map(|w| w.message.clone()).collect(),
        }
    }

    /// Export to JSON format
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Cycles between the first input element and the first output element
    pub fn latency(&self) -> i64 {
        self.tensors.iter().map(|t| t.offset).max().unwrap_or(0)
    }
}

impl std::fmt::Display for DataflowReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Dataflow of {}", self.config.app_name)?;
        writeln!(f, "================")?;
        writeln!(f, "Tile size: {:?}", self.config.tile_size)?;
        writeln!(
            f,
            "Unroll factor: {}, iterate: {}",
            self.config.unroll_factor, self.config.iterate
        )?;
        writeln!(f, "Latency: {} cycles", self.latency())?;
        writeln!(f)?;

        for tensor in &self.tensors {
            writeln!(
                f,
                "{} [{}x{}] @ offset {}",
                tensor.name, tensor.scalar_type, tensor.channel_count, tensor.offset
            )?;
            if let Some(buffer) = self.reuse_buffers.get(&tensor.name) {
                writeln!(f, "  Reuse buffer: {} deep, links {:?}", buffer.length, buffer.links)?;
            }
        }
        writeln!(f)?;

        for stage in &self.stages {
            writeln!(f, "Stage {}:", stage.name)?;
            for (input, window) in &stage.window {
                let delay = stage.delay.get(input).copied().unwrap_or(0);
                writeln!(f, "  {} window {:?} delay {}", input, window, delay)?;
            }
        }
        writeln!(f)?;
        writeln!(f, "Forwarders: {:?}", self.forwarders)?;
        if !self.forwarders_with_border.is_empty() {
            writeln!(f, "Forwarders with border: {:?}", self.forwarders_with_border)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Definition, InputDef, Load, StageExpr};
    use crate::config::BorderPolicy;

    fn stencil(config: StencilConfig) -> Stencil {
        let tmp = Definition::local(
            "tmp",
            ScalarType::Float,
            vec![StageExpr::new(
                vec![0, 0],
                vec![Load::new("input", vec![0, 0]), Load::new("input", vec![1, 0])],
            )],
        );
        let output = Definition::output(
            "output",
            ScalarType::Float,
            vec![StageExpr::new(
                vec![0, 0],
                vec![Load::new("tmp", vec![0, 0]), Load::new("tmp", vec![0, 1])],
            )],
        );
        Stencil::new(config, InputDef::new("input", ScalarType::Float), output, vec![tmp]).unwrap()
    }

    #[test]
    fn test_report_follows_schedule() {
        let report = DataflowReport::new(&stencil(StencilConfig::new(vec![64, 0], 1)));
        let names: Vec<&str> = report.tensors.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["input", "tmp", "output"]);
        assert_eq!(report.latency(), 65);
        assert_eq!(report.tensors[0].children, vec!["tmp".to_string()]);
        assert_eq!(report.tensors[1].parent.as_deref(), Some("tmp"));
        assert!(report.replicated.is_none());
        assert_eq!(report.forwardings["input"].len(), 2);
        assert!(report.forwardings["tmp"][0].outputs[0].starts_with("from_tmp_to_output_param_"));
    }

    #[test]
    fn test_json_export() {
        let config = StencilConfig::new(vec![64, 0], 1)
            .with_border(BorderPolicy::Preserve)
            .with_iterate(2)
            .with_cluster(ClusterMode::Fine);
        let report = DataflowReport::new(&stencil(config));
        let json = report.to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["output"], "output");
        assert_eq!(value["tensors"].as_array().unwrap().len(), 5);
        assert!(value["replicated"]["reuse_buffers"].get("tmp").is_some());
        assert!(value["stages"][1]["preserve_border_from"] == "input");
        assert!(report.to_string().contains("Forwarders with border"));
    }
}
