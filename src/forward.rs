//! Forwarding-network synthesis
//!
//! Every buffer tap of a producer tensor is served by one forwarding
//! module. It reads the tap, pushes the value further down the reuse chain
//! when the chain continues, and fans it out to every (stage, lane, point)
//! that reads the tap. Taps that border logic sees directly additionally
//! exchange border values with neighboring lanes.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::graph::TensorId;
use crate::stencil::Stencil;
use crate::tiling::{serialize, stencil_dim, stencil_distance, window_offset};

/// A data port of a forwarding module
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Port {
    /// Feeds window point `point` of `stage` on lane `lane`
    ToStage {
        tensor: String,
        stage: String,
        point: usize,
        lane: usize,
    },
    /// Feeds the next tap of the reuse chain
    ToNextTap { tensor: String, offset: i64 },
    /// Reads this module's tap
    FromTap { tensor: String, offset: i64 },
    BorderLeft { tensor: String, dim: usize, lane: usize },
    BorderRight { tensor: String, dim: usize, lane: usize },
}

impl std::fmt::Display for Port {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Port::ToStage {
                tensor,
                stage,
                point,
                lane,
            } => write!(f, "from_{}_to_{}_param_{}_pe_{}", tensor, stage, point, lane),
            Port::ToNextTap { tensor, offset } | Port::FromTap { tensor, offset } => {
                write!(f, "{}_offset_{}", tensor, offset)
            }
            Port::BorderLeft { tensor, dim, lane } => {
                write!(f, "border_from_{}_dim_{}_left_pe_{}", tensor, dim, lane)
            }
            Port::BorderRight { tensor, dim, lane } => {
                write!(f, "border_from_{}_dim_{}_right_pe_{}", tensor, dim, lane)
            }
        }
    }
}

/// A scalar parameter of a forwarding module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Param {
    InputBound(usize),
    InputSize(usize),
    EpochNum,
}

impl std::fmt::Display for Param {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Param::InputBound(d) => write!(f, "input_bound_dim_{}", d),
            Param::InputSize(d) => write!(f, "input_size_dim_{}", d),
            Param::EpochNum => write!(f, "epoch_num"),
        }
    }
}

/// Template parameter sizing the module's FIFO
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BufferParam {
    Length(i64),
    /// Border-exchanging modules are specialized per lane and delay
    LaneDelay { lane: usize, delay: i64 },
}

impl std::fmt::Display for BufferParam {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BufferParam::Length(length) => write!(f, "{}", length),
            BufferParam::LaneDelay { lane, delay } => write!(f, "{}-{}", lane, delay),
        }
    }
}

/// Descriptor of the module serving one tap
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Forwarding {
    pub func_name: String,
    pub outputs: Vec<Port>,
    pub inputs: Vec<Port>,
    pub params: Vec<Param>,
    pub buffer: BufferParam,
}

impl Forwarding {
    fn pending() -> Self {
        Self {
            func_name: String::new(),
            outputs: Vec::new(),
            inputs: Vec::new(),
            params: Vec::new(),
            buffer: BufferParam::Length(0),
        }
    }

    pub fn has_border(&self) -> bool {
        matches!(self.buffer, BufferParam::LaneDelay { .. })
    }
}

/// Distinct module shapes that must be instantiated
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Forwarders {
    /// Output-port counts of plain modules
    pub plain: BTreeSet<usize>,
    /// `(tensor, output-port count)` of border-exchanging modules
    pub with_border: BTreeSet<(String, usize)>,
}

/// Whether taps below the unroll factor of `tensor` face border logic
pub(crate) fn exposes_border(stencil: &Stencil, tensor: TensorId) -> bool {
    let graph = stencil.graph();
    graph.tensor(tensor).preserve_border_to.is_some() && !graph.is_input(tensor)
}

/// Descriptors for every tap of `src`, keyed by tap offset
pub(crate) fn synthesize(stencil: &Stencil, src: TensorId) -> BTreeMap<i64, Forwarding> {
    let graph = stencil.graph();
    let config = stencil.config();
    let unroll_factor = config.unroll_factor;
    let src_name = graph.tensor(src).name.as_str();
    let mut forwardings: BTreeMap<i64, Forwarding> = BTreeMap::new();
    let Some(dsts) = stencil.all_points().get(src_name) else {
        return forwardings;
    };
    let empty = BTreeMap::new();
    let next_fifo = stencil.next_fifo().get(src_name).unwrap_or(&empty);

    for (dst_name, dst_points) in dsts {
        for (&offset, lanes) in dst_points {
            let fwd = forwardings.entry(offset).or_insert_with(Forwarding::pending);
            for (&lane, &point) in lanes {
                fwd.outputs.insert(
                    0,
                    Port::ToStage {
                        tensor: src_name.to_string(),
                        stage: dst_name.clone(),
                        point,
                        lane,
                    },
                );
            }
            if !fwd.func_name.is_empty() {
                continue;
            }

            if let Some(&next) = next_fifo.get(&offset) {
                fwd.outputs.push(Port::ToNextTap {
                    tensor: src_name.to_string(),
                    offset: next,
                });
            }
            fwd.inputs.push(Port::FromTap {
                tensor: src_name.to_string(),
                offset,
            });
            let mut func_name = "forward".to_string();
            let mut buffer =
                BufferParam::Length(stencil.reuse_buffer_length(src_name, offset).unwrap_or(0));

            if offset < unroll_factor as i64 && exposes_border(stencil, src) {
                let lane = lanes.keys().last().copied().unwrap_or(0);
                let delay = border_delay(stencil, src);
                let self_dim = border_window_dim(stencil, src);
                func_name = format!("forward_{}", src_name);
                buffer = BufferParam::LaneDelay { lane, delay };
                for d in 0..config.dim - 1 {
                    let row: i64 = config.tile_size[..d].iter().product();
                    let param_offset = (config.tile_size[d] - self_dim[d] + 1) * row;
                    let factor = unroll_factor as i64;
                    fwd.inputs.push(Port::BorderLeft {
                        tensor: src_name.to_string(),
                        dim: d,
                        lane: (lane as i64 + param_offset).rem_euclid(factor) as usize,
                    });
                    fwd.inputs.push(Port::BorderRight {
                        tensor: src_name.to_string(),
                        dim: d,
                        lane: (lane as i64 - param_offset).rem_euclid(factor) as usize,
                    });
                }
                fwd.params.extend((0..config.dim - 1).map(Param::InputBound));
                fwd.params.extend((0..config.dim).map(Param::InputSize));
            }

            fwd.params.push(Param::EpochNum);
            fwd.func_name = func_name;
            fwd.buffer = buffer;
        }
    }
    forwardings
}

/// Source of the border window of `src`'s producing stage
fn border_window_input(stencil: &Stencil, src: TensorId) -> TensorId {
    stencil
        .graph()
        .preserve_border_from(src)
        .unwrap_or_else(|| stencil.input().id)
}

fn border_window_dim(stencil: &Stencil, src: TensorId) -> Vec<i64> {
    let window = stencil.overall_stencil_window_of(border_window_input(stencil, src), src);
    stencil_dim(&window, stencil.config().dim)
}

/// Cycles of border data held back, accumulated over every iteration of
/// the border-preserving chain.
fn border_delay(stencil: &Stencil, src: TensorId) -> i64 {
    let graph = stencil.graph();
    let config = stencil.config();
    let window = stencil.overall_stencil_window_of(border_window_input(stencil, src), src);
    let overall_idx = window_offset(&window, config.dim);

    let mut iteration = 1;
    let mut parent = graph.preserve_border_from(src);
    while let Some(p) = parent {
        if graph.tensor(p).parent.is_none() {
            break;
        }
        parent = graph.preserve_border_from(p);
        iteration += 1;
    }

    (stencil_distance(&window, &config.tile_size) - serialize(&overall_idx, &config.tile_size)) * iteration
}

/// Module shapes needed across all tensors
pub(crate) fn collect_forwarders(stencil: &Stencil) -> Forwarders {
    let mut forwarders = Forwarders::default();
    let unroll_factor = stencil.config().unroll_factor as i64;
    for (src_name, dsts) in stencil.all_points() {
        let Some(src) = stencil.graph().tensor_id(src_name) else {
            continue;
        };
        let Some(forwardings) = stencil.forwardings(src_name) else {
            continue;
        };
        for dst_points in dsts.values() {
            let offsets: BTreeSet<i64> = dst_points.keys().copied().collect();
            for offset in offsets {
                let Some(fwd) = forwardings.get(&offset) else {
                    continue;
                };
                let count = fwd.outputs.len();
                if offset < unroll_factor && exposes_border(stencil, src) {
                    forwarders.with_border.insert((src_name.clone(), count));
                } else {
                    forwarders.plain.insert(count);
                }
            }
        }
    }
    forwarders
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Definition, InputDef, Load, ScalarType, StageExpr};
    use crate::config::{BorderPolicy, StencilConfig};
    use pretty_assertions::assert_eq;

    fn blur(border: BorderPolicy, iterate: i64) -> Stencil {
        blur_tiled(233, 1, border, iterate)
    }

    fn blur_tiled(width: i64, unroll_factor: usize, border: BorderPolicy, iterate: i64) -> Stencil {
        let config = StencilConfig::new(vec![width, 0], unroll_factor)
            .with_iterate(iterate)
            .with_border(border);
        let tmp = Definition::local(
            "tmp",
            ScalarType::Uint16,
            vec![StageExpr::new(
                vec![0, 0],
                vec![
                    Load::new("input", vec![-1, 0]),
                    Load::new("input", vec![0, 0]),
                    Load::new("input", vec![1, 0]),
                ],
            )],
        );
        let output = Definition::output(
            "output",
            ScalarType::Uint16,
            vec![StageExpr::new(
                vec![0, 0],
                vec![
                    Load::new("tmp", vec![0, -1]),
                    Load::new("tmp", vec![0, 0]),
                    Load::new("tmp", vec![0, 1]),
                ],
            )],
        );
        Stencil::new(config, InputDef::new("input", ScalarType::Uint16), output, vec![tmp]).unwrap()
    }

    #[test]
    fn test_plain_forwardings() {
        let stencil = blur(BorderPolicy::Ignore, 1);
        let fwd = stencil.forwardings("input").unwrap();
        assert_eq!(fwd.len(), 3);

        let head = &fwd[&0];
        assert_eq!(head.func_name, "forward");
        assert_eq!(
            head.outputs,
            vec![
                Port::ToStage {
                    tensor: "input".to_string(),
                    stage: "tmp".to_string(),
                    point: 2,
                    lane: 0,
                },
                Port::ToNextTap {
                    tensor: "input".to_string(),
                    offset: 1,
                },
            ]
        );
        assert_eq!(head.inputs.len(), 1);
        assert_eq!(head.params, vec![Param::EpochNum]);
        assert_eq!(head.buffer, BufferParam::Length(0));

        let tail = &fwd[&2];
        assert_eq!(tail.outputs.len(), 1);
        assert_eq!(tail.buffer, BufferParam::Length(1));

        let forwarders = stencil.forwarders();
        assert_eq!(forwarders.plain, BTreeSet::from([1, 2]));
        assert!(forwarders.with_border.is_empty());
    }

    #[test]
    fn test_border_forwarding() {
        let stencil = blur(BorderPolicy::Preserve, 2);
        let fwd = &stencil.forwardings("input_iter1").unwrap()[&0];
        assert!(fwd.has_border());
        assert_eq!(fwd.func_name, "forward_input_iter1");
        assert_eq!(fwd.buffer, BufferParam::LaneDelay { lane: 0, delay: 234 });
        assert_eq!(fwd.buffer.to_string(), "0-234");
        assert_eq!(fwd.inputs.len(), 3);
        assert_eq!(fwd.inputs[1].to_string(), "border_from_input_iter1_dim_0_left_pe_0");
        assert_eq!(
            fwd.params,
            vec![
                Param::InputBound(0),
                Param::InputSize(0),
                Param::InputSize(1),
                Param::EpochNum
            ]
        );

        let forwarders = stencil.forwarders();
        assert!(forwarders
            .with_border
            .contains(&("input_iter1".to_string(), 2)));
        // the primary input never exchanges borders
        assert!(forwarders.with_border.iter().all(|(t, _)| t != "input"));
    }

    #[test]
    fn test_border_lanes_wrap_around_unroll_factor() {
        let stencil = blur_tiled(10, 4, BorderPolicy::Preserve, 2);
        let fwd = stencil.forwardings("input_iter1").unwrap();

        // neighbors sit (10 - 3 + 1) lanes away, wrapped mod 4
        let head = &fwd[&0];
        assert_eq!(head.func_name, "forward_input_iter1");
        assert_eq!(head.buffer, BufferParam::LaneDelay { lane: 3, delay: 11 });
        assert_eq!(head.buffer.to_string(), "3-11");
        let inputs: Vec<String> = head.inputs.iter().map(ToString::to_string).collect();
        assert_eq!(
            inputs[1..],
            [
                "border_from_input_iter1_dim_0_left_pe_3",
                "border_from_input_iter1_dim_0_right_pe_3"
            ]
        );

        let third = &fwd[&2];
        assert_eq!(third.buffer, BufferParam::LaneDelay { lane: 1, delay: 11 });
        assert_eq!(
            third.inputs[1..],
            [
                Port::BorderLeft {
                    tensor: "input_iter1".to_string(),
                    dim: 0,
                    lane: 1,
                },
                Port::BorderRight {
                    tensor: "input_iter1".to_string(),
                    dim: 0,
                    lane: 1,
                },
            ]
        );
    }

    #[test]
    fn test_port_names() {
        let port = Port::ToStage {
            tensor: "input".to_string(),
            stage: "tmp".to_string(),
            point: 1,
            lane: 3,
        };
        assert_eq!(port.to_string(), "from_input_to_tmp_param_1_pe_3");
        assert_eq!(Param::InputBound(1).to_string(), "input_bound_dim_1");
    }
}
