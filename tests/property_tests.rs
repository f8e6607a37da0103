// Property-based tests for scheduler and synthesis invariants.
//
// Three categories:
// 1. Serialization: linear, strictly increasing along every dimension
// 2. Scheduling: causality and production order on generated pipelines
// 3. Synthesis: every tap read is buffered and served by one forwarder
//
// Uses proptest with explicit configuration to prevent CI flakiness.

use proptest::prelude::*;
use std::collections::{BTreeMap, BTreeSet};

use stencil_dataflow::schedule::required_availability;
use stencil_dataflow::{
    serialize, BorderPolicy, Definition, InputDef, Load, ScalarType, StageExpr, Stencil,
    StencilConfig,
};

// ── Pipeline generator ──────────────────────────────────────────────────────

/// A chain `input -> t0 -> t1 -> ... -> output`, optionally with the output
/// also reading the input directly (a diamond).
#[derive(Debug, Clone)]
struct Pipeline {
    width: i64,
    unroll: usize,
    locals: Vec<Vec<(i64, i64)>>,
    output: Vec<(i64, i64)>,
    diamond: bool,
}

/// Window points always include the origin so no stage reads only the past.
fn arb_window() -> impl Strategy<Value = Vec<(i64, i64)>> {
    prop::collection::btree_set((-2i64..=2, -1i64..=1), 0..5).prop_map(|points| {
        let mut points: Vec<(i64, i64)> = points.into_iter().collect();
        points.push((0, 0));
        points
    })
}

fn arb_pipeline() -> impl Strategy<Value = Pipeline> {
    (
        8i64..64,
        1usize..4,
        prop::collection::vec(arb_window(), 0..4),
        arb_window(),
        any::<bool>(),
    )
        .prop_map(|(width, unroll, locals, output, diamond)| Pipeline {
            width,
            unroll,
            locals,
            output,
            diamond,
        })
}

fn loads(name: &str, window: &[(i64, i64)]) -> Vec<Load> {
    window
        .iter()
        .map(|&(x, y)| Load::new(name, vec![x, y]))
        .collect()
}

fn arb_border() -> impl Strategy<Value = (i64, BorderPolicy)> {
    (
        1i64..=3,
        prop_oneof![Just(BorderPolicy::Ignore), Just(BorderPolicy::Preserve)],
    )
}

fn build(pipeline: &Pipeline) -> Stencil {
    build_iterated(pipeline, 1, BorderPolicy::Ignore)
}

fn build_iterated(pipeline: &Pipeline, iterate: i64, border: BorderPolicy) -> Stencil {
    let mut prev = "input".to_string();
    let mut locals = Vec::new();
    for (i, window) in pipeline.locals.iter().enumerate() {
        let name = format!("t{}", i);
        locals.push(Definition::local(
            &name,
            ScalarType::Int32,
            vec![StageExpr::new(vec![0, 0], loads(&prev, window))],
        ));
        prev = name;
    }
    let mut output_loads = loads(&prev, &pipeline.output);
    if pipeline.diamond {
        output_loads.extend(loads("input", &[(0, 0), (1, 0)]));
    }
    let output = Definition::output(
        "output",
        ScalarType::Int32,
        vec![StageExpr::new(vec![0, 0], output_loads)],
    );
    let config = StencilConfig::new(vec![pipeline.width, 0], pipeline.unroll)
        .with_iterate(iterate)
        .with_border(border);
    Stencil::new(config, InputDef::new("input", ScalarType::Int32), output, locals)
        .unwrap_or_else(|e| panic!("failed to build {:?}: {}", pipeline, e))
}

// ── Serialization ───────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn serialize_zero_is_zero(t0 in 1i64..100, t1 in 1i64..100) {
        prop_assert_eq!(serialize(&[0, 0, 0], &[t0, t1, 0]), 0);
    }

    #[test]
    fn serialize_increases_along_each_dim(
        t0 in 1i64..100,
        t1 in 1i64..100,
        v in prop::collection::vec(-50i64..50, 3),
        d in 0usize..3,
    ) {
        let tile = [t0, t1, 0];
        let mut next = v.clone();
        next[d] += 1;
        prop_assert!(serialize(&next, &tile) > serialize(&v, &tile));
    }
}

// ── Scheduling ──────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn schedule_is_causal(pipeline in arb_pipeline()) {
        let stencil = build(&pipeline);
        let graph = stencil.graph();
        let tile = &stencil.config().tile_size;
        for stage in stencil.stages() {
            let produced = graph.tensor(stage.output).offset;
            for (name, &input) in &stage.inputs {
                let arrival = required_availability(graph, stage.id, input, tile);
                prop_assert!(arrival <= produced, "{} reads {} too early", stage.name, name);
                prop_assert_eq!(arrival + stage.delay_of(name), produced);
            }
        }
    }

    #[test]
    fn chronological_order_is_monotonic(pipeline in arb_pipeline()) {
        let stencil = build(&pipeline);
        let order: Vec<_> = stencil.chronological_tensors().collect();
        prop_assert_eq!(order[0].name.as_str(), "input");
        prop_assert_eq!(order.len(), stencil.tensors().count());
        let names: BTreeSet<&str> = order.iter().map(|t| t.name.as_str()).collect();
        prop_assert_eq!(names.len(), order.len());
        for pair in order.windows(2) {
            prop_assert!(pair[0].offset <= pair[1].offset);
        }
    }

    #[test]
    fn overall_window_is_stable(pipeline in arb_pipeline()) {
        let stencil = build(&pipeline);
        let first = stencil.overall_stencil_window("input", "output").unwrap();
        let second = stencil.overall_stencil_window("input", "output").unwrap();
        prop_assert_eq!(&*first, &*second);
        let rebuilt = build(&pipeline);
        let third = rebuilt.overall_stencil_window("input", "output").unwrap();
        prop_assert_eq!(&*first, &*third);
    }
}

// ── Synthesis ───────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn every_read_is_buffered(pipeline in arb_pipeline()) {
        let stencil = build(&pipeline);
        let unroll = stencil.config().unroll_factor as i64;
        for stage in stencil.stages() {
            for (name, offsets) in &stage.offset {
                let max = *offsets.last().unwrap();
                let delay = stage.delay_of(name);
                let buffer = &stencil.reuse_buffers()[name];
                let points = &stencil.all_points()[name][&stage.name];
                for lane in 0..unroll {
                    for x in offsets {
                        let tap = max - x + delay + lane;
                        prop_assert!(points.contains_key(&tap));
                        prop_assert!(buffer.contains(tap));
                        prop_assert!(tap < buffer.length);
                    }
                }
            }
        }
    }

    #[test]
    fn every_tap_has_one_forwarder(
        pipeline in arb_pipeline(),
        (iterate, border) in arb_border(),
    ) {
        let stencil = build_iterated(&pipeline, iterate, border);
        for tensor in stencil.producer_tensors() {
            let forwardings = stencil.forwardings(&tensor.name).unwrap();
            let next_fifo = &stencil.next_fifo()[&tensor.name];
            let mut readers: BTreeMap<i64, usize> = BTreeMap::new();
            for stage_points in stencil.all_points()[&tensor.name].values() {
                for (&tap, lanes) in stage_points {
                    *readers.entry(tap).or_default() += lanes.len();
                }
            }
            let taps: Vec<i64> = readers.keys().copied().collect();
            let served: Vec<i64> = forwardings.keys().copied().collect();
            prop_assert_eq!(taps, served);
            for (tap, count) in readers {
                let expected = count + usize::from(next_fifo.contains_key(&tap));
                prop_assert_eq!(forwardings[&tap].outputs.len(), expected);
                let fwd = &forwardings[&tap];
                if fwd.has_border() {
                    prop_assert_eq!(fwd.func_name.clone(), format!("forward_{}", tensor.name));
                    prop_assert!(tap < stencil.config().unroll_factor as i64);
                } else {
                    prop_assert_eq!(fwd.func_name.as_str(), "forward");
                }
            }
        }
    }
}
