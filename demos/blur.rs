//! Example: Separable Blur
//!
//! Schedules a 3x3 box blur split into a horizontal and a vertical pass,
//! first as a single pass and then iterated twice with preserved borders.
//!
//! Run with: cargo run --example blur

use stencil_dataflow::{
    BorderPolicy, DataflowReport, Definition, InputDef, Load, ScalarType, StageExpr, Stencil,
    StencilConfig,
};

fn taps(name: &str, along: usize) -> Vec<Load> {
    (-1..=1)
        .map(|d| {
            let mut idx = vec![0, 0];
            idx[along] = d;
            Load::new(name, idx)
        })
        .collect()
}

fn blur(config: StencilConfig) -> Stencil {
    let tmp = Definition::local(
        "tmp",
        ScalarType::Uint16,
        vec![StageExpr::new(vec![0, 0], taps("input", 0))
            .with_text("(input(-1, 0) + input(0, 0) + input(1, 0)) / 3")],
    );
    let output = Definition::output(
        "output",
        ScalarType::Uint16,
        vec![StageExpr::new(vec![0, 0], taps("tmp", 1))
            .with_text("(tmp(0, -1) + tmp(0, 0) + tmp(0, 1)) / 3")],
    );
    Stencil::new(config, InputDef::new("input", ScalarType::Uint16), output, vec![tmp]).unwrap()
}

fn main() {
    println!("=== Separable Blur Example ===\n");

    // Example 1: one pass, one lane
    let config = StencilConfig::new(vec![233, 0], 1).with_app_name("blur");
    let stencil = blur(config);
    println!("Example 1: single pass on 233-wide tiles\n");
    for tensor in stencil.chronological_tensors() {
        println!("  {} produced at offset {}", tensor.name, tensor.offset);
    }
    for (name, buffer) in stencil.reuse_buffers() {
        println!("  {} buffered {} deep: {:?}", name, buffer.length, buffer.links);
    }
    println!("  Forwarders: {:?}\n", stencil.forwarders().plain);

    // Example 2: two iterations, borders preserved, four lanes
    let config = StencilConfig::new(vec![233, 0], 4)
        .with_app_name("blur2")
        .with_iterate(2)
        .with_border(BorderPolicy::Preserve);
    let stencil = blur(config);
    println!("Example 2: two iterations with preserved borders, 4 lanes\n");
    let report = DataflowReport::new(&stencil);
    print!("{}", report);
    println!();
    for fwd in stencil.forwardings("input_iter1").into_iter().flat_map(|f| f.values()) {
        if fwd.has_border() {
            let inputs: Vec<String> = fwd.inputs.iter().map(ToString::to_string).collect();
            println!("  {}<{}> reads {}", fwd.func_name, fwd.buffer, inputs.join(", "));
        }
    }
}
