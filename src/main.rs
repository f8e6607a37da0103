//! Stencil to Dataflow CLI
//!
//! Usage:
//!   stencil2dataflow blur.json
//!   stencil2dataflow blur.json --unroll-factor 4 --iterate 2 --border preserve
//!   cat blur.json | stencil2dataflow --json

use clap::{Parser as ClapParser, ValueEnum};
use colored::Colorize;
use std::fs;
use std::io::{self, Read};

use stencil_dataflow::{BorderPolicy, DataflowReport, StencilProgram};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Border {
    Ignore,
    Preserve,
}

#[derive(ClapParser, Debug)]
#[command(name = "stencil2dataflow")]
#[command(author = "FPGA Team")]
#[command(version = "0.1.0")]
#[command(about = "Schedules stencil kernels into streaming dataflow pipelines")]
struct Args {
    /// Stencil program in JSON (reads stdin when omitted)
    #[arg(value_name = "FILE")]
    input_file: Option<String>,

    /// Override the number of unrolled lanes
    #[arg(short = 'u', long = "unroll-factor")]
    unroll_factor: Option<usize>,

    /// Override the iteration count
    #[arg(short = 'i', long = "iterate")]
    iterate: Option<i64>,

    /// Override the border policy
    #[arg(short = 'b', long = "border", value_enum)]
    border: Option<Border>,

    /// Output as JSON
    #[arg(short = 'j', long = "json")]
    json_output: bool,

    /// Verbose output
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
}

fn main() {
    let args = Args::parse();
    if args.verbose {
        clilog::init_stderr_color_debug();
    }

    let source = if let Some(file) = &args.input_file {
        fs::read_to_string(file).unwrap_or_else(|e| {
            eprintln!("{}: Failed to read file '{}': {}", "Error".red(), file, e);
            std::process::exit(1);
        })
    } else {
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer).unwrap_or_else(|e| {
            eprintln!("{}: Failed to read stdin: {}", "Error".red(), e);
            std::process::exit(1);
        });
        buffer
    };

    let mut program = match StencilProgram::from_json(&source) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("{}: {}", "Parse error".red(), e);
            std::process::exit(1);
        }
    };
    if let Some(unroll_factor) = args.unroll_factor {
        program.config.unroll_factor = unroll_factor;
    }
    if let Some(iterate) = args.iterate {
        program.config.iterate = iterate;
    }
    if let Some(border) = args.border {
        program.config.border = match border {
            Border::Ignore => BorderPolicy::Ignore,
            Border::Preserve => BorderPolicy::Preserve,
        };
    }

    if args.verbose {
        println!("{}", "Stencil to Dataflow Scheduler".bold().blue());
        println!("{}", "=".repeat(35));
        println!();
        println!("{}: {}", "Kernel".green(), program.config.app_name);
        println!(
            "{}: {:?} x {} lane(s), {} iteration(s)",
            "Target".green(),
            program.config.tile_size,
            program.config.unroll_factor,
            program.config.iterate
        );
        println!();
    }

    let stencil = match program.build() {
        Ok(s) => s,
        Err(e) => {
            eprintln!("{}: {}", "Scheduling error".red(), e);
            std::process::exit(1);
        }
    };
    for warning in stencil.warnings() {
        eprintln!("{}: {}", "Warning".yellow(), warning.message);
    }
    let report = DataflowReport::new(&stencil);

    if args.json_output {
        match report.to_json() {
            Ok(json) => println!("{}", json),
            Err(e) => {
                eprintln!("{}: Failed to serialize to JSON: {}", "Error".red(), e);
                std::process::exit(1);
            }
        }
    } else {
        print_report(&report, args.verbose);
    }
}

fn print_report(report: &DataflowReport, verbose: bool) {
    println!("{}", "Scheduling Results".bold().green());
    println!("{}", "=".repeat(50));
    println!();

    println!("{}: {} -> {}", "Pipeline".cyan(), report.input, report.output);
    println!("{}: {} cycles", "Latency".cyan(), report.latency());
    println!(
        "{}: input {}, output {}",
        "Partition".cyan(),
        report.input_partition,
        report.output_partition
    );
    println!("{}: {:?}", "Forwarders".cyan(), report.forwarders);
    if !report.forwarders_with_border.is_empty() {
        println!(
            "{}: {:?}",
            "Forwarders with border".cyan(),
            report.forwarders_with_border
        );
    }
    println!();

    println!("{}", "Tensors".bold().yellow());
    println!("{}", "-".repeat(50));
    for tensor in &report.tensors {
        println!(
            "{} {} @ {}",
            tensor.name.bold(),
            format!("[{}x{}]", tensor.scalar_type, tensor.channel_count),
            tensor.offset.to_string().bold()
        );
        if let Some(buffer) = report.reuse_buffers.get(&tensor.name) {
            println!("  {}: {} deep", "Reuse buffer".cyan(), buffer.length);
            if verbose {
                println!("  {}: {:?}", "Links".cyan(), buffer.links);
            }
        }
    }

    if verbose {
        println!();
        println!("{}", "Stages".bold().yellow());
        println!("{}", "-".repeat(50));
        for stage in &report.stages {
            println!();
            println!("{} {}", "Stage".bold(), stage.name.bold());
            for (input, window) in &stage.window {
                println!(
                    "  {}: {:?} {} {}",
                    input.cyan(),
                    window,
                    "delay".cyan(),
                    stage.delay.get(input).copied().unwrap_or(0)
                );
            }
            if let Some(from) = &stage.preserve_border_from {
                println!("  {}: {}", "Border from".cyan(), from);
            }
        }
        for (tensor, modules) in &report.forwardings {
            println!();
            println!("{} {}", "Forwarding".bold(), tensor.bold());
            for module in modules {
                println!(
                    "  {} {} <{}>: {} output(s)",
                    module.offset,
                    module.func_name,
                    module.buffer,
                    module.outputs.len()
                );
            }
        }
    } else {
        println!();
        println!("({} stages, use -v for details)", report.stages.len());
    }
}
