//! Stencil pipeline assembly
//!
//! [`Stencil::new`] takes the definitions produced by the front-end,
//! expands `iterate > 1` into renamed per-iteration copies, builds the
//! tensor/stage graph, schedules it and wires border preservation. Every
//! structure derived from the finished graph (reuse buffers, points,
//! forwardings) is computed on first access and cached for the lifetime of
//! the [`Stencil`].

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

use indexmap::{IndexMap, IndexSet};
use once_cell::unsync::OnceCell;
use serde::{Deserialize, Serialize};

use crate::ast::{Definition, InputDef};
use crate::config::StencilConfig;
use crate::error::{SemanticWarning, StencilError, StencilResult};
use crate::forward::{self, Forwarders, Forwarding};
use crate::graph::{Graph, Stage, StageId, Tensor, TensorId};
use crate::reuse::{self, Points, ReplicatedPoints, ReuseBuffer, ReusePlan};
use crate::schedule;
use crate::tiling::{serialize, stencil_distance, window_offset, Window};
use crate::window::{overall_stencil_window, WindowMemo};

/// Everything the front-end hands over for one kernel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StencilProgram {
    pub config: StencilConfig,
    pub input: InputDef,
    pub output: Definition,
    #[serde(default)]
    pub locals: Vec<Definition>,
}

impl StencilProgram {
    pub fn from_json(text: &str) -> StencilResult<Self> {
        serde_json::from_str(text)
            .map_err(|e| StencilError::semantic(format!("malformed stencil program: {}", e)))
    }

    pub fn build(self) -> StencilResult<Stencil> {
        Stencil::new(self.config, self.input, self.output, self.locals)
    }
}

/// A scheduled stencil pipeline
#[derive(Debug)]
pub struct Stencil {
    config: StencilConfig,
    graph: Graph,
    input: TensorId,
    output: TensorId,
    chronological: Vec<TensorId>,
    warnings: Vec<SemanticWarning>,

    window_memo: RefCell<WindowMemo>,
    reuse: OnceCell<ReusePlan>,
    replicated_reuse: OnceCell<ReusePlan>,
    all_points: OnceCell<IndexMap<String, Points>>,
    replicated_points: OnceCell<IndexMap<String, ReplicatedPoints>>,
    forwardings: OnceCell<BTreeMap<String, BTreeMap<i64, Forwarding>>>,
    forwarders: OnceCell<Forwarders>,
}

fn name_from_iter(name: &str, iteration: i64) -> String {
    if iteration > 0 {
        format!("{}_iter{}", name, iteration)
    } else {
        name.to_string()
    }
}

/// Rename loads and the border source of `def` through `rename`
fn rename_reads(def: &mut Definition, rename: impl Fn(&str) -> String) {
    def.mutate_loads(&rename);
    if let Some(from) = def.preserve_border.as_deref() {
        def.preserve_border = Some(rename(from));
    }
}

impl Stencil {
    pub fn new(
        config: StencilConfig,
        input: InputDef,
        mut output: Definition,
        locals: Vec<Definition>,
    ) -> StencilResult<Self> {
        config.validate()?;
        let warnings = config.warnings();
        for warning in &warnings {
            clilog::warn!("{}", warning);
        }

        check_names(&input, &output, &locals)?;
        if config.iterate > 1 {
            if input.scalar_type != output.scalar_type {
                return Err(StencilError::semantic(format!(
                    "input must have the same type as output if iterate > 1 times, \
                     current input has type {} but output has type {}",
                    input.scalar_type, output.scalar_type
                )));
            }
            if input.channel_count != output.channel_count {
                return Err(StencilError::semantic(format!(
                    "input must have the same number of channels as output if iterate > 1 times, \
                     current input has {} channel(s) but output has {} channel(s)",
                    input.channel_count, output.channel_count
                )));
            }
            clilog::debug!(
                "pipeline {} iterations of {} -> {}",
                config.iterate,
                input.name,
                output.name
            );
        }

        let locals = expand_iterations(&config, &input, &mut output, locals);
        let mut seen = IndexSet::new();
        for def in locals.iter().chain([&output]) {
            if def.name == input.name {
                return Err(StencilError::semantic(format!(
                    "input name conflict with tensor: {}",
                    def.name
                )));
            }
            if !seen.insert(def.name.as_str()) {
                return Err(StencilError::semantic(format!(
                    "tensor {} is defined more than once",
                    def.name
                )));
            }
        }
        for def in locals.iter().chain([&output]) {
            clilog::debug!(
                "{:?} {}: {}[{}] border={:?}",
                def.kind,
                def.name,
                def.scalar_type,
                def.channel_count,
                def.preserve_border
            );
            for expr in &def.exprs {
                clilog::debug!("    expr @{:?}: {}", expr.idx, expr.text);
            }
        }

        clilog::info!("assemble dependency graph");
        let tile_size = config.tile_size.clone();
        let mut graph = Graph::new();
        for def in &locals {
            graph.add_tensor(&def.name, def.scalar_type, def.channel_count, def.store_idx()?.to_vec());
        }
        let input_id = graph.add_tensor(
            &input.name,
            input.scalar_type,
            input.channel_count,
            vec![0; config.dim],
        );
        let output_id = graph.add_tensor(
            &output.name,
            output.scalar_type,
            output.channel_count,
            output.store_idx()?.to_vec(),
        );

        for def in locals.iter().chain([&output]) {
            add_stage_for(&mut graph, &config, def)?;
        }
        if let Some(name) = graph.find_cycle() {
            return Err(StencilError::semantic(format!(
                "tensor {} depends on itself",
                name
            )));
        }

        let preserved: Vec<(&str, &str)> = locals
            .iter()
            .chain([&output])
            .filter_map(|def| Some((def.name.as_str(), def.preserve_border.as_deref()?)))
            .collect();
        let mut wiring = Vec::with_capacity(preserved.len());
        for &(dst, src) in &preserved {
            clilog::debug!("border from {} to {}", src, dst);
            let src_id = graph.tensor_id(src).ok_or_else(|| {
                StencilError::semantic(format!(
                    "tensor {} preserves border from undefined tensor {}",
                    dst, src
                ))
            })?;
            let stage = graph
                .stage_id(dst)
                .ok_or_else(|| StencilError::internal(format!("stage {} was never built", dst)))?;
            graph
                .tensor_mut(src_id)
                .preserve_border_to
                .get_or_insert_with(IndexSet::new)
                .insert(stage);
            graph.stage_mut(stage).preserve_border_from.get_or_insert(src_id);
            wiring.push((stage, src_id));
        }

        clilog::info!("calculate tensor offsets");
        let timer = clilog::stimer!("schedule");
        let chronological = schedule::schedule(&mut graph, input_id, &tile_size)?;
        clilog::finish!(timer);

        // the aggregated window can only be taken once the graph is complete
        if !wiring.is_empty() {
            clilog::info!("wire preserved borders");
        }
        for (stage, src) in wiring {
            wire_border(&mut graph, stage, src, &tile_size);
        }

        for stage in graph.stages() {
            for (name, offsets) in &stage.offset {
                clilog::debug!(
                    "stage.offset: {}@{} <- {}@{:?} delayed {}",
                    stage.name,
                    serialize(&stage.idx, &tile_size),
                    name,
                    offsets,
                    stage.delay_of(name)
                );
            }
        }

        Ok(Self {
            config,
            graph,
            input: input_id,
            output: output_id,
            chronological,
            warnings,
            window_memo: RefCell::new(WindowMemo::new()),
            reuse: OnceCell::new(),
            replicated_reuse: OnceCell::new(),
            all_points: OnceCell::new(),
            replicated_points: OnceCell::new(),
            forwardings: OnceCell::new(),
            forwarders: OnceCell::new(),
        })
    }

    pub fn config(&self) -> &StencilConfig {
        &self.config
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn warnings(&self) -> &[SemanticWarning] {
        &self.warnings
    }

    pub fn tensor(&self, name: &str) -> Option<&Tensor> {
        self.graph.tensor_id(name).map(|id| self.graph.tensor(id))
    }

    pub fn stage(&self, name: &str) -> Option<&Stage> {
        self.graph.stage_id(name).map(|id| self.graph.stage(id))
    }

    pub fn tensors(&self) -> impl Iterator<Item = &Tensor> {
        self.graph.tensors()
    }

    pub fn stages(&self) -> impl Iterator<Item = &Stage> {
        self.graph.stages()
    }

    pub fn input(&self) -> &Tensor {
        self.graph.tensor(self.input)
    }

    pub fn output(&self) -> &Tensor {
        self.graph.tensor(self.output)
    }

    /// Tensors in production order, input first
    pub fn chronological_tensors(&self) -> impl Iterator<Item = &Tensor> {
        self.chronological.iter().map(|&id| self.graph.tensor(id))
    }

    pub fn stages_chronologically(&self) -> impl Iterator<Item = &Stage> {
        self.chronological_tensors()
            .filter_map(|t| t.parent)
            .map(|id| self.graph.stage(id))
    }

    /// Tensors read by at least one stage
    pub fn producer_tensors(&self) -> impl Iterator<Item = &Tensor> {
        self.graph.tensors().filter(|t| !t.children.is_empty())
    }

    /// Tensors written by a stage
    pub fn consumer_tensors(&self) -> impl Iterator<Item = &Tensor> {
        self.graph.tensors().filter(|t| t.parent.is_some())
    }

    /// DRAM banks per direction
    pub fn dram_bank(&self) -> usize {
        self.config.effective_dram_bank()
    }

    pub fn pixel_width_i(&self) -> u32 {
        self.input().scalar_type.width()
    }

    pub fn pixel_width_o(&self) -> u32 {
        self.output().scalar_type.width()
    }

    /// Array partition factor of the input burst buffer
    pub fn input_partition(&self) -> usize {
        self.partition(self.pixel_width_i())
    }

    /// Array partition factor of the output burst buffer
    pub fn output_partition(&self) -> usize {
        self.partition(self.pixel_width_o())
    }

    fn partition(&self, pixel_width: u32) -> usize {
        let per_burst = (self.config.burst_width / pixel_width) as usize;
        let banked = per_burst * self.dram_bank() / 2;
        banked.max(self.config.unroll_factor / 2)
    }

    /// Cumulative window `dst` reads from `src`, `None` for unknown names
    pub fn overall_stencil_window(&self, src: &str, dst: &str) -> Option<Rc<Window>> {
        let src = self.graph.tensor_id(src)?;
        let dst = self.graph.tensor_id(dst)?;
        Some(self.overall_stencil_window_of(src, dst))
    }

    pub(crate) fn overall_stencil_window_of(&self, src: TensorId, dst: TensorId) -> Rc<Window> {
        overall_stencil_window(&self.graph, &mut self.window_memo.borrow_mut(), src, dst)
    }

    fn reuse_plan(&self) -> &ReusePlan {
        self.reuse
            .get_or_init(|| reuse::unrolled_reuse_plan(&self.graph, self.config.unroll_factor))
    }

    fn replicated_reuse_plan(&self) -> &ReusePlan {
        self.replicated_reuse.get_or_init(|| {
            reuse::replicated_reuse_plan(&self.graph, self.config.replication_factor)
        })
    }

    pub fn reuse_buffers(&self) -> &BTreeMap<String, ReuseBuffer> {
        &self.reuse_plan().buffers
    }

    pub fn reuse_buffer_lengths(&self) -> &BTreeMap<String, BTreeMap<i64, i64>> {
        &self.reuse_plan().lengths
    }

    pub fn reuse_buffer_length(&self, name: &str, offset: i64) -> Option<i64> {
        self.reuse_buffer_lengths().get(name)?.get(&offset).copied()
    }

    pub fn next_fifo(&self) -> &BTreeMap<String, BTreeMap<i64, i64>> {
        &self.reuse_plan().next_fifo
    }

    /// Per producer tensor: consuming stage -> tap -> lane -> window rank
    pub fn all_points(&self) -> &IndexMap<String, Points> {
        self.all_points.get_or_init(|| {
            self.producer_tensors()
                .map(|t| {
                    let points = reuse::unrolled_points(&self.graph, t, self.config.unroll_factor);
                    (t.name.clone(), points)
                })
                .collect()
        })
    }

    /// Forwarding descriptors of `src`, keyed by tap offset
    pub fn forwardings(&self, src: &str) -> Option<&BTreeMap<i64, Forwarding>> {
        self.forwardings
            .get_or_init(|| {
                self.producer_tensors()
                    .map(|t| (t.name.clone(), forward::synthesize(self, t.id)))
                    .collect()
            })
            .get(src)
    }

    pub fn forwarders(&self) -> &Forwarders {
        self.forwarders.get_or_init(|| forward::collect_forwarders(self))
    }

    pub fn forwarders_with_border(&self) -> &BTreeSet<(String, usize)> {
        &self.forwarders().with_border
    }

    pub fn replicated_reuse_buffers(&self) -> &BTreeMap<String, ReuseBuffer> {
        &self.replicated_reuse_plan().buffers
    }

    pub fn replicated_reuse_buffer_length(&self, name: &str, offset: i64) -> Option<i64> {
        self.replicated_reuse_plan().lengths.get(name)?.get(&offset).copied()
    }

    pub fn replicated_next_fifo(&self) -> &BTreeMap<String, BTreeMap<i64, i64>> {
        &self.replicated_reuse_plan().next_fifo
    }

    pub fn replicated_all_points(&self) -> &IndexMap<String, ReplicatedPoints> {
        self.replicated_points.get_or_init(|| {
            self.producer_tensors()
                .map(|t| (t.name.clone(), reuse::replicated_points(&self.graph, t)))
                .collect()
        })
    }
}

fn check_names(input: &InputDef, output: &Definition, locals: &[Definition]) -> StencilResult<()> {
    let mut local_names = BTreeSet::new();
    for local in locals {
        if local.name == input.name {
            return Err(StencilError::semantic(format!(
                "input name conflict with tensor: {}",
                input.name
            )));
        }
        if !local_names.insert(local.name.as_str()) {
            return Err(StencilError::semantic(format!(
                "tensor {} is defined more than once",
                local.name
            )));
        }
    }
    if output.name == input.name {
        return Err(StencilError::semantic(format!(
            "input name conflict with tensor: {}",
            input.name
        )));
    }
    if local_names.contains(output.name.as_str()) {
        return Err(StencilError::semantic(format!(
            "output name conflict with tensor: {}",
            output.name
        )));
    }
    Ok(())
}

/// Maps the input and every local to its copy of `iteration`
fn iteration_renamer<'a>(
    input: &'a str,
    locals: &'a BTreeSet<String>,
    iteration: i64,
) -> impl Fn(&str) -> String + 'a {
    move |name| {
        if name == input || locals.contains(name) {
            name_from_iter(name, iteration)
        } else {
            name.to_string()
        }
    }
}

/// Unroll `iterate` self-compositions into renamed locals.
///
/// Iteration `k` reads the previous iteration's copies of the input and the
/// locals; its copy of the output is stored as `input_iter{k}`. The final
/// output reads from iteration `iterate - 1`.
fn expand_iterations(
    config: &StencilConfig,
    input: &InputDef,
    output: &mut Definition,
    locals: Vec<Definition>,
) -> Vec<Definition> {
    let local_names: BTreeSet<String> = locals.iter().map(|l| l.name.clone()).collect();
    let renamer = |iteration| iteration_renamer(&input.name, &local_names, iteration);

    let mut expanded = Vec::new();
    for iteration in 1..config.iterate {
        let mut fed_back = output.to_local();
        rename_reads(&mut fed_back, renamer(iteration - 1));
        fed_back.mutate_store(name_from_iter(&input.name, iteration));
        if config.preserve_border() {
            fed_back.set_preserve_border(name_from_iter(&input.name, iteration - 1));
        }
        expanded.push(fed_back);

        for local in &locals {
            let mut copy = local.clone();
            rename_reads(&mut copy, renamer(iteration));
            copy.mutate_store(name_from_iter(&local.name, iteration));
            expanded.push(copy);
        }
    }

    rename_reads(output, renamer(config.iterate - 1));
    if config.preserve_border() {
        output.set_preserve_border(name_from_iter(&input.name, config.iterate - 1));
    }

    let mut all = locals;
    all.extend(expanded);
    all
}

fn add_stage_for(graph: &mut Graph, config: &StencilConfig, def: &Definition) -> StencilResult<StageId> {
    let output = graph
        .tensor_id(&def.name)
        .ok_or_else(|| StencilError::internal(format!("tensor {} was never built", def.name)))?;

    let mut points: BTreeMap<String, BTreeSet<Vec<i64>>> = BTreeMap::new();
    for load in def.loads().filter(|l| !config.is_extra_param(&l.name)) {
        points.entry(load.name.clone()).or_default().insert(load.idx.clone());
    }

    let mut window = BTreeMap::new();
    let mut inputs = BTreeMap::new();
    for (name, set) in points {
        let id = graph.tensor_id(&name).ok_or_else(|| {
            StencilError::semantic(format!("tensor {} reads undefined tensor {}", def.name, name))
        })?;
        let mut sorted: Vec<Vec<i64>> = set.into_iter().collect();
        sorted.sort_by_key(|p| serialize(p, &config.tile_size));
        inputs.insert(name.clone(), id);
        window.insert(name, sorted);
    }

    Ok(graph.add_stage(output, window, def.exprs.clone(), inputs, &config.tile_size))
}

/// Make `stage` read its border source and hold it back by the depth of
/// the aggregated window in between.
fn wire_border(graph: &mut Graph, stage: StageId, src: TensorId, tile_size: &[i64]) {
    let src_name = graph.tensor(src).name.clone();
    if !graph.stage(stage).window.contains_key(&src_name) {
        let idx = graph.stage(stage).idx.clone();
        graph.add_stage_input(stage, src, vec![idx], tile_size);
    }

    let dst = graph.stage(stage).output;
    let mut memo = WindowMemo::new();
    let window = overall_stencil_window(graph, &mut memo, src, dst);
    let delay = stencil_distance(&window, tile_size) - serialize(&window_offset(&window, tile_size.len()), tile_size);
    clilog::debug!(
        "window for {}@{:?} from {} spans {} cycle(s)",
        graph.stage(stage).name,
        graph.stage(stage).idx,
        src_name,
        delay
    );
    graph.stage_mut(stage).delay.entry(src_name).or_insert(delay);
}
