// rewrite.rs - The command buffer scheduling pass
//
// Walks the module bottom-up from the entry computation. Nested
// computations (while condition/body, conditional branches, plain calls)
// are rewritten first so their control-flow instruction can then be
// re-classified. Each computation is hoisted, scanned for runs, and every
// run is outlined into a command buffer computation and spliced back as a
// call plus tuple projections.
//
// Preconditions: the module carries a schedule that verifies (S1-S3).
// Postconditions: the schedule still verifies; every data and control
//                 dependency of the input is preserved through the calls.
// Failure modes: `MissingSchedule`/`InvalidSchedule` before any mutation;
//                `InvariantViolation`/`Graph` on internal inconsistencies
//                (fail-fast, no rollback).
// Side effects: mutates the module; debug-level logging per command buffer.

use std::collections::HashSet;

use tracing::{debug, info_span};

use crate::collect::collect_command_buffer_sequences;
use crate::config::{CommandBufferConfig, CommandBufferOptions, DeviceCapabilities};
use crate::error::PassError;
use crate::hoist::move_parameters_and_constants_to_front;
use crate::id::{CompId, InstrId};
use crate::ir::{CallRole, ComputationKind, InstructionSpec, Module, Opcode};
use crate::outline::{prepare_command_buffer, CommandBuffer};
use crate::schedule::{verify_computation, verify_schedule};

/// What one run of the pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RewriteStats {
    pub computations_visited: usize,
    /// Computations whose schedule or control edges the hoist edited.
    pub computations_hoisted: usize,
    pub command_buffers_created: usize,
    pub instructions_captured: usize,
}

impl RewriteStats {
    pub fn changed(&self) -> bool {
        self.computations_hoisted > 0 || self.command_buffers_created > 0
    }
}

/// Outlines capturable runs of a scheduled module into command buffers.
#[derive(Debug, Clone)]
pub struct CommandBufferScheduling {
    config: CommandBufferConfig,
}

impl CommandBufferScheduling {
    pub const NAME: &'static str = "command-buffer-scheduling";

    pub fn new(config: CommandBufferConfig) -> Self {
        Self { config }
    }

    pub fn from_options(options: &CommandBufferOptions, device: &dyn DeviceCapabilities) -> Self {
        Self::new(options.resolve(device))
    }

    pub fn config(&self) -> &CommandBufferConfig {
        &self.config
    }

    /// Rewrite `module`; returns whether anything changed.
    pub fn run(&self, module: &mut Module) -> Result<bool, PassError> {
        self.run_with_stats(module).map(|stats| stats.changed())
    }

    pub fn run_with_stats(&self, module: &mut Module) -> Result<RewriteStats, PassError> {
        let _span = info_span!("command_buffer_scheduling", module = module.name.as_str()).entered();
        if !module.has_schedule() {
            return Err(PassError::MissingSchedule(module.name.clone()));
        }
        verify_schedule(module).into_result()?;
        let entry = module
            .entry()
            .ok_or_else(|| PassError::invariant(module.name.clone(), "module has no entry computation"))?;

        let mut stats = RewriteStats::default();
        let mut visited = HashSet::new();
        self.rewrite_computation(module, entry, &mut visited, &mut stats)?;

        if let Some(violation) = verify_schedule(module).violations.into_iter().next() {
            return Err(PassError::invariant(violation.computation, violation.reason));
        }
        debug!(
            visited = stats.computations_visited,
            hoisted = stats.computations_hoisted,
            created = stats.command_buffers_created,
            captured = stats.instructions_captured,
            "command buffer scheduling finished"
        );
        Ok(stats)
    }

    fn rewrite_computation(
        &self,
        module: &mut Module,
        comp: CompId,
        visited: &mut HashSet<CompId>,
        stats: &mut RewriteStats,
    ) -> Result<(), PassError> {
        if !visited.insert(comp) {
            return Ok(());
        }
        stats.computations_visited += 1;

        for child in nested_computations(module, comp) {
            self.rewrite_computation(module, child, visited, stats)?;
        }

        if move_parameters_and_constants_to_front(module, comp)? {
            stats.computations_hoisted += 1;
        }

        let sequence = module.instruction_order(comp);
        for run in collect_command_buffer_sequences(module, &sequence, &self.config) {
            let command_buffer = prepare_command_buffer(module, &run)?;
            splice_command_buffer(module, comp, &run, command_buffer)?;
            stats.command_buffers_created += 1;
            stats.instructions_captured += run.len();
        }
        Ok(())
    }
}

/// Computations whose rewrite can change how instructions of `comp` are
/// classified, in schedule order. Fused computations, reducers and command
/// buffers are never entered.
fn nested_computations(module: &Module, comp: CompId) -> Vec<CompId> {
    let mut nested = Vec::new();
    for id in module.instruction_order(comp) {
        let inst = module.instr(id);
        match inst.opcode {
            Opcode::While => {
                nested.extend(inst.called_as(CallRole::Condition));
                nested.extend(inst.called_as(CallRole::Body));
            }
            Opcode::Conditional => nested.extend(inst.branches()),
            Opcode::Call => nested.extend(
                inst.called_as(CallRole::ToApply)
                    .filter(|&c| module.computation(c).kind == ComputationKind::Regular),
            ),
            _ => {}
        }
    }
    nested
}

/// Install `command_buffer` and replace `run` in `comp` with a call to it.
fn splice_command_buffer(
    module: &mut Module,
    comp: CompId,
    run: &[InstrId],
    command_buffer: CommandBuffer,
) -> Result<(), PassError> {
    let comp_name = module.computation(comp).name.clone();
    let in_run: HashSet<InstrId> = run.iter().copied().collect();
    let uses = module.use_index(comp);
    let call_shape = command_buffer.call_shape();
    let CommandBuffer {
        arguments,
        results,
        computation,
        ..
    } = command_buffer;

    let (body, body_ids) = module.add_detached_computation(computation, ComputationKind::CommandBuffer)?;
    if let Some(schedule) = module.schedule_mut() {
        schedule.set_sequence(body, body_ids);
    }

    let call = module.add_instruction(comp, InstructionSpec::call(call_shape, body), arguments.clone())?;
    let mut replacement = vec![call];
    if let [only] = results.as_slice() {
        module.replace_uses_except(*only, call, &in_run)?;
    } else {
        for (index, &result) in results.iter().enumerate() {
            let shape = module.instr(result).shape.clone();
            let gte = module.add_instruction(
                comp,
                InstructionSpec::get_tuple_element(shape, index),
                vec![call],
            )?;
            module.replace_uses_except(result, gte, &in_run)?;
            replacement.push(gte);
        }
    }

    // Ordering constraints that crossed the run boundary now attach to the
    // call; edges inside the run live on in the command buffer.
    for &id in run {
        for pred in module.instr(id).control_predecessors.clone() {
            if !in_run.contains(&pred) {
                module.add_control_dependency(pred, call)?;
            }
        }
    }
    for &id in run {
        for &succ in uses.control_successors(id) {
            if !in_run.contains(&succ) {
                module.add_control_dependency(call, succ)?;
            }
        }
    }

    let replaced = module
        .schedule_mut()
        .is_some_and(|s| s.replace_block(comp, run, replacement));
    if !replaced {
        return Err(PassError::invariant(
            &comp_name,
            "outlined run is not a contiguous block of the schedule",
        ));
    }
    module.remove_instructions(run)?;
    for touched in [comp, body] {
        verify_computation(module, touched).map_err(|reason| {
            PassError::invariant(module.computation(touched).name.clone(), reason)
        })?;
    }

    debug!(
        computation = comp_name.as_str(),
        command_buffer = module.computation(body).name.as_str(),
        call = module.instr(call).name.as_str(),
        arguments = arguments.len(),
        results = results.len(),
        instructions = run.len(),
        "outlined command buffer"
    );
    Ok(())
}
