// outline.rs - Extract one run into a detached command buffer computation
//
// The run is cloned into a fresh computation whose parameters are the run's
// external operands and whose root returns every value the outside world
// still reads. The module is only read; splicing happens in `rewrite`.
//
// Preconditions: `sequence` is a non-empty contiguous run of one verified
//                computation schedule.
// Postconditions: arguments are the external operands in first-appearance
//                 order without duplicates; results are the run members used
//                 outside the run (or the run's last instruction); internal
//                 control edges are reproduced between clones.
// Failure modes: `InvariantViolation` for an empty run, or an operand or
//                control predecessor scheduled after its consumer.
// Side effects: none.

use std::collections::{HashMap, HashSet};

use crate::error::PassError;
use crate::id::{InstrId, LocalId};
use crate::ir::{ComputationBuilder, DetachedComputation, InstructionSpec, Module};
use crate::shape::Shape;

/// Result of outlining one run.
#[derive(Debug, Clone)]
pub struct CommandBuffer {
    /// Values from the enclosing computation, one per parameter.
    pub arguments: Vec<InstrId>,
    /// Run members read outside the run, in schedule order.
    pub results: Vec<InstrId>,
    pub computation: DetachedComputation,
    /// Run member or argument → its clone or parameter in `computation`.
    pub inst_mapping: HashMap<InstrId, LocalId>,
}

impl CommandBuffer {
    /// Shape of the call that replaces the run.
    pub fn call_shape(&self) -> Shape {
        self.computation.root_instruction().spec.shape.clone()
    }
}

pub fn prepare_command_buffer(module: &Module, sequence: &[InstrId]) -> Result<CommandBuffer, PassError> {
    let Some(&first) = sequence.first() else {
        return Err(PassError::invariant("<none>", "cannot outline an empty run"));
    };
    let parent = module.instr(first).parent;
    let parent_name = module.computation(parent).name.clone();
    let uses = module.use_index(parent);
    let in_run: HashSet<InstrId> = sequence.iter().copied().collect();

    let mut builder = ComputationBuilder::new("command_buffer");
    let mut inst_mapping: HashMap<InstrId, LocalId> = HashMap::new();

    // Parameters first, one per distinct external operand.
    let mut arguments = Vec::new();
    for &id in sequence {
        for &op in &module.instr(id).operands {
            if in_run.contains(&op) || inst_mapping.contains_key(&op) {
                continue;
            }
            let n = arguments.len();
            let spec = InstructionSpec::parameter(n, module.instr(op).shape.clone(), format!("p{n}"));
            inst_mapping.insert(op, builder.add(spec, vec![])?);
            arguments.push(op);
        }
    }

    for &id in sequence {
        let inst = module.instr(id);
        let operands = inst
            .operands
            .iter()
            .map(|op| {
                inst_mapping.get(op).copied().ok_or_else(|| {
                    PassError::invariant(
                        &parent_name,
                        format!(
                            "'{}' is scheduled before its operand '{}'",
                            inst.name,
                            module.instr(*op).name
                        ),
                    )
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let clone = builder.add(InstructionSpec::clone_of(inst), operands)?;

        for pred in &inst.control_predecessors {
            if !in_run.contains(pred) {
                continue;
            }
            let Some(&pred_clone) = inst_mapping.get(pred) else {
                return Err(PassError::invariant(
                    &parent_name,
                    format!(
                        "'{}' is scheduled before its control predecessor '{}'",
                        inst.name,
                        module.instr(*pred).name
                    ),
                ));
            };
            builder.add_control_dependency(pred_clone, clone)?;
        }
        inst_mapping.insert(id, clone);
    }

    let mut results: Vec<InstrId> = sequence
        .iter()
        .copied()
        .filter(|&id| module.is_root(id) || uses.users(id).iter().any(|u| !in_run.contains(u)))
        .collect();
    if results.is_empty() {
        results.push(sequence[sequence.len() - 1]);
    }

    if let [only] = results.as_slice() {
        builder.set_root(inst_mapping[only]);
    } else {
        let shape = Shape::tuple(results.iter().map(|&r| module.instr(r).shape.clone()).collect());
        let operands = results.iter().map(|r| inst_mapping[r]).collect();
        let tuple = builder.add(InstructionSpec::tuple(shape), operands)?;
        builder.set_root(tuple);
    }

    Ok(CommandBuffer {
        arguments,
        results,
        computation: builder.build()?,
        inst_mapping,
    })
}
