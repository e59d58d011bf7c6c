// classify.rs - Which instructions may be recorded into a command buffer
//
// Pure predicates over the graph and a resolved config. Control-flow
// instructions are commands only when everything in their nested
// computations is capturable, so these predicates must be re-asked after
// nested computations have been rewritten.
//
// Preconditions: `id` names a live instruction of `module`.
// Postconditions: none (predicates).
// Failure modes: none; an unsupported or disabled kind is a non-command.
// Side effects: none.

use crate::config::{CommandBufferConfig, CommandKind};
use crate::id::{CompId, InstrId};
use crate::ir::{CallRole, ComputationKind, Module, Opcode, UseIndex};

/// Data-routing instructions that cost nothing at run time. They may ride
/// along inside a run but never start or justify one.
pub fn is_no_op(module: &Module, id: InstrId) -> bool {
    matches!(
        module.instr(id).opcode,
        Opcode::Tuple | Opcode::GetTupleElement | Opcode::Bitcast
    )
}

pub fn is_parameter_or_constant(module: &Module, id: InstrId) -> bool {
    matches!(
        module.instr(id).opcode,
        Opcode::Parameter | Opcode::Constant
    )
}

/// A call whose callee was produced by command buffer scheduling.
pub fn is_command_buffer_call(module: &Module, id: InstrId) -> bool {
    let inst = module.instr(id);
    inst.opcode == Opcode::Call
        && inst
            .called_as(CallRole::ToApply)
            .is_some_and(|c| module.computation(c).kind == ComputationKind::CommandBuffer)
}

/// Command kind a custom-call target belongs to.
pub fn custom_call_kind(target: &str) -> CommandKind {
    if target == "__cublas$gemm" {
        CommandKind::Cublas
    } else if target.starts_with("__cublas$lt$matmul") {
        CommandKind::CublasLt
    } else if target.starts_with("__cudnn$") {
        CommandKind::Cudnn
    } else {
        CommandKind::CustomCall
    }
}

/// Whether `id` can be recorded as a single command.
///
/// Async collective starts and dones are not commands on their own; see
/// `is_async_start_command` and `is_async_done_command`.
pub fn is_command(module: &Module, id: InstrId, config: &CommandBufferConfig) -> bool {
    let inst = module.instr(id);
    match &inst.opcode {
        Opcode::Fusion | Opcode::Sort | Opcode::PartitionId | Opcode::ReplicaId => {
            config.is_enabled(CommandKind::Fusion)
        }
        Opcode::CustomCall => {
            let Some(target) = inst.attrs.custom_call_target.as_deref() else {
                return false;
            };
            match custom_call_kind(target) {
                CommandKind::CustomCall => {
                    config.is_enabled(CommandKind::CustomCall)
                        && config.allows_custom_call_target(target)
                }
                kind => config.is_enabled(kind),
            }
        }
        Opcode::While => {
            config.is_enabled(CommandKind::While)
                && [CallRole::Condition, CallRole::Body]
                    .into_iter()
                    .filter_map(|role| inst.called_as(role))
                    .all(|comp| is_capturable_computation(module, comp, config))
        }
        Opcode::Conditional => {
            config.is_enabled(CommandKind::Conditionals)
                && inst
                    .branches()
                    .into_iter()
                    .all(|comp| is_capturable_computation(module, comp, config))
        }
        _ => false,
    }
}

pub fn is_async_start_command(module: &Module, id: InstrId, config: &CommandBufferConfig) -> bool {
    module.instr(id).opcode.is_async_start() && config.is_enabled(CommandKind::Collectives)
}

pub fn is_async_done_command(module: &Module, id: InstrId, config: &CommandBufferConfig) -> bool {
    module.instr(id).opcode.is_async_done() && config.is_enabled(CommandKind::Collectives)
}

/// The done instruction completing an async start: the start's user of the
/// matching done opcode that reads the start.
pub fn find_async_done(module: &Module, uses: &UseIndex, start: InstrId) -> Option<InstrId> {
    let done_opcode = module.instr(start).opcode.matching_done()?;
    uses.users(start)
        .iter()
        .copied()
        .find(|&u| module.instr(u).opcode == done_opcode)
}

/// The start instruction an async done completes: its first operand, when
/// that operand is a start of the matching kind.
pub fn find_async_start(module: &Module, done: InstrId) -> Option<InstrId> {
    let inst = module.instr(done);
    let &start = inst.operands.first()?;
    (module.instr(start).opcode.matching_done().as_ref() == Some(&inst.opcode)).then_some(start)
}

/// Every instruction of `comp` could live inside a command buffer.
pub fn is_capturable_computation(module: &Module, comp: CompId, config: &CommandBufferConfig) -> bool {
    module.computation(comp).instructions().iter().all(|&id| {
        is_no_op(module, id)
            || is_parameter_or_constant(module, id)
            || is_command(module, id, config)
            || is_async_start_command(module, id, config)
            || is_async_done_command(module, id, config)
            || is_command_buffer_call(module, id)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CommandBufferOptions, DeviceDescription};
    use crate::parse_module;

    fn config(kinds: &[CommandKind]) -> CommandBufferConfig {
        CommandBufferOptions {
            enabled_kinds: kinds.to_vec(),
            custom_call_targets: vec!["my_kernel".to_string()],
            ..Default::default()
        }
        .resolve(&DeviceDescription::cuda())
    }

    fn find(module: &Module, name: &str) -> InstrId {
        module
            .computations()
            .find_map(|c| module.find_instruction(c.id, name))
            .unwrap()
    }

    const LIBRARY_CALLS: &str = r#"
HloModule m, is_scheduled=true

ENTRY %main (a: f32[2,2]) -> f32[2,2] {
  %a = f32[2,2] parameter(0)
  %gemm = f32[2,2] custom-call(%a, %a), custom_call_target="__cublas$gemm"
  %lt = f32[2,2] custom-call(%gemm, %a), custom_call_target="__cublas$lt$matmul$f8"
  %conv = f32[2,2] custom-call(%lt), custom_call_target="__cudnn$convForward"
  %mine = f32[2,2] custom-call(%conv), custom_call_target="my_kernel"
  ROOT %other = f32[2,2] custom-call(%mine), custom_call_target="other_kernel"
}
"#;

    #[test]
    fn custom_call_targets_map_to_kinds() {
        assert_eq!(custom_call_kind("__cublas$gemm"), CommandKind::Cublas);
        assert_eq!(custom_call_kind("__cublas$lt$matmul"), CommandKind::CublasLt);
        assert_eq!(custom_call_kind("__cudnn$fmha"), CommandKind::Cudnn);
        assert_eq!(custom_call_kind("__cublas$trsm"), CommandKind::CustomCall);
    }

    #[test]
    fn custom_calls_follow_enabled_kinds() {
        let m = parse_module(LIBRARY_CALLS).unwrap();
        let only_cublas = config(&[CommandKind::Cublas]);
        assert!(is_command(&m, find(&m, "gemm"), &only_cublas));
        assert!(!is_command(&m, find(&m, "lt"), &only_cublas));

        let all = config(&CommandKind::ALL);
        for name in ["gemm", "lt", "conv", "mine"] {
            assert!(is_command(&m, find(&m, name), &all), "{name}");
        }
        assert!(!is_command(&m, find(&m, "other"), &all));
    }

    const WHILE_LOOP: &str = r#"
HloModule m, is_scheduled=true

%fused (p: s32[]) -> s32[] {
  %p = s32[] parameter(0)
  ROOT %neg = s32[] negate(%p)
}

%cond (c: (s32[])) -> pred[] {
  %c = (s32[]) parameter(0)
  %c.0 = s32[] get-tuple-element(%c), index=0
  ROOT %lt = pred[] custom-call(%c.0), custom_call_target="__cublas$gemm"
}

%body (b: (s32[])) -> (s32[]) {
  %b = (s32[]) parameter(0)
  %b.0 = s32[] get-tuple-element(%b), index=0
  %f = s32[] fusion(%b.0), kind=kLoop, calls=%fused
  ROOT %t = (s32[]) tuple(%f)
}

ENTRY %main (x: (s32[])) -> (s32[]) {
  %x = (s32[]) parameter(0)
  ROOT %w = (s32[]) while(%x), condition=%cond, body=%body
}
"#;

    #[test]
    fn while_needs_its_kind_and_capturable_bodies() {
        let m = parse_module(WHILE_LOOP).unwrap();
        let w = find(&m, "w");
        assert!(!is_command(
            &m,
            w,
            &config(&[CommandKind::While, CommandKind::Fusion])
        ));
        assert!(is_command(
            &m,
            w,
            &config(&[CommandKind::While, CommandKind::Fusion, CommandKind::Cublas])
        ));
        assert!(!is_command(
            &m,
            w,
            &config(&[CommandKind::Fusion, CommandKind::Cublas])
        ));
    }

    #[test]
    fn async_pairs_are_found_both_ways() {
        let m = parse_module(
            r#"
HloModule m, is_scheduled=true

%add (x: s32[], y: s32[]) -> s32[] {
  %x = s32[] parameter(0)
  %y = s32[] parameter(1)
  ROOT %sum = s32[] add(%x, %y)
}

ENTRY %main (a: s32[4]) -> s32[4] {
  %a = s32[4] parameter(0)
  %start = s32[4] all-reduce-start(%a), to_apply=%add
  ROOT %done = s32[4] all-reduce-done(%start)
}
"#,
        )
        .unwrap();
        let (start, done) = (find(&m, "start"), find(&m, "done"));
        let uses = m.use_index(m.entry().unwrap());
        assert_eq!(find_async_done(&m, &uses, start), Some(done));
        assert_eq!(find_async_start(&m, done), Some(start));
        let on = config(&[CommandKind::Collectives]);
        assert!(is_async_start_command(&m, start, &on));
        assert!(is_async_done_command(&m, done, &on));
        assert!(!is_command(&m, start, &on));
        assert!(!is_async_start_command(&m, start, &config(&[])));
    }

    #[test]
    fn no_ops_and_leaves() {
        let m = parse_module(WHILE_LOOP).unwrap();
        assert!(is_no_op(&m, find(&m, "b.0")));
        assert!(is_no_op(&m, find(&m, "t")));
        assert!(is_parameter_or_constant(&m, find(&m, "x")));
        assert!(!is_command_buffer_call(&m, find(&m, "w")));
    }
}
