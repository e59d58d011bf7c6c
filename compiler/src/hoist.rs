// hoist.rs - Move parameters and constants to the front of a schedule
//
// Leaves have no data inputs, so they can always run first. Putting them in
// one leading block means they never interrupt a run of commands and never
// end up cloned into a command buffer.
//
// Preconditions: `comp` is sequenced.
// Postconditions: every parameter and constant precedes every other
//                 instruction; relative order inside both groups is kept;
//                 the sequence still satisfies S2/S3.
// Failure modes: `InvariantViolation` if the reordered sequence does not
//                verify.
// Side effects: forwards leaf control predecessors to the leaf's users and
//               control successors, then drops the leaf's control edges.

use tracing::trace;

use crate::classify::is_parameter_or_constant;
use crate::error::PassError;
use crate::id::{CompId, InstrId};
use crate::ir::Module;
use crate::schedule::verify_computation;

/// Returns whether the sequence or any control edge changed.
pub fn move_parameters_and_constants_to_front(module: &mut Module, comp: CompId) -> Result<bool, PassError> {
    let comp_name = module.computation(comp).name.clone();
    let sequence: Vec<InstrId> = module
        .schedule()
        .and_then(|s| s.sequence(comp))
        .map(<[InstrId]>::to_vec)
        .ok_or_else(|| PassError::invariant(&comp_name, "computation is not sequenced"))?;

    let (leaves, rest): (Vec<InstrId>, Vec<InstrId>) = sequence
        .iter()
        .copied()
        .partition(|&id| is_parameter_or_constant(module, id));

    // Every edit below starts an edge at the current leaf or at one of its
    // predecessors. All of those sit ahead of the leaves still to visit, so
    // the index stays exact for them.
    let uses = module.use_index(comp);
    let mut edited = false;
    for &leaf in &leaves {
        let preds = module.instr(leaf).control_predecessors.clone();
        let successors = uses.control_successors(leaf);
        if preds.is_empty() && successors.is_empty() {
            continue;
        }
        // A hoisted leaf would run before its predecessors; whatever ran
        // after the leaf, by data or by control, inherits the ordering.
        let mut dependents = uses.users(leaf).to_vec();
        for &succ in successors {
            if !dependents.contains(&succ) {
                dependents.push(succ);
            }
        }
        for &pred in &preds {
            for &dependent in &dependents {
                if dependent != pred {
                    module.add_control_dependency(pred, dependent)?;
                }
            }
        }
        trace!(
            computation = comp_name.as_str(),
            leaf = module.instr(leaf).name.as_str(),
            forwarded = preds.len(),
            dependents = dependents.len(),
            "dropping leaf control dependencies"
        );
        for &succ in successors {
            module.remove_control_dependency(leaf, succ)?;
        }
        module.clear_control_predecessors(leaf)?;
        edited = true;
    }

    let reordered: Vec<InstrId> = leaves.into_iter().chain(rest).collect();
    let moved = reordered != sequence;
    if let Some(schedule) = module.schedule_mut() {
        schedule.set_sequence(comp, reordered);
    }
    verify_computation(module, comp).map_err(|reason| PassError::invariant(&comp_name, reason))?;
    Ok(moved || edited)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse_module;

    fn names(module: &Module, comp: CompId) -> Vec<String> {
        module
            .schedule()
            .unwrap()
            .sequence(comp)
            .unwrap()
            .iter()
            .map(|&id| module.instr(id).name.clone())
            .collect()
    }

    #[test]
    fn parameters_move_ahead_of_fusions() {
        let mut m = parse_module(
            r#"
HloModule m, is_scheduled=true

%fused (p0: s32[], p1: s32[]) -> s32[] {
  %p0 = s32[] parameter(0)
  %p1 = s32[] parameter(1)
  ROOT %add = s32[] add(%p0, %p1)
}

ENTRY %main (a: s32[], b: s32[], c: s32[]) -> s32[] {
  %a = s32[] parameter(0)
  %b = s32[] parameter(1)
  %fusion = s32[] fusion(%a, %b), kind=kLoop, calls=%fused
  %c = s32[] parameter(2)
  %k = s32[] constant(7)
  ROOT %fusion.1 = s32[] fusion(%k, %c), kind=kLoop, calls=%fused
}
"#,
        )
        .unwrap();
        let entry = m.entry().unwrap();
        assert!(move_parameters_and_constants_to_front(&mut m, entry).unwrap());
        assert_eq!(names(&m, entry), ["a", "b", "c", "k", "fusion", "fusion.1"]);
        assert!(!move_parameters_and_constants_to_front(&mut m, entry).unwrap());
    }

    #[test]
    fn leaf_control_predecessors_are_forwarded_to_users() {
        let mut m = parse_module(
            r#"
HloModule m, is_scheduled=true

%fused (p0: s32[]) -> s32[] {
  %p0 = s32[] parameter(0)
  ROOT %neg = s32[] negate(%p0)
}

ENTRY %main (a: s32[]) -> s32[] {
  %a = s32[] parameter(0)
  %side = s32[] custom-call(), custom_call_target="side_effect"
  %k = s32[] constant(1), control-predecessors={%side}
  ROOT %fusion = s32[] fusion(%k), kind=kLoop, calls=%fused
}
"#,
        )
        .unwrap();
        let entry = m.entry().unwrap();
        move_parameters_and_constants_to_front(&mut m, entry).unwrap();
        assert_eq!(names(&m, entry), ["a", "k", "side", "fusion"]);

        let k = m.find_instruction(entry, "k").unwrap();
        let side = m.find_instruction(entry, "side").unwrap();
        let fusion = m.find_instruction(entry, "fusion").unwrap();
        assert!(m.instr(k).control_predecessors.is_empty());
        assert_eq!(m.instr(fusion).control_predecessors, vec![side]);
    }

    #[test]
    fn leaf_control_predecessors_are_forwarded_to_control_successors() {
        let mut m = parse_module(
            r#"
HloModule m, is_scheduled=true

ENTRY %main (a: s32[]) -> s32[] {
  %a = s32[] parameter(0)
  %side = s32[] custom-call(), custom_call_target="side_effect"
  %k = s32[] constant(1), control-predecessors={%side}
  ROOT %sink = s32[] custom-call(%a), custom_call_target="sink", control-predecessors={%k}
}
"#,
        )
        .unwrap();
        let entry = m.entry().unwrap();
        assert!(move_parameters_and_constants_to_front(&mut m, entry).unwrap());
        assert_eq!(names(&m, entry), ["a", "k", "side", "sink"]);

        let k = m.find_instruction(entry, "k").unwrap();
        let side = m.find_instruction(entry, "side").unwrap();
        let sink = m.find_instruction(entry, "sink").unwrap();
        assert!(m.instr(k).control_predecessors.is_empty());
        assert!(m.control_successors(k).is_empty());
        assert_eq!(m.instr(sink).control_predecessors, vec![side]);
    }

    #[test]
    fn dropping_edges_of_an_already_hoisted_leaf_is_a_change() {
        let mut m = parse_module(
            r#"
HloModule m, is_scheduled=true

ENTRY %main (a: s32[]) -> s32[] {
  %a = s32[] parameter(0)
  %k = s32[] constant(1)
  ROOT %sink = s32[] custom-call(%a), custom_call_target="sink", control-predecessors={%k}
}
"#,
        )
        .unwrap();
        let entry = m.entry().unwrap();
        assert!(move_parameters_and_constants_to_front(&mut m, entry).unwrap());
        assert_eq!(names(&m, entry), ["a", "k", "sink"]);
        let sink = m.find_instruction(entry, "sink").unwrap();
        assert!(m.instr(sink).control_predecessors.is_empty());
        assert!(!move_parameters_and_constants_to_front(&mut m, entry).unwrap());
    }

    #[test]
    fn unsequenced_computation_is_an_invariant_violation() {
        let mut m = parse_module(
            r#"
HloModule m

ENTRY %main (a: s32[]) -> s32[] {
  ROOT %a = s32[] parameter(0)
}
"#,
        )
        .unwrap();
        let entry = m.entry().unwrap();
        assert!(matches!(
            move_parameters_and_constants_to_front(&mut m, entry),
            Err(PassError::InvariantViolation { .. })
        ));
    }
}
