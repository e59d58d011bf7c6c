// schedule.rs - Per-computation instruction sequences and their verification
//
// A `Schedule` maps each non-fused computation to a total order of its
// instructions. The pass never invents an order: it reads the existing one,
// edits it in place (hoisting, block replacement) and checks it again.
//
// Preconditions: sequences only name instructions of their own computation.
// Postconditions: `verify_schedule` reports S1-S3 for every computation.
// Failure modes: violations are collected, not raised; callers decide.
// Side effects: none.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::error::PassError;
use crate::id::{CompId, InstrId};
use crate::ir::{ComputationKind, Module};

// ── Schedule container ──────────────────────────────────────────────────────

/// Total execution order per computation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Schedule {
    sequences: BTreeMap<CompId, Vec<InstrId>>,
}

impl Schedule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sequence(&self, comp: CompId) -> Option<&[InstrId]> {
        self.sequences.get(&comp).map(Vec::as_slice)
    }

    pub fn is_sequenced(&self, comp: CompId) -> bool {
        self.sequences.contains_key(&comp)
    }

    pub fn set_sequence(&mut self, comp: CompId, sequence: Vec<InstrId>) {
        self.sequences.insert(comp, sequence);
    }

    pub fn sequenced_computations(&self) -> impl Iterator<Item = CompId> + '_ {
        self.sequences.keys().copied()
    }

    /// Drop `id` from the sequence of `comp`, if present.
    pub fn remove_instructions(&mut self, comp: CompId, ids: &HashSet<InstrId>) {
        if let Some(seq) = self.sequences.get_mut(&comp) {
            seq.retain(|i| !ids.contains(i));
        }
    }

    /// Replace the contiguous block holding exactly `block` (in order) with
    /// `replacement`. Returns false, leaving the sequence untouched, when the
    /// block is missing or not contiguous.
    pub fn replace_block(&mut self, comp: CompId, block: &[InstrId], replacement: Vec<InstrId>) -> bool {
        let Some(seq) = self.sequences.get_mut(&comp) else {
            return false;
        };
        let Some(&first) = block.first() else {
            return false;
        };
        let Some(start) = seq.iter().position(|&i| i == first) else {
            return false;
        };
        let end = start + block.len();
        if end > seq.len() || seq[start..end] != *block {
            return false;
        }
        seq.splice(start..end, replacement);
        true
    }
}

// ── Verification ─────────────────────────────────────────────────────────────

/// One broken schedule property, attributed to a computation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleViolation {
    pub computation: String,
    pub reason: String,
}

/// Machine-checkable evidence for schedule postconditions (S1-S3).
#[derive(Debug, Clone)]
pub struct ScheduleCert {
    /// S1: Every non-fused computation has a sequence.
    pub s1_all_computations_sequenced: bool,
    /// S2: Every sequence lists each live member exactly once and nothing else.
    pub s2_members_exactly_once: bool,
    /// S3: Operands and control predecessors precede their consumers.
    pub s3_dependencies_respected: bool,
    pub violations: Vec<ScheduleViolation>,
}

impl crate::pass::StageCert for ScheduleCert {
    fn all_pass(&self) -> bool {
        self.s1_all_computations_sequenced
            && self.s2_members_exactly_once
            && self.s3_dependencies_respected
    }

    fn obligations(&self) -> Vec<(&'static str, bool)> {
        vec![
            (
                "S1_all_computations_sequenced",
                self.s1_all_computations_sequenced,
            ),
            ("S2_members_exactly_once", self.s2_members_exactly_once),
            ("S3_dependencies_respected", self.s3_dependencies_respected),
        ]
    }
}

impl ScheduleCert {
    /// The first violation as an `InvalidSchedule` error.
    pub fn into_result(self) -> Result<(), PassError> {
        match self.violations.into_iter().next() {
            None => Ok(()),
            Some(v) => Err(PassError::InvalidSchedule {
                computation: v.computation,
                reason: v.reason,
            }),
        }
    }
}

/// Verify the module schedule against the graph.
///
/// A module without any schedule fails S1 for every non-fused computation.
pub fn verify_schedule(module: &Module) -> ScheduleCert {
    let mut cert = ScheduleCert {
        s1_all_computations_sequenced: true,
        s2_members_exactly_once: true,
        s3_dependencies_respected: true,
        violations: Vec::new(),
    };
    for comp in module.computations() {
        if comp.kind == ComputationKind::Fused {
            continue;
        }
        let seq = module.schedule().and_then(|s| s.sequence(comp.id));
        let Some(seq) = seq else {
            cert.s1_all_computations_sequenced = false;
            cert.violations.push(ScheduleViolation {
                computation: comp.name.clone(),
                reason: "computation has no instruction sequence".to_string(),
            });
            continue;
        };
        if let Err(reason) = verify_s2_members_exactly_once(module, comp.id, seq) {
            cert.s2_members_exactly_once = false;
            cert.violations.push(ScheduleViolation {
                computation: comp.name.clone(),
                reason,
            });
            continue;
        }
        if let Err(reason) = verify_s3_dependencies_respected(module, seq) {
            cert.s3_dependencies_respected = false;
            cert.violations.push(ScheduleViolation {
                computation: comp.name.clone(),
                reason,
            });
        }
    }
    cert
}

/// Check S2 and S3 for a single computation.
pub fn verify_computation(module: &Module, comp: CompId) -> Result<(), String> {
    let seq = module
        .schedule()
        .and_then(|s| s.sequence(comp))
        .ok_or_else(|| "computation has no instruction sequence".to_string())?;
    verify_s2_members_exactly_once(module, comp, seq)?;
    verify_s3_dependencies_respected(module, seq)
}

/// S2: the sequence is a permutation of the live members.
fn verify_s2_members_exactly_once(module: &Module, comp: CompId, seq: &[InstrId]) -> Result<(), String> {
    let members: HashSet<InstrId> = module.computation(comp).instructions().iter().copied().collect();
    let mut seen = HashSet::new();
    for &id in seq {
        let name = &module.instr(id).name;
        if !members.contains(&id) {
            return Err(format!("'{name}' is sequenced but not a live member"));
        }
        if !seen.insert(id) {
            return Err(format!("'{name}' is sequenced more than once"));
        }
    }
    if let Some(missing) = module
        .computation(comp)
        .instructions()
        .iter()
        .find(|id| !seen.contains(id))
    {
        return Err(format!(
            "'{}' is missing from the sequence",
            module.instr(*missing).name
        ));
    }
    Ok(())
}

/// S3: every operand and control predecessor comes earlier.
fn verify_s3_dependencies_respected(module: &Module, seq: &[InstrId]) -> Result<(), String> {
    let position: HashMap<InstrId, usize> = seq.iter().enumerate().map(|(i, &id)| (id, i)).collect();
    for (pos, &id) in seq.iter().enumerate() {
        let inst = module.instr(id);
        for &op in &inst.operands {
            if position.get(&op).map_or(true, |&p| p >= pos) {
                return Err(format!(
                    "'{}' precedes its operand '{}'",
                    inst.name,
                    module.instr(op).name
                ));
            }
        }
        for &pred in &inst.control_predecessors {
            if position.get(&pred).map_or(true, |&p| p >= pos) {
                return Err(format!(
                    "'{}' precedes its control predecessor '{}'",
                    inst.name,
                    module.instr(pred).name
                ));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{InstructionSpec, Opcode};
    use crate::pass::StageCert;
    use crate::shape::{PrimitiveType, Shape};

    fn s32() -> Shape {
        Shape::scalar(PrimitiveType::S32)
    }

    fn chain() -> (Module, CompId, Vec<InstrId>) {
        let mut m = Module::new("m");
        let c = m.add_computation("main", ComputationKind::Regular);
        let a = m
            .add_instruction(c, InstructionSpec::parameter(0, s32(), "a"), vec![])
            .unwrap();
        let b = m
            .add_instruction(
                c,
                InstructionSpec::new("negate", Opcode::from_name("negate"), s32()),
                vec![a],
            )
            .unwrap();
        let d = m
            .add_instruction(
                c,
                InstructionSpec::new("negate", Opcode::from_name("negate"), s32()),
                vec![b],
            )
            .unwrap();
        m.set_root(c, d).unwrap();
        (m, c, vec![a, b, d])
    }

    #[test]
    fn valid_schedule_passes_all_obligations() {
        let (mut m, c, ids) = chain();
        let mut s = Schedule::new();
        s.set_sequence(c, ids);
        m.set_schedule(Some(s));
        let cert = verify_schedule(&m);
        assert!(cert.all_pass());
        assert!(cert.into_result().is_ok());
    }

    #[test]
    fn missing_sequence_fails_s1() {
        let (mut m, _, _) = chain();
        m.set_schedule(Some(Schedule::new()));
        let cert = verify_schedule(&m);
        assert!(!cert.s1_all_computations_sequenced);
        assert!(matches!(
            cert.into_result(),
            Err(PassError::InvalidSchedule { .. })
        ));
    }

    #[test]
    fn duplicate_and_missing_fail_s2() {
        let (mut m, c, ids) = chain();
        let mut s = Schedule::new();
        s.set_sequence(c, vec![ids[0], ids[0], ids[1]]);
        m.set_schedule(Some(s));
        let cert = verify_schedule(&m);
        assert!(!cert.s2_members_exactly_once);
        assert_eq!(cert.violations[0].reason, "'a' is sequenced more than once");
    }

    #[test]
    fn operand_after_user_fails_s3() {
        let (mut m, c, ids) = chain();
        let mut s = Schedule::new();
        s.set_sequence(c, vec![ids[1], ids[0], ids[2]]);
        m.set_schedule(Some(s));
        let cert = verify_schedule(&m);
        assert!(!cert.s3_dependencies_respected);
        assert_eq!(cert.violations[0].reason, "'negate' precedes its operand 'a'");
    }

    #[test]
    fn control_predecessor_after_successor_fails_s3() {
        let (mut m, c, ids) = chain();
        let extra = m
            .add_instruction(c, InstructionSpec::custom_call(s32(), "t"), vec![])
            .unwrap();
        m.add_control_dependency(extra, ids[1]).unwrap();
        let mut s = Schedule::new();
        s.set_sequence(c, vec![ids[0], ids[1], extra, ids[2]]);
        m.set_schedule(Some(s));
        assert!(!verify_schedule(&m).s3_dependencies_respected);
    }

    #[test]
    fn replace_block_requires_contiguity() {
        let mut s = Schedule::new();
        let c = CompId(0);
        let ids: Vec<InstrId> = (0..5).map(InstrId).collect();
        s.set_sequence(c, ids.clone());
        assert!(!s.replace_block(c, &[ids[1], ids[3]], vec![InstrId(9)]));
        assert!(s.replace_block(c, &[ids[1], ids[2]], vec![InstrId(9), InstrId(10)]));
        assert_eq!(
            s.sequence(c).unwrap(),
            &[ids[0], InstrId(9), InstrId(10), ids[3], ids[4]]
        );
    }

    #[test]
    fn removed_instruction_leaves_sequence() {
        let (mut m, c, ids) = chain();
        let dead = m
            .add_instruction(c, InstructionSpec::custom_call(s32(), "t"), vec![])
            .unwrap();
        let mut s = Schedule::new();
        s.set_sequence(c, vec![ids[0], dead, ids[1], ids[2]]);
        m.set_schedule(Some(s));
        m.remove_instruction(dead).unwrap();
        assert_eq!(m.schedule().unwrap().sequence(c).unwrap(), ids.as_slice());
        assert!(verify_schedule(&m).all_pass());
    }
}
