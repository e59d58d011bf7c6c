// print.rs - Text form of a module
//
// Renders a `Module` in the same format `parser` reads: callees before
// callers, instructions in schedule order, operands by name only. Attributes
// the pass interprets come first in a fixed order, then preserved ones as
// written, then `control-predecessors`.
//
// Preconditions: `module` is well formed (every computation has a root).
// Postconditions: parsing the output yields an equivalent module.
// Failure modes: none (pure string formatting).
// Side effects: none.

use std::fmt;

use crate::id::{CompId, InstrId};
use crate::ir::{CallRole, Instruction, Module, Opcode};

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HloModule {}", self.name)?;
        if self.has_schedule() {
            write!(f, ", is_scheduled=true")?;
        }
        writeln!(f)?;
        for comp in self.post_order() {
            writeln!(f)?;
            write_computation(f, self, comp)?;
        }
        Ok(())
    }
}

/// One computation, header through closing brace.
pub fn computation_to_string(module: &Module, comp: CompId) -> String {
    struct Comp<'a>(&'a Module, CompId);
    impl fmt::Display for Comp<'_> {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write_computation(f, self.0, self.1)
        }
    }
    Comp(module, comp).to_string()
}

fn write_computation(f: &mut fmt::Formatter<'_>, module: &Module, comp: CompId) -> fmt::Result {
    let computation = module.computation(comp);
    if module.entry() == Some(comp) {
        write!(f, "ENTRY ")?;
    }
    write!(f, "%{} (", computation.name)?;
    for (i, &param) in computation.parameters().iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        let p = module.instr(param);
        write!(f, "{}: {}", p.name, p.shape)?;
    }
    write!(f, ")")?;
    if let Some(root) = computation.root() {
        write!(f, " -> {}", module.instr(root).shape)?;
    }
    writeln!(f, " {{")?;
    for id in module.instruction_order(comp) {
        write!(f, "  ")?;
        if computation.root() == Some(id) {
            write!(f, "ROOT ")?;
        }
        write_instruction(f, module, module.instr(id))?;
        writeln!(f)?;
    }
    writeln!(f, "}}")
}

fn write_instruction(f: &mut fmt::Formatter<'_>, module: &Module, inst: &Instruction) -> fmt::Result {
    write!(f, "%{} = {} {}(", inst.name, inst.shape, inst.opcode.name())?;
    match (&inst.opcode, inst.attrs.parameter_number, &inst.attrs.literal) {
        (Opcode::Parameter, Some(number), _) => write!(f, "{number}")?,
        (_, _, Some(literal)) if inst.operands.is_empty() => write!(f, "{literal}")?,
        _ => write_names(f, module, &inst.operands)?,
    }
    write!(f, ")")?;

    let attrs = &inst.attrs;
    if let Some(index) = attrs.tuple_index {
        write!(f, ", index={index}")?;
    }
    if let Some(kind) = attrs.fusion_kind {
        write!(f, ", kind={}", kind.as_str())?;
    }
    for (role, key) in [
        (CallRole::Calls, "calls"),
        (CallRole::ToApply, "to_apply"),
        (CallRole::Condition, "condition"),
        (CallRole::Body, "body"),
    ] {
        for (_, comp) in inst.called.iter().filter(|(r, _)| *r == role) {
            write!(f, ", {key}=%{}", module.computation(*comp).name)?;
        }
    }
    let branches = inst.branches();
    if !branches.is_empty() {
        write!(f, ", branch_computations={{")?;
        for (i, comp) in branches.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "%{}", module.computation(*comp).name)?;
        }
        write!(f, "}}")?;
    }
    if let Some(target) = &attrs.custom_call_target {
        write!(
            f,
            ", custom_call_target=\"{}\"",
            target.replace('\\', "\\\\").replace('"', "\\\"")
        )?;
    }
    for (key, value) in &attrs.extra {
        write!(f, ", {key}={value}")?;
    }
    if !inst.control_predecessors.is_empty() {
        write!(f, ", control-predecessors={{")?;
        write_names(f, module, &inst.control_predecessors)?;
        write!(f, "}}")?;
    }
    Ok(())
}

fn write_names(f: &mut fmt::Formatter<'_>, module: &Module, ids: &[InstrId]) -> fmt::Result {
    for (i, &id) in ids.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "%{}", module.instr(id).name)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse_module;

    const SOURCE: &str = r#"HloModule m, is_scheduled=true

%fused (p0: s32[], p1: s32[]) -> s32[] {
  %p0 = s32[] parameter(0)
  %p1 = s32[] parameter(1)
  ROOT %add = s32[] add(%p0, %p1)
}

ENTRY %main (a: s32[]) -> (s32[], s32[]) {
  %a = s32[] parameter(0)
  %c = f32[1]{0} constant({1})
  %fusion = s32[] fusion(%a, %a), kind=kLoop, calls=%fused, control-predecessors={%c}
  %cc = s32[] custom-call(%fusion), custom_call_target="__cublas$gemm", backend_config={"x":1}
  ROOT %t = (s32[], s32[]) tuple(%fusion, %cc)
}
"#;

    #[test]
    fn printed_module_matches_source() {
        let m = parse_module(SOURCE).unwrap();
        assert_eq!(m.to_string(), SOURCE);
    }

    #[test]
    fn reprint_is_a_fixed_point() {
        let m = parse_module(SOURCE).unwrap();
        let again = parse_module(&m.to_string()).unwrap();
        assert_eq!(again.to_string(), m.to_string());
    }

    #[test]
    fn single_computation_and_projections() {
        let m = parse_module(
            r#"HloModule m
ENTRY %main (p: (s32[], s32[])) -> s32[] {
  %p = (s32[], s32[]) parameter(0)
  ROOT %x = s32[] get-tuple-element(%p), index=1
}"#,
        )
        .unwrap();
        let entry = m.entry().unwrap();
        insta::assert_snapshot!(computation_to_string(&m, entry), @r###"
        ENTRY %main (p: (s32[], s32[])) -> s32[] {
          %p = (s32[], s32[]) parameter(0)
          ROOT %x = s32[] get-tuple-element(%p), index=1
        }
        "###);
        assert!(!m.to_string().contains("is_scheduled"));
    }

    #[test]
    fn conditional_branches_print_as_a_list() {
        let m = parse_module(
            r#"HloModule m
%t (x: s32[]) -> s32[] {
  ROOT %x = s32[] parameter(0)
}
%f (y: s32[]) -> s32[] {
  ROOT %y = s32[] parameter(0)
}
ENTRY %main (p: pred[], a: s32[]) -> s32[] {
  %p = pred[] parameter(0)
  %a = s32[] parameter(1)
  ROOT %cond = s32[] conditional(%p, %a, %a), true_computation=%t, false_computation=%f
}"#,
        )
        .unwrap();
        let entry = m.entry().unwrap();
        let text = computation_to_string(&m, entry);
        assert!(
            text.contains("conditional(%p, %a, %a), branch_computations={%t, %f}"),
            "{text}"
        );
    }
}
