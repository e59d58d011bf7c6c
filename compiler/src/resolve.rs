// resolve.rs - Name resolution: AST → instruction graph
//
// Walks the parsed module, binds every `%name` reference to an instruction of
// the same computation or to a computation of the module, converts shapes and
// interpreted attributes, and builds a `Module`. `is_scheduled=true` gives
// each non-fused computation a sequence equal to its textual order.
//
// Preconditions: `ast` is a well-formed AST from the parser.
// Postconditions: on success the module is fully wired: operands, control
//                 edges, roots, entry and (optionally) a schedule.
// Failure modes: unknown or duplicate names, malformed attribute values and
//                unknown element types produce `Diagnostic` entries.
//                Resolution continues past errors; the module is only
//                returned when no error was reported.
// Side effects: none.

use std::collections::HashMap;
use std::str::FromStr;

use crate::ast::*;
use crate::diag::{codes, DiagCode, Diagnostic};
use crate::error::IrError;
use crate::id::{CompId, InstrId};
use crate::ir::{CallRole, ComputationKind, FusionKind, InstructionSpec, Module, Opcode};
use crate::schedule::Schedule;
use crate::shape::{PrimitiveType, Shape};

// ── Public types ────────────────────────────────────────────────────────────

/// Result of name resolution.
#[derive(Debug)]
pub struct ResolveResult {
    pub module: Option<Module>,
    pub diagnostics: Vec<Diagnostic>,
}

/// Name the rewrite gives every command buffer it outlines, before uniquing.
pub const COMMAND_BUFFER_PREFIX: &str = "command_buffer";

/// `command_buffer` or a uniqued `command_buffer.N`, nothing else.
pub fn is_command_buffer_name(name: &str) -> bool {
    match name.strip_prefix(COMMAND_BUFFER_PREFIX) {
        Some("") => true,
        Some(rest) => rest
            .strip_prefix('.')
            .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit())),
        None => false,
    }
}

// ── Public entry point ──────────────────────────────────────────────────────

/// Resolve all names in a parsed module.
pub fn resolve(ast: &ModuleAst) -> ResolveResult {
    let mut ctx = ResolveCtx::new(&ast.name.name);

    // Pass 1: computations, so calls may refer forward.
    ctx.collect_computations(ast);

    // Pass 2: instructions, operands and control edges per computation.
    for (comp_ast, comp) in ast.computations.iter().zip(ctx.comp_slots.clone()) {
        if let Some(comp) = comp {
            ctx.resolve_computation(comp_ast, comp);
        }
    }

    ctx.classify_computations(ast);
    ctx.choose_entry(ast);
    if ast.is_scheduled() {
        ctx.build_schedule();
    }

    let has_errors = ctx.diagnostics.iter().any(Diagnostic::is_error);
    ResolveResult {
        module: (!has_errors).then_some(ctx.module),
        diagnostics: ctx.diagnostics,
    }
}

// ── Internal context ────────────────────────────────────────────────────────

struct PendingRefs {
    id: InstrId,
    operands: Vec<Ident>,
    control_predecessors: Vec<Ident>,
}

struct ResolveCtx {
    module: Module,
    diagnostics: Vec<Diagnostic>,
    /// Computation name → (ID, definition span).
    comp_names: HashMap<String, (CompId, Span)>,
    /// One slot per AST computation; `None` for rejected duplicates.
    comp_slots: Vec<Option<CompId>>,
}

impl ResolveCtx {
    fn new(name: &str) -> Self {
        ResolveCtx {
            module: Module::new(name),
            diagnostics: Vec::new(),
            comp_names: HashMap::new(),
            comp_slots: Vec::new(),
        }
    }

    fn error(&mut self, code: DiagCode, span: Span, message: String) {
        self.diagnostics.push(Diagnostic::error(code, span, message));
    }

    fn graph_error(&mut self, span: Span, err: IrError) {
        self.error(codes::GRAPH_ERROR, span, err.to_string());
    }

    // ── Pass 1: computations ────────────────────────────────────────────

    fn collect_computations(&mut self, ast: &ModuleAst) {
        if ast.computations.is_empty() {
            self.error(
                codes::EMPTY_COMPUTATION,
                ast.span,
                format!("module '{}' has no computations", ast.name.name),
            );
        }
        for comp_ast in &ast.computations {
            let name = &comp_ast.name.name;
            if let Some(&(_, first)) = self.comp_names.get(name) {
                self.diagnostics.push(
                    Diagnostic::error(
                        codes::DUPLICATE_COMPUTATION,
                        comp_ast.name.span,
                        format!("duplicate computation '%{name}'"),
                    )
                    .with_note(first, "first defined here"),
                );
                self.comp_slots.push(None);
                continue;
            }
            let id = self.module.add_computation(name, ComputationKind::Regular);
            self.comp_names.insert(name.clone(), (id, comp_ast.name.span));
            self.comp_slots.push(Some(id));
        }
    }

    fn lookup_computation(&mut self, ident: &Ident) -> Option<CompId> {
        match self.comp_names.get(&ident.name) {
            Some(&(id, _)) => Some(id),
            None => {
                self.error(
                    codes::UNKNOWN_COMPUTATION,
                    ident.span,
                    format!("unknown computation '%{}'", ident.name),
                );
                None
            }
        }
    }

    // ── Pass 2: instructions ────────────────────────────────────────────

    fn resolve_computation(&mut self, comp_ast: &ComputationAst, comp: CompId) {
        if comp_ast.instructions.is_empty() {
            self.error(
                codes::EMPTY_COMPUTATION,
                comp_ast.name.span,
                format!("computation '%{}' has no instructions", comp_ast.name.name),
            );
            return;
        }

        let mut names: HashMap<String, (InstrId, Span)> = HashMap::new();
        let mut pending = Vec::new();
        let mut root: Option<(InstrId, Span)> = None;
        let mut last = None;

        for inst in &comp_ast.instructions {
            if let Some(&(_, first)) = names.get(&inst.name.name) {
                self.diagnostics.push(
                    Diagnostic::error(
                        codes::DUPLICATE_INSTRUCTION,
                        inst.name.span,
                        format!(
                            "duplicate instruction '%{}' in computation '%{}'",
                            inst.name.name, comp_ast.name.name
                        ),
                    )
                    .with_note(first, "first defined here")
                    .with_hint("instruction names must be unique within a computation"),
                );
                continue;
            }
            let Some((spec, refs)) = self.instruction_spec(inst) else {
                continue;
            };
            if spec.opcode == Opcode::Parameter {
                let number = spec.attrs.parameter_number;
                let clash = names.values().any(|&(other, _)| {
                    let o = self.module.instr(other);
                    o.opcode == Opcode::Parameter && o.attrs.parameter_number == number
                });
                if clash {
                    self.error(
                        codes::BAD_PARAMETER,
                        inst.span,
                        format!(
                            "parameter number {} used twice in computation '%{}'",
                            number.unwrap_or_default(),
                            comp_ast.name.name
                        ),
                    );
                    continue;
                }
            }
            let id = match self.module.add_instruction_keeping_name(comp, spec, vec![]) {
                Ok(id) => id,
                Err(err) => {
                    self.graph_error(inst.span, err);
                    continue;
                }
            };
            names.insert(inst.name.name.clone(), (id, inst.name.span));
            pending.push(PendingRefs {
                id,
                operands: refs.0,
                control_predecessors: refs.1,
            });
            last = Some(id);

            if inst.is_root {
                match root {
                    Some((_, first)) => self.diagnostics.push(
                        Diagnostic::warning(
                            codes::DUPLICATE_ROOT,
                            inst.span,
                            format!("ROOT given twice in computation '%{}'", comp_ast.name.name),
                        )
                        .with_note(first, "first ROOT here; it is kept"),
                    ),
                    None => root = Some((id, inst.span)),
                }
            }
        }

        // Operands and control edges may refer forward, so wire them last.
        for refs in pending {
            let operands: Vec<InstrId> = refs
                .operands
                .iter()
                .filter_map(|ident| self.lookup_instruction(&names, ident, &comp_ast.name.name))
                .collect();
            if operands.len() == refs.operands.len() {
                if let Err(err) = self.module.set_operands(refs.id, operands) {
                    self.graph_error(comp_ast.span, err);
                }
            }
            for ident in &refs.control_predecessors {
                let Some(pred) = self.lookup_instruction(&names, ident, &comp_ast.name.name) else {
                    continue;
                };
                if let Err(err) = self.module.add_control_dependency(pred, refs.id) {
                    self.graph_error(ident.span, err);
                }
            }
        }

        if let Some(root) = root.map(|(id, _)| id).or(last) {
            if let Err(err) = self.module.set_root(comp, root) {
                self.graph_error(comp_ast.span, err);
            }
        }
    }

    fn lookup_instruction(
        &mut self,
        names: &HashMap<String, (InstrId, Span)>,
        ident: &Ident,
        comp_name: &str,
    ) -> Option<InstrId> {
        match names.get(&ident.name) {
            Some(&(id, _)) => Some(id),
            None => {
                self.error(
                    codes::UNKNOWN_INSTRUCTION,
                    ident.span,
                    format!(
                        "unknown instruction '%{}' in computation '%{comp_name}'",
                        ident.name
                    ),
                );
                None
            }
        }
    }

    /// Build the spec for `inst` plus its unresolved operand and control
    /// references. `None` after reporting a diagnostic.
    #[allow(clippy::type_complexity)]
    fn instruction_spec(&mut self, inst: &InstructionAst) -> Option<(InstructionSpec, (Vec<Ident>, Vec<Ident>))> {
        let shape = self.shape(&inst.shape)?;
        let opcode = Opcode::from_name(&inst.opcode.name);
        let mut spec = InstructionSpec::new(inst.name.name.clone(), opcode.clone(), shape);
        let mut ok = true;

        let operands = match &inst.args {
            Args::Operands(ops) => {
                for op in ops {
                    if let Some(shape) = &op.shape {
                        ok &= self.shape(shape).is_some();
                    }
                }
                ops.iter().map(|op| op.name.clone()).collect()
            }
            Args::Literal(text, span) if opcode == Opcode::Parameter => {
                match text.parse::<usize>() {
                    Ok(n) => spec.attrs.parameter_number = Some(n),
                    Err(_) => {
                        self.error(
                            codes::BAD_PARAMETER,
                            *span,
                            format!("parameter number must be a non-negative integer, found '{text}'"),
                        );
                        ok = false;
                    }
                }
                Vec::new()
            }
            Args::Literal(text, _) => {
                spec.attrs.literal = Some(text.clone());
                Vec::new()
            }
        };
        if opcode == Opcode::Parameter && spec.attrs.parameter_number.is_none() && ok {
            self.error(
                codes::BAD_PARAMETER,
                inst.span,
                format!("parameter '%{}' has no parameter number", inst.name.name),
            );
            ok = false;
        }

        let mut control_predecessors = Vec::new();
        for attr in &inst.attributes {
            ok &= self.attribute(attr, &mut spec, &mut control_predecessors);
        }
        ok.then_some((spec, (operands, control_predecessors)))
    }

    /// Apply one attribute to `spec`. Returns false after reporting a
    /// diagnostic.
    fn attribute(&mut self, attr: &Attribute, spec: &mut InstructionSpec, control: &mut Vec<Ident>) -> bool {
        let key = attr.key.name.as_str();
        let role = match key {
            "calls" => Some(CallRole::Calls),
            "to_apply" => Some(CallRole::ToApply),
            "condition" => Some(CallRole::Condition),
            "body" => Some(CallRole::Body),
            "branch_computations" | "true_computation" | "false_computation" => Some(CallRole::Branch),
            _ => None,
        };
        if let Some(role) = role {
            let refs: Vec<&Ident> = match &attr.value {
                AttrValue::Ref(r) => vec![r],
                AttrValue::RefList(list) => list.iter().collect(),
                _ => return self.bad_attribute(attr, "a computation reference"),
            };
            let mut ok = true;
            for r in refs {
                match self.lookup_computation(r) {
                    Some(comp) => spec.called.push((role, comp)),
                    None => ok = false,
                }
            }
            return ok;
        }

        match (key, &attr.value) {
            ("index", AttrValue::Raw(text)) => match text.parse::<usize>() {
                Ok(index) => spec.attrs.tuple_index = Some(index),
                Err(_) => return self.bad_attribute(attr, "a tuple index"),
            },
            ("index", _) => return self.bad_attribute(attr, "a tuple index"),
            ("kind", AttrValue::Raw(text)) if spec.opcode == Opcode::Fusion => match FusionKind::from_name(text) {
                Some(kind) => spec.attrs.fusion_kind = Some(kind),
                None => return self.bad_attribute(attr, "a fusion kind (kLoop, kInput, kOutput, kCustom)"),
            },
            ("custom_call_target", AttrValue::Str(target)) => {
                spec.attrs.custom_call_target = Some(target.clone());
            }
            ("custom_call_target", _) => return self.bad_attribute(attr, "a quoted target name"),
            ("control-predecessors", AttrValue::RefList(list)) => control.extend(list.iter().cloned()),
            ("control-predecessors", _) => return self.bad_attribute(attr, "a list of instruction references"),
            (_, value) => spec.attrs.extra.push((key.to_string(), verbatim(value))),
        }
        true
    }

    fn bad_attribute(&mut self, attr: &Attribute, expected: &str) -> bool {
        self.error(
            codes::BAD_ATTRIBUTE,
            attr.span,
            format!("attribute '{}' expects {expected}", attr.key.name),
        );
        false
    }

    fn shape(&mut self, ast: &ShapeAst) -> Option<Shape> {
        match ast {
            ShapeAst::Array {
                element,
                dims,
                layout,
                ..
            } => match PrimitiveType::from_str(&element.name) {
                Ok(element) => Some(Shape::Array {
                    element,
                    dims: dims.clone(),
                    layout: layout.clone(),
                }),
                Err(message) => {
                    self.error(codes::UNKNOWN_ELEMENT_TYPE, element.span, message);
                    None
                }
            },
            ShapeAst::Tuple(elements, _) => {
                let shapes: Vec<Option<Shape>> = elements.iter().map(|e| self.shape(e)).collect();
                shapes.into_iter().collect::<Option<Vec<_>>>().map(Shape::Tuple)
            }
        }
    }

    // ── Post-pass: computation kinds, entry, schedule ───────────────────

    /// Bodies of fusions are fused. A computation printed by an earlier
    /// rewrite is a command buffer again when it carries an outlined name
    /// and its one and only caller is a `call`.
    fn classify_computations(&mut self, ast: &ModuleAst) {
        let mut fused = Vec::new();
        let mut callers: HashMap<CompId, Vec<&Opcode>> = HashMap::new();
        for comp in self.module.computations() {
            for &id in comp.instructions() {
                let inst = self.module.instr(id);
                for callee in inst.called_computations() {
                    callers.entry(callee).or_default().push(&inst.opcode);
                }
                if inst.opcode == Opcode::Fusion {
                    fused.extend(inst.called_as(CallRole::Calls));
                }
            }
        }
        let mut command_buffers: Vec<CompId> = callers
            .into_iter()
            .filter(|(comp, callers)| {
                matches!(callers.as_slice(), [Opcode::Call])
                    && is_command_buffer_name(&self.module.computation(*comp).name)
            })
            .map(|(comp, _)| comp)
            .collect();
        command_buffers.sort();

        let kinds = fused
            .into_iter()
            .map(|c| (c, ComputationKind::Fused))
            .chain(command_buffers.into_iter().map(|c| (c, ComputationKind::CommandBuffer)));
        for (comp, kind) in kinds {
            if let Err(err) = self.module.set_computation_kind(comp, kind) {
                let span = ast
                    .computations
                    .iter()
                    .zip(&self.comp_slots)
                    .find(|(_, slot)| **slot == Some(comp))
                    .map_or(ast.span, |(comp_ast, _)| comp_ast.name.span);
                self.graph_error(span, err);
            }
        }
    }

    fn choose_entry(&mut self, ast: &ModuleAst) {
        let mut entry: Option<(CompId, Span)> = None;
        for (comp_ast, slot) in ast.computations.iter().zip(&self.comp_slots) {
            let (true, Some(comp)) = (comp_ast.is_entry, *slot) else {
                continue;
            };
            match entry {
                Some((_, first)) => self.diagnostics.push(
                    Diagnostic::error(
                        codes::DUPLICATE_ENTRY,
                        comp_ast.name.span,
                        format!("second ENTRY computation '%{}'", comp_ast.name.name),
                    )
                    .with_note(first, "first ENTRY here"),
                ),
                None => entry = Some((comp, comp_ast.name.span)),
            }
        }
        let entry = entry
            .map(|(comp, _)| comp)
            .or_else(|| self.comp_slots.iter().rev().find_map(|slot| *slot));
        if let Some(entry) = entry {
            if let Err(err) = self.module.set_entry(entry) {
                self.graph_error(ast.span, err);
            }
        }
    }

    fn build_schedule(&mut self) {
        let mut schedule = Schedule::new();
        for comp in self.module.computations() {
            if comp.kind != ComputationKind::Fused {
                schedule.set_sequence(comp.id, comp.instructions().to_vec());
            }
        }
        self.module.set_schedule(Some(schedule));
    }
}

/// Source form of an attribute value kept in `extra`.
fn verbatim(value: &AttrValue) -> String {
    match value {
        AttrValue::Ref(r) => format!("%{}", r.name),
        AttrValue::RefList(list) => {
            let names: Vec<String> = list.iter().map(|r| format!("%{}", r.name)).collect();
            format!("{{{}}}", names.join(", "))
        }
        AttrValue::Str(s) => format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\"")),
        AttrValue::Raw(text) => text.clone(),
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
