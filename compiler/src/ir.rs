// ir.rs - Arena-backed instruction graph
//
// A `Module` owns every computation and every instruction. Instructions refer
// to each other only through `InstrId`s held in explicit operand and
// control-predecessor lists; users and control successors are derived by
// scanning the owning computation. All edits go through `Module` methods so
// that membership, roots, parameter tables and the schedule stay coherent.
//
// Preconditions: IDs passed in were minted by the same module.
// Postconditions: every edit either fully applies or returns `IrError`
//                 without touching the graph.
// Failure modes: cross-computation edges, removal of used instructions.
// Side effects: none.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::error::IrError;
use crate::id::{CompId, IdAllocator, InstrId, LocalId};
use crate::schedule::Schedule;
use crate::shape::Shape;

// ── Opcodes ─────────────────────────────────────────────────────────────────

/// The kind of operation an instruction performs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Opcode {
    Parameter,
    Constant,
    Tuple,
    GetTupleElement,
    Bitcast,
    Fusion,
    Call,
    CustomCall,
    While,
    Conditional,
    Sort,
    PartitionId,
    ReplicaId,
    AllReduceStart,
    AllReduceDone,
    AllGatherStart,
    AllGatherDone,
    CollectivePermuteStart,
    CollectivePermuteDone,
    /// Any opcode the pass has no special knowledge of (`add`, `copy`, ...).
    Other(String),
}

impl Opcode {
    pub fn from_name(name: &str) -> Opcode {
        match name {
            "parameter" => Opcode::Parameter,
            "constant" => Opcode::Constant,
            "tuple" => Opcode::Tuple,
            "get-tuple-element" => Opcode::GetTupleElement,
            "bitcast" => Opcode::Bitcast,
            "fusion" => Opcode::Fusion,
            "call" => Opcode::Call,
            "custom-call" => Opcode::CustomCall,
            "while" => Opcode::While,
            "conditional" => Opcode::Conditional,
            "sort" => Opcode::Sort,
            "partition-id" => Opcode::PartitionId,
            "replica-id" => Opcode::ReplicaId,
            "all-reduce-start" => Opcode::AllReduceStart,
            "all-reduce-done" => Opcode::AllReduceDone,
            "all-gather-start" => Opcode::AllGatherStart,
            "all-gather-done" => Opcode::AllGatherDone,
            "collective-permute-start" => Opcode::CollectivePermuteStart,
            "collective-permute-done" => Opcode::CollectivePermuteDone,
            other => Opcode::Other(other.to_string()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Opcode::Parameter => "parameter",
            Opcode::Constant => "constant",
            Opcode::Tuple => "tuple",
            Opcode::GetTupleElement => "get-tuple-element",
            Opcode::Bitcast => "bitcast",
            Opcode::Fusion => "fusion",
            Opcode::Call => "call",
            Opcode::CustomCall => "custom-call",
            Opcode::While => "while",
            Opcode::Conditional => "conditional",
            Opcode::Sort => "sort",
            Opcode::PartitionId => "partition-id",
            Opcode::ReplicaId => "replica-id",
            Opcode::AllReduceStart => "all-reduce-start",
            Opcode::AllReduceDone => "all-reduce-done",
            Opcode::AllGatherStart => "all-gather-start",
            Opcode::AllGatherDone => "all-gather-done",
            Opcode::CollectivePermuteStart => "collective-permute-start",
            Opcode::CollectivePermuteDone => "collective-permute-done",
            Opcode::Other(name) => name,
        }
    }

    pub fn is_async_start(&self) -> bool {
        self.matching_done().is_some()
    }

    pub fn is_async_done(&self) -> bool {
        matches!(
            self,
            Opcode::AllReduceDone | Opcode::AllGatherDone | Opcode::CollectivePermuteDone
        )
    }

    /// The done opcode that completes this start opcode.
    pub fn matching_done(&self) -> Option<Opcode> {
        match self {
            Opcode::AllReduceStart => Some(Opcode::AllReduceDone),
            Opcode::AllGatherStart => Some(Opcode::AllGatherDone),
            Opcode::CollectivePermuteStart => Some(Opcode::CollectivePermuteDone),
            _ => None,
        }
    }
}

/// Fusion flavour, printed as `kind=kLoop` etc.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FusionKind {
    Loop,
    Input,
    Output,
    Custom,
}

impl FusionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FusionKind::Loop => "kLoop",
            FusionKind::Input => "kInput",
            FusionKind::Output => "kOutput",
            FusionKind::Custom => "kCustom",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "kLoop" => Some(FusionKind::Loop),
            "kInput" => Some(FusionKind::Input),
            "kOutput" => Some(FusionKind::Output),
            "kCustom" => Some(FusionKind::Custom),
            _ => None,
        }
    }
}

/// Why an instruction refers to a computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallRole {
    /// `calls=` of a fusion or custom call.
    Calls,
    /// `to_apply=` of a call or a reduction.
    ToApply,
    Condition,
    Body,
    /// One of `branch_computations={...}`, in branch order.
    Branch,
}

/// Opcode-specific attributes. Anything the pass does not interpret is kept
/// verbatim in `extra` so printing reproduces it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Attributes {
    pub parameter_number: Option<usize>,
    pub tuple_index: Option<usize>,
    pub fusion_kind: Option<FusionKind>,
    pub custom_call_target: Option<String>,
    /// Literal text of a constant, e.g. `{1}` or `0`.
    pub literal: Option<String>,
    pub extra: Vec<(String, String)>,
}

// ── Instructions ────────────────────────────────────────────────────────────

/// A node of the graph. Only reachable through `&Module`, so the public
/// fields are read-only to callers; edits go through `Module` methods.
#[derive(Debug, Clone)]
pub struct Instruction {
    pub id: InstrId,
    pub name: String,
    pub opcode: Opcode,
    pub shape: Shape,
    pub operands: Vec<InstrId>,
    pub control_predecessors: Vec<InstrId>,
    pub called: Vec<(CallRole, CompId)>,
    pub attrs: Attributes,
    pub parent: CompId,
    live: bool,
}

impl Instruction {
    pub fn is_live(&self) -> bool {
        self.live
    }

    /// Every computation this instruction refers to, in attribute order.
    pub fn called_computations(&self) -> impl Iterator<Item = CompId> + '_ {
        self.called.iter().map(|(_, comp)| *comp)
    }

    /// The first computation called in `role`.
    pub fn called_as(&self, role: CallRole) -> Option<CompId> {
        self.called
            .iter()
            .find(|(r, _)| *r == role)
            .map(|(_, comp)| *comp)
    }

    /// Branch computations of a conditional, in branch order.
    pub fn branches(&self) -> Vec<CompId> {
        self.called
            .iter()
            .filter(|(r, _)| *r == CallRole::Branch)
            .map(|(_, comp)| *comp)
            .collect()
    }
}

/// Everything needed to create an instruction except its operands and its
/// place in the graph.
#[derive(Debug, Clone, PartialEq)]
pub struct InstructionSpec {
    /// Preferred name; made module-unique on insertion.
    pub name: String,
    pub opcode: Opcode,
    pub shape: Shape,
    pub called: Vec<(CallRole, CompId)>,
    pub attrs: Attributes,
}

impl InstructionSpec {
    pub fn new(name: impl Into<String>, opcode: Opcode, shape: Shape) -> Self {
        Self {
            name: name.into(),
            opcode,
            shape,
            called: Vec::new(),
            attrs: Attributes::default(),
        }
    }

    pub fn parameter(number: usize, shape: Shape, name: impl Into<String>) -> Self {
        let mut spec = Self::new(name, Opcode::Parameter, shape);
        spec.attrs.parameter_number = Some(number);
        spec
    }

    pub fn constant(shape: Shape, literal: impl Into<String>) -> Self {
        let mut spec = Self::new("constant", Opcode::Constant, shape);
        spec.attrs.literal = Some(literal.into());
        spec
    }

    pub fn tuple(shape: Shape) -> Self {
        Self::new("tuple", Opcode::Tuple, shape)
    }

    pub fn get_tuple_element(shape: Shape, index: usize) -> Self {
        let mut spec = Self::new("get-tuple-element", Opcode::GetTupleElement, shape);
        spec.attrs.tuple_index = Some(index);
        spec
    }

    pub fn call(shape: Shape, to_apply: CompId) -> Self {
        Self::new("call", Opcode::Call, shape).with_called(CallRole::ToApply, to_apply)
    }

    pub fn fusion(shape: Shape, kind: FusionKind, calls: CompId) -> Self {
        let mut spec = Self::new("fusion", Opcode::Fusion, shape).with_called(CallRole::Calls, calls);
        spec.attrs.fusion_kind = Some(kind);
        spec
    }

    pub fn custom_call(shape: Shape, target: impl Into<String>) -> Self {
        let mut spec = Self::new("custom-call", Opcode::CustomCall, shape);
        spec.attrs.custom_call_target = Some(target.into());
        spec
    }

    pub fn while_loop(shape: Shape, condition: CompId, body: CompId) -> Self {
        Self::new("while", Opcode::While, shape)
            .with_called(CallRole::Condition, condition)
            .with_called(CallRole::Body, body)
    }

    /// A copy of `inst` without operands or control edges. Called
    /// computations are shared with the original.
    pub fn clone_of(inst: &Instruction) -> Self {
        Self {
            name: inst.name.clone(),
            opcode: inst.opcode.clone(),
            shape: inst.shape.clone(),
            called: inst.called.clone(),
            attrs: inst.attrs.clone(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_called(mut self, role: CallRole, comp: CompId) -> Self {
        self.called.push((role, comp));
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.extra.push((key.into(), value.into()));
        self
    }
}

// ── Computations ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComputationKind {
    Regular,
    /// Body of a fusion instruction; never scheduled.
    Fused,
    /// Created by command buffer scheduling.
    CommandBuffer,
}

/// A named sub-program: member instructions in insertion order, parameters
/// by number, and a root.
#[derive(Debug, Clone)]
pub struct Computation {
    pub id: CompId,
    pub name: String,
    pub kind: ComputationKind,
    instructions: Vec<InstrId>,
    parameters: BTreeMap<usize, InstrId>,
    root: Option<InstrId>,
}

impl Computation {
    /// Live members in insertion order.
    pub fn instructions(&self) -> &[InstrId] {
        &self.instructions
    }

    pub fn instruction_count(&self) -> usize {
        self.instructions.len()
    }

    pub fn root(&self) -> Option<InstrId> {
        self.root
    }

    /// Parameters ordered by parameter number.
    pub fn parameters(&self) -> Vec<InstrId> {
        self.parameters.values().copied().collect()
    }

    pub fn contains(&self, id: InstrId) -> bool {
        self.instructions.contains(&id)
    }
}

// ── Detached computations ───────────────────────────────────────────────────

/// An instruction of a computation that no module owns yet.
#[derive(Debug, Clone)]
pub struct DetachedInstruction {
    pub spec: InstructionSpec,
    pub operands: Vec<LocalId>,
    pub control_predecessors: Vec<LocalId>,
}

/// A computation built outside any module. Installing it with
/// `Module::add_detached_computation` transfers ownership to the module.
#[derive(Debug, Clone)]
pub struct DetachedComputation {
    pub name: String,
    pub instructions: Vec<DetachedInstruction>,
    pub root: LocalId,
}

impl DetachedComputation {
    pub fn instruction(&self, id: LocalId) -> &DetachedInstruction {
        &self.instructions[id.0]
    }

    pub fn root_instruction(&self) -> &DetachedInstruction {
        self.instruction(self.root)
    }

    pub fn parameter_count(&self) -> usize {
        self.instructions
            .iter()
            .filter(|i| i.spec.opcode == Opcode::Parameter)
            .count()
    }
}

/// Builds a `DetachedComputation` instruction by instruction.
#[derive(Debug)]
pub struct ComputationBuilder {
    name: String,
    instructions: Vec<DetachedInstruction>,
    root: Option<LocalId>,
}

impl ComputationBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instructions: Vec::new(),
            root: None,
        }
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    pub fn spec(&self, id: LocalId) -> Option<&InstructionSpec> {
        self.instructions.get(id.0).map(|i| &i.spec)
    }

    /// Append an instruction. Operands must already have been added.
    pub fn add(&mut self, spec: InstructionSpec, operands: Vec<LocalId>) -> Result<LocalId, IrError> {
        self.check_local(&operands)?;
        let id = LocalId(self.instructions.len());
        self.instructions.push(DetachedInstruction {
            spec,
            operands,
            control_predecessors: Vec::new(),
        });
        Ok(id)
    }

    pub fn add_control_dependency(&mut self, pred: LocalId, succ: LocalId) -> Result<(), IrError> {
        self.check_local(&[pred, succ])?;
        if pred == succ {
            return Err(IrError::SelfControlEdge(
                self.instructions[pred.0].spec.name.clone(),
            ));
        }
        let preds = &mut self.instructions[succ.0].control_predecessors;
        if !preds.contains(&pred) {
            preds.push(pred);
        }
        Ok(())
    }

    pub fn set_root(&mut self, id: LocalId) {
        self.root = Some(id);
    }

    /// Finish the computation. The root defaults to the last instruction.
    pub fn build(self) -> Result<DetachedComputation, IrError> {
        let root = match (self.root, self.instructions.len()) {
            (_, 0) => return Err(IrError::EmptyComputation(self.name)),
            (Some(root), _) => root,
            (None, n) => LocalId(n - 1),
        };
        Ok(DetachedComputation {
            name: self.name,
            instructions: self.instructions,
            root,
        })
    }

    fn check_local(&self, ids: &[LocalId]) -> Result<(), IrError> {
        match ids.iter().find(|id| id.0 >= self.instructions.len()) {
            Some(id) => Err(IrError::ForwardLocalReference {
                computation: self.name.clone(),
                index: id.0,
            }),
            None => Ok(()),
        }
    }
}

// ── Name uniquing ───────────────────────────────────────────────────────────

/// Hands out module-unique names. A taken name `foo` or `foo.3` continues as
/// `foo.N` with the next free `N`.
#[derive(Debug, Default, Clone)]
struct NameUniquer {
    used: HashSet<String>,
    next_suffix: HashMap<String, u64>,
}

impl NameUniquer {
    fn is_taken(&self, name: &str) -> bool {
        self.used.contains(name)
    }

    fn reserve(&mut self, name: &str) {
        self.used.insert(name.to_string());
    }

    fn unique(&mut self, prefix: &str) -> String {
        if self.used.insert(prefix.to_string()) {
            return prefix.to_string();
        }
        let root = strip_numeric_suffix(prefix).to_string();
        let counter = self.next_suffix.entry(root.clone()).or_insert(1);
        loop {
            let candidate = format!("{root}.{counter}");
            *counter += 1;
            if self.used.insert(candidate.clone()) {
                return candidate;
            }
        }
    }
}

fn strip_numeric_suffix(name: &str) -> &str {
    match name.rsplit_once('.') {
        Some((root, suffix))
            if !root.is_empty()
                && !suffix.is_empty()
                && suffix.bytes().all(|b| b.is_ascii_digit()) =>
        {
            root
        }
        _ => name,
    }
}

/// Reverse edges of one computation, built by `Module::use_index`. Goes
/// stale as soon as the computation is edited.
#[derive(Debug, Clone, Default)]
pub struct UseIndex {
    users: HashMap<InstrId, Vec<InstrId>>,
    control_successors: HashMap<InstrId, Vec<InstrId>>,
}

impl UseIndex {
    /// Same as `Module::users` at the time the index was built.
    pub fn users(&self, id: InstrId) -> &[InstrId] {
        self.users.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Same as `Module::control_successors` at the time the index was built.
    pub fn control_successors(&self, id: InstrId) -> &[InstrId] {
        self.control_successors.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }
}

// ── Module ──────────────────────────────────────────────────────────────────

/// A whole program: every computation, every instruction, the entry
/// computation and an optional schedule.
#[derive(Debug, Clone)]
pub struct Module {
    pub name: String,
    ids: IdAllocator,
    instructions: Vec<Instruction>,
    computations: Vec<Computation>,
    entry: Option<CompId>,
    schedule: Option<Schedule>,
    instr_names: NameUniquer,
    comp_names: NameUniquer,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ids: IdAllocator::new(),
            instructions: Vec::new(),
            computations: Vec::new(),
            entry: None,
            schedule: None,
            instr_names: NameUniquer::default(),
            comp_names: NameUniquer::default(),
        }
    }

    // ── Computations ────────────────────────────────────────────────────

    /// Add an empty computation. The name is made module-unique.
    pub fn add_computation(&mut self, name: &str, kind: ComputationKind) -> CompId {
        let id = self.ids.alloc_comp();
        let name = self.comp_names.unique(name);
        self.computations.push(Computation {
            id,
            name,
            kind,
            instructions: Vec::new(),
            parameters: BTreeMap::new(),
            root: None,
        });
        id
    }

    /// # Panics
    /// If `id` was not minted by this module.
    pub fn computation(&self, id: CompId) -> &Computation {
        &self.computations[id.0 as usize]
    }

    pub fn get_computation(&self, id: CompId) -> Result<&Computation, IrError> {
        self.computations
            .get(id.0 as usize)
            .ok_or(IrError::UnknownComputation(id))
    }

    pub fn computations(&self) -> impl Iterator<Item = &Computation> {
        self.computations.iter()
    }

    pub fn computation_count(&self) -> usize {
        self.computations.len()
    }

    pub fn find_computation(&self, name: &str) -> Option<CompId> {
        self.computations
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.id)
    }

    pub fn set_computation_kind(&mut self, id: CompId, kind: ComputationKind) -> Result<(), IrError> {
        self.computation_mut(id)?.kind = kind;
        Ok(())
    }

    pub fn entry(&self) -> Option<CompId> {
        self.entry
    }

    pub fn set_entry(&mut self, id: CompId) -> Result<(), IrError> {
        self.get_computation(id)?;
        self.entry = Some(id);
        Ok(())
    }

    pub fn is_computation_name_taken(&self, name: &str) -> bool {
        self.comp_names.is_taken(name)
    }

    fn computation_mut(&mut self, id: CompId) -> Result<&mut Computation, IrError> {
        self.computations
            .get_mut(id.0 as usize)
            .ok_or(IrError::UnknownComputation(id))
    }

    // ── Instructions ────────────────────────────────────────────────────

    /// # Panics
    /// If `id` was not minted by this module.
    pub fn instr(&self, id: InstrId) -> &Instruction {
        &self.instructions[id.0 as usize]
    }

    /// The instruction if it exists and was not removed.
    pub fn live(&self, id: InstrId) -> Result<&Instruction, IrError> {
        match self.instructions.get(id.0 as usize) {
            Some(inst) if inst.live => Ok(inst),
            _ => Err(IrError::UnknownInstruction(id)),
        }
    }

    pub fn find_instruction(&self, comp: CompId, name: &str) -> Option<InstrId> {
        self.computations
            .get(comp.0 as usize)?
            .instructions
            .iter()
            .copied()
            .find(|&id| self.instr(id).name == name)
    }

    pub fn is_instruction_name_taken(&self, name: &str) -> bool {
        self.instr_names.is_taken(name)
    }

    /// Add an instruction to `comp`. Operands must be live members of `comp`.
    pub fn add_instruction(
        &mut self,
        comp: CompId,
        spec: InstructionSpec,
        operands: Vec<InstrId>,
    ) -> Result<InstrId, IrError> {
        self.insert_instruction(comp, spec, operands, false)
    }

    /// Like `add_instruction`, but keeps `spec.name` as written even when
    /// another computation already uses it. Used when loading program text,
    /// where names only need to be unique per computation.
    pub fn add_instruction_keeping_name(
        &mut self,
        comp: CompId,
        spec: InstructionSpec,
        operands: Vec<InstrId>,
    ) -> Result<InstrId, IrError> {
        self.insert_instruction(comp, spec, operands, true)
    }

    fn insert_instruction(
        &mut self,
        comp: CompId,
        spec: InstructionSpec,
        operands: Vec<InstrId>,
        keep_name: bool,
    ) -> Result<InstrId, IrError> {
        self.get_computation(comp)?;
        for &op in &operands {
            self.check_member(op, comp, &spec.name)?;
        }
        for &callee in spec.called.iter().map(|(_, c)| c) {
            self.get_computation(callee)?;
        }

        let id = self.ids.alloc_instr();
        let name = if keep_name {
            self.instr_names.reserve(&spec.name);
            spec.name
        } else {
            self.instr_names.unique(&spec.name)
        };
        let parameter_number = match spec.opcode {
            Opcode::Parameter => spec.attrs.parameter_number,
            _ => None,
        };
        self.instructions.push(Instruction {
            id,
            name,
            opcode: spec.opcode,
            shape: spec.shape,
            operands,
            control_predecessors: Vec::new(),
            called: spec.called,
            attrs: spec.attrs,
            parent: comp,
            live: true,
        });
        let computation = self.computation_mut(comp)?;
        computation.instructions.push(id);
        if let Some(number) = parameter_number {
            computation.parameters.insert(number, id);
        }
        Ok(id)
    }

    /// Replace the operand list of `id` wholesale.
    pub fn set_operands(&mut self, id: InstrId, operands: Vec<InstrId>) -> Result<(), IrError> {
        let (comp, name) = {
            let inst = self.live(id)?;
            (inst.parent, inst.name.clone())
        };
        for &op in &operands {
            self.check_member(op, comp, &name)?;
        }
        self.instructions[id.0 as usize].operands = operands;
        Ok(())
    }

    pub fn set_root(&mut self, comp: CompId, id: InstrId) -> Result<(), IrError> {
        let name = self.computation(comp).name.clone();
        self.check_member(id, comp, &name)?;
        self.computation_mut(comp)?.root = Some(id);
        Ok(())
    }

    pub fn is_root(&self, id: InstrId) -> bool {
        let inst = self.instr(id);
        self.computation(inst.parent).root == Some(id)
    }

    /// Instructions that read `id` as an operand, each once, in member order.
    pub fn users(&self, id: InstrId) -> Vec<InstrId> {
        let comp = self.instr(id).parent;
        self.computation(comp)
            .instructions
            .iter()
            .copied()
            .filter(|&u| self.instr(u).operands.contains(&id))
            .collect()
    }

    /// Instructions that list `id` as a control predecessor, in member order.
    pub fn control_successors(&self, id: InstrId) -> Vec<InstrId> {
        let comp = self.instr(id).parent;
        self.computation(comp)
            .instructions
            .iter()
            .copied()
            .filter(|&s| self.instr(s).control_predecessors.contains(&id))
            .collect()
    }

    /// Users and control successors of every member of `comp`, from one
    /// scan. Prefer this over repeated `users`/`control_successors` calls
    /// when walking a whole computation.
    pub fn use_index(&self, comp: CompId) -> UseIndex {
        let mut index = UseIndex::default();
        for &member in &self.computation(comp).instructions {
            let inst = self.instr(member);
            for &op in &inst.operands {
                let users = index.users.entry(op).or_default();
                if users.last() != Some(&member) {
                    users.push(member);
                }
            }
            for &pred in &inst.control_predecessors {
                index.control_successors.entry(pred).or_default().push(member);
            }
        }
        index
    }

    /// Redirect every use of `old` to `new`, including the root slot.
    pub fn replace_all_uses_with(&mut self, old: InstrId, new: InstrId) -> Result<(), IrError> {
        self.replace_uses_except(old, new, &HashSet::new())
    }

    /// Redirect uses of `old` to `new`, leaving users listed in `except`
    /// untouched. A root slot holding `old` is always redirected.
    pub fn replace_uses_except(
        &mut self,
        old: InstrId,
        new: InstrId,
        except: &HashSet<InstrId>,
    ) -> Result<(), IrError> {
        let comp = self.live(old)?.parent;
        self.check_member(new, comp, &self.instr(old).name.clone())?;
        for user in self.users(old) {
            if except.contains(&user) || user == new {
                continue;
            }
            for op in self.instructions[user.0 as usize].operands.iter_mut() {
                if *op == old {
                    *op = new;
                }
            }
        }
        let computation = self.computation_mut(comp)?;
        if computation.root == Some(old) {
            computation.root = Some(new);
        }
        Ok(())
    }

    /// Make `pred` a control predecessor of `succ`. Adding an existing edge
    /// is a no-op.
    pub fn add_control_dependency(&mut self, pred: InstrId, succ: InstrId) -> Result<(), IrError> {
        let (p, s) = (self.live(pred)?, self.live(succ)?);
        if p.parent != s.parent {
            return Err(IrError::CrossComputationEdge {
                from: p.name.clone(),
                to: s.name.clone(),
            });
        }
        if pred == succ {
            return Err(IrError::SelfControlEdge(p.name.clone()));
        }
        let preds = &mut self.instructions[succ.0 as usize].control_predecessors;
        if !preds.contains(&pred) {
            preds.push(pred);
        }
        Ok(())
    }

    pub fn remove_control_dependency(&mut self, pred: InstrId, succ: InstrId) -> Result<(), IrError> {
        self.live(succ)?;
        self.instructions[succ.0 as usize]
            .control_predecessors
            .retain(|&p| p != pred);
        Ok(())
    }

    /// Drop the control edges into `id`, leaving its successors alone.
    pub fn clear_control_predecessors(&mut self, id: InstrId) -> Result<(), IrError> {
        self.live(id)?;
        self.instructions[id.0 as usize].control_predecessors.clear();
        Ok(())
    }

    /// Remove a block of instructions of one computation in a single scan.
    /// Members of `ids` may read each other; nothing else may read them and
    /// none may be the root. Checks everything before removing anything.
    pub fn remove_instructions(&mut self, ids: &[InstrId]) -> Result<(), IrError> {
        let Some(&first) = ids.first() else {
            return Ok(());
        };
        let comp = self.live(first)?.parent;
        let comp_name = self.computation(comp).name.clone();
        let doomed: HashSet<InstrId> = ids.iter().copied().collect();
        let index = self.use_index(comp);
        for &id in ids {
            self.check_member(id, comp, &comp_name)?;
            let name = self.instr(id).name.clone();
            let outside: Vec<String> = index
                .users(id)
                .iter()
                .filter(|u| !doomed.contains(u))
                .map(|&u| self.instr(u).name.clone())
                .collect();
            if !outside.is_empty() {
                return Err(IrError::HasUsers { name, users: outside });
            }
            if self.is_root(id) {
                return Err(IrError::RemovesRoot(name));
            }
        }

        let members = self.computation(comp).instructions.clone();
        for member in members {
            self.instructions[member.0 as usize]
                .control_predecessors
                .retain(|p| !doomed.contains(p));
        }
        for &id in ids {
            self.instructions[id.0 as usize].control_predecessors.clear();
            self.instructions[id.0 as usize].live = false;
        }
        let computation = self.computation_mut(comp)?;
        computation.instructions.retain(|i| !doomed.contains(i));
        computation.parameters.retain(|_, p| !doomed.contains(p));
        if let Some(schedule) = self.schedule.as_mut() {
            schedule.remove_instructions(comp, &doomed);
        }
        Ok(())
    }

    /// Remove an unused, non-root instruction from its computation and from
    /// the computation's schedule sequence.
    pub fn remove_instruction(&mut self, id: InstrId) -> Result<(), IrError> {
        self.remove_instructions(&[id])
    }

    /// Install a detached computation. Returns its ID and the module IDs of
    /// its instructions, indexed like `detached.instructions`.
    pub fn add_detached_computation(
        &mut self,
        detached: DetachedComputation,
        kind: ComputationKind,
    ) -> Result<(CompId, Vec<InstrId>), IrError> {
        let comp = self.add_computation(&detached.name, kind);
        let mut ids: Vec<InstrId> = Vec::with_capacity(detached.instructions.len());
        for inst in &detached.instructions {
            let operands = inst.operands.iter().map(|l| ids[l.0]).collect();
            let id = self.add_instruction(comp, inst.spec.clone(), operands)?;
            ids.push(id);
        }
        for (i, inst) in detached.instructions.iter().enumerate() {
            for pred in &inst.control_predecessors {
                self.add_control_dependency(ids[pred.0], ids[i])?;
            }
        }
        self.set_root(comp, ids[detached.root.0])?;
        Ok((comp, ids))
    }

    /// Instructions of `comp` in schedule order when sequenced, otherwise
    /// in insertion order.
    pub fn instruction_order(&self, comp: CompId) -> Vec<InstrId> {
        match self.schedule.as_ref().and_then(|s| s.sequence(comp)) {
            Some(seq) => seq.to_vec(),
            None => self.computation(comp).instructions.clone(),
        }
    }

    /// All computations, callees before callers.
    pub fn post_order(&self) -> Vec<CompId> {
        let mut visited = HashSet::new();
        let mut order = Vec::new();
        for comp in &self.computations {
            self.visit_post_order(comp.id, &mut visited, &mut order);
        }
        order
    }

    fn visit_post_order(&self, id: CompId, visited: &mut HashSet<CompId>, order: &mut Vec<CompId>) {
        if !visited.insert(id) {
            return;
        }
        for inst in self.instruction_order(id) {
            for callee in self.instr(inst).called_computations() {
                self.visit_post_order(callee, visited, order);
            }
        }
        order.push(id);
    }

    // ── Schedule ────────────────────────────────────────────────────────

    pub fn has_schedule(&self) -> bool {
        self.schedule.is_some()
    }

    pub fn schedule(&self) -> Option<&Schedule> {
        self.schedule.as_ref()
    }

    pub fn schedule_mut(&mut self) -> Option<&mut Schedule> {
        self.schedule.as_mut()
    }

    pub fn set_schedule(&mut self, schedule: Option<Schedule>) {
        self.schedule = schedule;
    }

    fn check_member(&self, id: InstrId, comp: CompId, context: &str) -> Result<(), IrError> {
        let inst = self.live(id)?;
        if inst.parent != comp {
            return Err(IrError::CrossComputationEdge {
                from: inst.name.clone(),
                to: context.to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape::{PrimitiveType, Shape};

    fn s32() -> Shape {
        Shape::scalar(PrimitiveType::S32)
    }

    /// entry: a = parameter(0); b = parameter(1); add = add(a, b)
    fn small_module() -> (Module, CompId, [InstrId; 3]) {
        let mut m = Module::new("m");
        let c = m.add_computation("main", ComputationKind::Regular);
        let a = m
            .add_instruction(c, InstructionSpec::parameter(0, s32(), "a"), vec![])
            .unwrap();
        let b = m
            .add_instruction(c, InstructionSpec::parameter(1, s32(), "b"), vec![])
            .unwrap();
        let add = m
            .add_instruction(
                c,
                InstructionSpec::new("add", Opcode::from_name("add"), s32()),
                vec![a, b],
            )
            .unwrap();
        m.set_root(c, add).unwrap();
        m.set_entry(c).unwrap();
        (m, c, [a, b, add])
    }

    #[test]
    fn opcode_names_roundtrip() {
        for name in [
            "fusion",
            "get-tuple-element",
            "all-reduce-start",
            "collective-permute-done",
            "add",
        ] {
            assert_eq!(Opcode::from_name(name).name(), name);
        }
        assert_eq!(
            Opcode::AllGatherStart.matching_done(),
            Some(Opcode::AllGatherDone)
        );
        assert!(Opcode::AllReduceDone.is_async_done());
        assert!(!Opcode::Fusion.is_async_start());
    }

    #[test]
    fn names_are_uniqued_with_numeric_suffixes() {
        let mut u = NameUniquer::default();
        assert_eq!(u.unique("fusion"), "fusion");
        assert_eq!(u.unique("fusion.1"), "fusion.1");
        assert_eq!(u.unique("fusion"), "fusion.2");
        assert_eq!(u.unique("fusion.1"), "fusion.3");
        assert_eq!(u.unique("p0"), "p0");
        assert_eq!(u.unique("p0"), "p0.1");
        assert_eq!(strip_numeric_suffix("main.18"), "main");
        assert_eq!(strip_numeric_suffix("Arg_.3"), "Arg_");
        assert_eq!(strip_numeric_suffix("x.y"), "x.y");
    }

    #[test]
    fn parameters_are_indexed_by_number() {
        let (m, c, [a, b, _]) = small_module();
        assert_eq!(m.computation(c).parameters(), vec![a, b]);
    }

    #[test]
    fn users_and_replace_uses() {
        let (mut m, c, [a, b, add]) = small_module();
        assert_eq!(m.users(a), vec![add]);
        m.replace_all_uses_with(a, b).unwrap();
        assert_eq!(m.instr(add).operands, vec![b, b]);
        assert!(m.users(a).is_empty());
        assert_eq!(m.computation(c).root(), Some(add));
    }

    #[test]
    fn replace_uses_redirects_root() {
        let (mut m, c, [a, _, add]) = small_module();
        let neg = m
            .add_instruction(
                c,
                InstructionSpec::new("negate", Opcode::from_name("negate"), s32()),
                vec![a],
            )
            .unwrap();
        m.replace_all_uses_with(add, neg).unwrap();
        assert_eq!(m.computation(c).root(), Some(neg));
    }

    #[test]
    fn replace_uses_except_keeps_listed_users() {
        let (mut m, c, [a, b, add]) = small_module();
        let mul = m
            .add_instruction(
                c,
                InstructionSpec::new("multiply", Opcode::from_name("multiply"), s32()),
                vec![a, a],
            )
            .unwrap();
        let except: HashSet<InstrId> = [add].into_iter().collect();
        m.replace_uses_except(a, b, &except).unwrap();
        assert_eq!(m.instr(add).operands, vec![a, b]);
        assert_eq!(m.instr(mul).operands, vec![b, b]);
    }

    #[test]
    fn control_dependencies_are_deduplicated() {
        let (mut m, _, [a, b, add]) = small_module();
        m.add_control_dependency(a, add).unwrap();
        m.add_control_dependency(a, add).unwrap();
        m.add_control_dependency(b, add).unwrap();
        assert_eq!(m.instr(add).control_predecessors, vec![a, b]);
        assert_eq!(m.control_successors(a), vec![add]);
        assert!(matches!(
            m.add_control_dependency(add, add),
            Err(IrError::SelfControlEdge(_))
        ));
        m.clear_control_predecessors(add).unwrap();
        assert!(m.instr(add).control_predecessors.is_empty());
    }

    #[test]
    fn remove_refuses_used_and_root() {
        let (mut m, c, [a, _, add]) = small_module();
        assert!(matches!(
            m.remove_instruction(a),
            Err(IrError::HasUsers { .. })
        ));
        assert!(matches!(
            m.remove_instruction(add),
            Err(IrError::RemovesRoot(_))
        ));
        let dead = m
            .add_instruction(c, InstructionSpec::custom_call(s32(), "t"), vec![])
            .unwrap();
        m.add_control_dependency(dead, add).unwrap();
        m.remove_instruction(dead).unwrap();
        assert!(!m.instr(dead).is_live());
        assert!(!m.computation(c).contains(dead));
        assert!(m.instr(add).control_predecessors.is_empty());
        assert!(m.live(dead).is_err());
    }

    #[test]
    fn use_index_matches_per_instruction_queries() {
        let (mut m, c, [a, b, add]) = small_module();
        let mul = m
            .add_instruction(
                c,
                InstructionSpec::new("multiply", Opcode::from_name("multiply"), s32()),
                vec![a, a],
            )
            .unwrap();
        m.add_control_dependency(b, mul).unwrap();
        m.add_control_dependency(add, mul).unwrap();

        let index = m.use_index(c);
        for id in [a, b, add, mul] {
            assert_eq!(index.users(id), m.users(id).as_slice());
            assert_eq!(index.control_successors(id), m.control_successors(id).as_slice());
        }
        assert_eq!(index.users(a), &[add, mul]);
        assert!(index.users(mul).is_empty());
    }

    #[test]
    fn block_removal_allows_uses_inside_the_block() {
        let (mut m, c, [a, b, add]) = small_module();
        let neg = m
            .add_instruction(
                c,
                InstructionSpec::new("negate", Opcode::from_name("negate"), s32()),
                vec![a],
            )
            .unwrap();
        let abs = m
            .add_instruction(
                c,
                InstructionSpec::new("abs", Opcode::from_name("abs"), s32()),
                vec![neg],
            )
            .unwrap();
        m.add_control_dependency(neg, add).unwrap();
        m.add_control_dependency(b, abs).unwrap();

        assert!(matches!(
            m.remove_instructions(&[neg]),
            Err(IrError::HasUsers { .. })
        ));
        assert!(m.instr(neg).is_live());

        m.remove_instructions(&[neg, abs]).unwrap();
        assert!(!m.computation(c).contains(neg) && !m.computation(c).contains(abs));
        assert!(m.instr(add).control_predecessors.is_empty());
        assert!(m.control_successors(b).is_empty());
        assert_eq!(m.users(a), vec![add]);
    }

    #[test]
    fn cross_computation_edges_are_rejected() {
        let (mut m, _, [a, _, _]) = small_module();
        let other = m.add_computation("other", ComputationKind::Regular);
        let x = m
            .add_instruction(other, InstructionSpec::parameter(0, s32(), "x"), vec![])
            .unwrap();
        assert!(matches!(
            m.add_control_dependency(a, x),
            Err(IrError::CrossComputationEdge { .. })
        ));
        let err = m
            .add_instruction(
                other,
                InstructionSpec::new("negate", Opcode::from_name("negate"), s32()),
                vec![a],
            )
            .unwrap_err();
        assert!(matches!(err, IrError::CrossComputationEdge { .. }));
    }

    #[test]
    fn detached_computation_installs_with_edges() {
        let mut m = Module::new("m");
        let mut b = ComputationBuilder::new("command_buffer");
        let p = b.add(InstructionSpec::parameter(0, s32(), "p0"), vec![]).unwrap();
        let x = b
            .add(InstructionSpec::new("negate", Opcode::from_name("negate"), s32()), vec![p])
            .unwrap();
        let y = b
            .add(InstructionSpec::new("negate", Opcode::from_name("negate"), s32()), vec![x])
            .unwrap();
        b.add_control_dependency(x, y).unwrap();
        assert!(b.add(InstructionSpec::tuple(s32()), vec![LocalId(9)]).is_err());
        let detached = b.build().unwrap();
        assert_eq!(detached.root, y);
        assert_eq!(detached.parameter_count(), 1);

        let (comp, ids) = m
            .add_detached_computation(detached, ComputationKind::CommandBuffer)
            .unwrap();
        assert_eq!(m.computation(comp).name, "command_buffer");
        assert_eq!(m.computation(comp).root(), Some(ids[2]));
        assert_eq!(m.instr(ids[2]).control_predecessors, vec![ids[1]]);
        assert_eq!(m.instr(ids[1]).name, "negate");
        assert_eq!(m.instr(ids[2]).name, "negate.1");
    }

    #[test]
    fn post_order_puts_callees_first() {
        let mut m = Module::new("m");
        let body = m.add_computation("body", ComputationKind::Regular);
        let bp = m
            .add_instruction(body, InstructionSpec::parameter(0, s32(), "bp"), vec![])
            .unwrap();
        m.set_root(body, bp).unwrap();
        let main = m.add_computation("main", ComputationKind::Regular);
        let p = m
            .add_instruction(main, InstructionSpec::parameter(0, s32(), "p"), vec![])
            .unwrap();
        let w = m
            .add_instruction(main, InstructionSpec::while_loop(s32(), body, body), vec![p])
            .unwrap();
        m.set_root(main, w).unwrap();
        let cb = m.add_computation("command_buffer", ComputationKind::CommandBuffer);
        let cp = m
            .add_instruction(cb, InstructionSpec::parameter(0, s32(), "cp"), vec![])
            .unwrap();
        m.set_root(cb, cp).unwrap();
        let call = m
            .add_instruction(body, InstructionSpec::call(s32(), cb), vec![bp])
            .unwrap();
        m.set_root(body, call).unwrap();
        assert_eq!(m.post_order(), vec![cb, body, main]);
    }
}
