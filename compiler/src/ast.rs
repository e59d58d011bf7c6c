// AST node types for HLO-style program text.
//
// A direct, unresolved image of the text: names are strings, references are
// not yet bound to instructions, and attributes the pass does not interpret
// keep their source text. Spans are byte ranges into the module text and
// are what resolution errors point at.

/// Byte range in the module text.
pub type Span = chumsky::span::SimpleSpan;

/// An identifier or `%name` with its source span. For `%name` the sigil is
/// not part of `name`.
#[derive(Debug, Clone, PartialEq)]
pub struct Ident {
    pub name: String,
    pub span: Span,
}

// ── Root ──

/// `HloModule <name>(, attr=value)*` followed by computations.
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleAst {
    pub name: Ident,
    pub attributes: Vec<Attribute>,
    pub computations: Vec<ComputationAst>,
    pub span: Span,
}

impl ModuleAst {
    /// `is_scheduled=true` in the module header.
    pub fn is_scheduled(&self) -> bool {
        self.attributes
            .iter()
            .any(|a| a.key.name == "is_scheduled" && matches!(&a.value, AttrValue::Raw(v) if v == "true"))
    }
}

// ── Computations ──

/// `ENTRY? %name (param: shape, ...) -> shape { instructions }`
#[derive(Debug, Clone, PartialEq)]
pub struct ComputationAst {
    pub is_entry: bool,
    pub name: Ident,
    /// Header parameter list; informational, the parameter instructions
    /// in the body are authoritative.
    pub params: Vec<(Ident, ShapeAst)>,
    pub result: ShapeAst,
    pub instructions: Vec<InstructionAst>,
    pub span: Span,
}

// ── Instructions ──

/// `ROOT? %name = shape opcode(args)(, attr=value)*`
#[derive(Debug, Clone, PartialEq)]
pub struct InstructionAst {
    pub is_root: bool,
    pub name: Ident,
    pub shape: ShapeAst,
    pub opcode: Ident,
    pub args: Args,
    pub attributes: Vec<Attribute>,
    pub span: Span,
}

/// Contents of the parentheses after the opcode.
#[derive(Debug, Clone, PartialEq)]
pub enum Args {
    /// `(s32[] %a, %b)`; possibly empty.
    Operands(Vec<Operand>),
    /// Anything else, kept as source text: `parameter(0)`, `constant({1})`.
    Literal(String, Span),
}

/// An operand reference, optionally annotated with its shape.
#[derive(Debug, Clone, PartialEq)]
pub struct Operand {
    pub shape: Option<ShapeAst>,
    pub name: Ident,
}

// ── Shapes ──

#[derive(Debug, Clone, PartialEq)]
pub enum ShapeAst {
    Array {
        element: Ident,
        dims: Vec<i64>,
        layout: Option<Vec<i64>>,
        span: Span,
    },
    Tuple(Vec<ShapeAst>, Span),
}

impl ShapeAst {
    pub fn span(&self) -> Span {
        match self {
            ShapeAst::Array { span, .. } | ShapeAst::Tuple(_, span) => *span,
        }
    }
}

// ── Attributes ──

/// `key=value` after the operand list or in the module header.
#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    pub key: Ident,
    pub value: AttrValue,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    /// `%name`
    Ref(Ident),
    /// `{%a, %b}`
    RefList(Vec<Ident>),
    /// `"text"`, unescaped.
    Str(String),
    /// Any other value, as written in the source.
    Raw(String),
}
