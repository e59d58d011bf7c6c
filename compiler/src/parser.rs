// Grammar for module text, built from chumsky combinators over the token
// stream of `lexer::lex`.
//
// The grammar stops at the first syntax error. Attribute values and constant
// literals that nothing downstream interprets are matched as balanced token
// groups and kept verbatim as source text.

use chumsky::error::RichReason;
use chumsky::input::{Stream, ValueInput};
use chumsky::prelude::*;
use chumsky::span::SimpleSpan;

use crate::ast::*;
use crate::diag::{codes, Diagnostic};
use crate::lexer::Token;

/// Result of parsing: AST plus any errors.
#[derive(Debug)]
pub struct ParseResult {
    pub module: Option<ModuleAst>,
    pub errors: Vec<Rich<'static, Token, SimpleSpan>>,
}

impl ParseResult {
    /// Errors as diagnostics: stray characters are `E0001`, grammar
    /// failures `E0002`.
    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.errors
            .iter()
            .map(|e| {
                let code = match e.reason() {
                    RichReason::Custom(_) => codes::LEX_ERROR,
                    _ => codes::SYNTAX_ERROR,
                };
                Diagnostic::error(code, *e.span(), e.to_string())
            })
            .collect()
    }
}

/// Lex and parse `source`. `module` is `None` when the grammar failed.
pub fn parse(source: &str) -> ParseResult {
    let lexed = crate::lexer::lex(source);
    let eoi: SimpleSpan = (source.len()..source.len()).into();
    let stream = Stream::from_iter(lexed.tokens).map(eoi, |(t, s): (_, _)| (t, s));

    let (module, syntax) = module_parser(source).parse(stream).into_output_errors();

    // Stray characters first, as custom errors, then the grammar's complaint.
    let mut all_errors: Vec<Rich<'static, Token, SimpleSpan>> = lexed
        .unknown
        .into_iter()
        .map(|span| {
            let message = format!("unexpected character {:?}", &source[span.start()..span.end()]);
            Rich::custom(span, message)
        })
        .collect();
    all_errors.extend(syntax.into_iter().map(|e| e.into_owned()));

    ParseResult {
        module,
        errors: all_errors,
    }
}

// ── Grammar ──
//
// Rules share one borrow of `source` for reading identifier text back out
// of spans.

fn module_parser<'tokens, 'src: 'tokens, I>(
    source: &'src str,
) -> impl Parser<'tokens, I, ModuleAst, extra::Err<Rich<'tokens, Token, SimpleSpan>>> + 'src
where
    'tokens: 'src,
    I: ValueInput<'tokens, Token = Token, Span = SimpleSpan>,
{
    let text = move |span: SimpleSpan| source[span.start()..span.end()].to_string();

    // ── Identifiers and names ──

    let ident = just(Token::Ident).map_with(move |_, e| {
        let span: SimpleSpan = e.span();
        Ident {
            name: text(span),
            span,
        }
    });

    let name = select! {
        Token::Name(n) = e => Ident { name: n, span: e.span() },
    };

    let int = select! { Token::Int(v) => v };

    // ── Balanced token group (raw attribute values, literals) ──

    let tree = recursive(|tree| {
        choice((
            tree.clone()
                .repeated()
                .delimited_by(just(Token::LParen), just(Token::RParen))
                .ignored(),
            tree.clone()
                .repeated()
                .delimited_by(just(Token::LBrace), just(Token::RBrace))
                .ignored(),
            tree.repeated()
                .delimited_by(just(Token::LBracket), just(Token::RBracket))
                .ignored(),
            none_of([
                Token::LParen,
                Token::RParen,
                Token::LBrace,
                Token::RBrace,
                Token::LBracket,
                Token::RBracket,
            ])
            .ignored(),
        ))
    });

    // ── Shapes: f32[2,3]{1,0} | (shape, ...) ──

    let int_list = int
        .separated_by(just(Token::Comma))
        .collect::<Vec<_>>();

    let shape = recursive(|shape| {
        let array = ident
            .clone()
            .then(
                int_list
                    .clone()
                    .delimited_by(just(Token::LBracket), just(Token::RBracket)),
            )
            .then(
                int_list
                    .clone()
                    .delimited_by(just(Token::LBrace), just(Token::RBrace))
                    .or_not(),
            )
            .map_with(|((element, dims), layout), e| ShapeAst::Array {
                element,
                dims,
                layout,
                span: e.span(),
            });

        let tuple = shape
            .separated_by(just(Token::Comma))
            .collect::<Vec<_>>()
            .delimited_by(just(Token::LParen), just(Token::RParen))
            .map_with(|elements, e| ShapeAst::Tuple(elements, e.span()));

        array.or(tuple)
    });

    // ── Attributes: key=value ──

    let attr_value = {
        let ref_list = name
            .clone()
            .separated_by(just(Token::Comma))
            .collect::<Vec<_>>()
            .delimited_by(just(Token::LBrace), just(Token::RBrace))
            .map(AttrValue::RefList);
        let raw = tree
            .clone()
            .map_with(move |_, e| AttrValue::Raw(text(e.span())));
        choice((
            name.clone().map(AttrValue::Ref),
            ref_list,
            select! { Token::Str(s) => AttrValue::Str(s) },
            raw,
        ))
    };

    let attribute = ident
        .clone()
        .then_ignore(just(Token::Equals))
        .then(attr_value)
        .map_with(|(key, value), e| Attribute {
            key,
            value,
            span: e.span(),
        });

    let attributes = just(Token::Comma)
        .ignore_then(attribute)
        .repeated()
        .collect::<Vec<_>>();

    // ── Instruction arguments ──

    let args = {
        let operand = shape
            .clone()
            .or_not()
            .then(name.clone())
            .map(|(shape, name)| Operand { shape, name });
        let operands = operand
            .separated_by(just(Token::Comma))
            .collect::<Vec<_>>()
            .map(Args::Operands);
        let literal = tree
            .clone()
            .repeated()
            .at_least(1)
            .map_with(move |_, e| {
                let span: SimpleSpan = e.span();
                Args::Literal(text(span), span)
            });
        just(Token::LParen).ignore_then(choice((
            operands.then_ignore(just(Token::RParen)),
            literal.then_ignore(just(Token::RParen)),
        )))
    };

    // ── Instruction ──

    let instruction = just(Token::Root)
        .or_not()
        .map(|root| root.is_some())
        .then(name.clone())
        .then_ignore(just(Token::Equals))
        .then(shape.clone())
        .then(ident.clone())
        .then(args)
        .then(attributes.clone())
        .map_with(
            |(((((is_root, name), shape), opcode), args), attributes), e| InstructionAst {
                is_root,
                name,
                shape,
                opcode,
                args,
                attributes,
                span: e.span(),
            },
        );

    // ── Computation ──

    let params = ident
        .clone()
        .then_ignore(just(Token::Colon))
        .then(shape.clone())
        .separated_by(just(Token::Comma))
        .collect::<Vec<_>>()
        .delimited_by(just(Token::LParen), just(Token::RParen));

    let computation = just(Token::Entry)
        .or_not()
        .map(|entry| entry.is_some())
        .then(name.clone())
        .then(params)
        .then_ignore(just(Token::Arrow))
        .then(shape)
        .then(
            instruction
                .repeated()
                .collect::<Vec<_>>()
                .delimited_by(just(Token::LBrace), just(Token::RBrace)),
        )
        .map_with(
            |((((is_entry, name), params), result), instructions), e| ComputationAst {
                is_entry,
                name,
                params,
                result,
                instructions,
                span: e.span(),
            },
        );

    // ── Module ──

    just(Token::HloModule)
        .ignore_then(ident.or(name))
        .then(attributes)
        .then(computation.repeated().collect::<Vec<_>>())
        .then_ignore(end())
        .map_with(|((name, attributes), computations), e| ModuleAst {
            name,
            attributes,
            computations,
            span: e.span(),
        })
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(source: &str) -> ModuleAst {
        let result = parse(source);
        assert!(
            result.errors.is_empty(),
            "unexpected errors: {:#?}",
            result.errors
        );
        result.module.expect("expected module")
    }

    const SMALL: &str = r#"
HloModule TestModule, is_scheduled=true

%fused_computation (param_0: s32[], param_1: s32[]) -> s32[] {
  %p0 = s32[] parameter(0)
  %p1 = s32[] parameter(1)
  ROOT %add = s32[] add(s32[] %p0, s32[] %p1)
}

ENTRY %main (a: s32[], b: (s32[], f32[2]{0})) -> s32[] {
  %a = s32[] parameter(0)
  %b = (s32[], f32[2]{0}) parameter(1)
  %c = f32[1]{0} constant({1})
  %fusion = s32[] fusion(s32[] %a, %a), kind=kLoop, calls=%fused_computation, control-predecessors={%c}
  ROOT %start = s32[4]{0} all-reduce-start(s32[4]{0} %a),
    replica_groups={{0,1}}, to_apply=%fused_computation,
    backend_config={"is_sync":true,"no_parallel_custom_call":false}
}
"#;

    #[test]
    fn header_and_computations() {
        let m = parse_ok(SMALL);
        assert_eq!(m.name.name, "TestModule");
        assert!(m.is_scheduled());
        assert_eq!(m.computations.len(), 2);
        assert!(!m.computations[0].is_entry);
        assert!(m.computations[1].is_entry);
        assert_eq!(m.computations[1].params.len(), 2);
        assert!(matches!(m.computations[1].params[1].1, ShapeAst::Tuple(ref e, _) if e.len() == 2));
    }

    #[test]
    fn operands_literals_and_roots() {
        let m = parse_ok(SMALL);
        let entry = &m.computations[1];
        let a = &entry.instructions[0];
        assert!(matches!(&a.args, Args::Literal(t, _) if t == "0"));
        let c = &entry.instructions[2];
        assert!(matches!(&c.args, Args::Literal(t, _) if t == "{1}"));
        let fusion = &entry.instructions[3];
        let Args::Operands(ops) = &fusion.args else {
            panic!("expected operands")
        };
        assert_eq!(ops.len(), 2);
        assert!(ops[0].shape.is_some());
        assert!(ops[1].shape.is_none());
        assert!(entry.instructions[4].is_root);
    }

    #[test]
    fn attribute_values() {
        let m = parse_ok(SMALL);
        let fusion = &m.computations[1].instructions[3];
        let keys: Vec<&str> = fusion.attributes.iter().map(|a| a.key.name.as_str()).collect();
        assert_eq!(keys, ["kind", "calls", "control-predecessors"]);
        assert_eq!(fusion.attributes[0].value, AttrValue::Raw("kLoop".into()));
        assert!(matches!(&fusion.attributes[1].value, AttrValue::Ref(r) if r.name == "fused_computation"));
        assert!(matches!(&fusion.attributes[2].value, AttrValue::RefList(l) if l.len() == 1));

        let start = &m.computations[1].instructions[4];
        assert_eq!(
            start.attributes[0].value,
            AttrValue::Raw("{{0,1}}".into())
        );
        assert_eq!(
            start.attributes[2].value,
            AttrValue::Raw(r#"{"is_sync":true,"no_parallel_custom_call":false}"#.into())
        );
    }

    #[test]
    fn empty_operand_list() {
        let m = parse_ok(
            r#"HloModule m
ENTRY %main () -> s32[] {
  ROOT %cc = s32[] custom-call(), custom_call_target="some target"
}"#,
        );
        let cc = &m.computations[0].instructions[0];
        assert_eq!(cc.args, Args::Operands(vec![]));
        assert_eq!(cc.attributes[0].value, AttrValue::Str("some target".into()));
    }

    #[test]
    fn stray_character_is_a_lex_error() {
        let result = parse("HloModule m # \nENTRY %main () -> s32[] {\n  ROOT %x = s32[] constant(0)\n}");
        let diags = result.diagnostics();
        assert_eq!(diags[0].code, codes::LEX_ERROR);
        assert!(diags[0].message.contains("unexpected character"), "{}", diags[0].message);
    }

    #[test]
    fn grammar_failure_is_a_syntax_error() {
        let result = parse("HloModule m\nENTRY %main () -> s32[] {\n  %x = s32[] \n}");
        assert!(result.module.is_none());
        assert!(result
            .diagnostics()
            .iter()
            .all(|d| d.code == codes::SYNTAX_ERROR));
    }
}
