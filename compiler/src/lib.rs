// cmdbuf - Command buffer scheduling
//
// Library root. Front end (lexer, parser, resolve, print) for the text form
// of scheduled modules, the instruction graph, and the pass that outlines
// capturable runs into command buffer computations.

pub mod ast;
pub mod classify;
pub mod collect;
pub mod config;
pub mod diag;
pub mod error;
pub mod hoist;
pub mod id;
pub mod ir;
pub mod lexer;
pub mod outline;
pub mod parser;
pub mod pass;
pub mod pipeline;
pub mod print;
pub mod resolve;
pub mod rewrite;
pub mod schedule;
pub mod shape;

pub use config::{CommandBufferConfig, CommandBufferOptions, CommandKind, DeviceDescription, Platform};
pub use error::{IrError, PassError};
pub use ir::Module;
pub use rewrite::{CommandBufferScheduling, RewriteStats};

use diag::{codes, Diagnostic};

/// Parse and resolve program text into a module.
///
/// Returns every error-level diagnostic on failure; warnings are dropped.
pub fn parse_module(source: &str) -> Result<Module, Vec<Diagnostic>> {
    let parsed = parser::parse(source);
    if !parsed.errors.is_empty() {
        return Err(parsed.diagnostics());
    }
    let Some(ast) = parsed.module else {
        return Err(vec![Diagnostic::error(
            codes::SYNTAX_ERROR,
            (0..source.len()).into(),
            "parse failed with no output",
        )]);
    };
    let resolved = resolve::resolve(&ast);
    match resolved.module {
        Some(module) => Ok(module),
        None => Err(resolved
            .diagnostics
            .into_iter()
            .filter(Diagnostic::is_error)
            .collect()),
    }
}
