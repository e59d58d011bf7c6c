// pipeline.rs - Driver state and the pass runner
//
// `CompilationState` owns the source, the resolved options and whatever the
// passes have produced so far. `run_pipeline` executes the passes a given
// `--emit` target needs and stops at the first pass that reports an error;
// diagnostics are handed to the caller as each pass finishes.

use std::time::Instant;

use tracing::debug;

use crate::ast::{ModuleAst, Span};
use crate::config::{CommandBufferConfig, CommandBufferOptions, DeviceCapabilities};
use crate::diag::{codes, Diagnostic};
use crate::error::PassError;
use crate::hoist::move_parameters_and_constants_to_front;
use crate::ir::Module;
use crate::pass::{descriptor, required_passes, PassId, StageCert};
use crate::rewrite::{CommandBufferScheduling, RewriteStats};
use crate::schedule::ScheduleCert;

// ── Provenance ─────────────────────────────────────────────────────────────

/// What a run was computed from: SHA-256 of the module text, SHA-256 of
/// `CommandBufferOptions::canonical_json()`, and the crate version. Two runs
/// with equal provenance print the same output.
#[derive(Debug, Clone)]
pub struct Provenance {
    pub source_hash: [u8; 32],
    pub options_fingerprint: [u8; 32],
    pub compiler_version: &'static str,
}

impl Provenance {
    pub fn source_hash_hex(&self) -> String {
        hex(&self.source_hash)
    }

    pub fn options_fingerprint_hex(&self) -> String {
        hex(&self.options_fingerprint)
    }

    /// Pretty JSON for `--emit build-info`, newline-terminated.
    pub fn to_json(&self) -> String {
        let value = serde_json::json!({
            "source_hash": self.source_hash_hex(),
            "options_fingerprint": self.options_fingerprint_hex(),
            "compiler_version": self.compiler_version,
        });
        let mut json = serde_json::to_string_pretty(&value).unwrap_or_default();
        json.push('\n');
        json
    }
}

fn hex(digest: &[u8; 32]) -> String {
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

fn sha256(bytes: &[u8]) -> [u8; 32] {
    use sha2::{Digest, Sha256};
    let mut out = [0u8; 32];
    out.copy_from_slice(&Sha256::digest(bytes));
    out
}

/// The options are hashed in canonical form, so kind order and repeated
/// kinds do not change the fingerprint.
pub fn compute_provenance(source: &str, options: &CommandBufferOptions) -> Provenance {
    Provenance {
        source_hash: sha256(source.as_bytes()),
        options_fingerprint: sha256(options.canonical_json().as_bytes()),
        compiler_version: env!("CARGO_PKG_VERSION"),
    }
}

// ── Compilation state ──────────────────────────────────────────────────────

/// Source, options and every artifact produced so far.
pub struct CompilationState {
    pub source: String,
    pub options: CommandBufferOptions,
    pub config: CommandBufferConfig,
    pub ast: Option<ModuleAst>,
    pub module: Option<Module>,
    pub cert: Option<ScheduleCert>,
    pub stats: Option<RewriteStats>,
    pub diagnostics: Vec<Diagnostic>,
    pub has_error: bool,
    pub provenance: Provenance,
}

impl CompilationState {
    /// Resolves `options` against `device` once, up front.
    pub fn new(source: impl Into<String>, options: CommandBufferOptions, device: &dyn DeviceCapabilities) -> Self {
        let source = source.into();
        let provenance = compute_provenance(&source, &options);
        let config = options.resolve(device);
        Self {
            source,
            options,
            config,
            ast: None,
            module: None,
            cert: None,
            stats: None,
            diagnostics: Vec::new(),
            has_error: false,
            provenance,
        }
    }

    /// Span of the whole module, for diagnostics without a finer location.
    fn module_span(&self) -> Span {
        self.ast
            .as_ref()
            .map(|ast| ast.span)
            .unwrap_or_else(|| (0..self.source.len()).into())
    }
}

// ── Runner ─────────────────────────────────────────────────────────────────

/// A pass reported at least one error. The diagnostics themselves are in
/// `CompilationState::diagnostics`.
#[derive(Debug)]
pub struct PipelineError {
    pub failing_pass: PassId,
}

/// Report, record and time one finished pass; fail if it produced errors.
fn finish_pass(
    state: &mut CompilationState,
    pass_id: PassId,
    diags: Vec<Diagnostic>,
    elapsed: std::time::Duration,
    verbose: bool,
    on_pass_complete: &mut impl FnMut(PassId, &[Diagnostic]),
) -> Result<(), PipelineError> {
    on_pass_complete(pass_id, &diags);
    let is_err = diags.iter().any(Diagnostic::is_error);
    state.diagnostics.extend(diags);
    let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
    debug!(pass = descriptor(pass_id).name, elapsed_ms, "pass complete");
    if verbose {
        eprintln!(
            "cmdbuf: {} complete, {:.1}ms",
            descriptor(pass_id).name,
            elapsed_ms
        );
    }
    if is_err {
        state.has_error = true;
        return Err(PipelineError {
            failing_pass: pass_id,
        });
    }
    Ok(())
}

/// Run `terminal` and the passes it depends on, in order.
///
/// `on_pass_complete` sees each pass's diagnostics as soon as the pass ends,
/// warnings included. On `Err`, `state.has_error` is set and the artifacts
/// of later passes stay `None`.
pub fn run_pipeline(
    state: &mut CompilationState,
    terminal: PassId,
    verbose: bool,
    mut on_pass_complete: impl FnMut(PassId, &[Diagnostic]),
) -> Result<(), PipelineError> {
    for pass_id in required_passes(terminal) {
        let t = Instant::now();
        let diags = match pass_id {
            PassId::Parse => run_parse(state),
            PassId::Resolve => run_resolve(state),
            PassId::VerifySchedule => run_verify_schedule(state),
            PassId::CommandBuffers => run_command_buffers(state),
        };
        finish_pass(
            state,
            pass_id,
            diags,
            t.elapsed(),
            verbose,
            &mut on_pass_complete,
        )?;
    }
    Ok(())
}

fn run_parse(state: &mut CompilationState) -> Vec<Diagnostic> {
    let result = crate::parser::parse(&state.source);
    let mut diags = result.diagnostics();
    state.ast = result.module;
    if state.ast.is_none() && diags.is_empty() {
        diags.push(Diagnostic::error(
            codes::SYNTAX_ERROR,
            state.module_span(),
            "parse failed with no output",
        ));
    }
    diags
}

fn run_resolve(state: &mut CompilationState) -> Vec<Diagnostic> {
    let Some(ast) = state.ast.as_ref() else {
        return Vec::new();
    };
    let result = crate::resolve::resolve(ast);
    state.module = result.module;
    result.diagnostics
}

fn run_verify_schedule(state: &mut CompilationState) -> Vec<Diagnostic> {
    let span = state.module_span();
    let Some(module) = state.module.as_ref() else {
        return Vec::new();
    };
    if !module.has_schedule() {
        return vec![Diagnostic::error(
            codes::INVALID_SCHEDULE,
            span,
            PassError::MissingSchedule(module.name.clone()).to_string(),
        )
        .with_hint("add `is_scheduled=true` to the HloModule header")];
    }
    let cert = crate::schedule::verify_schedule(module);
    let mut diags = Vec::new();
    if !cert.all_pass() {
        let mut diag = Diagnostic::error(
            codes::INVALID_SCHEDULE,
            span,
            format!("schedule verification failed: {}", cert.failed().join(", ")),
        );
        for violation in &cert.violations {
            diag = diag.with_detail(format!(
                "computation '%{}': {}",
                violation.computation, violation.reason
            ));
        }
        diags.push(diag);
    }
    state.cert = Some(cert);
    diags
}

fn run_command_buffers(state: &mut CompilationState) -> Vec<Diagnostic> {
    let span = state.module_span();
    let Some(module) = state.module.as_mut() else {
        return Vec::new();
    };
    let pass = CommandBufferScheduling::new(state.config.clone());
    match pass.run_with_stats(module) {
        Ok(stats) => {
            state.stats = Some(stats);
            Vec::new()
        }
        Err(err) => vec![Diagnostic::error(codes::PASS_FAILED, span, err.to_string())],
    }
}

// ── Sequence preview ───────────────────────────────────────────────────────

/// Names of the instructions in each run the collector would capture in the
/// entry computation, after hoisting. `module` itself is not modified.
pub fn preview_entry_sequences(module: &Module, config: &CommandBufferConfig) -> Result<Vec<Vec<String>>, PassError> {
    let mut scratch = module.clone();
    let entry = scratch
        .entry()
        .ok_or_else(|| PassError::invariant(module.name.clone(), "module has no entry computation"))?;
    if !scratch.has_schedule() {
        return Err(PassError::MissingSchedule(module.name.clone()));
    }
    move_parameters_and_constants_to_front(&mut scratch, entry)?;
    let order = scratch.instruction_order(entry);
    Ok(
        crate::collect::collect_command_buffer_sequences(&scratch, &order, config)
            .into_iter()
            .map(|run| run.iter().map(|&id| scratch.instr(id).name.clone()).collect())
            .collect(),
    )
}

// ── Tests ──────────────────────────────────────────────────────────────────
