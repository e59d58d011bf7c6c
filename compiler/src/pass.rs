// pass.rs - The driver's passes as data
//
// Four passes run in a fixed chain: parse, resolve, verify_schedule and
// command_buffers. Each `--emit` target names the last pass it needs, and
// the runner executes only that pass and its inputs.

use std::collections::HashSet;

// ── Identifiers ────────────────────────────────────────────────────────────

/// Identifies each pass of the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PassId {
    Parse,
    Resolve,
    VerifySchedule,
    CommandBuffers,
}

/// What a pass leaves behind in `CompilationState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactId {
    Ast,       // ModuleAst
    Module,    // Module
    Cert,      // ScheduleCert
    Rewritten, // Module (in place) + RewriteStats
}

// ── Stage certificates ─────────────────────────────────────────────────────

/// Machine-checkable evidence that a stage's postconditions hold.
pub trait StageCert {
    /// Every obligation holds.
    fn all_pass(&self) -> bool;

    /// Named obligations with their outcome, in a stable order.
    fn obligations(&self) -> Vec<(&'static str, bool)>;

    /// Names of the obligations that failed.
    fn failed(&self) -> Vec<&'static str> {
        self.obligations()
            .into_iter()
            .filter(|(_, ok)| !ok)
            .map(|(name, _)| name)
            .collect()
    }
}

// ── Pass descriptor ────────────────────────────────────────────────────────

pub struct PassDescriptor {
    /// Shown in `--verbose` timings and trace events.
    pub name: &'static str,
    /// Passes that must have run first.
    pub inputs: &'static [PassId],
    pub outputs: &'static [ArtifactId],
    /// Input whose change makes the output stale.
    pub invalidation_key: &'static str,
    /// Informal pre/post conditions.
    pub invariants: &'static str,
}

pub fn descriptor(id: PassId) -> PassDescriptor {
    match id {
        PassId::Parse => PassDescriptor {
            name: "parse",
            inputs: &[],
            outputs: &[ArtifactId::Ast],
            invalidation_key: "source",
            invariants: "token stream fully consumed",
        },
        PassId::Resolve => PassDescriptor {
            name: "resolve",
            inputs: &[PassId::Parse],
            outputs: &[ArtifactId::Module],
            invalidation_key: "ast",
            invariants: "all names bound, roots and entry chosen",
        },
        PassId::VerifySchedule => PassDescriptor {
            name: "verify_schedule",
            inputs: &[PassId::Resolve],
            outputs: &[ArtifactId::Cert],
            invalidation_key: "module",
            invariants: "S1-S3 hold for the input schedule",
        },
        PassId::CommandBuffers => PassDescriptor {
            name: "command_buffers",
            inputs: &[PassId::VerifySchedule],
            outputs: &[ArtifactId::Rewritten],
            invalidation_key: "module + resolved command buffer config",
            invariants: "S1-S3 still hold, dependencies preserved through calls",
        },
    }
}

// ── Ordering ───────────────────────────────────────────────────────────────

/// Every pass, in execution order.
pub const ALL_PASSES: [PassId; 4] = [
    PassId::Parse,
    PassId::Resolve,
    PassId::VerifySchedule,
    PassId::CommandBuffers,
];

/// `terminal` and everything it depends on, dependencies first.
pub fn required_passes(terminal: PassId) -> Vec<PassId> {
    fn push_with_inputs(id: PassId, seen: &mut HashSet<PassId>, out: &mut Vec<PassId>) {
        if seen.insert(id) {
            for &input in descriptor(id).inputs {
                push_with_inputs(input, seen, out);
            }
            out.push(id);
        }
    }
    let mut out = Vec::new();
    push_with_inputs(terminal, &mut HashSet::new(), &mut out);
    out
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_passes_command_buffers_includes_all() {
        assert_eq!(required_passes(PassId::CommandBuffers), ALL_PASSES.to_vec());
    }

    #[test]
    fn required_passes_resolve_is_minimal() {
        assert_eq!(
            required_passes(PassId::Resolve),
            vec![PassId::Parse, PassId::Resolve]
        );
        assert_eq!(required_passes(PassId::Parse), vec![PassId::Parse]);
    }

    #[test]
    fn every_pass_produces_something() {
        for pass in ALL_PASSES {
            assert!(!descriptor(pass).outputs.is_empty(), "{pass:?}");
        }
    }

    #[test]
    fn inputs_run_before_their_consumers() {
        for pass in ALL_PASSES {
            let order = required_passes(pass);
            assert_eq!(order.last(), Some(&pass));
            for input in descriptor(pass).inputs {
                let at = order.iter().position(|p| p == input);
                assert!(at.is_some_and(|i| i + 1 < order.len()), "{pass:?} needs {input:?}");
            }
        }
    }

    struct Fixed(Vec<(&'static str, bool)>);

    impl StageCert for Fixed {
        fn all_pass(&self) -> bool {
            self.0.iter().all(|(_, ok)| *ok)
        }
        fn obligations(&self) -> Vec<(&'static str, bool)> {
            self.0.clone()
        }
    }

    #[test]
    fn failed_lists_broken_obligations_in_order() {
        let cert = Fixed(vec![("A", true), ("B", false), ("C", false)]);
        assert!(!cert.all_pass());
        assert_eq!(cert.failed(), vec!["B", "C"]);
    }
}
