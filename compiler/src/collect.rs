// collect.rs - Partition a schedule into runs worth capturing
//
// Single left-to-right scan. No-ops ride along once a run holds a command,
// commands extend the run, an async start pulls in its whole region up to
// the matching done when that region is capturable, and anything else closes
// the run.
//
// Preconditions: `sequence` is a verified schedule of one computation.
// Postconditions: returned runs are disjoint, in schedule order, contiguous
//                 in `sequence`, start and end with a command, and each
//                 holds at least `max(min_graph_size, 1)` commands.
// Failure modes: none.
// Side effects: trace-level logging of emitted runs.

use std::collections::HashMap;

use tracing::trace;

use crate::classify::{
    find_async_done, find_async_start, is_async_done_command, is_async_start_command, is_command,
    is_no_op,
};
use crate::config::CommandBufferConfig;
use crate::id::InstrId;
use crate::ir::{Module, UseIndex};

/// One run of instructions to outline, in schedule order.
pub type Sequence = Vec<InstrId>;

pub fn collect_command_buffer_sequences(
    module: &Module,
    sequence: &[InstrId],
    config: &CommandBufferConfig,
) -> Vec<Sequence> {
    let Some(&first) = sequence.first() else {
        return Vec::new();
    };
    let uses = module.use_index(module.instr(first).parent);
    let position: HashMap<InstrId, usize> =
        sequence.iter().enumerate().map(|(i, &id)| (id, i)).collect();
    let mut collector = RunCollector::new(config.effective_min_graph_size());

    let mut i = 0;
    while i < sequence.len() {
        let id = sequence[i];
        if collector.num_commands > 0 && is_no_op(module, id) {
            collector.push(id, false);
        } else if is_command(module, id, config) {
            collector.push(id, true);
        } else if let Some(end) = capturable_async_region(module, &uses, sequence, &position, i, config) {
            for &member in &sequence[i..=end] {
                collector.push(member, true);
            }
            i = end;
        } else {
            collector.flush(module);
        }
        i += 1;
    }
    collector.flush(module);
    collector.sequences
}

/// End index of the async region starting at `start`, when the region can be
/// captured as a whole: every member is a no-op or a (possibly async)
/// command, and every start and done in it has its partner inside.
fn capturable_async_region(
    module: &Module,
    uses: &UseIndex,
    sequence: &[InstrId],
    position: &HashMap<InstrId, usize>,
    start: usize,
    config: &CommandBufferConfig,
) -> Option<usize> {
    let start_id = sequence[start];
    if !is_async_start_command(module, start_id, config) {
        return None;
    }
    let done = find_async_done(module, uses, start_id)?;
    let end = *position.get(&done)?;
    if end <= start {
        return None;
    }
    let region = &sequence[start..=end];
    let inside = |id: InstrId| position.get(&id).is_some_and(|&p| (start..=end).contains(&p));

    let capturable = region.iter().all(|&id| {
        if is_async_start_command(module, id, config) {
            find_async_done(module, uses, id).is_some_and(inside)
        } else if is_async_done_command(module, id, config) {
            find_async_start(module, id).is_some_and(inside)
        } else {
            is_no_op(module, id) || is_command(module, id, config)
        }
    });
    capturable.then_some(end)
}

struct RunCollector {
    min_commands: usize,
    current: Sequence,
    num_commands: usize,
    sequences: Vec<Sequence>,
}

impl RunCollector {
    fn new(min_commands: usize) -> Self {
        Self {
            min_commands,
            current: Vec::new(),
            num_commands: 0,
            sequences: Vec::new(),
        }
    }

    fn push(&mut self, id: InstrId, counts: bool) {
        self.current.push(id);
        if counts {
            self.num_commands += 1;
        }
    }

    fn flush(&mut self, module: &Module) {
        let mut run = std::mem::take(&mut self.current);
        let num_commands = std::mem::replace(&mut self.num_commands, 0);
        if num_commands < self.min_commands {
            return;
        }
        while run.last().is_some_and(|&id| is_no_op(module, id)) {
            run.pop();
        }
        trace!(
            commands = num_commands,
            len = run.len(),
            first = run.first().map(|&id| module.instr(id).name.as_str()),
            "collected command buffer run"
        );
        self.sequences.push(run);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CommandBufferOptions, CommandKind, DeviceDescription};
    use crate::ir::Opcode;
    use crate::parse_module;

    fn config(kinds: &[CommandKind], min_graph_size: usize) -> CommandBufferConfig {
        CommandBufferOptions {
            enabled_kinds: kinds.to_vec(),
            min_graph_size,
            ..Default::default()
        }
        .resolve(&DeviceDescription::cuda())
    }

    fn entry_runs(source: &str, config: &CommandBufferConfig) -> Vec<Vec<String>> {
        let m = parse_module(source).unwrap();
        let entry = m.entry().unwrap();
        let seq = m.schedule().unwrap().sequence(entry).unwrap().to_vec();
        collect_command_buffer_sequences(&m, &seq, config)
            .into_iter()
            .map(|run| run.iter().map(|&id| m.instr(id).name.clone()).collect())
            .collect()
    }

    const INTERLEAVED: &str = r#"
HloModule m, is_scheduled=true

%fused (p0: s32[], p1: s32[]) -> s32[] {
  %p0 = s32[] parameter(0)
  %p1 = s32[] parameter(1)
  ROOT %add = s32[] add(%p0, %p1)
}

ENTRY %main (a: s32[], b: s32[], c: (s32[], s32[])) -> s32[] {
  %a = s32[] parameter(0)
  %b = s32[] parameter(1)
  %c = (s32[], s32[]) parameter(2)
  %fusion = s32[] fusion(%a, %b), kind=kLoop, calls=%fused
  %d = s32[] get-tuple-element(%c), index=0
  %fusion.1 = s32[] fusion(%fusion, %d), kind=kLoop, calls=%fused
  %e = s32[] get-tuple-element(%c), index=1
  %custom-call = s32[] custom-call(%fusion.1, %e), custom_call_target="some target"
  %fusion.2 = s32[] fusion(%custom-call, %a), kind=kLoop, calls=%fused
  ROOT %fusion.3 = s32[] fusion(%custom-call, %fusion.2), kind=kLoop, calls=%fused
}
"#;

    #[test]
    fn runs_split_at_non_commands_and_drop_trailing_no_ops() {
        let runs = entry_runs(INTERLEAVED, &config(&[CommandKind::Fusion], 2));
        assert_eq!(
            runs,
            vec![
                vec!["fusion", "d", "fusion.1"],
                vec!["fusion.2", "fusion.3"],
            ]
        );
    }

    #[test]
    fn threshold_counts_commands_only() {
        let runs = entry_runs(INTERLEAVED, &config(&[CommandKind::Fusion], 3));
        assert!(runs.is_empty());
        let runs = entry_runs(INTERLEAVED, &config(&[CommandKind::Fusion], 0));
        assert_eq!(runs.len(), 2);
        assert!(entry_runs(INTERLEAVED, &config(&[], 1)).is_empty());
    }

    const ASYNC: &str = r#"
HloModule m, is_scheduled=true

%add (x: s32[4], y: s32[4]) -> s32[4] {
  %x = s32[4] parameter(0)
  %y = s32[4] parameter(1)
  ROOT %sum = s32[4] add(%x, %y)
}

%fused (p: s32[4]) -> s32[4] {
  %p = s32[4] parameter(0)
  ROOT %neg = s32[4] negate(%p)
}

ENTRY %main (a: s32[4]) -> s32[4] {
  %a = s32[4] parameter(0)
  %start = s32[4] all-reduce-start(%a), to_apply=%add
  %fusion = s32[4] fusion(%a), kind=kLoop, calls=%fused
  %done = s32[4] all-reduce-done(%start)
  ROOT %fusion.1 = s32[4] fusion(%done), kind=kLoop, calls=%fused
}
"#;

    #[test]
    fn async_region_is_captured_whole() {
        let runs = entry_runs(
            ASYNC,
            &config(&[CommandKind::Fusion, CommandKind::Collectives], 2),
        );
        assert_eq!(runs, vec![vec!["start", "fusion", "done", "fusion.1"]]);
    }

    #[test]
    fn async_region_with_non_command_is_not_captured() {
        let source = ASYNC.replace(
            "%fusion = s32[4] fusion(%a), kind=kLoop, calls=%fused",
            "%fusion = s32[4] custom-call(%a), custom_call_target=\"opaque\"",
        );
        let runs = entry_runs(
            &source,
            &config(&[CommandKind::Fusion, CommandKind::Collectives], 1),
        );
        // Neither half of the pair lands in a run; only the trailing fusion.
        assert_eq!(runs, vec![vec!["fusion.1"]]);
    }

    #[test]
    fn collectives_disabled_breaks_runs() {
        let runs = entry_runs(ASYNC, &config(&[CommandKind::Fusion], 1));
        assert_eq!(runs, vec![vec!["fusion"], vec!["fusion.1"]]);
    }

    #[test]
    fn runs_never_start_or_end_with_no_ops() {
        let m = parse_module(INTERLEAVED).unwrap();
        let entry = m.entry().unwrap();
        let seq = m.schedule().unwrap().sequence(entry).unwrap().to_vec();
        for run in collect_command_buffer_sequences(&m, &seq, &config(&[CommandKind::Fusion], 1)) {
            assert_eq!(m.instr(run[0]).opcode, Opcode::Fusion);
            assert_eq!(m.instr(*run.last().unwrap()).opcode, Opcode::Fusion);
        }
    }
}
