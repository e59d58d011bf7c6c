use clap::Parser;
use std::path::PathBuf;

use cmdbuf::config::{CommandBufferOptions, CommandKind, DeviceDescription, Platform};
use cmdbuf::diag;
use cmdbuf::pass::PassId;
use cmdbuf::pipeline::{preview_entry_sequences, run_pipeline, CompilationState};

#[derive(Debug, Clone, clap::ValueEnum)]
enum EmitStage {
    /// The rewritten module
    Hlo,
    /// The parsed module, unchanged
    Input,
    /// Runs the collector would capture in the entry computation
    Sequences,
    /// Provenance JSON
    BuildInfo,
}

#[derive(Parser, Debug)]
#[command(
    name = "cmdbuf",
    version,
    about = "Outlines capturable runs of a scheduled HLO module into command buffers"
)]
struct Cli {
    /// Input module text
    source: PathBuf,

    /// Output file path (stdout when omitted)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Pass options as JSON; flags below override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Command kind to enable (repeatable; replaces the configured set)
    #[arg(long = "enable", value_name = "KIND")]
    enable: Vec<CommandKind>,

    /// Minimum number of commands in a captured run
    #[arg(long)]
    min_graph_size: Option<usize>,

    /// Target platform
    #[arg(long, default_value = "cuda")]
    platform: Platform,

    /// CUDA toolkit version, e.g. 12030 for 12.3
    #[arg(long)]
    toolkit_version: Option<u32>,

    /// CUDA driver version, e.g. 12030 for 12.3
    #[arg(long)]
    driver_version: Option<u32>,

    /// Output stage
    #[arg(long, value_enum, default_value_t = EmitStage::Hlo)]
    emit: EmitStage,

    /// Print passes, timing and debug logs
    #[arg(long)]
    verbose: bool,
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(if cli.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::WARN
        })
        .without_time()
        .init();

    if cli.verbose {
        eprintln!("cmdbuf: source = {}", cli.source.display());
        eprintln!("cmdbuf: emit   = {:?}", cli.emit);
    }

    // ── Options ──
    let mut options = match &cli.config {
        Some(path) => {
            let text = match std::fs::read_to_string(path) {
                Ok(t) => t,
                Err(e) => {
                    eprintln!("cmdbuf: error: {}: {}", path.display(), e);
                    std::process::exit(2);
                }
            };
            match CommandBufferOptions::from_json(&text) {
                Ok(o) => o,
                Err(e) => {
                    eprintln!("cmdbuf: error: {}: {}", path.display(), e);
                    std::process::exit(2);
                }
            }
        }
        None => CommandBufferOptions::default(),
    };
    if !cli.enable.is_empty() {
        options.enabled_kinds = cli.enable.clone();
    }
    if let Some(n) = cli.min_graph_size {
        options.min_graph_size = n;
    }
    if let Some(v) = cli.toolkit_version {
        options.toolkit_version = v;
    }
    if let Some(v) = cli.driver_version {
        options.driver_version = v;
    }
    let device = DeviceDescription {
        platform: cli.platform,
    };

    // ── Read source ──
    let source = match std::fs::read_to_string(&cli.source) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("cmdbuf: error: {}: {}", cli.source.display(), e);
            std::process::exit(2);
        }
    };

    let mut state = CompilationState::new(source, options, &device);
    if cli.verbose {
        let kinds: Vec<&str> = state.config.enabled_kinds().map(|k| k.as_str()).collect();
        eprintln!("cmdbuf: enabled kinds = [{}]", kinds.join(", "));
    }

    let terminal = match cli.emit {
        EmitStage::Hlo => Some(PassId::CommandBuffers),
        EmitStage::Input => Some(PassId::Resolve),
        EmitStage::Sequences => Some(PassId::VerifySchedule),
        EmitStage::BuildInfo => None,
    };

    if let Some(terminal) = terminal {
        let path = cli.source.display().to_string();
        let source = state.source.clone();
        let result = run_pipeline(&mut state, terminal, cli.verbose, |_, diags| {
            for d in diags {
                eprintln!("cmdbuf: {}", diag::render(d, &path, &source));
            }
        });
        if result.is_err() {
            std::process::exit(1);
        }
    }

    let output = match cli.emit {
        EmitStage::BuildInfo => state.provenance.to_json(),
        EmitStage::Hlo | EmitStage::Input => match &state.module {
            Some(module) => module.to_string(),
            None => {
                eprintln!("cmdbuf: no module produced");
                std::process::exit(1);
            }
        },
        EmitStage::Sequences => {
            let Some(module) = &state.module else {
                eprintln!("cmdbuf: no module produced");
                std::process::exit(1);
            };
            match preview_entry_sequences(module, &state.config) {
                Ok(runs) => {
                    let mut text = String::new();
                    for (i, run) in runs.iter().enumerate() {
                        text.push_str(&format!("sequence {i}: {}\n", run.join(", ")));
                    }
                    text
                }
                Err(e) => {
                    eprintln!("cmdbuf: error: {e}");
                    std::process::exit(1);
                }
            }
        }
    };

    if cli.verbose {
        if let Some(stats) = &state.stats {
            eprintln!(
                "cmdbuf: {} command buffer(s), {} instruction(s) captured",
                stats.command_buffers_created, stats.instructions_captured
            );
        }
    }

    match &cli.output {
        Some(path) => {
            if let Err(e) = std::fs::write(path, output) {
                eprintln!("cmdbuf: error: {}: {}", path.display(), e);
                std::process::exit(2);
            }
        }
        None => print!("{output}"),
    }
}
