//! Escapist - escape analysis driver
//!
//! # Usage
//!
//! ```bash
//! # Analyze a program and print placement decisions
//! escapist analyze program.json
//!
//! # With pass configuration, wave-parallel, as JSON
//! escapist analyze program.json --config escape.toml --parallel --format json
//!
//! # Show the bottom-up SCC schedule
//! escapist schedule program.json
//! ```
//!
//! Programs are `compiler::ir::Program` values serialized as JSON.

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use compiler::config::EscapeConfig;
use compiler::escape::{AllocationDecision, EscapeAnalysis, EscapeAnalysisResults, Scheduler};
use compiler::ir::{visit_statements, DeclId, Program, Stmt};
use fxhash::FxHashMap;
use log::{error, LevelFilter};
use std::path::{Path, PathBuf};
use std::process;

#[derive(Parser)]
#[command(name = "escapist")]
#[command(version = "0.1.0")]
#[command(about = "Escape analysis: stack/heap placement and safe-function summaries", long_about = None)]
struct Cli {
    /// Raise the log level (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run escape analysis over a program
    Analyze {
        /// Path to the program (JSON)
        program: PathBuf,

        /// Pass configuration (TOML)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Analyze independent SCCs in parallel
        #[arg(long)]
        parallel: bool,

        /// Output format
        #[arg(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Print the SCCs of the call graph in analysis order
    Schedule {
        /// Path to the program (JSON)
        program: PathBuf,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum OutputFormat {
    Text,
    Json,
}

fn main() {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    if cli.verbose == 0 && std::env::var_os("RUST_LOG").is_some() {
        compiler::logging::init_from_env();
    } else {
        compiler::logging::init_with_level(level);
    }

    let result = match cli.command {
        Commands::Analyze {
            program,
            config,
            parallel,
            format,
        } => analyze(&program, config.as_deref(), parallel, format),
        Commands::Schedule { program } => schedule(&program),
    };

    if let Err(e) = result {
        error!("{}", e);
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn load_program(path: &Path) -> Result<Program, String> {
    let source = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;
    serde_json::from_str(&source).map_err(|e| format!("Invalid program {}: {}", path.display(), e))
}

fn analyze(
    path: &Path,
    config_path: Option<&Path>,
    parallel: bool,
    format: OutputFormat,
) -> Result<(), String> {
    let program = load_program(path)?;
    let mut config = match config_path {
        Some(config_path) => EscapeConfig::load(config_path).map_err(|e| e.to_string())?,
        None => EscapeConfig::default(),
    };
    config.parallel |= parallel;

    let results = EscapeAnalysis::perform(&program, &config)
        .map_err(|e| format!("Internal compiler error in escape analysis: {}", e))?;

    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(&results)
                .map_err(|e| format!("Failed to serialize results: {}", e))?;
            println!("{}", json);
        }
        OutputFormat::Text => print_results(&program, &results),
    }
    Ok(())
}

fn print_results(program: &Program, results: &EscapeAnalysisResults) {
    let function_name = |id| {
        program
            .function(id)
            .map(|function| function.name.as_str())
            .unwrap_or("<unknown>")
    };

    println!("Functions:");
    for summary in results.summaries.iter() {
        let leaks: Vec<String> = summary
            .parameter_leak_level
            .iter()
            .enumerate()
            .filter_map(|(index, level)| level.map(|level| format!("#{}@{}", index, level)))
            .collect();
        println!(
            "  {:<24} {:<6} leaks: {:<16} ({:?})",
            summary.name,
            if summary.is_safe { "safe" } else { "unsafe" },
            if leaks.is_empty() {
                "-".to_string()
            } else {
                leaks.join(" ")
            },
            summary.source
        );
    }

    println!("\nAllocation sites:");
    for site in results.allocations.iter() {
        println!(
            "  {:<12} {:<24} {}{}",
            site.key().to_string(),
            function_name(site.function),
            site.decision,
            if site.forced { " (size)" } else { "" }
        );
    }

    let mut names: FxHashMap<DeclId, &str> = FxHashMap::default();
    for function in &program.functions {
        for param in &function.params {
            names.insert(param.decl, &param.name);
        }
        if let Some(body) = &function.body {
            visit_statements(body, &mut |stmt| {
                if let Stmt::Declare { decl, name, .. } = stmt {
                    names.insert(*decl, name);
                }
            });
        }
    }

    println!("\nMoved to heap:");
    let moved: Vec<_> = results
        .variables
        .values()
        .filter(|variable| variable.decision == AllocationDecision::HeapRequired)
        .collect();
    if moved.is_empty() {
        println!("  (none)");
    }
    for variable in moved {
        println!(
            "  {:<24} in {}",
            names.get(&variable.decl).copied().unwrap_or("<unnamed>"),
            function_name(variable.function)
        );
    }

    let stats = &results.stats;
    println!(
        "\n{} functions ({} external), {} SCCs in {} waves, {} stack / {} heap sites, {:?}",
        stats.functions_analyzed,
        stats.external_functions,
        stats.scc_count,
        stats.waves,
        stats.stack_allocations,
        stats.heap_allocations,
        stats.analysis_time
    );
}

fn schedule(path: &Path) -> Result<(), String> {
    let program = load_program(path)?;
    let scheduler = Scheduler::compute_functions_to_process(&program).map_err(|e| e.to_string())?;

    for (level, wave) in scheduler.waves().iter().enumerate() {
        println!("Wave {}:", level);
        for &index in wave {
            let scc = &scheduler.sccs()[index];
            let names: Vec<&str> = scc
                .functions
                .iter()
                .filter_map(|&id| program.function(id))
                .map(|function| function.name.as_str())
                .collect();
            println!(
                "  [{}]{}",
                names.join(", "),
                if scc.is_recursive { " (recursive)" } else { "" }
            );
        }
    }
    Ok(())
}
