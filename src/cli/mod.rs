//! RS-030: CLI subcommands. Init, validate, synth, plan, list, verify,
//! status, assert, schema, completions.

use crate::core::assertions::{self, MatchStyle};
use crate::core::{parser, planner, state, synth, types};
use crate::stacks;
use crate::tripwire::{drift, eventlog};
use clap::{CommandFactory, Parser, Subcommand};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

#[derive(Parser, Debug)]
#[command(
    name = "railstack",
    version,
    about = "Typed deployment topology for a containerised Rails API, synthesized to CloudFormation"
)]
pub struct Cli {
    /// Diagnostic verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize a new railstack project
    Init {
        /// Directory to initialize (default: current)
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// Validate railstack.yaml and the stacks it declares
    Validate {
        /// Path to railstack.yaml
        #[arg(short, long, default_value = "railstack.yaml")]
        file: PathBuf,

        /// Context override (repeatable)
        #[arg(short = 'c', long = "context", value_name = "KEY=VALUE")]
        context: Vec<String>,
    },

    /// Render every stack into a cloud assembly directory
    Synth {
        /// Path to railstack.yaml
        #[arg(short, long, default_value = "railstack.yaml")]
        file: PathBuf,

        /// Context override (repeatable)
        #[arg(short = 'c', long = "context", value_name = "KEY=VALUE")]
        context: Vec<String>,

        /// Assembly directory
        #[arg(short, long, default_value = "cdk.out")]
        out: PathBuf,
    },

    /// Show what a synth would change relative to the last one
    Plan {
        /// Path to railstack.yaml
        #[arg(short, long, default_value = "railstack.yaml")]
        file: PathBuf,

        /// Context override (repeatable)
        #[arg(short = 'c', long = "context", value_name = "KEY=VALUE")]
        context: Vec<String>,

        /// Assembly directory holding the previous lock
        #[arg(short, long, default_value = "cdk.out")]
        out: PathBuf,

        /// Only show one stack
        #[arg(short, long)]
        stack: Option<String>,
    },

    /// List stacks in deployment order with their waves and cross-stack wiring
    List {
        /// Path to railstack.yaml
        #[arg(short, long, default_value = "railstack.yaml")]
        file: PathBuf,

        /// Context override (repeatable)
        #[arg(short = 'c', long = "context", value_name = "KEY=VALUE")]
        context: Vec<String>,
    },

    /// Check the templates on disk against the lock (tripwire)
    Verify {
        /// Assembly directory
        #[arg(short, long, default_value = "cdk.out")]
        out: PathBuf,

        /// Exit non-zero on any drift (for CI)
        #[arg(long)]
        tripwire: bool,
    },

    /// Show the lock and the last synth run
    Status {
        /// Assembly directory
        #[arg(short, long, default_value = "cdk.out")]
        out: PathBuf,
    },

    /// Match a rendered template against an expected JSON fragment
    Assert {
        /// Rendered template
        template: PathBuf,

        /// Expected JSON
        expected: PathBuf,

        /// exact | superset
        #[arg(long, default_value = "superset")]
        style: MatchStyle,
    },

    /// Print the JSON Schema of railstack.yaml
    Schema,

    /// Generate shell completions
    Completions {
        shell: clap_complete::Shell,
    },
}

/// Dispatch a CLI command.
pub fn dispatch(cmd: Commands) -> Result<(), String> {
    match cmd {
        Commands::Init { path } => cmd_init(&path),
        Commands::Validate { file, context } => cmd_validate(&file, &context),
        Commands::Synth { file, context, out } => cmd_synth(&file, &context, &out),
        Commands::Plan {
            file,
            context,
            out,
            stack,
        } => cmd_plan(&file, &context, &out, stack.as_deref()),
        Commands::List { file, context } => cmd_list(&file, &context),
        Commands::Verify { out, tripwire } => cmd_verify(&out, tripwire),
        Commands::Status { out } => cmd_status(&out),
        Commands::Assert {
            template,
            expected,
            style,
        } => cmd_assert(&template, &expected, style),
        Commands::Schema => cmd_schema(),
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "railstack", &mut std::io::stdout());
            Ok(())
        }
    }
}

const INIT_TEMPLATE: &str = r#"version: "1.0"
name: ecs-rails-sample
description: "Rails API on ECS Fargate with Aurora MySQL"

# Deployment-time values; override with -c KEY=VALUE
context:
  AppTag: latest
  # Replace with the complete ARN of the application secret
  EcsRailsSampleSecretArn: "arn:aws:secretsmanager:ap-northeast-1:123456789012:secret:ecs-rails-sample-AbCdEf"

policy:
  removal: destroy

ci:
  repository_name: ecs-rails-sample
  branch: main
"#;

fn cmd_init(path: &Path) -> Result<(), String> {
    let config_path = path.join("railstack.yaml");
    if config_path.exists() {
        return Err(format!("{} already exists", config_path.display()));
    }
    std::fs::create_dir_all(path)
        .map_err(|e| format!("cannot create {}: {}", path.display(), e))?;
    std::fs::write(&config_path, INIT_TEMPLATE)
        .map_err(|e| format!("cannot write {}: {}", config_path.display(), e))?;

    println!("Initialized railstack project at {}", path.display());
    println!("  Created: {}", config_path.display());
    Ok(())
}

/// Parse a config, apply `-c` overrides and validate it.
fn parse_and_validate(file: &Path, context: &[String]) -> Result<types::RailstackConfig, String> {
    let mut config = parser::parse_config_file(file)?;
    parser::apply_context_overrides(&mut config, context)?;
    let errors = parser::validate_config(&config);
    if errors.is_empty() {
        return Ok(config);
    }
    for e in &errors {
        eprintln!("  ERROR: {}", e);
    }
    Err(format!("{} validation error(s)", errors.len()))
}

fn cmd_validate(file: &Path, context: &[String]) -> Result<(), String> {
    let config = parse_and_validate(file, context)?;
    let app = stacks::compose(&config)?;
    let assembly = synth::synthesize(&app)?;
    let resources: usize = assembly.stacks.values().map(|s| s.resource_count()).sum();
    println!(
        "OK: {} ({} stacks, {} resources, AppTag {})",
        config.name,
        assembly.stacks.len(),
        resources,
        config.app_tag()
    );
    Ok(())
}

fn cmd_synth(file: &Path, context: &[String], out: &Path) -> Result<(), String> {
    let started = Instant::now();
    let config = parse_and_validate(file, context)?;
    let run_id = eventlog::generate_run_id();
    eventlog::append_event(
        out,
        types::ProvenanceEvent::SynthStarted {
            app: config.name.clone(),
            run_id: run_id.clone(),
            railstack_version: env!("CARGO_PKG_VERSION").to_string(),
        },
    )?;

    let assembly = match stacks::compose(&config).and_then(|app| synth::synthesize(&app)) {
        Ok(a) => a,
        Err(e) => {
            eventlog::append_event(
                out,
                types::ProvenanceEvent::SynthFailed {
                    app: config.name.clone(),
                    run_id,
                    error: e.clone(),
                },
            )?;
            return Err(e);
        }
    };

    synth::write_assembly(out, &assembly)?;
    let mut lock = state::lock_from_assembly(&assembly);
    state::record_manifest(out, &mut lock)?;
    state::save_lock(out, &lock)?;

    for s in assembly.stacks.values() {
        println!(
            "  {}: {} resources -> {}",
            s.name,
            s.resource_count(),
            out.join(&s.template_file).display()
        );
        eventlog::append_event(
            out,
            types::ProvenanceEvent::StackSynthesized {
                app: assembly.app.clone(),
                stack: s.name.clone(),
                resources: u32::try_from(s.resource_count()).unwrap_or(u32::MAX),
                hash: s.hash.clone(),
            },
        )?;
    }

    let elapsed = started.elapsed().as_secs_f64();
    eventlog::append_event(
        out,
        types::ProvenanceEvent::SynthCompleted {
            app: assembly.app.clone(),
            run_id,
            stacks: u32::try_from(assembly.stacks.len()).unwrap_or(u32::MAX),
            total_seconds: elapsed,
        },
    )?;

    println!();
    println!(
        "Synthesized {} stack(s) into {} ({:.2}s).",
        assembly.stacks.len(),
        out.display(),
        elapsed
    );
    Ok(())
}

/// Templates of the previous synth that are still on disk.
fn previous_templates(out: &Path, lock: &types::AssemblyLock) -> HashMap<String, serde_json::Value> {
    let mut previous = HashMap::new();
    for (name, locked) in &lock.stacks {
        match synth::read_template(out, &locked.template) {
            Ok(t) => {
                previous.insert(name.clone(), t);
            }
            Err(e) => tracing::warn!(stack = %name, error = %e, "previous template unavailable"),
        }
    }
    previous
}

fn cmd_plan(file: &Path, context: &[String], out: &Path, stack_filter: Option<&str>) -> Result<(), String> {
    let config = parse_and_validate(file, context)?;
    let app = stacks::compose(&config)?;
    let assembly = synth::synthesize(&app)?;

    // The previous lock decides Create vs Update vs NoOp
    let lock = state::load_lock(out)?;
    let previous = lock
        .as_ref()
        .map(|l| previous_templates(out, l))
        .unwrap_or_default();
    let plan = planner::plan(&assembly, lock.as_ref(), &previous);

    print_plan(&plan, stack_filter);
    Ok(())
}

/// Display a plan to stdout.
fn print_plan(plan: &types::ExecutionPlan, stack_filter: Option<&str>) {
    println!("Planning: {} ({} resources)", plan.name, plan.changes.len());
    println!();

    let mut current_stack = String::new();
    for change in &plan.changes {
        if stack_filter.is_some_and(|f| change.stack != f) {
            continue;
        }
        if change.stack != current_stack {
            current_stack.clone_from(&change.stack);
            println!("{}:", current_stack);
        }
        let symbol = match change.action {
            types::PlanAction::Create => "+",
            types::PlanAction::Update => "~",
            types::PlanAction::Destroy => "-",
            types::PlanAction::NoOp => " ",
        };
        println!("  {} {}", symbol, change.description);
    }

    println!();
    println!(
        "Plan: {} to add, {} to change, {} to destroy, {} unchanged.",
        plan.to_create, plan.to_update, plan.to_destroy, plan.unchanged
    );
}

fn cmd_list(file: &Path, context: &[String]) -> Result<(), String> {
    let config = parse_and_validate(file, context)?;
    let app = stacks::compose(&config)?;
    let assembly = synth::synthesize(&app)?;

    for (i, wave) in assembly.waves.iter().enumerate() {
        println!("Wave {}:", i + 1);
        for name in wave {
            let Some(s) = assembly.stacks.get(name) else {
                continue;
            };
            let deps = if s.dependencies.is_empty() {
                "-".to_string()
            } else {
                s.dependencies.join(", ")
            };
            println!(
                "  {} [{}] {} resources, depends on: {}",
                name,
                s.environment,
                s.resource_count(),
                deps
            );
            if let Some(stack) = app.stack(name) {
                for export in stack.exports() {
                    println!("    export {}", export);
                }
                for import in stack.imports() {
                    println!("    import {}", import);
                }
            }
        }
    }
    println!();
    println!("Order: {}", assembly.order.join(" -> "));
    Ok(())
}

fn require_lock(out: &Path) -> Result<types::AssemblyLock, String> {
    state::load_lock(out)?.ok_or_else(|| {
        format!(
            "no lock in {}; run `railstack synth` first",
            out.display()
        )
    })
}

fn cmd_verify(out: &Path, tripwire_mode: bool) -> Result<(), String> {
    let lock = require_lock(out)?;
    println!("Checking {} ({} stacks)...", lock.app, lock.stacks.len());
    let findings = drift::detect_drift(out, &lock);

    if findings.is_empty() {
        println!("No drift detected.");
        return Ok(());
    }

    for f in &findings {
        match &f.resource {
            Some(id) => println!("  DRIFTED: {}/{} ({})", f.stack, id, f.detail),
            None => println!("  DRIFTED: {} ({})", f.stack, f.detail),
        }
        println!("    Expected: {}", f.expected_hash);
        println!("    Actual:   {}", f.actual_hash);
    }
    println!();
    println!("Drift detected: {} finding(s)", findings.len());
    if tripwire_mode {
        return Err(format!("{} drift finding(s)", findings.len()));
    }
    Ok(())
}

fn cmd_status(out: &Path) -> Result<(), String> {
    let Some(lock) = state::load_lock(out)? else {
        println!("No lock found. Run `railstack synth` first.");
        return Ok(());
    };

    println!("App: {}", lock.app);
    println!("  Generated: {}", lock.generated_at);
    println!("  Generator: {}", lock.generator);
    println!("  Assembly: {}", lock.assembly_hash);
    println!("  Stacks: {}", lock.stacks.len());
    for (name, sl) in &lock.stacks {
        println!(
            "    {}: {} resources [{}] {}",
            name,
            sl.resources.len(),
            sl.environment,
            sl.hash
        );
    }

    let events = eventlog::read_events(out)?;
    let last = events.iter().rev().find(|e| {
        matches!(
            e.event,
            types::ProvenanceEvent::SynthCompleted { .. } | types::ProvenanceEvent::SynthFailed { .. }
        )
    });
    match last.map(|e| (&e.ts, &e.event)) {
        Some((ts, types::ProvenanceEvent::SynthCompleted { run_id, total_seconds, .. })) => {
            println!("  Last run: {} completed at {} ({:.2}s)", run_id, ts, total_seconds);
        }
        Some((ts, types::ProvenanceEvent::SynthFailed { run_id, error, .. })) => {
            println!("  Last run: {} FAILED at {}: {}", run_id, ts, error);
        }
        _ => {}
    }
    Ok(())
}

fn read_json(path: &Path) -> Result<serde_json::Value, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
    serde_json::from_str(&content).map_err(|e| format!("invalid JSON {}: {}", path.display(), e))
}

fn cmd_assert(template: &Path, expected: &Path, style: MatchStyle) -> Result<(), String> {
    let actual = read_json(template)?;
    let expected_json = read_json(expected)?;
    let mismatches = assertions::match_template(&actual, &expected_json, style);
    if mismatches.is_empty() {
        println!("OK: {} matches ({})", template.display(), style);
        return Ok(());
    }
    for m in &mismatches {
        eprintln!("  ERROR: {}", m);
    }
    Err(format!("{} mismatch(es)", mismatches.len()))
}

fn cmd_schema() -> Result<(), String> {
    let schema = schemars::schema_for!(types::RailstackConfig);
    let json = serde_json::to_string_pretty(&schema)
        .map_err(|e| format!("JSON serialize error: {}", e))?;
    println!("{}", json);
    Ok(())
}
