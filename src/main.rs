//! LEMP Provisioner - Main entry point
//!
//! Resolves the run configuration, shows the plan, and drives the step
//! pipeline. The process exit status reflects the run outcome.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use dialoguer::Confirm;
use tracing::{debug, error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use lemp_provision::cli::Cli;
use lemp_provision::config::Configuration;
use lemp_provision::host_check::{detect_php_version, ensure_root};
use lemp_provision::pipeline::{Pipeline, RunOutcome};
use lemp_provision::run_state::RunState;
use lemp_provision::signals::install_interrupt_handler;
use lemp_provision::toolkit::Toolkit;
use lemp_provision::CleanupReport;

/// Initialize tracing with `info` by default, `debug` with --verbose.
///
/// `RUST_LOG` overrides both.
fn init_logger(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .init();
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logger(cli.verbose);
    info!("LEMP provisioner starting up");

    let mode = cli.mode();
    let state = Arc::new(RunState::new(mode, cli.overwrite_policy()));
    let tools = Toolkit::system(&state);
    install_interrupt_handler(Arc::clone(&state), tools.clone())
        .context("Failed to register signal handlers")?;
    debug!("Signal handlers initialized");

    let layout = cli.load_layout().context("Failed to load layout file")?;
    if let Some(path) = &cli.save_layout {
        layout
            .save_to_file(path)
            .with_context(|| format!("Failed to save layout to {}", path.display()))?;
        println!("✓ Layout saved to {}", path.display());
        return Ok(());
    }

    ensure_root(mode)?;

    let php_version = detect_php_version(&tools.commands);
    let config = Arc::new(Configuration::resolve(cli.parameters(layout), php_version)?);
    debug!(config = ?config, "configuration resolved");

    print_plan(&config);
    if mode.is_perform() && !cli.yes {
        let proceed = Confirm::new()
            .with_prompt("Proceed with installation?")
            .default(false)
            .interact()
            .context("Failed to read confirmation")?;
        if !proceed {
            println!("Aborted by user.");
            return Ok(());
        }
    }

    state.activate(Arc::clone(&config))?;

    let outcome = Pipeline::standard().run(&config, &state, &tools);
    print_summary(&config, &tools, &outcome);
    std::process::exit(outcome.exit_code());
}

fn print_plan(config: &Configuration) {
    println!("========================================");
    println!("Planned configuration:");
    for line in config.plan_lines() {
        println!("  {}", line);
    }
    println!("========================================");
}

fn print_summary(config: &Configuration, tools: &Toolkit, outcome: &RunOutcome) {
    match outcome {
        RunOutcome::Completed { steps, duration } => {
            if config.mode.is_simulate() {
                println!(
                    "\n✓ Dry run complete: {} step(s), {} effect(s) described, nothing changed.",
                    steps,
                    tools.journal().len()
                );
                println!("  Re-run with --execute to apply.");
            } else {
                println!(
                    "\n✓ Installation completed in {:.1}s ({} step(s))",
                    duration.as_secs_f64(),
                    steps
                );
                let scheme = if config.certbot { "https" } else { "http" };
                println!("  Visit {}://{} to finish the WordPress setup.", scheme, config.domain);
            }
        }
        RunOutcome::Failed {
            index,
            step,
            error,
            cleanup,
        } => {
            error!("Step {} ({}) failed: {}", index + 1, step, error);
            eprintln!("\n✗ Step '{}' failed: {}", step, error);
            if let Some(diagnostics) = error.diagnostics() {
                eprintln!("  Output:\n{}", diagnostics.trim_end());
            }
            report_cleanup(cleanup.as_ref());
        }
        RunOutcome::Interrupted { step, cleanup } => {
            match step {
                Some(step) => eprintln!("\n✗ Interrupted during '{}'", step),
                None => eprintln!("\n✗ Interrupted"),
            }
            report_cleanup(cleanup.as_ref());
        }
    }
}

fn report_cleanup(report: Option<&CleanupReport>) {
    let Some(report) = report else {
        return;
    };
    if report.is_clean() {
        eprintln!("  Rolled back {} action(s).", report.attempted.len());
        return;
    }
    eprintln!(
        "  Rollback incomplete: {} of {} action(s) failed:",
        report.failures.len(),
        report.attempted.len()
    );
    for (action, err) in &report.failures {
        eprintln!("    - {}: {}", action, err);
    }
}
