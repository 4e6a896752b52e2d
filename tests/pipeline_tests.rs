//! End-to-end pipeline runs against recording backends and a temp-dir host.
//!
//! These cover the run-level guarantees: simulation touches nothing, a failed
//! step stops the run and rolls back exactly what the run created, and an
//! interrupt unwinds through the same cleanup.

mod common;

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;

use signal_hook::consts::signal::SIGINT;

use common::{FakeFetcher, Harness, InterruptingFs, DOMAIN, DOWNLOAD_URL};
use lemp_provision::cleanup::{self, CompensatingAction};
use lemp_provision::config::OverwritePolicy;
use lemp_provision::error::{ProvisionError, Result};
use lemp_provision::mode::ExecutionMode;
use lemp_provision::pipeline::{Pipeline, RunOutcome, Step, StepContext};
use lemp_provision::run_state::RunPhase;
use lemp_provision::signals::handle_interrupt;
use lemp_provision::steps::content::DeployContent;
use lemp_provision::steps::database::CreateDatabase;

/// The rollback statement for this run's database (install-mysql drops `test`)
const DROP_WORDPRESS: &str = "DROP DATABASE IF EXISTS `wordpress`";

/// Delivers an interrupt to the run from inside the pipeline, the same way the
/// signal thread would.
struct InterruptHere;

impl Step for InterruptHere {
    fn name(&self) -> &'static str {
        "interrupt"
    }

    fn description(&self) -> &'static str {
        "Deliver SIGINT"
    }

    fn run(&self, ctx: &StepContext<'_>) -> Result<()> {
        let code = handle_interrupt(SIGINT, ctx.state, ctx.tools);
        assert_eq!(code, Some(1), "the signal path owns the rollback");
        Err(ProvisionError::interrupted("SIGINT"))
    }
}

// ============================================================================
// Simulation
// ============================================================================

#[test]
fn test_dry_run_plans_without_side_effects() {
    let h = Harness::new(ExecutionMode::Simulate, OverwritePolicy::Preserve);
    let before = h.host.snapshot();

    let outcome = h.run(&Pipeline::standard());

    assert!(outcome.is_success(), "unexpected outcome: {outcome:?}");
    assert_eq!(outcome.exit_code(), 0);
    assert!(
        h.commands.mutating_calls().is_empty(),
        "simulate spawned: {:?}",
        h.commands.mutating_calls()
    );
    assert_eq!(h.fetcher.downloads(), 0);
    assert_eq!(h.host.snapshot(), before, "host must be untouched");

    let journal = h.tools.journal();
    let web_root = h.host.web_root().display().to_string();
    let site_config = h.host.site_config().display().to_string();
    assert!(journal.mentions(&format!("create directory {web_root}")));
    assert!(journal.mentions(&format!("write file {site_config}")));
    assert!(journal.mentions("apt-get install -y nginx"));
    assert!(journal.mentions(DOWNLOAD_URL));
    assert!(journal.mentions("wp-config.php"));

    let plan = h.config.plan_lines().join("\n");
    assert!(plan.contains(&web_root));
    assert!(plan.contains(&site_config));
    assert!(plan.contains("DRY-RUN"));
}

#[test]
fn test_dry_run_reports_conflicts_like_a_real_run() {
    let h = Harness::new(ExecutionMode::Simulate, OverwritePolicy::Preserve);
    fs::create_dir_all(h.host.web_root()).unwrap();

    let outcome = h.run(&Pipeline::standard());

    match &outcome {
        RunOutcome::Failed { step, error, .. } => {
            assert_eq!(*step, "deploy-content");
            assert!(matches!(error, ProvisionError::ResourceConflict { .. }));
        }
        other => panic!("expected failure, got {other:?}"),
    }
    assert!(h.commands.mutating_calls().is_empty());
    assert!(h.host.web_root().exists());
}

// ============================================================================
// Successful runs
// ============================================================================

#[test]
fn test_perform_run_deploys_site() {
    let h = Harness::new(ExecutionMode::Perform, OverwritePolicy::Preserve);

    let outcome = h.run(&Pipeline::standard());

    assert!(outcome.is_success(), "unexpected outcome: {outcome:?}");
    assert_eq!(outcome.exit_code(), 0);
    assert_eq!(h.state.phase(), RunPhase::Settled);

    let web_root = h.host.web_root();
    assert!(web_root.join("index.php").exists());
    assert!(web_root.join("wp-includes/version.php").exists());
    assert!(!web_root.join("wordpress").exists(), "wrapper dir stripped");

    let wp_config = fs::read_to_string(web_root.join("wp-config.php")).unwrap();
    assert!(wp_config.contains("define( 'DB_NAME', 'wordpress' );"));
    assert!(wp_config.contains("define( 'DB_PASSWORD', 's3cret\\'pw' );"));
    assert!(wp_config.contains("fresh-auth"));
    assert!(!wp_config.contains("put your unique phrase here"));
    let wp_config_path = web_root.join("wp-config.php");
    let mode = fs::metadata(&wp_config_path).unwrap().permissions().mode() & 0o777;
    assert_eq!(mode, 0o640, "credentials file is not world-readable");
    let calls: Vec<String> = h.commands.calls().iter().map(|c| c.display()).collect();
    let tree = calls
        .iter()
        .position(|c| c.contains("-type f -exec chmod 644"))
        .expect("file modes set");
    let narrowed = calls
        .iter()
        .position(|c| *c == format!("chmod 640 {}", wp_config_path.display()))
        .expect("wp-config narrowed");
    assert!(tree < narrowed, "narrowing runs after the tree pass");

    let site = fs::read_to_string(h.host.site_config()).unwrap();
    assert!(site.contains(&format!("server_name {DOMAIN} www.{DOMAIN};")));
    assert_eq!(fs::read_link(h.host.site_link()).unwrap(), h.host.site_config());
    assert!(!h.host.layout.sites_enabled.join("default").exists());

    let php_ini = fs::read_to_string(h.host.php_ini()).unwrap();
    assert!(php_ini.contains("upload_max_filesize = 64M"));
    assert!(php_ini.contains("memory_limit = 256M"));

    assert!(h.commands.ran("CREATE DATABASE IF NOT EXISTS `wordpress`"));
    assert!(h.commands.ran("nginx -t"));
    assert!(h.commands.ran("systemctl reload nginx"));
    assert!(h.commands.ran("systemctl restart php8.1-fpm"));
    assert!(!h.commands.ran("certbot"), "certbot not requested");
    assert!(!h.commands.ran(DROP_WORDPRESS));
    assert_eq!(h.host.scratch_entries(), 0, "scratch removed on success");
}

#[test]
fn test_offline_run_falls_back_to_latest_archive() {
    let h = Harness::with_fetcher(
        ExecutionMode::Perform,
        OverwritePolicy::Preserve,
        FakeFetcher::offline(),
    );

    let outcome = h.run(&Pipeline::standard());

    assert!(outcome.is_success(), "unexpected outcome: {outcome:?}");
    let wp_config = fs::read_to_string(h.host.web_root().join("wp-config.php")).unwrap();
    assert!(wp_config.contains("put your unique phrase here"), "sample salts kept");
    assert_eq!(h.fetcher.downloads(), 1);
}

#[test]
fn test_late_interrupt_after_success_is_ignored() {
    let h = Harness::new(ExecutionMode::Perform, OverwritePolicy::Preserve);
    assert!(h.run(&Pipeline::standard()).is_success());

    assert_eq!(handle_interrupt(SIGINT, &h.state, &h.tools), None);
    assert!(h.host.web_root().join("index.php").exists());
    assert!(h.host.site_config().exists());
    assert!(!h.commands.ran(DROP_WORDPRESS));
}

// ============================================================================
// Conflicts and overwrite
// ============================================================================

#[test]
fn test_existing_web_root_conflict_rolls_back_only_own_work() {
    let h = Harness::new(ExecutionMode::Perform, OverwritePolicy::Preserve);
    let web_root = h.host.web_root();
    fs::create_dir_all(&web_root).unwrap();
    fs::write(web_root.join("keep.html"), "mine").unwrap();

    let outcome = h.run(&Pipeline::standard());

    assert_eq!(outcome.exit_code(), 1);
    let RunOutcome::Failed {
        step,
        error,
        cleanup,
        ..
    } = &outcome
    else {
        panic!("expected failure, got {outcome:?}");
    };
    assert_eq!(*step, "deploy-content");
    assert!(matches!(error, ProvisionError::ResourceConflict { .. }));
    assert!(error.to_string().contains("Use --overwrite to replace."));

    let report = cleanup.as_ref().expect("failure path ran cleanup");
    assert!(report.is_clean());
    assert!(!report
        .attempted
        .iter()
        .any(|a| matches!(a, CompensatingAction::RemovePath(p) if *p == web_root)));

    assert_eq!(fs::read_to_string(web_root.join("keep.html")).unwrap(), "mine");
    assert!(h.commands.ran(DROP_WORDPRESS));
    assert_eq!(h.fetcher.downloads(), 0);
    assert_eq!(h.host.scratch_entries(), 0);
}

#[test]
fn test_overwrite_replaces_existing_web_root() {
    let h = Harness::new(ExecutionMode::Perform, OverwritePolicy::Replace);
    let web_root = h.host.web_root();
    fs::create_dir_all(&web_root).unwrap();
    fs::write(web_root.join("stale.html"), "old").unwrap();

    let outcome = h.run(&Pipeline::standard());

    assert!(outcome.is_success(), "unexpected outcome: {outcome:?}");
    assert!(!web_root.join("stale.html").exists());
    assert!(web_root.join("index.php").exists());
}

#[test]
fn test_existing_database_without_overwrite_is_left_alone() {
    let h = Harness::new(ExecutionMode::Perform, OverwritePolicy::Preserve);
    h.commands.database_exists("wordpress");

    let outcome = h.run(&Pipeline::standard());

    match &outcome {
        RunOutcome::Failed { step, error, .. } => {
            assert_eq!(*step, "create-database");
            assert_eq!(
                error.to_string(),
                "Database wordpress already exists. Use --overwrite to replace."
            );
        }
        other => panic!("expected failure, got {other:?}"),
    }
    assert!(!h.commands.ran(DROP_WORDPRESS), "pre-existing database kept");
    assert!(!h.commands.ran("CREATE DATABASE"));
}

#[test]
fn test_existing_database_user_without_overwrite_is_left_alone() {
    let h = Harness::new(ExecutionMode::Perform, OverwritePolicy::Preserve);
    h.commands.user_exists("wpuser");

    let outcome = h.run(&Pipeline::standard());

    match &outcome {
        RunOutcome::Failed { step, error, .. } => {
            assert_eq!(*step, "create-database");
            assert!(matches!(error, ProvisionError::ResourceConflict { .. }));
            assert_eq!(
                error.to_string(),
                "Database user wpuser already exists. Use --overwrite to replace."
            );
        }
        other => panic!("expected failure, got {other:?}"),
    }
    assert!(!h.commands.ran("DROP USER"), "pre-existing account kept");
    assert!(!h.commands.ran("CREATE USER"));
    assert!(!h.state.ledger().database_created);
}

#[test]
fn test_existing_database_user_with_overwrite_is_recreated() {
    let h = Harness::new(ExecutionMode::Perform, OverwritePolicy::Replace);
    h.commands.user_exists("wpuser");

    let outcome = h.run(&Pipeline::standard());

    assert!(outcome.is_success(), "unexpected outcome: {outcome:?}");
    let calls: Vec<String> = h.commands.calls().iter().map(|c| c.display()).collect();
    let dropped = calls.iter().position(|c| c.contains("DROP USER")).expect("dropped");
    let created = calls.iter().position(|c| c.contains("CREATE USER")).expect("created");
    assert!(dropped < created);
}

#[test]
fn test_existing_database_with_overwrite_is_recreated() {
    let h = Harness::new(ExecutionMode::Perform, OverwritePolicy::Replace);
    h.commands.database_exists("wordpress");

    let outcome = h.run(&Pipeline::standard());

    assert!(outcome.is_success(), "unexpected outcome: {outcome:?}");
    let calls: Vec<String> = h.commands.calls().iter().map(|c| c.display()).collect();
    let dropped = calls.iter().position(|c| c.contains(DROP_WORDPRESS)).expect("dropped");
    let created = calls.iter().position(|c| c.contains("CREATE DATABASE")).expect("created");
    assert!(dropped < created);
}

#[test]
fn test_replaced_site_config_is_restored_on_failure() {
    let h = Harness::new(ExecutionMode::Perform, OverwritePolicy::Replace);
    fs::write(h.host.site_config(), "# previous site\n").unwrap();
    h.commands.fail_on("nginx -t", 1, "nginx: [emerg] unexpected end of file");

    let outcome = h.run(&Pipeline::standard());

    let RunOutcome::Failed { step, error, .. } = &outcome else {
        panic!("expected failure, got {outcome:?}");
    };
    assert_eq!(*step, "configure-web-server");
    assert_eq!(error.diagnostics(), Some("nginx: [emerg] unexpected end of file"));

    assert_eq!(
        fs::read_to_string(h.host.site_config()).unwrap(),
        "# previous site\n"
    );
    let leftovers: Vec<_> = fs::read_dir(&h.host.layout.sites_available)
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    assert_eq!(leftovers.len(), 1, "backup moved back: {leftovers:?}");
    assert!(fs::symlink_metadata(h.host.site_link()).is_err());
    assert!(!h.host.web_root().exists());
    assert!(h.commands.ran(DROP_WORDPRESS));
}

// ============================================================================
// Failure handling
// ============================================================================

#[test]
fn test_failure_stops_later_steps_and_cleans_up_once() {
    let h = Harness::new(ExecutionMode::Perform, OverwritePolicy::Preserve);
    h.commands.fail_on("mysql-server", 100, "E: Unable to locate package mysql-server");

    let outcome = h.run(&Pipeline::standard());

    let RunOutcome::Failed {
        index,
        step,
        error,
        cleanup,
    } = &outcome
    else {
        panic!("expected failure, got {outcome:?}");
    };
    assert_eq!(*index, 2);
    assert_eq!(*step, "install-mysql");
    assert!(matches!(
        error,
        ProvisionError::CommandFailed {
            exit_code: Some(100),
            ..
        }
    ));
    assert!(error.diagnostics().unwrap().contains("Unable to locate package"));
    assert!(cleanup.as_ref().expect("cleanup ran").attempted.is_empty());

    assert!(!h.commands.ran("php8.1-fpm"));
    assert!(!h.commands.ran("CREATE DATABASE"));
    assert_eq!(h.fetcher.downloads(), 0);

    assert_eq!(h.state.phase(), RunPhase::RollingBack);
    assert!(cleanup::run_once(&h.config, &h.state, &h.tools).is_none());
}

#[test]
fn test_cleanup_actions_are_independent() {
    let h = Harness::new(ExecutionMode::Perform, OverwritePolicy::Preserve);
    h.commands.fail_on("nginx -t", 1, "nginx: configuration file test failed");
    h.commands.fail_on(DROP_WORDPRESS, 1, "ERROR 2002: Can't connect");

    let outcome = h.run(&Pipeline::standard());

    let RunOutcome::Failed { error, cleanup, .. } = &outcome else {
        panic!("expected failure, got {outcome:?}");
    };
    assert!(
        error.to_string().contains("nginx -t"),
        "original error not masked: {error}"
    );
    let report = cleanup.as_ref().expect("cleanup ran");
    assert_eq!(report.failures.len(), 1);
    assert!(matches!(report.failures[0].0, CompensatingAction::DropDatabase(_)));

    assert!(!h.host.web_root().exists());
    assert!(!h.host.site_config().exists());
    assert!(fs::symlink_metadata(h.host.site_link()).is_err());
    assert_eq!(h.host.scratch_entries(), 0);

    let ledger = h.state.ledger();
    assert!(ledger.created_paths.is_empty());
    assert!(ledger.temp_dirs.is_empty());
    assert!(ledger.database_created, "failed drop stays on record");
}

// ============================================================================
// Interrupts
// ============================================================================

#[test]
fn test_interrupt_after_database_creation() {
    let h = Harness::new(ExecutionMode::Perform, OverwritePolicy::Preserve);
    let pipeline = Pipeline::new(vec![
        Box::new(CreateDatabase),
        Box::new(InterruptHere),
        Box::new(DeployContent),
    ]);

    let outcome = h.run(&pipeline);

    assert_eq!(outcome.exit_code(), 1);
    match &outcome {
        RunOutcome::Interrupted { step, cleanup } => {
            assert_eq!(*step, Some("interrupt"));
            assert!(cleanup.is_none(), "signal path already rolled back");
        }
        other => panic!("expected interrupt, got {other:?}"),
    }
    assert_eq!(h.commands.count(DROP_WORDPRESS), 1);
    assert!(!h.host.web_root().exists());
    assert_eq!(h.host.scratch_entries(), 0);
    assert_eq!(h.fetcher.downloads(), 0, "deployment never started");
}

#[test]
fn test_interrupt_after_deployment_removes_web_root_and_scratch() {
    let h = Harness::new(ExecutionMode::Perform, OverwritePolicy::Preserve);
    let pipeline = Pipeline::new(vec![
        Box::new(CreateDatabase),
        Box::new(DeployContent),
        Box::new(InterruptHere),
    ]);

    let outcome = h.run(&pipeline);

    assert!(matches!(outcome, RunOutcome::Interrupted { .. }));
    assert!(!h.host.web_root().exists());
    assert_eq!(h.host.scratch_entries(), 0);
    assert!(h.commands.ran(DROP_WORDPRESS));
    assert!(h.state.ledger().temp_dirs.is_empty());
}

#[test]
fn test_interrupt_from_another_thread_mid_copy_waits_for_the_copy() {
    let files = InterruptingFs::new();
    let h = Harness::with_files(ExecutionMode::Perform, OverwritePolicy::Preserve, files.clone());
    files.arm(Arc::clone(&h.state), h.tools.clone());

    let outcome = h.run(&Pipeline::standard());
    let signal_exit = files.join();

    assert_eq!(outcome.exit_code(), 1);
    let RunOutcome::Interrupted { step, cleanup } = &outcome else {
        panic!("expected interrupt, got {outcome:?}");
    };
    assert_eq!(*step, Some("deploy-content"));
    // Exactly one side ran the rollback
    assert!(cleanup.is_some() != signal_exit.is_some());

    assert!(!files.rolled_back_mid_copy(), "rollback overlapped an in-flight copy");
    assert_eq!(files.late_copies(), 0, "copy resumed after the interrupt");
    assert_eq!(h.commands.count(DROP_WORDPRESS), 1);

    let ledger = h.state.ledger();
    assert!(ledger.created_paths.is_empty());
    assert!(ledger.temp_dirs.is_empty());
    assert!(!h.host.web_root().exists(), "web root left behind after rollback");
    assert_eq!(h.host.scratch_entries(), 0);
    assert!(!h.host.site_config().exists(), "later steps never ran");
}

#[test]
fn test_halted_run_refuses_forward_effects() {
    let h = Harness::new(ExecutionMode::Perform, OverwritePolicy::Preserve);
    h.state.halt();

    let err = h
        .tools
        .files
        .create_dir_all(&h.host.web_root())
        .expect_err("gate closed");
    assert!(err.is_interrupted());

    let outcome = h.run(&Pipeline::standard());
    match &outcome {
        RunOutcome::Interrupted { step, .. } => assert_eq!(*step, Some("update-system")),
        other => panic!("expected interrupt, got {other:?}"),
    }
    assert!(h.commands.mutating_calls().is_empty());
    assert!(!h.host.web_root().exists());
}
