//! Integration tests for sdp
//!
//! These drive the built binary against throwaway project directories.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

/// Helper to create an sdp Command
fn sdp() -> Command {
    cargo_bin_cmd!("sdp")
}

fn write(root: &Path, rel: &str, body: &str) {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, body).unwrap();
}

/// Helper to create a project with two F016 workstreams in the backlog.
/// Retries are turned off so git failures outside a repository stay quick.
fn create_temp_project() -> TempDir {
    let dir = TempDir::new().unwrap();
    write(
        dir.path(),
        "docs/workstreams/backlog/00-016-01-parser.md",
        "---\nws_id: 00-016-01\ntitle: Parser\n---\n# Parser\n\nWrite the parser.\n",
    );
    write(
        dir.path(),
        "docs/workstreams/backlog/00-016-02-printer.md",
        "---\nws_id: 00-016-02\ntitle: Printer\n---\n# Printer\n",
    );
    write(
        dir.path(),
        ".sdp/config.toml",
        "[resilience]\nmax_attempts = 1\n",
    );
    dir
}

fn orchestrate(dir: &TempDir) -> Command {
    let mut cmd = sdp();
    cmd.arg("--project-dir")
        .arg(dir.path())
        .arg("orchestrate")
        .arg("--feature")
        .arg("F016");
    cmd
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_sdp_help() {
        sdp()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("orchestrate"));
    }

    #[test]
    fn test_sdp_version() {
        sdp().arg("--version").assert().success();
    }

    #[test]
    fn test_result_requires_advance() {
        let dir = create_temp_project();
        orchestrate(&dir)
            .arg("--result")
            .arg("abc1234")
            .assert()
            .failure()
            .code(1)
            .stderr(predicate::str::contains("--advance"));
    }

    #[test]
    fn test_modes_are_exclusive() {
        let dir = create_temp_project();
        orchestrate(&dir)
            .arg("--status")
            .arg("--hydrate")
            .assert()
            .failure()
            .code(1);
    }

    #[test]
    fn test_unknown_subcommand_exits_one() {
        sdp()
            .arg("deploy")
            .assert()
            .failure()
            .code(1)
            .stderr(predicate::str::contains("deploy"));
    }

    #[test]
    fn test_help_and_version_exit_zero() {
        sdp().args(["orchestrate", "--help"]).assert().code(0);
        sdp().arg("--version").assert().code(0);
    }

    #[test]
    fn test_missing_project_dir_fails() {
        let dir = create_temp_project();
        sdp()
            .arg("--project-dir")
            .arg(dir.path().join("nope"))
            .arg("orchestrate")
            .arg("--feature")
            .arg("F016")
            .assert()
            .failure();
    }
}

// =============================================================================
// Orchestration Tests
// =============================================================================

mod orchestration {
    use super::*;

    #[test]
    fn test_walks_feature_into_review() {
        let dir = create_temp_project();

        orchestrate(&dir)
            .arg("--next-action")
            .assert()
            .success()
            .stdout(predicate::str::contains(r#""action":"build""#))
            .stdout(predicate::str::contains(r#""ws_id":"00-016-01""#));

        orchestrate(&dir)
            .arg("--advance")
            .arg("--result")
            .arg("abc1234")
            .assert()
            .success()
            .stderr(predicate::str::contains("advanced"));

        orchestrate(&dir)
            .arg("--resume")
            .assert()
            .success()
            .stdout(predicate::str::contains(r#""ws_id":"00-016-02""#));

        orchestrate(&dir)
            .arg("--advance")
            .arg("--result")
            .arg("def5678")
            .arg("--resume")
            .assert()
            .success();

        orchestrate(&dir)
            .arg("--resume")
            .assert()
            .success()
            .stdout(predicate::str::contains(r#""action":"review""#))
            .stdout(predicate::str::contains(r#""feature_id":"F016""#));

        assert!(dir.path().join(".sdp/checkpoints/F016.json").exists());
    }

    #[test]
    fn test_resume_without_checkpoint_fails() {
        let dir = create_temp_project();
        orchestrate(&dir)
            .arg("--resume")
            .assert()
            .failure()
            .code(1)
            .stderr(predicate::str::contains("error"));

        assert!(!dir.path().join(".sdp/checkpoints/F016.json").exists());
    }

    #[test]
    fn test_invalid_feature_id_fails() {
        let dir = create_temp_project();
        sdp()
            .arg("--project-dir")
            .arg(dir.path())
            .arg("orchestrate")
            .arg("--feature")
            .arg("../F016")
            .assert()
            .failure()
            .code(1);
    }

    #[test]
    fn test_advance_rejects_wrong_result_kind() {
        let dir = create_temp_project();
        orchestrate(&dir).assert().success();

        orchestrate(&dir)
            .arg("--advance")
            .arg("--result")
            .arg("approved")
            .assert()
            .failure()
            .code(1);
    }

    #[test]
    fn test_checkpoint_dir_override() {
        let dir = create_temp_project();
        let store = TempDir::new().unwrap();

        orchestrate(&dir)
            .arg("--checkpoint-dir")
            .arg(store.path())
            .assert()
            .success();

        assert!(store.path().join("F016.json").exists());
        assert!(!dir.path().join(".sdp/checkpoints/F016.json").exists());
    }

    #[test]
    fn test_hydrate_prints_workstream_brief() {
        let dir = create_temp_project();
        orchestrate(&dir)
            .arg("--hydrate")
            .assert()
            .success()
            .stdout(predicate::str::contains("Parser"))
            .stdout(predicate::str::contains("00-016-01"));
    }

    #[test]
    fn test_status_after_first_action() {
        let dir = create_temp_project();
        orchestrate(&dir).assert().success();

        orchestrate(&dir)
            .arg("--status")
            .assert()
            .success()
            .stdout(predicate::str::contains(r#""resumable": true"#))
            .stdout(predicate::str::contains(r#""workstreams_total": 2"#));
    }
}

// =============================================================================
// Policy Tests
// =============================================================================

mod policy {
    use super::*;

    #[test]
    fn test_eval_without_policies_is_empty_advisory() {
        let dir = create_temp_project();
        sdp()
            .arg("--project-dir")
            .arg(dir.path())
            .arg("policy")
            .arg("eval")
            .arg("--feature")
            .arg("F016")
            .arg("--phase")
            .arg("build")
            .assert()
            .success()
            .stdout(predicate::str::contains(
                r#"{"denials":[],"warnings":[],"level":"advisory"}"#,
            ));
    }

    #[test]
    fn test_eval_rejects_unknown_phase() {
        let dir = create_temp_project();
        sdp()
            .arg("--project-dir")
            .arg(dir.path())
            .arg("policy")
            .arg("eval")
            .arg("--feature")
            .arg("F016")
            .arg("--phase")
            .arg("deploy")
            .assert()
            .failure();
    }
}

// =============================================================================
// Decision Log Tests
// =============================================================================

mod decisions {
    use super::*;

    fn decisions(dir: &TempDir) -> Command {
        let mut cmd = sdp();
        cmd.arg("--project-dir").arg(dir.path()).arg("decisions");
        cmd
    }

    #[test]
    fn test_log_then_list() {
        let dir = create_temp_project();

        decisions(&dir)
            .args(["log", "--type", "technical"])
            .args(["--question", "Which parser?"])
            .args(["--decision", "Hand-written recursive descent"])
            .args(["--rationale", "Better errors"])
            .args(["--alternatives", "pest,nom"])
            .args(["--feature", "F016"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Logged"));

        decisions(&dir)
            .args(["log", "--type", "tradeoff"])
            .args(["--question", "Cache results?"])
            .args(["--decision", "No"])
            .assert()
            .success();

        decisions(&dir)
            .arg("list")
            .assert()
            .success()
            .stdout(predicate::str::contains("Which parser?"))
            .stdout(predicate::str::contains("Cache results?"));

        decisions(&dir)
            .args(["list", "--feature", "F016", "--json"])
            .assert()
            .success()
            .stdout(predicate::str::contains("recursive descent"))
            .stdout(predicate::str::contains("Cache results?").not());

        decisions(&dir)
            .args(["list", "--search", "CACHE"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Cache results?"))
            .stdout(predicate::str::contains("Which parser?").not());

        let raw = fs::read_to_string(dir.path().join("docs/decisions/decisions.jsonl")).unwrap();
        assert_eq!(raw.lines().count(), 2);
    }

    #[test]
    fn test_log_rejects_unknown_type() {
        let dir = create_temp_project();
        decisions(&dir)
            .args(["log", "--type", "whim"])
            .args(["--question", "q"])
            .args(["--decision", "d"])
            .assert()
            .failure();
    }

    #[test]
    fn test_list_empty_log() {
        let dir = create_temp_project();
        decisions(&dir)
            .arg("list")
            .assert()
            .success()
            .stdout(predicate::str::contains("No decisions recorded"));
    }
}

// =============================================================================
// Session Tests
// =============================================================================

mod session {
    use super::*;

    fn session(dir: &TempDir) -> Command {
        let mut cmd = sdp();
        cmd.arg("--project-dir").arg(dir.path()).arg("session");
        cmd
    }

    #[test]
    fn test_init_then_show() {
        let dir = create_temp_project();

        session(&dir)
            .args(["init", "--feature", "F016"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Created"));

        session(&dir)
            .arg("show")
            .assert()
            .success()
            .stdout(predicate::str::contains(r#""feature_id": "F016""#));
    }

    #[test]
    fn test_init_refuses_overwrite_without_force() {
        let dir = create_temp_project();
        session(&dir)
            .args(["init", "--feature", "F016"])
            .assert()
            .success();

        session(&dir)
            .args(["init", "--feature", "F017"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("--force"));

        session(&dir)
            .args(["init", "--feature", "F017", "--force"])
            .assert()
            .success();
    }

    #[test]
    fn test_tampered_session_is_rejected() {
        let dir = create_temp_project();
        session(&dir)
            .args(["init", "--feature", "F016"])
            .assert()
            .success();

        let path = dir.path().join(".sdp/session.json");
        let raw = fs::read_to_string(&path).unwrap();
        fs::write(&path, raw.replace("F016", "F099")).unwrap();

        session(&dir).arg("show").assert().failure().code(1);
    }

    #[test]
    fn test_session_for_other_feature_blocks_orchestration() {
        let dir = create_temp_project();
        session(&dir)
            .args(["init", "--feature", "F017"])
            .assert()
            .success();

        orchestrate(&dir).assert().success();

        orchestrate(&dir)
            .arg("--advance")
            .arg("--result")
            .arg("abc1234")
            .assert()
            .failure()
            .stderr(predicate::str::contains("pinned to F017"));
    }
}

// =============================================================================
// Checkpoint Tests
// =============================================================================

mod checkpoint {
    use super::*;

    fn checkpoint(dir: &TempDir) -> Command {
        let mut cmd = sdp();
        cmd.arg("--project-dir").arg(dir.path()).arg("checkpoint");
        cmd
    }

    #[test]
    fn test_list_shows_phase_and_progress() {
        let dir = create_temp_project();
        orchestrate(&dir).assert().success();
        orchestrate(&dir)
            .arg("--advance")
            .arg("--result")
            .arg("abc1234")
            .assert()
            .success();

        checkpoint(&dir)
            .arg("list")
            .assert()
            .success()
            .stdout(predicate::str::contains("F016"))
            .stdout(predicate::str::contains("build"))
            .stdout(predicate::str::contains("1/2"));

        checkpoint(&dir)
            .args(["list", "--json"])
            .assert()
            .success()
            .stdout(predicate::str::contains(r#""feature_id":"F016""#))
            .stdout(predicate::str::contains(r#""completed":1"#));
    }

    #[test]
    fn test_list_without_checkpoints() {
        let dir = create_temp_project();
        checkpoint(&dir)
            .arg("list")
            .assert()
            .success()
            .stdout(predicate::str::contains("No checkpoints"));
    }
}
