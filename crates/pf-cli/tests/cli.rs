//! CLI command integration tests.
//! Each test uses a temp directory via PF_DATA_DIR for full isolation.

use std::path::PathBuf;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

const FUSION_JSON: &str = r#"{
    "task": "fuse two passes",
    "template": "for x in items:\n    scale(x)\nfor y in items:\n    clamp(y)\n"
}"#;

fn pf_cmd(data_dir: &TempDir) -> Command {
    #[allow(deprecated)]
    let mut cmd = Command::cargo_bin("pf").unwrap();
    cmd.env("PF_DATA_DIR", data_dir.path());
    cmd
}

fn write_input(dir: &TempDir, name: &str, body: &str) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, body).unwrap();
    path
}

/// Run `synth --save` and return the saved run id.
fn save_fusion_run(dir: &TempDir) -> String {
    let input = write_input(dir, "fusion.json", FUSION_JSON);
    let output = pf_cmd(dir)
        .args(["synth", "--save"])
        .arg(&input)
        .output()
        .unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    stdout
        .lines()
        .find_map(|l| l.strip_prefix("saved run "))
        .expect("saved run line")
        .trim()
        .to_string()
}

#[test]
fn catalog_lists_atoms() {
    let dir = TempDir::new().unwrap();
    pf_cmd(&dir)
        .arg("catalog")
        .assert()
        .success()
        .stdout(predicate::str::contains("PAR_DISPATCH"))
        .stdout(predicate::str::contains("OPAQUE"));
}

#[test]
fn catalog_json() {
    let dir = TempDir::new().unwrap();
    let output = pf_cmd(&dir).args(["catalog", "--json"]).output().unwrap();
    assert!(output.status.success());
    let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(value.as_array().unwrap().len(), 12);
}

#[test]
fn synth_fuses_loops() {
    let dir = TempDir::new().unwrap();
    let input = write_input(&dir, "fusion.json", FUSION_JSON);
    pf_cmd(&dir)
        .arg("synth")
        .arg(&input)
        .assert()
        .success()
        .stdout(predicate::str::contains("for x in items:\n    y = x\n"))
        .stdout(predicate::str::contains("generations: 1"))
        .stdout(predicate::str::contains("termination: converged"));
}

#[test]
fn synth_reads_toml() {
    let dir = TempDir::new().unwrap();
    let input = write_input(
        &dir,
        "fusion.toml",
        "task = \"fuse from toml\"\nquality = \"fast_compile\"\ntemplate = \"\"\"\nfor x in items:\n    scale(x)\nfor y in items:\n    clamp(y)\n\"\"\"\n",
    );
    pf_cmd(&dir)
        .arg("synth")
        .arg(&input)
        .assert()
        .success()
        .stdout(predicate::str::contains("task:        fuse from toml"));
}

#[test]
fn synth_json_output() {
    let dir = TempDir::new().unwrap();
    let input = write_input(&dir, "fusion.json", FUSION_JSON);
    let output = pf_cmd(&dir)
        .args(["synth", "--json"])
        .arg(&input)
        .output()
        .unwrap();
    assert!(output.status.success());
    let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(value["version"], "1.0");
    assert_eq!(value["generations"], 1);
    assert!(value.get("finalEnergy").is_some());
}

#[test]
fn synth_empty_task_fails() {
    let dir = TempDir::new().unwrap();
    let input = write_input(&dir, "empty.json", r#"{"task": "   "}"#);
    pf_cmd(&dir)
        .arg("synth")
        .arg(&input)
        .assert()
        .failure()
        .stderr(predicate::str::contains("task is empty"));
}

#[test]
fn synth_unknown_target_fails() {
    let dir = TempDir::new().unwrap();
    let input = write_input(&dir, "bad.json", r#"{"task": "t", "target": "cobol"}"#);
    pf_cmd(&dir)
        .arg("synth")
        .arg(&input)
        .assert()
        .failure()
        .stderr(predicate::str::contains("cobol"));
}

#[test]
fn synth_zero_generations() {
    let dir = TempDir::new().unwrap();
    let input = write_input(&dir, "fusion.json", FUSION_JSON);
    pf_cmd(&dir)
        .args(["synth", "--max-generations", "0"])
        .arg(&input)
        .assert()
        .success()
        .stdout(predicate::str::contains("generations: 0"))
        .stdout(predicate::str::contains("budget exhausted (generations)"));
}

#[test]
fn runs_fresh_db() {
    let dir = TempDir::new().unwrap();
    pf_cmd(&dir)
        .arg("runs")
        .assert()
        .success()
        .stdout(predicate::str::contains("no runs"));
}

#[test]
fn save_then_list_explain_replay() {
    let dir = TempDir::new().unwrap();
    let id = save_fusion_run(&dir);

    pf_cmd(&dir)
        .arg("runs")
        .assert()
        .success()
        .stdout(predicate::str::contains(&id[..8]))
        .stdout(predicate::str::contains("fuse two passes"));

    pf_cmd(&dir)
        .args(["explain", &id[..8]])
        .assert()
        .success()
        .stdout(predicate::str::contains("loop-fusion (#1)"));

    pf_cmd(&dir)
        .args(["replay", &id])
        .assert()
        .success()
        .stdout(predicate::str::contains("replay ok: 1 generations"));
}

#[test]
fn replay_uses_recorded_core_count() {
    let dir = TempDir::new().unwrap();
    let input = write_input(
        &dir,
        "spread.json",
        r#"{"task": "spread", "template": "map x in data:\n    f(x)\n"}"#,
    );
    let output = pf_cmd(&dir)
        .args(["synth", "--save", "--cores", "8"])
        .arg(&input)
        .output()
        .unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    let id = stdout
        .lines()
        .find_map(|l| l.strip_prefix("saved run "))
        .expect("saved run line")
        .trim()
        .to_string();

    pf_cmd(&dir)
        .args(["replay", &id])
        .assert()
        .success()
        .stdout(predicate::str::contains("replay ok"));

    pf_cmd(&dir)
        .args(["replay", &id, "--cores", "2"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("replay failed"));
}

#[test]
fn explain_unknown_run_fails() {
    let dir = TempDir::new().unwrap();
    pf_cmd(&dir)
        .args(["explain", "deadbeef"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("run not found"));
}

#[test]
fn export_then_import() {
    let dir = TempDir::new().unwrap();
    let id = save_fusion_run(&dir);
    let path = dir.path().join("run.json");

    pf_cmd(&dir)
        .args(["export", &id])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("exported"));

    pf_cmd(&dir)
        .arg("import")
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("imported"));

    let output = pf_cmd(&dir).arg("runs").output().unwrap();
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(stdout.lines().count(), 2);
}

#[test]
fn data_dir_flag_overrides_env() {
    let env_dir = TempDir::new().unwrap();
    let flag_dir = TempDir::new().unwrap();
    save_fusion_run(&env_dir);

    pf_cmd(&env_dir)
        .arg("--data-dir")
        .arg(flag_dir.path())
        .arg("runs")
        .assert()
        .success()
        .stdout(predicate::str::contains("no runs"));
}
