#![allow(deprecated)]
use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

const CONFIG: &str = r#"
account: "111122223333"
default_region: eu-west-1
tasks:
  - name: nightly
    action: delay
    interval: "0 2 * * ? *"
    max_concurrency: 1
    parameters:
      minutes: 0
  - name: tag-prod
    action: noop
    tag_filter: "Env=Prod"
    regions: [eu-west-1]
    events:
      aws.tag:
        Tag Change on Resource: [CreateTags]
"#;

fn opsrun(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("opsrun").unwrap();
    cmd.current_dir(dir.path())
        .env("OPSRUN_CONFIG", dir.path().join("opsrun.yaml"))
        .env_remove("RUST_LOG");
    cmd
}

fn with_config(yaml: &str) -> TempDir {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("opsrun.yaml"), yaml).unwrap();
    dir
}

fn json_output(cmd: &mut Command) -> serde_json::Value {
    let out = cmd.arg("--json").assert().success().get_output().stdout.clone();
    serde_json::from_slice(&out).unwrap()
}

// ---------------------------------------------------------------------------
// opsrun init / validate
// ---------------------------------------------------------------------------

#[test]
fn init_writes_a_valid_default_config() {
    let dir = TempDir::new().unwrap();
    opsrun(&dir)
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("created"));
    assert!(dir.path().join("opsrun.yaml").exists());

    opsrun(&dir)
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("exists"));
    opsrun(&dir).arg("validate").assert().success();
}

#[test]
fn commands_without_config_point_at_init() {
    let dir = TempDir::new().unwrap();
    opsrun(&dir)
        .arg("instances")
        .assert()
        .failure()
        .stderr(predicate::str::contains("opsrun init"));
}

#[test]
fn validate_rejects_bad_cron() {
    let dir = with_config("tasks:\n  - name: broken\n    action: noop\n    interval: \"0 25 * * *\"\n");
    opsrun(&dir)
        .arg("validate")
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid task definitions"));
}

#[test]
fn validate_reports_warnings() {
    let dir = with_config("tasks:\n  - name: idle\n    action: noop\n    enabled: false\n");
    let value = json_output(opsrun(&dir).arg("validate"));
    assert_eq!(value["tasks"], 1);
    let warnings = value["warnings"].as_array().unwrap();
    assert!(warnings.iter().any(|w| w["level"] == "warning"
        && w["message"].as_str().unwrap().contains("disabled")));
}

// ---------------------------------------------------------------------------
// opsrun tick / complete
// ---------------------------------------------------------------------------

#[test]
fn nightly_runs_one_at_a_time_across_ticks() {
    let dir = with_config(CONFIG);

    let first = json_output(opsrun(&dir).args(["tick", "--at", "2024-05-01T02:00:30Z"]));
    assert_eq!(first["tick"]["created"].as_array().unwrap().len(), 1);
    let dispatched = first["dispatch"]["dispatched"].as_array().unwrap();
    assert_eq!(dispatched[0]["status"], "wait-for-completion");

    // The same minute again is a no-op.
    let again = json_output(opsrun(&dir).args(["tick", "--at", "2024-05-01T02:00:50Z"]));
    assert!(again["tick"]["created"].as_array().unwrap().is_empty());
    assert_eq!(again["tick"]["skipped"][0], "nightly");

    // A manual run while the first is still waiting queues behind it.
    let second = json_output(opsrun(&dir).args(["fire", "nightly", "--at", "2024-05-01T02:00:40Z"]));
    assert_eq!(second["created"][0]["status"], "waiting");
    assert!(second["dispatch"]["dispatched"].as_array().unwrap().is_empty());

    let done = json_output(opsrun(&dir).args(["complete", "--at", "2024-05-01T02:01:00Z"]));
    assert_eq!(done["completion"]["completed"], 1);
    assert_eq!(done["completion"]["promoted"].as_array().unwrap().len(), 1);
    assert_eq!(
        done["dispatch"]["dispatched"][0]["status"],
        "wait-for-completion"
    );

    let completed = json_output(opsrun(&dir).args(["instances", "--status", "completed"]));
    assert_eq!(completed.as_array().unwrap().len(), 1);
}

#[test]
fn fire_runs_a_task_on_demand() {
    let dir = with_config(CONFIG);
    opsrun(&dir)
        .args(["fire", "tag-prod", "--at", "2024-05-01T10:00:00Z"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Fired 'tag-prod': 1 instance(s)"));

    let completed = json_output(opsrun(&dir).args(["instances", "--status", "completed"]));
    let rows = completed.as_array().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["source"], "manual");
    assert_eq!(rows[0]["account"], "111122223333");

    let id = rows[0]["id"].as_str().unwrap();
    opsrun(&dir)
        .args(["show", id])
        .assert()
        .success()
        .stdout(predicate::str::contains("task: tag-prod"));
}

#[test]
fn fire_unknown_task_fails() {
    let dir = with_config(CONFIG);
    opsrun(&dir)
        .args(["fire", "nope"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("nope"));
}

#[test]
fn show_unknown_instance_fails() {
    let dir = with_config(CONFIG);
    opsrun(&dir).args(["show", "missing"]).assert().failure();
}

// ---------------------------------------------------------------------------
// opsrun event
// ---------------------------------------------------------------------------

#[test]
fn tag_events_trigger_only_matching_tasks() {
    let dir = with_config(CONFIG);
    let event = |env: &str| {
        serde_json::json!({
            "source": "aws.tag",
            "detail_type": "Tag Change on Resource",
            "name": "CreateTags",
            "account": "111122223333",
            "region": "eu-west-1",
            "resources": ["vol-1"],
            "tags": {"Env": env},
            "changed_tag_keys": ["Env"],
        })
        .to_string()
    };
    std::fs::write(dir.path().join("prod.json"), event("Prod")).unwrap();
    std::fs::write(dir.path().join("dev.json"), event("Dev")).unwrap();

    let prod = json_output(opsrun(&dir).args(["event", "prod.json"]));
    let triggered = prod["event"]["triggered"].as_array().unwrap();
    assert_eq!(triggered.len(), 1);
    assert_eq!(triggered[0]["task"], "tag-prod");

    let dev = json_output(opsrun(&dir).args(["event", "dev.json"]));
    assert!(dev["event"]["triggered"].as_array().unwrap().is_empty());
}

#[test]
fn malformed_event_fails() {
    let dir = with_config(CONFIG);
    std::fs::write(dir.path().join("bad.json"), "{\"source\": 1}").unwrap();
    opsrun(&dir)
        .args(["event", "bad.json"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("malformed event"));
}

#[test]
fn reconcile_on_an_empty_ledger_is_quiet() {
    let dir = with_config(CONFIG);
    opsrun(&dir)
        .arg("reconcile")
        .assert()
        .success()
        .stdout(predicate::str::contains("within its limit"));
}

// ---------------------------------------------------------------------------
// opsrun cron / filter / actions
// ---------------------------------------------------------------------------

#[test]
fn cron_lists_upcoming_firings() {
    let dir = TempDir::new().unwrap();
    let value = json_output(opsrun(&dir).args([
        "cron",
        "0 2 * * ? *",
        "--from",
        "2024-05-01T00:00:00Z",
        "--count",
        "3",
    ]));
    let utc: Vec<&str> = value
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v["utc"].as_str().unwrap())
        .collect();
    assert_eq!(
        utc,
        vec![
            "2024-05-01T02:00:00Z",
            "2024-05-02T02:00:00Z",
            "2024-05-03T02:00:00Z"
        ]
    );
}

#[test]
fn cron_rejects_bad_expressions_and_zones() {
    let dir = TempDir::new().unwrap();
    opsrun(&dir).args(["cron", "* * *"]).assert().failure();
    opsrun(&dir)
        .args(["cron", "@daily", "--tz", "Mars/Olympus"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown timezone"));
}

#[test]
fn filter_evaluates_left_to_right() {
    let dir = TempDir::new().unwrap();
    opsrun(&dir)
        .args(["filter", "Env=Prod&Backup", "Env=Prod", "Backup=yes"])
        .assert()
        .success()
        .stdout(predicate::str::diff("match\n"));
    opsrun(&dir)
        .args(["filter", "a | b & c", "a=1"])
        .assert()
        .success()
        .stdout(predicate::str::diff("no match\n"));
}

#[test]
fn actions_lists_builtins() {
    let dir = TempDir::new().unwrap();
    opsrun(&dir)
        .arg("actions")
        .assert()
        .success()
        .stdout(predicate::str::contains("noop"))
        .stdout(predicate::str::contains("delay"))
        .stdout(predicate::str::contains("set-tags"));
}
