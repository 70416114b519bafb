use crate::action::ActionRegistry;
use crate::error::{OpsError, Result};
use crate::ledger::LedgerSettings;
use crate::retry::RetryPolicy;
use crate::scheduler::StaticTargets;
use crate::task::{TaskCatalog, TaskDefinition};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE: &str = "opsrun.yaml";

/// Written by `opsrun init`.
pub const DEFAULT_CONFIG: &str = r#"# opsrun orchestrator configuration
account: local
default_region: us-east-1

# Tag listing the event-triggered tasks a resource opts into.
task_list_tag: OpsRunTaskList

# Relative paths resolve against this file's directory.
ledger_path: .opsrun/ledger.redb

retry:
  max_attempts: 5
  call_timeout_secs: 300
  wait:
    type: multiply
    start_secs: 10
    factor: 2
    max_secs: 60
    random_factor: 0.25

ledger:
  batch_size: 25
  flush_attempts: 5
  page_size: 100

completion:
  interval_secs: 60
  invocation_limit_secs: 900
  safety_margin_secs: 30

scheduler:
  tick_secs: 60

tasks:
  - name: nightly
    action: delay
    description: Nightly long-running job, one at a time
    interval: "0 2 * * ? *"
    timezone: UTC
    max_concurrency: 1
    parameters:
      minutes: 5

  - name: tag-prod
    action: set-tags
    description: Mark production volumes for backup when tagged
    tag_filter: "Env=Prod&!Backup=requested"
    events:
      aws.tag:
        Tag Change on Resource:
          - CreateTags
    parameters:
      tags:
        Backup: requested
"#;

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionSettings {
    #[serde(default = "default_completion_interval")]
    pub interval_secs: u64,
    /// Longest a single completion tick may run.
    #[serde(default = "default_invocation_limit")]
    pub invocation_limit_secs: u64,
    /// Kept free at the end of the invocation for reconciliation and the
    /// final ledger writes.
    #[serde(default = "default_safety_margin")]
    pub safety_margin_secs: u64,
}

fn default_completion_interval() -> u64 {
    60
}

fn default_invocation_limit() -> u64 {
    900
}

fn default_safety_margin() -> u64 {
    30
}

impl Default for CompletionSettings {
    fn default() -> Self {
        CompletionSettings {
            interval_secs: default_completion_interval(),
            invocation_limit_secs: default_invocation_limit(),
            safety_margin_secs: default_safety_margin(),
        }
    }
}

impl CompletionSettings {
    /// Wall-clock budget for probing within one completion tick.
    pub fn budget(&self) -> Duration {
        Duration::from_secs(
            self.invocation_limit_secs
                .saturating_sub(self.safety_margin_secs),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerSettings {
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
}

fn default_tick_secs() -> u64 {
    60
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        SchedulerSettings {
            tick_secs: default_tick_secs(),
        }
    }
}

// ---------------------------------------------------------------------------
// OrchestratorConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_account")]
    pub account: String,
    #[serde(default = "default_region")]
    pub default_region: String,
    #[serde(default = "default_task_list_tag")]
    pub task_list_tag: String,
    #[serde(default = "default_ledger_path")]
    pub ledger_path: PathBuf,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub ledger: LedgerSettings,
    #[serde(default)]
    pub completion: CompletionSettings,
    #[serde(default)]
    pub scheduler: SchedulerSettings,
    #[serde(default)]
    pub tasks: Vec<TaskDefinition>,
}

fn default_account() -> String {
    "local".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_task_list_tag() -> String {
    "OpsRunTaskList".to_string()
}

fn default_ledger_path() -> PathBuf {
    PathBuf::from(".opsrun/ledger.redb")
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        OrchestratorConfig {
            account: default_account(),
            default_region: default_region(),
            task_list_tag: default_task_list_tag(),
            ledger_path: default_ledger_path(),
            retry: RetryPolicy::default(),
            ledger: LedgerSettings::default(),
            completion: CompletionSettings::default(),
            scheduler: SchedulerSettings::default(),
            tasks: Vec::new(),
        }
    }
}

impl OrchestratorConfig {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(OpsError::Configuration(format!(
                "no config at {} (run `opsrun init` first)",
                path.display()
            )));
        }
        let data = std::fs::read_to_string(path)?;
        Self::from_yaml(&data)
    }

    pub fn from_yaml(data: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(data)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(path, data.as_bytes())
    }

    /// Write the commented default config unless one already exists.
    pub fn init(path: &Path) -> Result<bool> {
        crate::io::write_if_missing(path, DEFAULT_CONFIG.as_bytes())
    }

    /// Ledger location, with a relative `ledger_path` taken from the
    /// directory holding `config_path`.
    pub fn resolve_ledger_path(&self, config_path: &Path) -> PathBuf {
        if self.ledger_path.is_absolute() {
            return self.ledger_path.clone();
        }
        match config_path.parent() {
            Some(dir) => dir.join(&self.ledger_path),
            None => self.ledger_path.clone(),
        }
    }

    /// Validate every task; the first invalid one fails the whole config.
    pub fn compile(&self, registry: &ActionRegistry) -> Result<TaskCatalog> {
        TaskCatalog::compile(&self.tasks, registry)
    }

    pub fn targets(&self) -> StaticTargets {
        StaticTargets::new(&self.account, &self.default_region)
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    /// Soft problems only. Hard errors come from [`compile`](Self::compile).
    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();
        let warn = |message: String| ConfigWarning {
            level: WarnLevel::Warning,
            message,
        };

        for task in &self.tasks {
            if !task.enabled {
                warnings.push(warn(format!("task '{}' is disabled", task.name)));
            }
            let has_interval = task
                .interval
                .as_deref()
                .is_some_and(|i| !i.trim().is_empty());
            if !has_interval && task.events.is_empty() {
                warnings.push(warn(format!(
                    "task '{}' has neither an interval nor events and only runs when fired by hand",
                    task.name
                )));
            }
            if !task.events.is_empty() && task.regions.is_empty() {
                warnings.push(warn(format!(
                    "task '{}' reacts to events from every region",
                    task.name
                )));
            }
        }

        if self.completion.budget() < Duration::from_secs(60) {
            warnings.push(warn(format!(
                "completion budget is {}s; fewer probes will run per tick",
                self.completion.budget().as_secs()
            )));
        }
        if self.scheduler.tick_secs > 60 {
            warnings.push(warn(format!(
                "scheduler tick of {}s is coarser than the one-minute cron resolution",
                self.scheduler.tick_secs
            )));
        }
        if self.scheduler.tick_secs == 0 || self.completion.interval_secs == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "timer intervals must be greater than zero".to_string(),
            });
        }
        for problem in self.retry.wait.problems() {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: problem,
            });
        }
        if self.task_list_tag.trim().is_empty() {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "task_list_tag is empty".to_string(),
            });
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
