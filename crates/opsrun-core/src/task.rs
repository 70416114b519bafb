use crate::action::{ActionDescriptor, ActionRegistry};
use crate::cron::CronExpression;
use crate::error::{OpsError, Result};
use crate::tagging::TagFilterExpression;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};

// ---------------------------------------------------------------------------
// TaskDefinition
// ---------------------------------------------------------------------------

/// A task as configured. Consumed read-only; see [`Task::compile`] for the
/// validated form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub name: String,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Cron interval; absent for event-only tasks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub accounts: Vec<String>,
    #[serde(default)]
    pub regions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag_filter: Option<String>,
    /// Event source -> detail type -> event names.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub events: BTreeMap<String, BTreeMap<String, Vec<String>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_minutes: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<u32>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub dry_run: bool,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_enabled() -> bool {
    true
}

impl TaskDefinition {
    pub fn new(name: impl Into<String>, action: impl Into<String>) -> Self {
        TaskDefinition {
            name: name.into(),
            action: action.into(),
            description: None,
            interval: None,
            timezone: default_timezone(),
            enabled: true,
            accounts: Vec::new(),
            regions: Vec::new(),
            tag_filter: None,
            events: BTreeMap::new(),
            timeout_minutes: None,
            max_concurrency: None,
            parameters: Map::new(),
            dry_run: false,
        }
    }

    pub fn with_interval(mut self, interval: impl Into<String>) -> Self {
        self.interval = Some(interval.into());
        self
    }

    pub fn with_event(
        mut self,
        source: impl Into<String>,
        detail_type: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        self.events
            .entry(source.into())
            .or_default()
            .entry(detail_type.into())
            .or_default()
            .push(name.into());
        self
    }
}

/// Where an instance runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub account: String,
    pub region: String,
}

impl Target {
    pub fn new(account: impl Into<String>, region: impl Into<String>) -> Self {
        Target {
            account: account.into(),
            region: region.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// A definition whose cron string, tag filter, timezone and action have
/// all been resolved.
#[derive(Debug, Clone)]
pub struct Task {
    definition: TaskDefinition,
    descriptor: ActionDescriptor,
    schedule: Option<CronExpression>,
    timezone: Tz,
    tag_filter: Option<TagFilterExpression>,
}

impl Task {
    pub fn compile(definition: TaskDefinition, registry: &ActionRegistry) -> Result<Task> {
        let name = definition.name.trim();
        if name.is_empty() {
            return Err(OpsError::Configuration("task with an empty name".into()));
        }
        let invalid = |reason: String| OpsError::Configuration(format!("task '{name}': {reason}"));

        let descriptor = registry.require(&definition.action)?.clone();
        let schedule = match definition.interval.as_deref().map(str::trim) {
            Some(interval) if !interval.is_empty() => Some(CronExpression::parse(interval)?),
            _ => None,
        };
        let timezone: Tz = definition
            .timezone
            .parse()
            .map_err(|_| invalid(format!("unknown timezone '{}'", definition.timezone)))?;
        let tag_filter = match definition.tag_filter.as_deref().map(str::trim) {
            Some(filter) if !filter.is_empty() => Some(TagFilterExpression::parse(filter)?),
            _ => None,
        };

        if let Some(timeout) = definition.timeout_minutes {
            if timeout == 0 {
                return Err(invalid("timeout_minutes must be greater than 0".into()));
            }
            if !descriptor.has_completion() {
                return Err(invalid(format!(
                    "timeout_minutes is only valid for actions with a completion probe, '{}' has none",
                    descriptor.id
                )));
            }
        }
        if definition.max_concurrency == Some(0) {
            return Err(invalid("max_concurrency must be greater than 0".into()));
        }
        descriptor
            .validate_parameters(&definition.parameters)
            .map_err(|e| invalid(e.to_string()))?;

        Ok(Task {
            definition,
            descriptor,
            schedule,
            timezone,
            tag_filter,
        })
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn definition(&self) -> &TaskDefinition {
        &self.definition
    }

    pub fn descriptor(&self) -> &ActionDescriptor {
        &self.descriptor
    }

    pub fn schedule(&self) -> Option<&CronExpression> {
        self.schedule.as_ref()
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    pub fn tag_filter(&self) -> Option<&TagFilterExpression> {
        self.tag_filter.as_ref()
    }

    pub fn is_enabled(&self) -> bool {
        self.definition.enabled
    }

    /// Completion timeout in minutes: the task override, else the action's
    /// own property. `None` for actions without a completion probe.
    pub fn timeout_minutes(&self) -> Option<u32> {
        if !self.descriptor.has_completion() {
            return None;
        }
        Some(
            self.definition
                .timeout_minutes
                .unwrap_or(self.descriptor.properties.completion_timeout_minutes),
        )
    }

    pub fn concurrency_limit(&self) -> Option<u32> {
        self.definition
            .max_concurrency
            .or(self.descriptor.properties.max_concurrency)
    }

    pub fn listens_for(&self, source: &str, detail_type: &str, name: &str) -> bool {
        self.definition
            .events
            .get(source)
            .and_then(|details| details.get(detail_type))
            .is_some_and(|names| names.iter().any(|n| n == name))
    }
}

// ---------------------------------------------------------------------------
// TaskCatalog
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct TaskCatalog {
    tasks: Vec<Task>,
}

impl TaskCatalog {
    /// Validate every definition up front; the first invalid one fails the
    /// whole catalog.
    pub fn compile(definitions: &[TaskDefinition], registry: &ActionRegistry) -> Result<Self> {
        let mut seen = BTreeSet::new();
        let mut tasks = Vec::with_capacity(definitions.len());
        for definition in definitions {
            if !seen.insert(definition.name.clone()) {
                return Err(OpsError::Configuration(format!(
                    "task '{}' is defined more than once",
                    definition.name
                )));
            }
            tasks.push(Task::compile(definition.clone(), registry)?);
        }
        Ok(TaskCatalog { tasks })
    }

    pub fn get(&self, name: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.name() == name)
    }

    pub fn require(&self, name: &str) -> Result<&Task> {
        self.get(name)
            .ok_or_else(|| OpsError::TaskNotFound(name.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter()
    }

    pub fn enabled(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter().filter(|t| t.is_enabled())
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ActionRegistry {
        ActionRegistry::builtin()
    }

    #[test]
    fn compiles_a_scheduled_task() {
        let def = TaskDefinition::new("nightly", "delay").with_interval("0 2 * * ? *");
        let task = Task::compile(def, &registry()).unwrap();
        assert!(task.schedule().is_some());
        assert_eq!(task.timezone(), Tz::UTC);
        assert_eq!(task.timeout_minutes(), Some(60));
        assert_eq!(task.concurrency_limit(), None);
    }

    #[test]
    fn configuration_errors_fail_fast() {
        let cases = vec![
            TaskDefinition::new("a", "does-not-exist"),
            TaskDefinition::new("b", "noop").with_interval("99 * * * *"),
            TaskDefinition {
                tag_filter: Some("(Env=Prod".into()),
                ..TaskDefinition::new("c", "noop")
            },
            TaskDefinition {
                timezone: "Mars/Olympus".into(),
                ..TaskDefinition::new("d", "noop")
            },
            TaskDefinition {
                timeout_minutes: Some(10),
                ..TaskDefinition::new("e", "noop")
            },
            TaskDefinition {
                timeout_minutes: Some(0),
                ..TaskDefinition::new("f", "delay")
            },
            TaskDefinition {
                max_concurrency: Some(0),
                ..TaskDefinition::new("g", "noop")
            },
            TaskDefinition::new(" ", "noop"),
        ];
        for def in cases {
            let name = def.name.clone();
            assert!(Task::compile(def, &registry()).is_err(), "{name} should fail");
        }
    }

    #[test]
    fn invalid_action_parameters_are_rejected() {
        let mut def = TaskDefinition::new("wait", "delay");
        def.parameters
            .insert("minutes".into(), Value::String("ten".into()));
        assert!(matches!(
            Task::compile(def, &registry()),
            Err(OpsError::Configuration(_))
        ));
    }

    #[test]
    fn task_overrides_action_properties() {
        let def = TaskDefinition {
            timeout_minutes: Some(15),
            max_concurrency: Some(3),
            ..TaskDefinition::new("wait", "delay")
        };
        let task = Task::compile(def, &registry()).unwrap();
        assert_eq!(task.timeout_minutes(), Some(15));
        assert_eq!(task.concurrency_limit(), Some(3));

        let tagger = Task::compile(TaskDefinition::new("tag", "set-tags"), &registry()).unwrap();
        assert_eq!(tagger.concurrency_limit(), Some(1));
        assert_eq!(tagger.timeout_minutes(), None);
    }

    #[test]
    fn catalog_rejects_duplicates() {
        let defs = vec![
            TaskDefinition::new("same", "noop"),
            TaskDefinition::new("same", "noop"),
        ];
        assert!(TaskCatalog::compile(&defs, &registry()).is_err());
    }

    #[test]
    fn event_subscriptions() {
        let def = TaskDefinition::new("on-tag", "noop").with_event(
            "aws.tag",
            "Tag Change on Resource",
            "CreateTags",
        );
        let task = Task::compile(def, &registry()).unwrap();
        assert!(task.listens_for("aws.tag", "Tag Change on Resource", "CreateTags"));
        assert!(!task.listens_for("aws.tag", "Tag Change on Resource", "DeleteTags"));
        assert!(!task.listens_for("aws.ec2", "Tag Change on Resource", "CreateTags"));
    }

    #[test]
    fn definitions_read_from_yaml() {
        let yaml = r#"
name: nightly
action: delay
interval: "0 2 * * ? *"
timezone: Europe/Amsterdam
regions: [eu-west-1]
parameters:
  minutes: 5
"#;
        let def: TaskDefinition = serde_yaml::from_str(yaml).unwrap();
        assert!(def.enabled);
        assert_eq!(def.parameters["minutes"], serde_json::json!(5));
        let task = Task::compile(def, &registry()).unwrap();
        assert_eq!(task.timezone(), chrono_tz::Europe::Amsterdam);
    }
}
