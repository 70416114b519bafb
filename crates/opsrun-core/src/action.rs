//! The action plugin contract and the registry that maps action ids to
//! factories.

use crate::error::{OpsError, Result};
use crate::instance::ExecutionInstance;
use crate::retry::CallError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

pub const DEFAULT_COMPLETION_TIMEOUT_MINUTES: u32 = 60;

#[derive(Debug, Error)]
pub enum ActionError {
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("{0}")]
    Failed(String),

    #[error(transparent)]
    Remote(#[from] CallError),
}

pub type ActionResult<T> = std::result::Result<T, ActionError>;

// ---------------------------------------------------------------------------
// ActionArgs
// ---------------------------------------------------------------------------

/// Everything an action is constructed from: the invocation context plus the
/// task parameters snapshotted on the instance.
#[derive(Debug, Clone)]
pub struct ActionArgs {
    pub instance_id: String,
    pub task: String,
    pub account: String,
    pub region: String,
    pub parameters: Map<String, Value>,
    pub resources: Value,
    pub dry_run: bool,
    /// The owning task's trigger filter, if it has one.
    pub tag_filter: Option<String>,
    pub invoked_at: DateTime<Utc>,
}

impl ActionArgs {
    pub fn from_instance(
        instance: &ExecutionInstance,
        tag_filter: Option<&str>,
        now: DateTime<Utc>,
    ) -> Self {
        ActionArgs {
            instance_id: instance.id.clone(),
            task: instance.task.clone(),
            account: instance.account.clone(),
            region: instance.region.clone(),
            parameters: instance.parameters.as_object().cloned().unwrap_or_default(),
            resources: instance.resources.clone(),
            dry_run: instance.dry_run,
            tag_filter: tag_filter.map(str::to_string),
            invoked_at: now,
        }
    }

    pub fn param_str(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).and_then(Value::as_str)
    }

    pub fn param_u64(&self, name: &str) -> Option<u64> {
        self.parameters.get(name).and_then(Value::as_u64)
    }
}

// ---------------------------------------------------------------------------
// Action
// ---------------------------------------------------------------------------

pub trait Action: Send {
    fn execute(&mut self) -> ActionResult<Value>;

    /// Completion probe. `Ok(None)` (or an empty value) means still running.
    /// Only consulted for actions registered with a completion capability.
    fn is_completed(&mut self, start_result: &Value) -> ActionResult<Option<Value>> {
        let _ = start_result;
        Ok(None)
    }
}

pub type ActionFactory = fn(ActionArgs) -> ActionResult<Box<dyn Action>>;
pub type ConcurrencyKeyFn = fn(&ActionArgs) -> String;
pub type ParameterValidator = fn(&Map<String, Value>) -> std::result::Result<(), String>;

#[derive(Clone, Copy)]
pub enum ActionKind {
    Simple,
    WithCompletion,
    WithConcurrencyKey(ConcurrencyKeyFn),
    Both(ConcurrencyKeyFn),
}

impl ActionKind {
    pub fn has_completion(&self) -> bool {
        matches!(self, ActionKind::WithCompletion | ActionKind::Both(_))
    }

    pub fn concurrency_key_fn(&self) -> Option<ConcurrencyKeyFn> {
        match self {
            ActionKind::WithConcurrencyKey(f) | ActionKind::Both(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Simple => "simple",
            ActionKind::WithCompletion => "with-completion",
            ActionKind::WithConcurrencyKey(_) => "with-concurrency-key",
            ActionKind::Both(_) => "both",
        }
    }
}

impl fmt::Debug for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ActionProperties {
    pub max_concurrency: Option<u32>,
    pub completion_timeout_minutes: u32,
}

impl Default for ActionProperties {
    fn default() -> Self {
        ActionProperties {
            max_concurrency: None,
            completion_timeout_minutes: DEFAULT_COMPLETION_TIMEOUT_MINUTES,
        }
    }
}

// ---------------------------------------------------------------------------
// ActionDescriptor
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct ActionDescriptor {
    pub id: &'static str,
    pub description: &'static str,
    pub kind: ActionKind,
    pub properties: ActionProperties,
    pub factory: ActionFactory,
    pub validate: Option<ParameterValidator>,
}

impl ActionDescriptor {
    pub fn build(&self, args: ActionArgs) -> ActionResult<Box<dyn Action>> {
        (self.factory)(args)
    }

    pub fn has_completion(&self) -> bool {
        self.kind.has_completion()
    }

    /// Key shared by instances competing for the same slots. Actions without
    /// a key function but with a limit share one key per action id.
    pub fn concurrency_key(&self, args: &ActionArgs, limit: Option<u32>) -> Option<String> {
        match self.kind.concurrency_key_fn() {
            Some(f) => Some(f(args)),
            None if limit.is_some() => Some(self.id.to_string()),
            None => None,
        }
    }

    pub fn validate_parameters(&self, parameters: &Map<String, Value>) -> Result<()> {
        match self.validate {
            Some(validate) => validate(parameters).map_err(|reason| {
                OpsError::Configuration(format!("action '{}': {reason}", self.id))
            }),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for ActionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionDescriptor")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("properties", &self.properties)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// ActionRegistry
// ---------------------------------------------------------------------------

/// Explicit mapping from action id to descriptor. Built once at startup and
/// passed by reference.
#[derive(Debug, Clone, Default)]
pub struct ActionRegistry {
    actions: BTreeMap<&'static str, ActionDescriptor>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in actions.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        for descriptor in crate::actions::descriptors() {
            registry.actions.insert(descriptor.id, descriptor);
        }
        registry
    }

    pub fn register(&mut self, descriptor: ActionDescriptor) -> Result<()> {
        if self.actions.contains_key(descriptor.id) {
            return Err(OpsError::Configuration(format!(
                "action '{}' registered twice",
                descriptor.id
            )));
        }
        self.actions.insert(descriptor.id, descriptor);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&ActionDescriptor> {
        self.actions.get(id)
    }

    pub fn require(&self, id: &str) -> Result<&ActionDescriptor> {
        self.get(id)
            .ok_or_else(|| OpsError::UnknownAction(id.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &ActionDescriptor> {
        self.actions.values()
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}
