use crate::action::{
    Action, ActionArgs, ActionDescriptor, ActionError, ActionKind, ActionProperties,
    ActionResult,
};
use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Map, Value};

pub(super) fn descriptor() -> ActionDescriptor {
    ActionDescriptor {
        id: "delay",
        description: "Long-running stand-in that completes `minutes` after it started",
        kind: ActionKind::WithCompletion,
        properties: ActionProperties::default(),
        factory: build,
        validate: Some(validate),
    }
}

fn validate(parameters: &Map<String, Value>) -> Result<(), String> {
    match parameters.get("minutes") {
        None => Ok(()),
        Some(v) if v.as_u64().is_some() => Ok(()),
        Some(v) => Err(format!("minutes must be a non-negative integer, got {v}")),
    }
}

fn build(args: ActionArgs) -> ActionResult<Box<dyn Action>> {
    validate(&args.parameters).map_err(ActionError::InvalidParameters)?;
    Ok(Box::new(Delay { args }))
}

struct Delay {
    args: ActionArgs,
}

impl Delay {
    fn minutes(&self) -> i64 {
        self.args.param_u64("minutes").unwrap_or(1) as i64
    }
}

impl Action for Delay {
    fn execute(&mut self) -> ActionResult<Value> {
        let ready_at = self.args.invoked_at + Duration::minutes(self.minutes());
        Ok(json!({ "ready_at": ready_at.to_rfc3339() }))
    }

    fn is_completed(&mut self, start_result: &Value) -> ActionResult<Option<Value>> {
        let ready_at = start_result
            .get("ready_at")
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc))
            .ok_or_else(|| ActionError::Failed("start result has no valid ready_at".into()))?;
        if self.args.invoked_at < ready_at {
            return Ok(None);
        }
        Ok(Some(json!({
            "waited_minutes": self.minutes(),
            "completed_at": self.args.invoked_at.to_rfc3339(),
        })))
    }
}
