use crate::action::{
    Action, ActionArgs, ActionDescriptor, ActionError, ActionKind, ActionProperties,
    ActionResult,
};
use crate::tagging::{retriggers, TagFilterExpression, TagFilterSet, Tags};
use serde_json::{json, Map, Value};

pub(super) fn descriptor() -> ActionDescriptor {
    ActionDescriptor {
        id: "set-tags",
        description: "Computes tag writes for the selected resources, one writer per account and region",
        kind: ActionKind::WithConcurrencyKey(concurrency_key),
        properties: ActionProperties {
            max_concurrency: Some(1),
            ..ActionProperties::default()
        },
        factory: build,
        validate: Some(validate),
    }
}

fn concurrency_key(args: &ActionArgs) -> String {
    format!("set-tags:{}:{}", args.account, args.region)
}

fn validate(parameters: &Map<String, Value>) -> Result<(), String> {
    match parameters.get("tags") {
        Some(Value::Object(tags)) => {
            if let Some((k, _)) = tags.iter().find(|(_, v)| !v.is_string()) {
                return Err(format!("tag '{k}' must have a string value"));
            }
        }
        Some(_) => return Err("tags must be a map of strings".into()),
        None => {}
    }
    if let Some(remove) = parameters.get("remove") {
        let text = remove.as_str().ok_or("remove must be a string")?;
        TagFilterSet::parse(text).map_err(|e| e.to_string())?;
    }
    Ok(())
}

fn build(args: ActionArgs) -> ActionResult<Box<dyn Action>> {
    validate(&args.parameters).map_err(ActionError::InvalidParameters)?;
    let proposed: Tags = args
        .parameters
        .get("tags")
        .and_then(Value::as_object)
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default();
    let remove = args
        .param_str("remove")
        .map(TagFilterSet::parse)
        .transpose()
        .map_err(|e| ActionError::InvalidParameters(e.to_string()))?;
    let trigger = args
        .tag_filter
        .as_deref()
        .map(TagFilterExpression::parse)
        .transpose()
        .map_err(|e| ActionError::InvalidParameters(e.to_string()))?;
    Ok(Box::new(SetTags {
        args,
        proposed,
        remove,
        trigger,
    }))
}

struct SetTags {
    args: ActionArgs,
    proposed: Tags,
    remove: Option<TagFilterSet>,
    trigger: Option<TagFilterExpression>,
}

fn resource_tags(resource: &Value) -> Tags {
    resource
        .get("tags")
        .and_then(Value::as_object)
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

impl Action for SetTags {
    fn execute(&mut self) -> ActionResult<Value> {
        let resources = self.args.resources.as_array().cloned().unwrap_or_default();
        let mut applied = Vec::new();
        let mut skipped = Vec::new();

        for resource in &resources {
            let id = resource.get("id").and_then(Value::as_str).unwrap_or_default();
            let original = resource_tags(resource);
            let mut written = original.clone();
            if let Some(remove) = &self.remove {
                for key in remove.pairs_matching_any_filter(&original).keys() {
                    written.remove(key);
                }
            }
            written.extend(self.proposed.clone());
            if let Some(trigger) = &self.trigger {
                if retriggers(&original, &written, trigger) {
                    tracing::warn!(
                        task = %self.args.task,
                        resource = id,
                        "skipping tag write that would retrigger the task"
                    );
                    skipped.push(json!(id));
                    continue;
                }
            }
            applied.push(json!({ "id": id, "tags": written }));
        }

        Ok(json!({
            "dry_run": self.args.dry_run,
            "applied": applied,
            "skipped": skipped,
        }))
    }
}
