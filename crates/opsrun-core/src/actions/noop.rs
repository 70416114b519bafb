use crate::action::{
    Action, ActionArgs, ActionDescriptor, ActionKind, ActionProperties, ActionResult,
};
use serde_json::{json, Value};

pub(super) fn descriptor() -> ActionDescriptor {
    ActionDescriptor {
        id: "noop",
        description: "Completes immediately, echoing its message parameter",
        kind: ActionKind::Simple,
        properties: ActionProperties::default(),
        factory: build,
        validate: None,
    }
}

fn build(args: ActionArgs) -> ActionResult<Box<dyn Action>> {
    Ok(Box::new(Noop { args }))
}

struct Noop {
    args: ActionArgs,
}

impl Action for Noop {
    fn execute(&mut self) -> ActionResult<Value> {
        Ok(json!({
            "task": self.args.task,
            "account": self.args.account,
            "region": self.args.region,
            "message": self.args.param_str("message").unwrap_or("ok"),
        }))
    }
}
