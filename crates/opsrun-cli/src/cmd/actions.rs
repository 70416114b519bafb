use crate::output::{print_json, print_table};
use opsrun_core::action::ActionRegistry;

pub fn run(json: bool) -> anyhow::Result<()> {
    let registry = ActionRegistry::builtin();

    if json {
        let rows: Vec<_> = registry
            .iter()
            .map(|a| {
                serde_json::json!({
                    "id": a.id,
                    "description": a.description,
                    "kind": a.kind.as_str(),
                    "properties": a.properties,
                })
            })
            .collect();
        return print_json(&rows);
    }

    let rows = registry
        .iter()
        .map(|a| {
            vec![
                a.id.to_string(),
                a.kind.as_str().to_string(),
                if a.has_completion() {
                    format!("{}m", a.properties.completion_timeout_minutes)
                } else {
                    "-".to_string()
                },
                a.properties
                    .max_concurrency
                    .map_or("-".to_string(), |n| n.to_string()),
                a.description.to_string(),
            ]
        })
        .collect();
    print_table(&["ID", "KIND", "TIMEOUT", "MAX", "DESCRIPTION"], rows);
    Ok(())
}
