use crate::output::print_json;
use anyhow::Context;
use opsrun_core::tagging::{TagFilterExpression, Tags};

pub fn run(expression: &str, pairs: &[String], json: bool) -> anyhow::Result<()> {
    let filter = TagFilterExpression::parse(expression).context("invalid tag filter")?;
    let tags = parse_tags(pairs);
    let matched = filter.is_match(&tags);

    if json {
        return print_json(&serde_json::json!({
            "expression": filter.as_str(),
            "keys": filter.get_filter_keys(),
            "tags": tags,
            "matched": matched,
        }));
    }
    println!("{}", if matched { "match" } else { "no match" });
    Ok(())
}

/// `Key=Value` pairs; a bare `Key` gets an empty value.
fn parse_tags(pairs: &[String]) -> Tags {
    pairs
        .iter()
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (pair.clone(), String::new()),
        })
        .collect()
}
