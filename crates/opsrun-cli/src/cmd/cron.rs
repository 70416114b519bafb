use crate::context::parse_at;
use crate::output::print_json;
use anyhow::{anyhow, Context};
use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use opsrun_core::cron::CronExpression;

/// How far ahead to look for firings.
const LOOKAHEAD_DAYS: i64 = 366 * 4;

pub fn run(
    expression: &str,
    tz: &str,
    count: usize,
    from: Option<&str>,
    json: bool,
) -> anyhow::Result<()> {
    let expr = CronExpression::parse(expression).context("invalid cron expression")?;
    let zone: Tz = tz
        .parse()
        .map_err(|e| anyhow!("unknown timezone '{tz}': {e}"))?;
    let start = parse_at(from)?.with_timezone(&zone);

    let firings: Vec<DateTime<Tz>> = expr
        .within_next(Duration::days(LOOKAHEAD_DAYS), start)
        .iter()
        .take(count)
        .collect();

    if json {
        let rows: Vec<_> = firings
            .iter()
            .map(|at| {
                serde_json::json!({
                    "local": at.to_rfc3339(),
                    "utc": at.with_timezone(&Utc),
                })
            })
            .collect();
        return print_json(&rows);
    }
    if firings.is_empty() {
        println!("No firings in the next {LOOKAHEAD_DAYS} days.");
    }
    for at in &firings {
        println!(
            "{}  ({})",
            at.format("%Y-%m-%d %H:%M %Z"),
            at.with_timezone(&Utc).format("%Y-%m-%d %H:%M UTC")
        );
    }
    Ok(())
}
