use chrono::{DateTime, Utc};
use opsrun_core::instance::ExecutionInstance;
use serde::Serialize;

pub fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn print_table(headers: &[&str], rows: Vec<Vec<String>>) {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in &rows {
        for (w, cell) in widths.iter_mut().zip(row) {
            *w = (*w).max(cell.chars().count());
        }
    }

    let line = |cells: Vec<String>| {
        let padded: Vec<String> = cells
            .iter()
            .enumerate()
            .map(|(i, cell)| {
                let w = widths.get(i).copied().unwrap_or(0);
                format!("{cell:w$}")
            })
            .collect();
        println!("{}", padded.join("  ").trim_end());
    };

    line(headers.iter().map(|h| h.to_string()).collect());
    line(widths.iter().map(|&w| "-".repeat(w)).collect());
    for row in rows {
        line(row);
    }
}

pub fn timestamp(at: &DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S").to_string()
}

pub fn print_instances(instances: &[ExecutionInstance]) {
    if instances.is_empty() {
        println!("No instances.");
        return;
    }
    let rows = instances
        .iter()
        .map(|i| {
            vec![
                i.id.clone(),
                i.task.clone(),
                i.status.to_string(),
                format!("{}/{}", i.account, i.region),
                i.source.to_string(),
                timestamp(&i.created_at),
            ]
        })
        .collect();
    print_table(&["ID", "TASK", "STATUS", "TARGET", "SOURCE", "CREATED"], rows);
}

/// `(subject, error)` pairs collected by a tick.
pub fn print_failures(failures: &[(String, String)]) {
    for (subject, error) in failures {
        eprintln!("[failed] {subject}: {error}");
    }
}
