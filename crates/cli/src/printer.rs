use std::io::Write;

use anyhow::Result;
use clap::ValueEnum;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use serde::Serialize;

use apps_core::{Condition, ConditionStatus};

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
    Yaml,
}

/// Serialize `value` as JSON or YAML onto `out`. Tables are rendered by the caller.
pub fn write_structured<T: Serialize>(out: &mut impl Write, format: OutputFormat, value: &T) -> Result<()> {
    match format {
        OutputFormat::Json => writeln!(out, "{}", serde_json::to_string_pretty(value)?)?,
        OutputFormat::Yaml | OutputFormat::Table => write!(out, "{}", serde_yaml::to_string(value)?)?,
    }
    Ok(())
}

pub struct Row {
    pub name: String,
    pub ready: String,
    pub reason: String,
    pub age: String,
}

impl Row {
    pub fn new(name: Option<&str>, ready: Option<&Condition>, created: Option<&Time>) -> Self {
        Self {
            name: name.unwrap_or_default().to_string(),
            ready: ready.map(|c| c.status).unwrap_or_default().as_str().to_string(),
            reason: ready.and_then(|c| c.reason.clone()).unwrap_or_else(|| "-".into()),
            age: render_age(created.map(|t| t.0.timestamp()).unwrap_or(0)),
        }
    }
}

pub fn write_table(out: &mut impl Write, rows: &[Row], empty: &str) -> Result<()> {
    if rows.is_empty() {
        writeln!(out, "{empty}")?;
        return Ok(());
    }
    let w = rows.iter().map(|r| r.name.len()).max().unwrap_or(0).max(4);
    writeln!(out, "{:<w$}   {:<7}   {:<24}   AGE", "NAME", "READY", "REASON")?;
    for r in rows {
        writeln!(out, "{:<w$}   {:<7}   {:<24}   {}", r.name, r.ready, r.reason, r.age)?;
    }
    Ok(())
}

/// One-line summary of a Ready condition for `get` output.
pub fn describe_ready(ready: Option<&Condition>) -> String {
    match ready {
        None => "Unknown (no Ready condition reported)".to_string(),
        Some(c) => {
            let mut s = c.status.as_str().to_string();
            if let Some(reason) = &c.reason {
                s.push_str(&format!(" ({reason})"));
            }
            if c.status != ConditionStatus::True {
                if let Some(msg) = c.message.as_deref().filter(|m| !m.is_empty()) {
                    s.push_str(&format!(": {msg}"));
                }
            }
            s
        }
    }
}

fn render_age(creation_ts: i64) -> String {
    if creation_ts <= 0 { return "-".to_string(); }
    let now = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default().as_secs() as i64;
    age_between(creation_ts, now)
}

fn age_between(creation_ts: i64, now: i64) -> String {
    let mut secs = (now - creation_ts).max(0) as u64;
    let days = secs / 86_400; secs %= 86_400;
    let hours = secs / 3600; secs %= 3600;
    let mins = secs / 60; secs %= 60;
    if days > 0 { format!("{}d{}h", days, hours) }
    else if hours > 0 { format!("{}h{}m", hours, mins) }
    else if mins > 0 { format!("{}m", mins) }
    else { format!("{}s", secs) }
}
