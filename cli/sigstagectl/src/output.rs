//! Output formatting for CLI commands.

use colored::Colorize;
use serde::Serialize;
use sigstage_pipeline::{RecordOutcome, RunReport};
use tabled::{Table, Tabled};

const CLI_SCHEMA_VERSION: &str = "sigstage.cli.v1";

/// Output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable table format.
    #[default]
    Table,
    /// JSON format.
    Json,
}

impl OutputFormat {
    pub fn parse(value: &str) -> Self {
        match value {
            "json" => Self::Json,
            _ => Self::Table,
        }
    }
}

/// One table row per record.
#[derive(Debug, Tabled)]
struct OutcomeRow {
    #[tabled(rename = "IMAGE")]
    image: String,
    #[tabled(rename = "BATCH")]
    batch: String,
    #[tabled(rename = "STATE")]
    state: String,
    #[tabled(rename = "NOTE")]
    note: String,
}

impl From<&RecordOutcome> for OutcomeRow {
    fn from(outcome: &RecordOutcome) -> Self {
        let note = match outcome.state.failure() {
            Some(reason) => reason.to_string(),
            None if outcome.tagged_latest => "tagged latest".to_string(),
            None if outcome.reused => "reused".to_string(),
            None => String::new(),
        };

        Self {
            image: outcome.image.clone(),
            batch: outcome
                .batch
                .as_ref()
                .map(|b| b.to_string())
                .unwrap_or_else(|| "-".to_string()),
            state: outcome.state.as_str().to_string(),
            note,
        }
    }
}

/// Print a run report: a table plus summary, or the JSON envelope.
pub fn print_report(report: &RunReport, format: OutputFormat) {
    match format {
        OutputFormat::Table => {
            if report.outcomes.is_empty() {
                println!("{}", "No records found.".dimmed());
                return;
            }

            let rows: Vec<OutcomeRow> = report.outcomes.iter().map(OutcomeRow::from).collect();
            println!("{}", Table::new(rows));

            let summary = format!(
                "{}: {} succeeded, {} failed",
                report.operation,
                report.succeeded_count(),
                report.failed_count()
            );
            if report.is_success() {
                print_success(&summary);
            } else {
                eprintln!("{} {}", "Failed:".red().bold(), summary);
            }
        }
        OutputFormat::Json => print_single(report, format),
    }
}

/// Print a single item in the specified format.
pub fn print_single<T: Serialize>(data: &T, format: OutputFormat) {
    match format {
        OutputFormat::Table => {
            let value = serde_json::to_value(data).unwrap_or_else(|_| serde_json::json!({}));
            if let serde_json::Value::Object(entries) = value {
                for (key, value) in entries {
                    let shown = match value {
                        serde_json::Value::String(s) => s,
                        serde_json::Value::Null => "-".to_string(),
                        other => other.to_string(),
                    };
                    println!("{}: {}", key.bold(), shown);
                }
            }
        }
        OutputFormat::Json => println!("{}", format_json(data, "{}")),
    }
}

/// Print a success message.
pub fn print_success(message: &str) {
    println!("{} {}", "Success:".green().bold(), message);
}

/// Print an info message.
pub fn print_info(message: &str) {
    println!("{} {}", "Info:".blue().bold(), message);
}

fn format_json<T: Serialize + ?Sized>(data: &T, fallback: &str) -> String {
    let value = serde_json::to_value(data).unwrap_or_else(|_| serde_json::json!({}));
    let sorted = sort_json_value(wrap_with_schema(camel_case_keys(value)));
    serde_json::to_string_pretty(&sorted).unwrap_or_else(|_| fallback.to_string())
}

fn wrap_with_schema(value: serde_json::Value) -> serde_json::Value {
    serde_json::json!({
        "schemaVersion": CLI_SCHEMA_VERSION,
        "data": value
    })
}

fn sort_json_value(value: serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Array(values) => {
            serde_json::Value::Array(values.into_iter().map(sort_json_value).collect())
        }
        serde_json::Value::Object(entries) => {
            let mut pairs: Vec<_> = entries.into_iter().collect();
            pairs.sort_by(|a, b| a.0.cmp(&b.0));
            let mut mapped = serde_json::Map::new();
            for (key, value) in pairs {
                mapped.insert(key, sort_json_value(value));
            }
            serde_json::Value::Object(mapped)
        }
        other => other,
    }
}

fn camel_case_keys(value: serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Array(values) => {
            serde_json::Value::Array(values.into_iter().map(camel_case_keys).collect())
        }
        serde_json::Value::Object(entries) => serde_json::Value::Object(
            entries
                .into_iter()
                .map(|(key, value)| (snake_to_lower_camel(&key), camel_case_keys(value)))
                .collect(),
        ),
        other => other,
    }
}

fn snake_to_lower_camel(input: &str) -> String {
    let mut parts = input.split('_');
    let Some(first) = parts.next() else {
        return String::new();
    };
    let mut out = String::from(first);
    for part in parts {
        let mut chars = part.chars();
        if let Some(first_char) = chars.next() {
            out.push(first_char.to_ascii_uppercase());
            out.extend(chars);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use sigstage_pipeline::{Operation, RecordState};
    use sigstage_record::BatchId;

    fn report() -> RunReport {
        let batch = BatchId::parse("20250101T000000Z").unwrap();
        let mut report = RunReport::new(Operation::Publish);
        let mut published =
            RecordOutcome::new("registry.example/app@sha256:aa", Some(batch.clone()), RecordState::Published);
        published.tagged_latest = true;
        report.push(published);
        report.push(RecordOutcome::new(
            "registry.example/app@sha256:bb",
            Some(batch),
            RecordState::Failed("denied".to_string()),
        ));
        report
    }

    #[test]
    fn json_output_is_wrapped_and_camel_cased() {
        let json: serde_json::Value =
            serde_json::from_str(&format_json(&report(), "{}")).unwrap();

        assert_eq!(json["schemaVersion"], CLI_SCHEMA_VERSION);
        let outcomes = json["data"]["outcomes"].as_array().unwrap();
        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0]["taggedLatest"], true);
        assert_eq!(outcomes[0]["state"]["status"], "published");
        assert_eq!(outcomes[1]["state"]["reason"], "denied");
        assert_eq!(json["data"]["operation"], "publish");
    }

    #[test]
    fn rows_carry_failure_reason_or_latest_note() {
        let report = report();
        let rows: Vec<OutcomeRow> = report.outcomes.iter().map(OutcomeRow::from).collect();

        assert_eq!(rows[0].state, "published");
        assert_eq!(rows[0].note, "tagged latest");
        assert_eq!(rows[0].batch, "20250101T000000Z");
        assert_eq!(rows[1].state, "failed");
        assert_eq!(rows[1].note, "denied");
    }

    #[test]
    fn flat_records_show_no_batch() {
        let outcome = RecordOutcome::new("registry.example/app@sha256:cc", None, RecordState::Prepared);
        assert_eq!(OutcomeRow::from(&outcome).batch, "-");
    }

    #[test]
    fn snake_to_lower_camel_handles_edge_cases() {
        assert_eq!(snake_to_lower_camel("tagged_latest"), "taggedLatest");
        assert_eq!(snake_to_lower_camel("image"), "image");
        assert_eq!(snake_to_lower_camel("a__b"), "aB");
    }
}
