//! Output formatting for uf2b (table, json, csv)

use chrono::Local;
use clap::ValueEnum;
use colored::Colorize;
use serde::Serialize;
use tabled::{Table, Tabled};
use uf2b_client::{DeviceOutcome, StatusCode};

/// Output format options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// ASCII table format (default)
    #[default]
    Table,
    /// JSON format
    Json,
    /// CSV format
    Csv,
}

/// Context for output rendering
pub struct OutputContext {
    pub format: OutputFormat,
    pub quiet: bool,
}

impl OutputContext {
    pub fn new(format: OutputFormat, no_color: bool, quiet: bool) -> Self {
        if no_color {
            colored::control::set_override(false);
        }
        Self { format, quiet }
    }

    /// Print a success message (unless in quiet mode)
    pub fn success(&self, msg: &str) {
        if !self.quiet {
            println!("{}", msg.green());
        }
    }

    /// Print an info message (unless in quiet mode)
    pub fn info(&self, msg: &str) {
        if !self.quiet {
            println!("{}", msg);
        }
    }

    /// Print a timestamped console line (unless in quiet mode)
    pub fn log(&self, msg: &str) {
        if !self.quiet {
            println!("{} {}", Local::now().format("%H:%M:%S%.3f").to_string().dimmed(), msg);
        }
    }

    /// Print a warning message
    pub fn warn(&self, msg: &str) {
        eprintln!("{}", msg.yellow());
    }

    /// Print an error message
    pub fn error(&self, msg: &str) {
        eprintln!("{}", msg.red());
    }

    /// Print data in the configured format
    pub fn print<T: Tabled + Serialize>(&self, data: &[T]) {
        match self.format {
            OutputFormat::Table => {
                if data.is_empty() {
                    if !self.quiet {
                        println!("No data");
                    }
                } else {
                    let table = Table::new(data).to_string();
                    println!("{}", table);
                }
            }
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::to_string_pretty(data).unwrap_or_else(|_| "[]".to_string())
                );
            }
            OutputFormat::Csv => {
                print_csv(data);
            }
        }
    }
}

/// Print data as CSV
fn print_csv<T: Serialize>(data: &[T]) {
    if data.is_empty() {
        return;
    }

    // Get field names from the first item
    let first = serde_json::to_value(&data[0]).unwrap_or_default();
    if let serde_json::Value::Object(map) = &first {
        let headers: Vec<&str> = map.keys().map(|s| s.as_str()).collect();
        println!("{}", headers.join(","));

        for item in data {
            if let Ok(serde_json::Value::Object(row)) = serde_json::to_value(item) {
                let values: Vec<String> = headers
                    .iter()
                    .map(|h| {
                        row.get(*h)
                            .map(|v| match v {
                                serde_json::Value::String(s) => escape_csv(s),
                                other => escape_csv(&other.to_string()),
                            })
                            .unwrap_or_default()
                    })
                    .collect();
                println!("{}", values.join(","));
            }
        }
    }
}

/// Escape a value for CSV output
fn escape_csv(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

// =============================================================================
// Display types for commands
// =============================================================================

/// Port status for the status command
#[derive(Debug, Tabled, Serialize)]
pub struct DeviceStatusRow {
    #[tabled(rename = "Device")]
    pub device: usize,
    #[tabled(rename = "Code")]
    pub code: String,
    #[tabled(rename = "State")]
    pub state: String,
    #[tabled(rename = "Mounted")]
    pub mounted: String,
}

impl DeviceStatusRow {
    pub fn new(device: usize, code: StatusCode) -> Self {
        let state = code
            .state()
            .map(|s| s.name().to_string())
            .unwrap_or_else(|| "???".to_string());

        let mut mounted = Vec::new();
        for (flag, name) in [
            (uf2b_core::TUH_MOUNTED, "tuh"),
            (uf2b_core::MSC_MOUNTED, "msc"),
            (uf2b_core::CDC_MOUNTED, "cdc"),
        ] {
            if code.has_flags(flag) {
                mounted.push(name);
            }
        }

        Self {
            device,
            code: format!("0x{:02x}", code.raw()),
            state,
            mounted: mounted.join(","),
        }
    }
}

/// Per-device result for the flash summary
#[derive(Debug, Tabled, Serialize)]
pub struct OutcomeRow {
    #[tabled(rename = "Device")]
    pub device: usize,
    #[tabled(rename = "Result")]
    pub result: String,
    #[tabled(rename = "Stage")]
    pub stage: String,
    #[tabled(rename = "Time")]
    pub elapsed: String,
    #[tabled(rename = "Reason")]
    pub reason: String,
}

impl From<&DeviceOutcome> for OutcomeRow {
    fn from(outcome: &DeviceOutcome) -> Self {
        Self {
            device: outcome.device,
            result: if outcome.is_success() { "ok" } else { "failed" }.to_string(),
            stage: outcome.stage.to_string(),
            elapsed: format!("{:.1}s", outcome.elapsed_ms as f64 / 1000.0),
            reason: outcome
                .failure
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uf2b_client::{DeviceStage, FailureCause};

    #[test]
    fn test_status_row() {
        let row = DeviceStatusRow::new(3, StatusCode(0x68));
        assert_eq!(row.code, "0x68");
        assert_eq!(row.state, "DEVICE_FLASH_REQUEST");
        assert_eq!(row.mounted, "tuh,msc");

        let unknown = DeviceStatusRow::new(0, StatusCode(0x0c));
        assert_eq!(unknown.state, "???");
    }

    #[test]
    fn test_outcome_row() {
        let outcome = DeviceOutcome {
            device: 5,
            stage: DeviceStage::AwaitingBootselRequest,
            elapsed_ms: 1500,
            failure: Some(FailureCause::TimedOut {
                message: "Timeout while waiting for BOOTSEL request".to_string(),
            }),
        };
        let row = OutcomeRow::from(&outcome);
        assert_eq!(row.result, "failed");
        assert_eq!(row.elapsed, "1.5s");
        assert_eq!(row.reason, "Timeout while waiting for BOOTSEL request");
    }

    #[test]
    fn test_escape_csv() {
        assert_eq!(escape_csv("plain"), "plain");
        assert_eq!(escape_csv("a,b"), "\"a,b\"");
    }
}
