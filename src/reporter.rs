use std::time::Duration;

use bytesize::ByteSize;
use serde::Serialize;

use crate::model::{Operation, OperationStatus};
use crate::protocol::StatusUpdate;

/// Line-oriented output of the foreground command.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Event<'a> {
    Created { operation: &'a Operation },
    Status(&'a StatusUpdate),
    Operations { operations: &'a [Operation] },
}

/// Reporter turns operations and status updates into human or JSON lines.
pub struct Reporter {
    json_mode: bool,
    updates: usize,
}

impl Reporter {
    pub fn new(json_mode: bool) -> Self {
        Self {
            json_mode,
            updates: 0,
        }
    }

    pub fn created(&mut self, operation: &Operation) {
        if self.json_mode {
            self.emit(&Event::Created { operation });
        } else {
            println!("started {} operation {}", operation.kind(), operation.id);
        }
    }

    pub fn status(&mut self, update: &StatusUpdate) {
        self.updates += 1;
        if self.json_mode {
            self.emit(&Event::Status(update));
        } else {
            println!("{}", format_status(&update.status));
        }
    }

    pub fn operations(&mut self, operations: &[Operation]) {
        if self.json_mode {
            self.emit(&Event::Operations { operations });
        } else {
            for operation in operations {
                println!("{}", format_operation(operation));
            }
        }
    }

    pub fn summary(&self) -> String {
        format!("{} status updates received", self.updates)
    }

    fn emit(&self, event: &Event<'_>) {
        if let Ok(line) = serde_json::to_string(event) {
            println!("{line}");
        }
    }
}

/// One human-readable progress line.
pub fn format_status(status: &OperationStatus) -> String {
    if status.finished {
        let code = status
            .exit_code
            .map_or_else(|| "?".to_string(), |c| c.to_string());
        return format!(
            "{} (exit {code}): {} in {} files",
            status.message,
            ByteSize::b(status.bytes_done),
            status.files_done
        );
    }

    let eta = status
        .seconds_left
        .map_or_else(
            || "--".to_string(),
            |s| humantime::format_duration(Duration::from_secs(s)).to_string(),
        );
    let mut line = format!(
        "{:>3.0}% {}/{} {}/s eta {eta}",
        status.progress * 100.0,
        ByteSize::b(status.bytes_done),
        ByteSize::b(status.bytes_total),
        ByteSize::b(status.speed as u64),
    );
    if !status.file_name.is_empty() {
        line.push(' ');
        line.push_str(&status.file_name);
    }
    line
}

pub fn format_operation(operation: &Operation) -> String {
    format!(
        "{} {:<5} {:<8} {}",
        operation.id,
        operation.kind().to_string(),
        operation.state.to_string(),
        operation.status.message
    )
}
