//! Prints the records of a paxos log.

use std::path::Path;

use anyhow::{Context, Result};
use paxlog_storage::{LogRecord, print_row, read_log};

use crate::style::{print_header, print_labeled};

pub fn run(path: &Path) -> Result<()> {
    let records =
        read_log(path).with_context(|| format!("failed to read paxos log {}", path.display()))?;

    print_header(&path.display().to_string());
    for record in &records {
        println!("{}", print_row(record));
    }

    let decided = records
        .iter()
        .filter(|r| matches!(r, LogRecord::Decide { .. }))
        .count();
    println!();
    print_labeled("records", &records.len().to_string());
    print_labeled("decided", &decided.to_string());
    if let Some(last) = records.iter().rev().find_map(|r| match r {
        LogRecord::Decide { scn, .. } => Some(*scn),
        _ => None,
    }) {
        print_labeled("last decided scn", &last.to_string());
    }
    Ok(())
}
