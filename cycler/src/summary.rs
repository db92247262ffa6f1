// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The append-only cycling ledger.

use crate::CycleRecord;
use anyhow::Context;
use serde::Deserialize;
use serde::Serialize;
use std::path::Path;
use std::path::PathBuf;

/// Ledger file name inside the log directory.
pub const SUMMARY_FILE: &str = "cycling_summary.csv";

const HEADER: [&str; 4] = ["Cycle#", "Status", "Previous Failure Cycle#", "Remarks"];

/// Outcome column of the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[expect(missing_docs)] // Self-describing names.
pub enum LedgerStatus {
    Succeeded,
    Failed,
}

/// One ledger row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryRow {
    /// Cycle number.
    #[serde(rename = "Cycle#")]
    pub cycle: u32,
    /// Whether the cycle counted as a success.
    #[serde(rename = "Status")]
    pub status: LedgerStatus,
    /// The most recent earlier failed cycle. `NA` on succeeded rows and `0`
    /// on a failed row with no earlier failure.
    #[serde(rename = "Previous Failure Cycle#", with = "cycle_or_na")]
    pub previous_failure: Option<u32>,
    /// Human readable outcome.
    #[serde(rename = "Remarks")]
    pub remarks: String,
}

impl From<&CycleRecord> for SummaryRow {
    fn from(record: &CycleRecord) -> Self {
        Self {
            cycle: record.number,
            status: if record.passed {
                LedgerStatus::Succeeded
            } else {
                LedgerStatus::Failed
            },
            previous_failure: if record.passed {
                None
            } else {
                Some(record.previous_failure.unwrap_or(0))
            },
            remarks: record.remarks.clone(),
        }
    }
}

mod cycle_or_na {
    use serde::Deserialize;
    use serde::Deserializer;
    use serde::Serializer;

    const NA: &str = "NA";

    pub fn serialize<S: Serializer>(value: &Option<u32>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(cycle) => serializer.serialize_u32(*cycle),
            None => serializer.serialize_str(NA),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u32>, D::Error> {
        let s = String::deserialize(deserializer)?;
        let s = s.trim();
        if s.eq_ignore_ascii_case(NA) || s.is_empty() {
            return Ok(None);
        }
        s.parse().map(Some).map_err(serde::de::Error::custom)
    }
}

/// Writer for `cycling_summary.csv`. Every row is flushed as soon as it is
/// appended so the ledger survives a controller crash.
pub struct CyclingSummary {
    writer: csv::Writer<fs_err::File>,
    path: PathBuf,
}

impl CyclingSummary {
    /// Create (or truncate) the ledger at `path` and write its header.
    pub fn create(path: &Path) -> anyhow::Result<Self> {
        let file = fs_err::File::create(path)?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        writer
            .write_record(HEADER)
            .context("failed to write summary header")?;
        writer.flush()?;
        Ok(Self {
            writer,
            path: path.to_owned(),
        })
    }

    /// Path of the ledger file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append the row for `record`.
    pub fn append(&mut self, record: &CycleRecord) -> anyhow::Result<()> {
        self.writer
            .serialize(SummaryRow::from(record))
            .with_context(|| format!("failed to append cycle {} to summary", record.number))?;
        self.writer.flush()?;
        Ok(())
    }

    /// Read back every row of a ledger file.
    pub fn read(path: &Path) -> anyhow::Result<Vec<SummaryRow>> {
        let file = fs_err::File::open(path)?;
        csv::Reader::from_reader(file)
            .deserialize()
            .collect::<Result<Vec<SummaryRow>, _>>()
            .with_context(|| format!("failed to parse {}", path.display()))
    }
}
