//! Tabulated batch output.
//!
//! One row per (file, channel, analysis, scope) unit of work. Analyses with
//! different result layouts share one table through a union of their keys,
//! so the CSV is directly loadable by downstream statistical tools.

use chrono::{DateTime, Utc};
use ephys_common::{AnalysisResult, Real, ResultValue};
use itertools::Itertools;
use std::{collections::BTreeSet, io::Write};

/// Identifying columns present in every batch table, in output order.
pub const FIXED_COLUMNS: [&str; 4] = ["file", "channel", "analysis", "scope"];

#[derive(Debug, Clone, PartialEq)]
pub struct BatchRow {
    pub file: String,
    pub channel: String,
    pub analysis: String,
    /// Concrete unit label, e.g. `trial 3` or `average`.
    pub scope: String,
    pub result: AnalysisResult,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchTable {
    pub started: DateTime<Utc>,
    pub finished: DateTime<Utc>,
    pub rows: Vec<BatchRow>,
}

impl BatchTable {
    /// Wall-clock span of the run that produced this table.
    pub fn elapsed(&self) -> chrono::Duration {
        self.finished - self.started
    }

    /// Fixed columns followed by the sorted union of all result keys.
    ///
    /// Overlay keys (leading underscore) never become columns; that is the
    /// data-model contract, not a rendering choice.
    pub fn column_names(&self) -> Vec<String> {
        let mut keys = BTreeSet::new();
        for row in &self.rows {
            for (key, _) in row.result.table_entries() {
                if !FIXED_COLUMNS.contains(&key) {
                    keys.insert(key.to_owned());
                }
            }
        }
        FIXED_COLUMNS
            .iter()
            .map(|column| (*column).to_owned())
            .chain(keys)
            .collect()
    }

    /// Serializes the table as CSV. Cells absent from a row's result are
    /// left blank; array values are semicolon-joined.
    pub fn write_csv(&self, sink: &mut impl Write) -> std::io::Result<()> {
        let columns = self.column_names();
        writeln!(sink, "{}", columns.iter().map(|c| quote(c)).join(","))?;
        for row in &self.rows {
            let line = columns
                .iter()
                .map(|column| match column.as_str() {
                    "file" => quote(&row.file),
                    "channel" => quote(&row.channel),
                    "analysis" => quote(&row.analysis),
                    "scope" => quote(&row.scope),
                    key => row
                        .result
                        .get(key)
                        .map(|value| quote(&render(value)))
                        .unwrap_or_default(),
                })
                .join(",");
            writeln!(sink, "{line}")?;
        }
        Ok(())
    }
}

fn render(value: &ResultValue) -> String {
    match value {
        ResultValue::Scalar(scalar) => render_real(*scalar),
        ResultValue::Array(values) => values.iter().copied().map(render_real).join(";"),
        ResultValue::Text(text) => text.clone(),
    }
}

fn render_real(value: Real) -> String {
    value.to_string()
}

/// Double-quotes a cell only when it needs escaping.
fn quote(cell: &str) -> String {
    if cell.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", cell.replace('"', "\"\""))
    } else {
        cell.to_owned()
    }
}
