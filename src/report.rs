//! Grouped, lexicographically sorted plain-text report over annotated feedback.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde_json::Value;
use tracing::warn;

use crate::artifact::json_kind;

pub static REPORT_HEADER: &str = "--- Customer Feedback Report by Theme ---";
pub static REPORT_FOOTER: &str = "--- End of Report ---";
pub static NO_DATA: &str = "No feedback data to report.";
const SECTION_RULE_WIDTH: usize = 50;

/// Warning: a record that was skipped because it does not look like annotated feedback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidRecordShape {
    pub index: usize,
    pub reason: String,
}

impl Display for InvalidRecordShape {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Skipping record {}: {}", self.index, self.reason)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThemeSection {
    pub theme: String,
    /// Texts in their original relative order.
    pub feedback: Vec<String>,
}

impl ThemeSection {
    pub fn count(&self) -> usize {
        self.feedback.len()
    }
}

/// Records grouped by theme label. Never persisted; rebuilt on every report.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThemeReport {
    /// Sorted by theme name.
    pub sections: Vec<ThemeSection>,
    pub skipped: Vec<InvalidRecordShape>,
}

impl ThemeReport {
    fn from_pairs(pairs: Vec<(String, String)>, skipped: Vec<InvalidRecordShape>) -> Self {
        let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (theme, text) in pairs {
            grouped.entry(theme).or_default().push(text);
        }
        Self {
            sections: grouped
                .into_iter()
                .map(|(theme, feedback)| ThemeSection { theme, feedback })
                .collect(),
            skipped,
        }
    }

    /// Group raw JSON records, skipping the ones with an invalid shape.
    pub fn from_values(records: &[Value]) -> Self {
        let mut pairs = Vec::with_capacity(records.len());
        let mut skipped = Vec::new();
        for (index, record) in records.iter().enumerate() {
            match record_fields(record) {
                Ok(pair) => pairs.push(pair),
                Err(reason) => skipped.push(InvalidRecordShape { index, reason }),
            }
        }
        Self::from_pairs(pairs, skipped)
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    pub fn total(&self) -> usize {
        self.sections.iter().map(ThemeSection::count).sum()
    }
}

fn string_field(obj: &serde_json::Map<String, Value>, key: &str) -> Result<String, String> {
    match obj.get(key) {
        None => Err(format!("missing `{key}`")),
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => Err(format!("`{key}` is {}, expected a string", json_kind(other))),
    }
}

fn record_fields(record: &Value) -> Result<(String, String), String> {
    let Value::Object(obj) = record else {
        return Err(format!("record is {}, expected an object", json_kind(record)));
    };
    let theme = string_field(obj, "theme_label")?;
    let text = string_field(obj, "feedback_text")?;
    Ok((theme, text))
}

impl Display for ThemeReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{REPORT_HEADER}")?;
        if self.is_empty() {
            writeln!(f)?;
            writeln!(f, "{NO_DATA}")?;
        }
        for section in &self.sections {
            writeln!(f)?;
            writeln!(f, "Theme: {}", section.theme)?;
            writeln!(f, "Count: {}", section.count())?;
            writeln!(f, "Feedback:")?;
            for text in &section.feedback {
                writeln!(f, "  - \"{text}\"")?;
            }
            writeln!(f)?;
            writeln!(f, "{}", "=".repeat(SECTION_RULE_WIDTH))?;
        }
        writeln!(f)?;
        write!(f, "{REPORT_FOOTER}")
    }
}

/// Build the report for a decoded annotated artifact, logging each skipped record.
#[tracing::instrument(name = "Rendering report", level = "info", skip_all, fields(n = records.len()))]
pub fn render(records: &[Value]) -> ThemeReport {
    let report = ThemeReport::from_values(records);
    for skipped in &report.skipped {
        warn!("{skipped}");
    }
    report
}
