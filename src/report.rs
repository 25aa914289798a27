//! Batch report
//!
//! One row per successfully graded student, one column per question seen in
//! any successful outcome. A question missing from a row is *unscored*, which
//! is written as the configured marker and never as zero.

use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::Path;

use crate::core::{GradingOutcome, StudentIdentity};

pub const OVERALL_COLUMN: &str = "overall";
pub const IDENTITY_COLUMNS: [&str; 3] = ["surname", "given_names", "file"];

#[derive(Debug, Clone, PartialEq)]
pub struct ReportRow {
    pub identity: StudentIdentity,
    /// Aligned with `BatchReport::questions`; `None` = unscored
    pub scores: Vec<Option<f64>>,
    /// Sum of the scored questions
    pub overall: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchReport {
    pub questions: Vec<String>,
    /// Sorted by surname, then given names; ties keep outcome order
    pub rows: Vec<ReportRow>,
}

impl BatchReport {
    /// Build from all outcomes, ignoring everything but `Success`.
    /// `manual_questions` are appended as columns that nobody scores automatically.
    pub fn from_outcomes<'a>(
        outcomes: impl IntoIterator<Item = &'a GradingOutcome>,
        manual_questions: &[String],
    ) -> Self {
        let graded: Vec<_> = outcomes
            .into_iter()
            .filter_map(|outcome| match outcome {
                GradingOutcome::Success {
                    identity,
                    questions,
                } => Some((identity, questions)),
                _ => None,
            })
            .collect();

        let mut columns: BTreeSet<&str> = BTreeSet::new();
        for (_, questions) in &graded {
            columns.extend(questions.keys().map(String::as_str));
        }
        let mut questions: Vec<String> = columns.into_iter().map(String::from).collect();
        for manual in manual_questions {
            if !questions.contains(manual) {
                questions.push(manual.clone());
            }
        }

        let mut rows: Vec<ReportRow> = graded
            .into_iter()
            .map(|(identity, scored)| {
                let scores: Vec<Option<f64>> = questions
                    .iter()
                    .map(|q| scored.get(q).map(|result| result.score))
                    .collect();
                let overall: f64 = scores.iter().flatten().sum();
                ReportRow {
                    identity: identity.clone(),
                    scores,
                    overall,
                }
            })
            .collect();

        rows.sort_by(|a, b| {
            a.identity
                .surname
                .cmp(&b.identity.surname)
                .then_with(|| a.identity.given_names.cmp(&b.identity.given_names))
        });

        Self { questions, rows }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// The `overall` column, in row order
    pub fn overall(&self) -> Vec<f64> {
        self.rows.iter().map(|row| row.overall).collect()
    }

    pub fn header(&self) -> Vec<String> {
        IDENTITY_COLUMNS
            .iter()
            .map(|c| c.to_string())
            .chain(self.questions.iter().cloned())
            .chain(std::iter::once(OVERALL_COLUMN.to_string()))
            .collect()
    }

    /// Render as delimited text with a header line
    pub fn to_delimited(&self, delimiter: char, unscored_marker: &str) -> String {
        let mut out = String::new();
        push_record(&mut out, self.header().iter().map(String::as_str), delimiter);

        for row in &self.rows {
            let mut fields = vec![
                row.identity.surname.clone(),
                row.identity.given_names.clone(),
                row.identity.archive_file_name(),
            ];
            fields.extend(row.scores.iter().map(|score| match score {
                Some(score) => score.to_string(),
                None => unscored_marker.to_string(),
            }));
            fields.push(row.overall.to_string());
            push_record(&mut out, fields.iter().map(String::as_str), delimiter);
        }
        out
    }

    pub fn write(&self, path: &Path, delimiter: char, unscored_marker: &str) -> io::Result<()> {
        fs::write(path, self.to_delimited(delimiter, unscored_marker))
    }

    /// Histogram of the `overall` column; `None` for an empty report
    pub fn histogram(&self, bins: usize) -> Option<Histogram> {
        Histogram::new(&self.overall(), bins)
    }
}

fn push_record<'a>(out: &mut String, fields: impl Iterator<Item = &'a str>, delimiter: char) {
    for (i, field) in fields.enumerate() {
        if i > 0 {
            out.push(delimiter);
        }
        out.push_str(&escape_field(field, delimiter));
    }
    out.push('\n');
}

fn escape_field(field: &str, delimiter: char) -> String {
    if field.contains(delimiter) || field.contains(['"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// Equal-width histogram
#[derive(Debug, Clone, PartialEq)]
pub struct Histogram {
    pub min: f64,
    pub max: f64,
    pub counts: Vec<usize>,
}

impl Histogram {
    pub fn new(values: &[f64], bins: usize) -> Option<Self> {
        if values.is_empty() || bins == 0 {
            return None;
        }
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let width = (max - min) / bins as f64;

        let mut counts = vec![0; bins];
        for value in values {
            let bin = if width > 0.0 {
                (((value - min) / width) as usize).min(bins - 1)
            } else {
                0
            };
            counts[bin] += 1;
        }
        Some(Self { min, max, counts })
    }

    pub fn bin_width(&self) -> f64 {
        (self.max - self.min) / self.counts.len() as f64
    }

    /// One line per bin: `[lower, upper) #### count`
    pub fn render(&self) -> String {
        let width = self.bin_width();
        let mut out = String::new();
        for (i, count) in self.counts.iter().enumerate() {
            let lower = self.min + width * i as f64;
            let upper = lower + width;
            let _ = writeln!(
                out,
                "[{:>8.2}, {:>8.2}) {} {}",
                lower,
                upper,
                "#".repeat(*count),
                count
            );
        }
        out
    }
}
