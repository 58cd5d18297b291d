//! Types for standardized reports to the user about commands.
//!
//! Commands that skip data (windows outside the blacklist threshold, examples with data
//! errors, windows that could not be predicted) say so in a [`Report`] rather than
//! failing, unless run in strict mode.

use std::fmt;

/// The [`CommandOutput<U>`] type output is generic over some data output
/// from a command, and a [`Report`] that reports information to the user.
#[derive(Debug)]
pub struct CommandOutput<U> {
    value: U,
    report: Report,
}

impl<U> CommandOutput<U> {
    pub fn new(value: U, report: Report) -> Self {
        Self { value, report }
    }

    pub fn value(&self) -> &U {
        &self.value
    }

    pub fn report(&self) -> &Report {
        &self.report
    }

    pub fn into_parts(self) -> (U, Report) {
        (self.value, self.report)
    }
}

/// A type to (semi) standardize reporting to the user.
#[derive(Clone, Debug, Default)]
pub struct Report {
    entries: Vec<String>,
}

impl Report {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_issue(&mut self, message: String) {
        self.entries.push(message)
    }

    /// Add an issue about `count` skipped items, if there were any.
    pub fn add_skipped(&mut self, count: usize, what: &str, reason: &str) {
        if count > 0 {
            self.add_issue(format!("{} {} were skipped: {}", count, what, reason));
        }
    }

    pub fn issues(&self) -> &[String] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for entry in &self.entries {
            writeln!(f, "note: {}", entry)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report() {
        let mut report = Report::new();
        report.add_skipped(0, "windows", "blacklisted");
        assert!(report.is_empty());
        report.add_skipped(3, "windows", "unknown sequence name");
        assert_eq!(report.issues().len(), 1);
        assert_eq!(
            report.to_string(),
            "note: 3 windows were skipped: unknown sequence name\n"
        );
    }
}
