//! Parsers for the engine's `-no-color` text output.

use crate::ApplyRecord;

/// Collect error lines ("Error: ...") from engine output.
pub fn parse_errors(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|l| l.starts_with("Error:"))
        .map(|l| l.trim_start_matches("Error:").trim().to_string())
        .collect()
}

/// Extract `(added, changed, deleted)` from a plan summary.
///
/// Recognizes "Plan: 1 to add, 2 to change, 3 to destroy." and treats
/// "No changes." output as all zeros.
pub fn parse_plan_counts(text: &str) -> (usize, usize, usize) {
    for line in text.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("Plan:") {
            let mut added = 0;
            let mut changed = 0;
            let mut deleted = 0;
            for part in rest.split(',') {
                let part = part.trim().trim_end_matches('.');
                let mut words = part.split_whitespace();
                let n: usize = match words.next().and_then(|w| w.parse().ok()) {
                    Some(n) => n,
                    None => continue,
                };
                match part {
                    p if p.ends_with("to add") => added = n,
                    p if p.ends_with("to change") => changed = n,
                    p if p.ends_with("to destroy") => deleted = n,
                    _ => {}
                }
            }
            return (added, changed, deleted);
        }
    }
    (0, 0, 0)
}

const ACTIONS: &[&str] = &[
    "Creating",
    "Creation complete",
    "Still creating",
    "Modifying",
    "Modifications complete",
    "Still modifying",
    "Destroying",
    "Destruction complete",
    "Still destroying",
    "Refreshing state",
    "Reading",
    "Read complete",
];

/// Stateful line parser for streamed apply/destroy output.
///
/// Feed lines in producer order; each recognized event yields a record
/// snapshot carrying the accumulated text, the error list so far and the
/// latest totals. `flush` yields a trailing record when output arrived after
/// the last event, so a consumer that drains the stream always sees the full
/// log in the final record.
#[derive(Debug, Default)]
pub struct ApplyParser {
    text: String,
    errors: Vec<String>,
    total_added: usize,
    total_changed: usize,
    total_destroyed: usize,
    dirty: bool,
}

impl ApplyParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_line(&mut self, line: &str) -> Option<ApplyRecord> {
        self.text.push_str(line);
        self.text.push('\n');
        self.dirty = true;

        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix("Error:") {
            self.errors.push(rest.trim().to_string());
            return Some(self.snapshot("", ""));
        }
        if let Some(rest) = trimmed
            .strip_prefix("Apply complete! Resources:")
            .or_else(|| trimmed.strip_prefix("Destroy complete! Resources:"))
        {
            self.parse_totals(rest);
            return Some(self.snapshot("", ""));
        }
        if let Some((object, action)) = parse_object_line(trimmed) {
            return Some(self.snapshot(object, action));
        }
        None
    }

    /// Trailing record for output after the last recognized event.
    pub fn flush(&mut self) -> Option<ApplyRecord> {
        if !self.dirty {
            return None;
        }
        Some(self.snapshot("", ""))
    }

    fn snapshot(&mut self, object: &str, action: &str) -> ApplyRecord {
        self.dirty = false;
        ApplyRecord {
            object: object.to_string(),
            action: action.to_string(),
            text: self.text.clone(),
            errors: self.errors.clone(),
            total_added: self.total_added,
            total_changed: self.total_changed,
            total_destroyed: self.total_destroyed,
        }
    }

    fn parse_totals(&mut self, rest: &str) {
        for part in rest.split(',') {
            let part = part.trim().trim_end_matches('.');
            let mut words = part.split_whitespace();
            let n: usize = match words.next().and_then(|w| w.parse().ok()) {
                Some(n) => n,
                None => continue,
            };
            match words.next() {
                Some("added") => self.total_added = n,
                Some("changed") => self.total_changed = n,
                Some("destroyed") => self.total_destroyed = n,
                _ => {}
            }
        }
    }
}

/// Match "<resource.address>: <Action> ..." lines.
fn parse_object_line(line: &str) -> Option<(&str, &str)> {
    let (object, rest) = line.split_once(": ")?;
    if object.contains(char::is_whitespace) || !object.contains('.') {
        return None;
    }
    for action in ACTIONS {
        if rest.starts_with(action) {
            return Some((object, action));
        }
    }
    None
}
