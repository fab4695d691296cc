//! Migration files and the sections inside them.
//!
//! A migration file is named `<timestamp>_<name>.sql` and holds a forward
//! section introduced by `-- UP` and an optional inverse section introduced
//! by `-- DOWN`. The DOWN section runs to the end of the file.

use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlmig_common::{Error, Result};

pub const UP_MARKER: &str = "-- UP";
pub const DOWN_MARKER: &str = "-- DOWN";

/// Format of generated timestamps. Lexicographic order is chronological.
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";

/// Identity of one migration: the pair that names its file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub timestamp: String,
    pub name: String,
}

impl MigrationRecord {
    pub fn new(timestamp: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            timestamp: timestamp.into(),
            name: name.into(),
        }
    }

    pub fn file_name(&self) -> String {
        format!("{}_{}.sql", self.timestamp, self.name)
    }

    pub fn path_in(&self, migrations_dir: &Path) -> PathBuf {
        migrations_dir.join(self.file_name())
    }
}

impl fmt::Display for MigrationRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.timestamp, self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    Up,
    Down,
}

impl Section {
    pub fn marker(&self) -> &'static str {
        match self {
            Section::Up => UP_MARKER,
            Section::Down => DOWN_MARKER,
        }
    }
}

/// Whether `line` is the given section marker. Anything after the marker
/// must be separated by whitespace, so `-- UPDATE` is plain text.
pub fn is_marker(line: &str, marker: &str) -> bool {
    line.strip_prefix(marker)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with(char::is_whitespace))
}

/// Collect the lines of one section, each terminated by `\n`.
///
/// UP starts after the UP marker and stops at the first DOWN marker. DOWN
/// starts after the first DOWN marker and runs to the end; a repeated DOWN
/// marker is kept as text. A missing marker yields an empty string.
pub fn extract_section<'a, I>(lines: I, section: Section) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let mut out = String::new();
    let mut inside = false;

    for line in lines {
        match section {
            Section::Up => {
                if is_marker(line, DOWN_MARKER) {
                    break;
                }
                if inside {
                    out.push_str(line);
                    out.push('\n');
                } else if is_marker(line, UP_MARKER) {
                    inside = true;
                }
            }
            Section::Down => {
                if inside {
                    out.push_str(line);
                    out.push('\n');
                } else if is_marker(line, DOWN_MARKER) {
                    inside = true;
                }
            }
        }
    }

    out
}

/// Reject marker layouts with no single reading: DOWN before UP, or either
/// marker appearing twice.
pub fn check_layout(path: &Path, content: &str) -> Result<()> {
    let mut up_line = None;
    let mut down_line = None;

    for (idx, line) in content.lines().enumerate() {
        let lineno = idx + 1;
        if is_marker(line, UP_MARKER) {
            if let Some(first) = up_line {
                return Err(malformed(
                    path,
                    format!("duplicate {UP_MARKER} marker on line {lineno} (first on line {first})"),
                ));
            }
            up_line = Some(lineno);
        } else if is_marker(line, DOWN_MARKER) {
            if let Some(first) = down_line {
                return Err(malformed(
                    path,
                    format!(
                        "duplicate {DOWN_MARKER} marker on line {lineno} (first on line {first})"
                    ),
                ));
            }
            if up_line.is_none() {
                return Err(malformed(
                    path,
                    format!("{DOWN_MARKER} marker on line {lineno} precedes any {UP_MARKER} marker"),
                ));
            }
            down_line = Some(lineno);
        }
    }

    Ok(())
}

fn malformed(path: &Path, reason: String) -> Error {
    Error::MalformedMigration {
        path: path.to_path_buf(),
        reason,
    }
}

/// Read a migration file, reporting absence separately from other failures.
pub fn read_migration(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|e| match e.kind() {
        ErrorKind::NotFound => Error::MigrationFileNotFound(path.to_path_buf()),
        _ => Error::FileRead {
            path: path.to_path_buf(),
            source: e,
        },
    })
}

/// Read, validate and extract one section of a migration file.
///
/// Returns `None` when the section is absent or contains only whitespace.
pub fn load_section(path: &Path, section: Section) -> Result<Option<String>> {
    let content = read_migration(path)?;
    check_layout(path, &content)?;

    let sql = extract_section(content.lines(), section);
    if sql.trim().is_empty() {
        Ok(None)
    } else {
        Ok(Some(sql))
    }
}

/// Turn a user-supplied name into a file-safe slug.
///
/// Case is lowered and spaces or dashes become underscores; anything else
/// outside `[a-z0-9_]` is rejected.
pub fn normalize_name(raw: &str) -> Result<String> {
    let slug: String = raw
        .trim()
        .chars()
        .map(|c| match c {
            ' ' | '-' => '_',
            c => c.to_ascii_lowercase(),
        })
        .collect();

    if slug.is_empty() {
        return Err(Error::InvalidName("name cannot be empty".into()));
    }
    if let Some(bad) = slug
        .chars()
        .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '_'))
    {
        return Err(Error::InvalidName(format!(
            "{raw:?} contains unsupported character {bad:?}"
        )));
    }
    Ok(slug)
}

pub fn timestamp_for(now: DateTime<Utc>) -> String {
    now.format(TIMESTAMP_FORMAT).to_string()
}

/// Body written for a freshly created migration.
pub fn template(record: &MigrationRecord, now: DateTime<Utc>) -> String {
    format!(
        "-- Migration: {}\n-- Created: {}\n\n{UP_MARKER}\n\n\n{DOWN_MARKER}\n\n",
        record.name,
        now.format("%Y-%m-%d %H:%M:%S UTC")
    )
}
