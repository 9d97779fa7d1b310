//! Parsing of `ls -la` output.

use serde::Serialize;

/// One directory entry.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct FileEntry {
    /// Entry name.
    pub name: String,
    /// Absolute path of the entry.
    pub path: String,
    /// `true` for directories.
    pub is_directory: bool,
    /// Size in bytes as reported by `ls`.
    pub size: u64,
    /// Permission string, for example `drwxr-xr-x`.
    pub permissions: String,
}

/// Prefixes `path` with `/` when it is relative.
#[must_use]
pub fn normalise_path(path: &str) -> String {
    let trimmed = path.trim();
    if trimmed.starts_with('/') {
        trimmed.to_owned()
    } else {
        format!("/{trimmed}")
    }
}

/// Parses long-format listing lines, skipping the `total` line and the
/// `.` and `..` entries. Lines that do not look like entries are ignored.
#[must_use]
pub fn parse_listing(output: &str, directory: &str) -> Vec<FileEntry> {
    output
        .lines()
        .filter(|line| !line.starts_with("total "))
        .filter_map(|line| parse_entry(line, directory))
        .collect()
}

fn parse_entry(line: &str, directory: &str) -> Option<FileEntry> {
    let mut fields = line.split_whitespace();
    let permissions = fields.next()?;
    if permissions.len() < 10 {
        return None;
    }
    // links, owner, group
    let size = fields.nth(3)?.parse::<u64>().ok()?;
    // month, day, time or year
    let rest: Vec<&str> = fields.skip(3).collect();
    if rest.is_empty() {
        return None;
    }
    let full_name = rest.join(" ");
    // Symbolic links print as `name -> target`.
    let name = full_name
        .split_once(" -> ")
        .map_or(full_name.as_str(), |(link, _)| link)
        .to_owned();
    if name == "." || name == ".." {
        return None;
    }
    let path = if directory.ends_with('/') {
        format!("{directory}{name}")
    } else {
        format!("{directory}/{name}")
    };
    Some(FileEntry {
        is_directory: permissions.starts_with('d'),
        permissions: permissions.to_owned(),
        size,
        path,
        name,
    })
}
