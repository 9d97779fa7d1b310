//! Coarse percentage milestones derived from free-text log lines.

/// Ordered `(substring, percent)` pairs. Percentages never decrease in table
/// order and the first matching entry wins.
pub const MILESTONES: &[(&str, u8)] = &[
    ("resolving machine image", 5),
    ("ensuring security group", 10),
    ("ensuring instance profile", 15),
    ("ensuring placement group", 18),
    ("launching instance", 25),
    ("waiting for instance state", 35),
    ("instance launched", 45),
    ("waiting for command channel", 50),
    ("command channel ready", 55),
    ("installing docker", 60),
    ("docker installation completed", 70),
    ("configuring aws credentials", 75),
    ("aws credentials configured", 80),
    ("pulling", 85),
    ("container deployment completed", 95),
    ("deployment completed successfully", 100),
];

/// Returns the percentage for `line` using [`MILESTONES`].
#[must_use]
pub fn milestone_for(line: &str) -> Option<u8> {
    milestone_in(MILESTONES, line)
}

/// Returns the percentage of the first entry of `table` whose substring
/// occurs in `line`, ignoring ASCII case.
#[must_use]
pub fn milestone_in(table: &[(&str, u8)], line: &str) -> Option<u8> {
    let haystack = line.to_ascii_lowercase();
    table
        .iter()
        .find(|(needle, _)| haystack.contains(&needle.to_ascii_lowercase()))
        .map(|&(_, percent)| percent)
}
