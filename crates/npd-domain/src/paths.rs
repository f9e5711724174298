/// Whether a `PATH` element is worth probing for an executable.
///
/// Environments occasionally carry empty segments (`PATH=/usr/bin::/bin`)
/// or garbage injected by wrapper scripts; those are skipped rather than
/// treated as fatal. A NUL byte can never appear in a Unix path.
#[must_use]
pub fn is_path_entry(entry: &str) -> bool {
    !entry.is_empty() && !entry.contains('\0')
}
