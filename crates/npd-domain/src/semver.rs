use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid version format: {input:?}")]
pub struct VersionParseError {
    pub input: String,
}

/// Extract the major component of a `major.minor[.patch]` version string.
///
/// Tolerates surrounding whitespace: `pnpm --version` terminates its output
/// with a newline, and lockfiles occasionally quote versions with stray
/// spaces.
pub fn major_version(version: &str) -> Result<u64, VersionParseError> {
    let trimmed = version.trim();
    let major = trimmed.split('.').next().unwrap_or_default();
    major.parse().map_err(|_| VersionParseError {
        input: version.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_major_from_full_semver() {
        assert_eq!(major_version("10.4.1"), Ok(10));
    }

    #[test]
    fn parses_major_minor_only() {
        assert_eq!(major_version("9.0"), Ok(9));
    }

    #[test]
    fn tolerates_trailing_newline() {
        assert_eq!(major_version("8.15.4\n"), Ok(8));
    }

    #[test]
    fn rejects_empty_input() {
        assert!(major_version("").is_err());
    }

    #[test]
    fn rejects_non_numeric_major() {
        let err = major_version("v9.0").unwrap_err();
        assert_eq!(err.input, "v9.0");
    }
}
