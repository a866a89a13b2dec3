//! The small set of error kinds a caller needs to match on *which*
//! condition occurred, rather than just display a message. Everything
//! else propagates as plain `anyhow::Error` with context strings
//! attached at I/O boundaries; these marker variants exist only where
//! `driver::run` needs to branch (cache load policy, the one fatal
//! structural-invariant case).

use std::fmt;

use camino::Utf8PathBuf;

#[derive(Debug)]
pub enum AnalysisError {
    NotADirectory(Utf8PathBuf),
    CacheCorrupt,
    CacheRootMismatch { expected: Utf8PathBuf, found: Utf8PathBuf },
    StructuralInvariantViolated(String),
}

impl fmt::Display for AnalysisError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnalysisError::NotADirectory(path) => write!(f, "not a directory: {path}"),
            AnalysisError::CacheCorrupt => write!(f, "cache file is corrupt"),
            AnalysisError::CacheRootMismatch { expected, found } => write!(
                f,
                "cache was built for root {found} but analysis was requested for {expected}"
            ),
            AnalysisError::StructuralInvariantViolated(detail) => {
                write!(f, "structural invariant violated: {detail}")
            }
        }
    }
}

impl std::error::Error for AnalysisError {}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn display_mentions_the_offending_path() {
        let err = AnalysisError::NotADirectory(Utf8PathBuf::from("/tmp/not-a-dir"));
        assert!(err.to_string().contains("/tmp/not-a-dir"));
    }
}
