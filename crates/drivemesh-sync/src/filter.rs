//! Include/exclude glob filtering
//!
//! Patterns use `/` as the separator, are case-sensitive, and `**` matches
//! zero or more path components. An entry passes when the include set is
//! empty or matches it, and no exclude matches it. Directories are walked
//! regardless of the include filter so their children can still qualify.

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};

use drivemesh_core::domain::{EngineError, EngineResult};

/// Compiled include/exclude filter over relative paths.
#[derive(Debug)]
pub struct GlobFilter {
    includes: Option<GlobSet>,
    excludes: Option<GlobSet>,
}

impl GlobFilter {
    pub fn new(includes: &[String], excludes: &[String]) -> EngineResult<Self> {
        Ok(Self {
            includes: build_set(includes)?,
            excludes: build_set(excludes)?,
        })
    }

    /// Pass-through filter.
    pub fn all() -> Self {
        Self {
            includes: None,
            excludes: None,
        }
    }

    /// Whether a file at `rel_path` participates in the sync.
    pub fn matches(&self, rel_path: &str) -> bool {
        if let Some(excludes) = &self.excludes {
            if excludes.is_match(rel_path) {
                return false;
            }
        }
        match &self.includes {
            Some(includes) => includes.is_match(rel_path),
            None => true,
        }
    }
}

fn build_set(patterns: &[String]) -> EngineResult<Option<GlobSet>> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = GlobBuilder::new(pattern)
            .literal_separator(true)
            .build()
            .map_err(|e| EngineError::InvalidArgument(format!("glob '{pattern}': {e}")))?;
        builder.add(glob);
    }
    builder
        .build()
        .map(Some)
        .map_err(|e| EngineError::InvalidArgument(format!("glob set: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(includes: &[&str], excludes: &[&str]) -> GlobFilter {
        GlobFilter::new(
            &includes.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
            &excludes.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
        )
        .unwrap()
    }

    #[test]
    fn empty_filter_passes_everything() {
        let f = filter(&[], &[]);
        assert!(f.matches("a.txt"));
        assert!(f.matches("deep/nested/b.bin"));
    }

    #[test]
    fn includes_restrict() {
        let f = filter(&["**/*.jpg"], &[]);
        assert!(f.matches("photo.jpg"));
        assert!(f.matches("2024/trip/photo.jpg"));
        assert!(!f.matches("notes.txt"));
    }

    #[test]
    fn excludes_always_win() {
        let f = filter(&["**/*.jpg"], &["tmp/**"]);
        assert!(f.matches("keep/photo.jpg"));
        assert!(!f.matches("tmp/photo.jpg"));
    }

    #[test]
    fn star_does_not_cross_separators() {
        let f = filter(&["*.txt"], &[]);
        assert!(f.matches("top.txt"));
        assert!(!f.matches("sub/inner.txt"));
    }

    #[test]
    fn double_star_matches_zero_components() {
        let f = filter(&["**/*.md"], &[]);
        assert!(f.matches("README.md"));
        assert!(f.matches("docs/guide.md"));
    }

    #[test]
    fn matching_is_case_sensitive() {
        let f = filter(&["**/*.jpg"], &[]);
        assert!(!f.matches("photo.JPG"));
    }

    #[test]
    fn invalid_pattern_is_rejected() {
        let err = GlobFilter::new(&["a[".to_string()], &[]).unwrap_err();
        assert_eq!(err.kind(), "InvalidArgument");
    }
}
