//! Gitignore-syntax matcher
//!
//! Uses the `ignore` crate (same as ripgrep) for gitignore-style pattern handling.

use super::{ExclusionError, IgnoreMatcher};
use ignore::gitignore::{Gitignore, GitignoreBuilder};

/// Matcher compiled from an ordered list of gitignore lines
pub struct GitignoreMatcher {
	gitignore: Gitignore,

	/// At least one negating (`!`) rule exists
	negated: bool,
}

impl GitignoreMatcher {
	/// Compile an ordered list of gitignore lines
	///
	/// Patterns are rooted at the sync root, so `/build` only matches the
	/// top-level entry while `build` matches at any depth.
	pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self, ExclusionError> {
		let mut builder = GitignoreBuilder::new("/");
		let mut negated = false;

		for line in patterns {
			let line = line.as_ref();
			if line.trim().is_empty() {
				continue;
			}
			if line.trim_start().starts_with('!') {
				negated = true;
			}
			builder
				.add_line(None, line)
				.map_err(|e| ExclusionError::InvalidPattern(format!("{}: {}", line, e)))?;
		}

		let gitignore =
			builder.build().map_err(|e| ExclusionError::InvalidPattern(e.to_string()))?;

		Ok(Self { gitignore, negated })
	}

	/// Number of compiled rules
	pub fn len(&self) -> usize {
		self.gitignore.len()
	}

	pub fn is_empty(&self) -> bool {
		self.gitignore.is_empty()
	}
}

impl IgnoreMatcher for GitignoreMatcher {
	fn matches(&self, path: &str, is_dir: bool) -> bool {
		let relative = path.trim_start_matches('/');
		if relative.is_empty() {
			return false;
		}
		self.gitignore.matched_path_or_any_parents(relative, is_dir).is_ignore()
	}

	fn require_full_scan(&self) -> bool {
		self.negated
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_gitignore_basic() {
		let matcher = GitignoreMatcher::new(&[
			"# Comment",
			"*.log",
			"node_modules/",
			"/target",
			"",
		])
		.unwrap();

		assert!(matcher.matches("test.log", false));
		assert!(matcher.matches("foo/bar.log", false));

		// Directory-only rules and everything below them
		assert!(matcher.matches("node_modules", true));
		assert!(!matcher.matches("node_modules", false));
		assert!(matcher.matches("web/node_modules/left-pad/index.js", false));

		// Anchored rules only apply at the root
		assert!(matcher.matches("target", true));
		assert!(!matcher.matches("src/target", true));

		assert!(!matcher.matches("src/main.rs", false));
		assert!(!matcher.require_full_scan());
	}

	#[test]
	fn test_negation_forces_full_scan() {
		let matcher = GitignoreMatcher::new(&["*.log", "!keep.log"]).unwrap();

		assert!(matcher.require_full_scan());
		assert!(matcher.matches("app.log", false));
		assert!(!matcher.matches("keep.log", false));
	}

	#[test]
	fn test_leading_slash_is_accepted() {
		let matcher = GitignoreMatcher::new(&["*.tmp"]).unwrap();
		assert!(matcher.matches("/a/b.tmp", false));
		assert!(!matcher.matches("/", true));
	}

	#[test]
	fn test_empty_pattern_list() {
		let matcher = GitignoreMatcher::new::<&str>(&[]).unwrap();
		assert!(matcher.is_empty());
		assert!(!matcher.matches("anything.txt", false));
	}
}

// vim: ts=4
