//! Path exclusion
//!
//! The sync engine only depends on the [`IgnoreMatcher`] contract; the
//! gitignore-syntax implementation lives in [`ignore`].

mod ignore;

pub use self::ignore::GitignoreMatcher;

use std::sync::Arc;

/// Matching contract consumed by the decision functions and walkers
pub trait IgnoreMatcher: Send + Sync {
	/// True if the path must be excluded from transfer
	fn matches(&self, path: &str, is_dir: bool) -> bool;

	/// True if negating rules exist
	///
	/// Walkers must then descend into ignored directories and evaluate every
	/// descendant, since a deeper path may be re-included.
	fn require_full_scan(&self) -> bool;
}

/// The three independent matchers of a session
#[derive(Clone, Default)]
pub struct Matchers {
	/// Excluded in both directions
	pub exclude: Option<Arc<dyn IgnoreMatcher>>,

	/// Never uploaded and never deleted remotely
	pub upload_exclude: Option<Arc<dyn IgnoreMatcher>>,

	/// Never downloaded and never deleted locally
	pub download_exclude: Option<Arc<dyn IgnoreMatcher>>,
}

impl Matchers {
	/// Compile the three pattern lists; empty lists produce no matcher
	pub fn compile(
		exclude: &[String],
		upload_exclude: &[String],
		download_exclude: &[String],
	) -> Result<Self, ExclusionError> {
		Ok(Matchers {
			exclude: compile_optional(exclude)?,
			upload_exclude: compile_optional(upload_exclude)?,
			download_exclude: compile_optional(download_exclude)?,
		})
	}

	pub fn is_excluded(&self, path: &str, is_dir: bool) -> bool {
		matches(&self.exclude, path, is_dir)
	}

	pub fn is_upload_excluded(&self, path: &str, is_dir: bool) -> bool {
		matches(&self.upload_exclude, path, is_dir)
	}

	pub fn is_download_excluded(&self, path: &str, is_dir: bool) -> bool {
		matches(&self.download_exclude, path, is_dir)
	}

	/// Walkers may prune excluded directories unless this is set
	pub fn require_full_scan(&self) -> bool {
		[&self.exclude, &self.upload_exclude, &self.download_exclude]
			.into_iter()
			.flatten()
			.any(|m| m.require_full_scan())
	}
}

fn compile_optional(patterns: &[String]) -> Result<Option<Arc<dyn IgnoreMatcher>>, ExclusionError> {
	if patterns.is_empty() {
		return Ok(None);
	}
	Ok(Some(Arc::new(GitignoreMatcher::new(patterns)?)))
}

fn matches(matcher: &Option<Arc<dyn IgnoreMatcher>>, path: &str, is_dir: bool) -> bool {
	matcher.as_ref().is_some_and(|m| m.matches(path, is_dir))
}

/// Exclusion errors
#[derive(Debug)]
pub enum ExclusionError {
	/// Failed to parse a pattern
	InvalidPattern(String),
}

impl std::fmt::Display for ExclusionError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			ExclusionError::InvalidPattern(msg) => {
				write!(f, "Invalid exclusion pattern: {}", msg)
			}
		}
	}
}

impl std::error::Error for ExclusionError {}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_matchers_are_independent() {
		let matchers = Matchers::compile(
			&["*.log".to_string()],
			&["dist/".to_string()],
			&["uploads/".to_string()],
		)
		.unwrap();

		assert!(matchers.is_excluded("a.log", false));
		assert!(!matchers.is_upload_excluded("a.log", false));
		assert!(matchers.is_upload_excluded("dist/app.js", false));
		assert!(!matchers.is_excluded("dist/app.js", false));
		assert!(matchers.is_download_excluded("uploads/img.png", false));
		assert!(!matchers.require_full_scan());
	}

	#[test]
	fn test_empty_lists_match_nothing() {
		let matchers = Matchers::compile(&[], &[], &[]).unwrap();
		assert!(matchers.exclude.is_none());
		assert!(!matchers.is_excluded("anything", true));
	}
}

// vim: ts=4
