//! Strategy enums used by the initial reconciliation
//!
//! Each enum includes a FromStr implementation for CLI and config parsing.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// How the first reconciliation of a session resolves differences
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum InitialSyncStrategy {
	/// Local tree wins conflicts; paths only present remotely are deleted
	MirrorLocal,

	/// Remote tree wins conflicts; paths only present locally are deleted
	MirrorRemote,

	/// Local copy wins conflicts
	PreferLocal,

	/// Remote copy wins conflicts
	PreferRemote,

	/// Newer modification time wins (default)
	#[default]
	PreferNewest,

	/// Leave conflicting files untouched on both sides
	KeepAll,
}

impl InitialSyncStrategy {
	/// Strategy used for per-file decisions
	///
	/// The mirror strategies behave like their prefer counterparts for files
	/// present on both sides; they only add deletions.
	pub fn effective(self) -> Self {
		match self {
			Self::MirrorLocal => Self::PreferLocal,
			Self::MirrorRemote => Self::PreferRemote,
			other => other,
		}
	}
}

impl FromStr for InitialSyncStrategy {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.to_lowercase().replace('_', "-").as_str() {
			"mirror-local" | "mirrorlocal" => Ok(Self::MirrorLocal),
			"mirror-remote" | "mirrorremote" => Ok(Self::MirrorRemote),
			"prefer-local" | "preferlocal" | "local" => Ok(Self::PreferLocal),
			"prefer-remote" | "preferremote" | "remote" => Ok(Self::PreferRemote),
			"prefer-newest" | "prefernewest" | "newest" => Ok(Self::PreferNewest),
			"keep-all" | "keepall" => Ok(Self::KeepAll),
			_ => Err(format!(
				"Unknown initial sync strategy: {}. Valid options: mirror-local, mirror-remote, prefer-local, prefer-remote, prefer-newest, keep-all",
				s
			)),
		}
	}
}

impl std::fmt::Display for InitialSyncStrategy {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::MirrorLocal => write!(f, "mirror-local"),
			Self::MirrorRemote => write!(f, "mirror-remote"),
			Self::PreferLocal => write!(f, "prefer-local"),
			Self::PreferRemote => write!(f, "prefer-remote"),
			Self::PreferNewest => write!(f, "prefer-newest"),
			Self::KeepAll => write!(f, "keep-all"),
		}
	}
}

/// Which metadata decides whether two copies of a file differ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CompareBy {
	/// Size and (ceiling-rounded) modification time (default)
	#[default]
	MtimeSize,

	/// Size only
	Size,
}

impl FromStr for CompareBy {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.to_lowercase().as_str() {
			"mtime-size" | "mtime" | "mtime+size" => Ok(Self::MtimeSize),
			"size" | "size-only" => Ok(Self::Size),
			_ => Err(format!("Unknown comparison: {}. Valid options: mtime-size, size", s)),
		}
	}
}

impl std::fmt::Display for CompareBy {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::MtimeSize => write!(f, "mtime-size"),
			Self::Size => write!(f, "size"),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_initial_sync_strategy_from_str() {
		assert_eq!(
			"mirror-local".parse::<InitialSyncStrategy>().unwrap(),
			InitialSyncStrategy::MirrorLocal
		);
		assert_eq!(
			"preferNewest".parse::<InitialSyncStrategy>().unwrap(),
			InitialSyncStrategy::PreferNewest
		);
		assert_eq!(
			"keep_all".parse::<InitialSyncStrategy>().unwrap(),
			InitialSyncStrategy::KeepAll
		);
		assert!("invalid".parse::<InitialSyncStrategy>().is_err());
	}

	#[test]
	fn test_display_round_trips_through_from_str() {
		for strategy in [
			InitialSyncStrategy::MirrorLocal,
			InitialSyncStrategy::MirrorRemote,
			InitialSyncStrategy::PreferLocal,
			InitialSyncStrategy::PreferRemote,
			InitialSyncStrategy::PreferNewest,
			InitialSyncStrategy::KeepAll,
		] {
			assert_eq!(strategy.to_string().parse::<InitialSyncStrategy>().unwrap(), strategy);
		}
	}

	#[test]
	fn test_mirror_strategies_map_to_prefer() {
		assert_eq!(InitialSyncStrategy::MirrorLocal.effective(), InitialSyncStrategy::PreferLocal);
		assert_eq!(InitialSyncStrategy::MirrorRemote.effective(), InitialSyncStrategy::PreferRemote);
		assert_eq!(InitialSyncStrategy::KeepAll.effective(), InitialSyncStrategy::KeepAll);
	}

	#[test]
	fn test_compare_by() {
		assert_eq!("size".parse::<CompareBy>().unwrap(), CompareBy::Size);
		assert_eq!(CompareBy::default(), CompareBy::MtimeSize);
		assert_eq!(serde_json::to_string(&CompareBy::MtimeSize).unwrap(), "\"mtime-size\"");
	}
}

// vim: ts=4
