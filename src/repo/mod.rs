//! The repository engine: the Add/Remove/Move state machine that
//! orchestrates every other component under a per-repository lock.
//!
//! `lock` is the advisory file lock guaranteeing a single serialized mutator
//! per `(repo, arch)`; `engine` is the orchestration itself.

mod engine;
mod lock;

pub use engine::{
    AddOutcome, AddRequest, MoveRequest, RemoveRequest, RepositoryContext, add, collect_garbage,
    move_pkg, reconcile, remove,
};
pub use lock::RepoLock;

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use crate::error::Error;

/// One of the (up to) six stability layers a repository declares: three
/// primary layers plus their parallel debug series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Layer {
    Stable,
    Testing,
    Staging,
    Debug,
    TestingDebug,
    StagingDebug,
}

/// Which of the two parallel layer series (primary or debug) a layer
/// belongs to. Stability comparisons never cross series.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Series {
    Primary,
    Debug,
}

impl Layer {
    /// The key used by [`crate::config::RepositoryConfig::layers`] and
    /// `resolved_layer_paths` to name this layer's configured directory.
    pub fn config_key(self) -> &'static str {
        match self {
            Layer::Stable => "stable",
            Layer::Testing => "testing",
            Layer::Staging => "staging",
            Layer::Debug => "debug",
            Layer::TestingDebug => "testing_debug",
            Layer::StagingDebug => "staging_debug",
        }
    }

    /// The series this layer belongs to, and its stability rank within
    /// that series (0 = least stable / staging, 2 = most stable / stable).
    pub fn series_and_rank(self) -> (Series, u8) {
        match self {
            Layer::Staging => (Series::Primary, 0),
            Layer::Testing => (Series::Primary, 1),
            Layer::Stable => (Series::Primary, 2),
            Layer::StagingDebug => (Series::Debug, 0),
            Layer::TestingDebug => (Series::Debug, 1),
            Layer::Debug => (Series::Debug, 2),
        }
    }

    /// Every layer in the same series as `self`, including `self`.
    pub fn series_members(self) -> [Layer; 3] {
        match self.series_and_rank().0 {
            Series::Primary => [Layer::Staging, Layer::Testing, Layer::Stable],
            Series::Debug => [Layer::StagingDebug, Layer::TestingDebug, Layer::Debug],
        }
    }
}

impl Display for Layer {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.config_key())
    }
}

impl FromStr for Layer {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input {
            "stable" => Ok(Layer::Stable),
            "testing" => Ok(Layer::Testing),
            "staging" => Ok(Layer::Staging),
            "debug" => Ok(Layer::Debug),
            "testing_debug" => Ok(Layer::TestingDebug),
            "staging_debug" => Ok(Layer::StagingDebug),
            other => Err(Error::Config {
                msg: format!("unknown layer '{other}'"),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staging_is_exempt_only_against_testing_within_its_series() {
        let (series, rank) = Layer::Staging.series_and_rank();
        assert_eq!(series, Series::Primary);
        assert_eq!(rank, 0);
        assert_eq!(Layer::Testing.series_and_rank().1, 1);
        assert_eq!(Layer::Stable.series_and_rank().1, 2);
    }

    #[test]
    fn debug_series_is_disjoint_from_primary() {
        assert_eq!(Layer::Debug.series_and_rank().0, Series::Debug);
        assert_eq!(
            Layer::Debug.series_members(),
            [Layer::StagingDebug, Layer::TestingDebug, Layer::Debug]
        );
    }

    #[test]
    fn config_key_round_trips_through_from_str() {
        for layer in [
            Layer::Stable,
            Layer::Testing,
            Layer::Staging,
            Layer::Debug,
            Layer::TestingDebug,
            Layer::StagingDebug,
        ] {
            assert_eq!(layer.config_key().parse::<Layer>().unwrap(), layer);
        }
    }
}
