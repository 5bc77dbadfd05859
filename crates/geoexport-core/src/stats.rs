//! The `StatisticsClient` trait -- the named collaborator for the dataset
//! statistics and tag/version lookup services.
//!
//! Both services are out of scope as reimplemented features (see the
//! top-level scope notes): the engine only needs their documented contract,
//! so production wiring to the real HTTP services lives outside this crate.
//! Tests drive the engine against fakes implementing this trait.

use anyhow::Result;
use async_trait::async_trait;

/// Dataset-level statistics consulted by [`crate::resource::ResourceEstimator`]
/// and by `VersionRef` resolution.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DatasetStatistics {
    pub byte_size: i64,
    pub feature_count: i64,
    pub max_version: i64,
}

/// Consults the feature-store's statistics and tag/version lookup services.
#[async_trait]
pub trait StatisticsClient: Send + Sync {
    /// Current dataset statistics for `space_id`.
    ///
    /// A `428`-equivalent from the real service should be surfaced by the
    /// implementation as a "dataset deactivated" validation failure, mapped
    /// by the caller into [`crate::error::EngineError::ValidationError`].
    async fn dataset_statistics(&self, space_id: &str) -> Result<DatasetStatistics>;

    /// Resolve a named tag to a concrete integer version.
    async fn resolve_tag(&self, space_id: &str, tag: &str) -> Result<i64>;

    /// Database-side precalculation of a generic download export's thread
    /// count, given the estimated feature count, the export `SELECT` query,
    /// and the source table.
    async fn precalc_thread_count(
        &self,
        feature_count: i64,
        select_query: &str,
        source_table: &str,
    ) -> Result<usize>;
}


#[cfg(test)]
mod tests {
    use super::test_support::FakeStatisticsClient;
    use super::*;

    #[tokio::test]
    async fn fake_resolves_known_tag() {
        let client = FakeStatisticsClient {
            tags: vec![("release-42".to_owned(), 42)],
            ..Default::default()
        };
        let version = client.resolve_tag("space-a", "release-42").await.unwrap();
        assert_eq!(version, 42);
    }

    #[tokio::test]
    async fn fake_rejects_unknown_tag() {
        let client = FakeStatisticsClient::default();
        assert!(client.resolve_tag("space-a", "missing").await.is_err());
    }
}
