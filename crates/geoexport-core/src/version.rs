//! Resolves a [`VersionRef`] to one that contains only concrete integers.

use geoexport_db::models::VersionRef;
use tracing::debug;

use crate::error::EngineError;
use crate::stats::StatisticsClient;

/// Resolve `version_ref` against the statistics/tag services.
///
/// `Concrete` and `Range` pass through unchanged (they already satisfy the
/// post-resolve invariant). `Head` resolves to the dataset's current
/// `maxVersion`; `Tag` resolves through the tag lookup service. Any failure
/// reaching the backing service, or an unresolvable reference, surfaces as
/// [`EngineError::ValidationError`] -- resolution failures are always
/// terminal for the step.
pub async fn resolve(
    version_ref: &VersionRef,
    space_id: &str,
    statistics: &dyn StatisticsClient,
) -> Result<VersionRef, EngineError> {
    match version_ref {
        VersionRef::Concrete(_) | VersionRef::Range { .. } => Ok(version_ref.clone()),
        VersionRef::Head => {
            let stats = statistics
                .dataset_statistics(space_id)
                .await
                .map_err(|e| EngineError::ValidationError(format!("HEAD resolution failed: {e}")))?;
            debug!(space_id, version = stats.max_version, "resolved HEAD");
            Ok(VersionRef::Concrete(stats.max_version))
        }
        VersionRef::Tag(tag) => {
            let version = statistics
                .resolve_tag(space_id, tag)
                .await
                .map_err(|e| {
                    EngineError::ValidationError(format!("tag {tag:?} could not be resolved: {e}"))
                })?;
            debug!(space_id, tag, version, "resolved tag");
            Ok(VersionRef::Concrete(version))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::test_support::FakeStatisticsClient;
    use crate::stats::DatasetStatistics;

    #[tokio::test]
    async fn concrete_passes_through() {
        let client = FakeStatisticsClient::default();
        let resolved = resolve(&VersionRef::Concrete(7), "space-a", &client)
            .await
            .unwrap();
        assert_eq!(resolved, VersionRef::Concrete(7));
    }

    #[tokio::test]
    async fn range_passes_through() {
        let client = FakeStatisticsClient::default();
        let input = VersionRef::Range { start: 10, end: 11 };
        let resolved = resolve(&input, "space-a", &client).await.unwrap();
        assert_eq!(resolved, input);
    }

    #[tokio::test]
    async fn head_resolves_to_max_version() {
        let client = FakeStatisticsClient {
            statistics: DatasetStatistics {
                byte_size: 0,
                feature_count: 0,
                max_version: 42,
            },
            ..Default::default()
        };
        let resolved = resolve(&VersionRef::Head, "space-a", &client).await.unwrap();
        assert_eq!(resolved, VersionRef::Concrete(42));
    }

    #[tokio::test]
    async fn tag_resolves_via_lookup() {
        let client = FakeStatisticsClient {
            tags: vec![("v1".to_owned(), 9)],
            ..Default::default()
        };
        let resolved = resolve(&VersionRef::Tag("v1".into()), "space-a", &client)
            .await
            .unwrap();
        assert_eq!(resolved, VersionRef::Concrete(9));
    }

    #[tokio::test]
    async fn unknown_tag_is_a_validation_error() {
        let client = FakeStatisticsClient::default();
        let err = resolve(&VersionRef::Tag("missing".into()), "space-a", &client)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ValidationError(_)));
    }
}
