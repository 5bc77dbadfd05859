//! `ChangedTilesPlanner` -- computes the task set for an incremental tile
//! export by diffing two dataset versions and mapping the changes onto a
//! tile grid.

use std::collections::BTreeSet;

use async_trait::async_trait;
use geoexport_db::models::QuadType;
use geoexport_db::{feature_store, task_table};
use sqlx::PgPool;

use crate::engine::TaskedStep;
use crate::error::EngineError;
use crate::resource::ExportKind;

/// Validated, read-only configuration for one changed-tiles run.
/// `start_version`/`end_version` must already be resolved integers (see
/// [`crate::version::resolve`]).
#[derive(Debug, Clone)]
pub struct ChangedTilesConfig {
    pub space_id: String,
    pub start_version: i64,
    pub end_version: i64,
    pub target_level: i32,
    pub quad_type: QuadType,
    /// How many historical versions the dataset is configured to retain;
    /// diffing requires more than one.
    pub versions_to_keep: i64,
}

impl ChangedTilesConfig {
    pub fn validate(&self) -> Result<(), EngineError> {
        if !(0..=12).contains(&self.target_level) {
            return Err(EngineError::ValidationError(
                "TargetLevel must be between 0 and 12".into(),
            ));
        }
        if self.versions_to_keep <= 1 {
            return Err(EngineError::ValidationError(
                "dataset must retain more than one version of history".into(),
            ));
        }
        Ok(())
    }
}

/// The set of tile ids, tagged with their level and encoding, invalidated or
/// re-exported by a completed changed-tiles step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileInvalidations {
    pub tile_level: i32,
    pub quad_type: QuadType,
    pub tile_ids: Vec<String>,
}

/// Deduplicate and sort the tile ids produced by the delta-view and
/// base-view passes of the changed-tiles algorithm.
fn union_tile_ids(new_tiles: Vec<String>, old_tiles: Vec<String>) -> Vec<String> {
    let mut set: BTreeSet<String> = new_tiles.into_iter().collect();
    set.extend(old_tiles);
    set.into_iter().collect()
}

pub struct ChangedTilesPlanner {
    config: ChangedTilesConfig,
    pool: PgPool,
}

impl ChangedTilesPlanner {
    pub fn new(config: ChangedTilesConfig, pool: PgPool) -> Self {
        Self { config, pool }
    }

    /// Two-pass tile diff (§4.4): tiles covering the changed ids' *current*
    /// geometry, unioned with tiles covering their *previous* geometry, so
    /// deletions and geometry moves invalidate the tiles they emptied.
    async fn affected_tile_ids(&self) -> Result<Vec<String>, EngineError> {
        let changed_ids = feature_store::changed_feature_ids(
            &self.pool,
            &self.config.space_id,
            self.config.start_version,
            self.config.end_version,
        )
        .await
        .map_err(EngineError::TransientDbError)?;

        let new_tiles = feature_store::tile_coverage(
            &self.pool,
            &self.config.space_id,
            self.config.end_version,
            &changed_ids,
            self.config.target_level,
            self.config.quad_type,
        )
        .await
        .map_err(EngineError::TransientDbError)?;

        let old_tiles = feature_store::base_tile_coverage(
            &self.pool,
            &self.config.space_id,
            self.config.start_version,
            &changed_ids,
            self.config.target_level,
            self.config.quad_type,
        )
        .await
        .map_err(EngineError::TransientDbError)?;

        Ok(union_tile_ids(new_tiles, old_tiles))
    }
}

#[async_trait]
impl TaskedStep for ChangedTilesPlanner {
    fn build_per_task_query(&self, task_data: &serde_json::Value) -> Result<String, EngineError> {
        let tile_id = task_data.as_str().ok_or_else(|| EngineError::TaskQueryBuildError {
            task_id: -1,
            reason: "task_data is not a tile id string".into(),
        })?;

        // Opaque to this crate beyond its shape: selects features at
        // end_version intersecting the tile, tagging each with the tile id
        // under `@ns:com:here:xyz.partitionKey`.
        Ok(format!(
            "SELECT *, '{tile_id}' AS \"@ns:com:here:xyz.partitionKey\" \
             FROM features_at_version('{space}', {version}) \
             WHERE geometry && tile_bbox('{tile_id}', '{quad_type}')",
            tile_id = tile_id,
            space = self.config.space_id,
            version = self.config.end_version,
            quad_type = self.config.quad_type,
        ))
    }

    fn initial_thread_count(&self) -> usize {
        8
    }

    fn export_kind(&self) -> ExportKind {
        ExportKind::ChangedTiles
    }

    async fn create_task_items(&self) -> Result<Vec<serde_json::Value>, EngineError> {
        let tiles = self.affected_tile_ids().await?;
        Ok(tiles.into_iter().map(serde_json::Value::String).collect())
    }
}

/// The `onAsyncSuccess` output: tiles whose export produced no bytes, i.e.
/// tiles that are now empty.
pub async fn tile_invalidations(
    pool: &PgPool,
    schema: &str,
    step_id: &str,
    target_level: i32,
    quad_type: QuadType,
) -> Result<TileInvalidations, EngineError> {
    let empty = task_table::empty_task_ids(pool, schema, step_id)
        .await
        .map_err(EngineError::TransientDbError)?;

    let tile_ids = empty
        .into_iter()
        .filter_map(|v| v.as_str().map(str::to_owned))
        .collect();

    Ok(TileInvalidations {
        tile_level: target_level,
        quad_type,
        tile_ids,
    })
}
