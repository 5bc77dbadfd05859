//! Concrete adapters over the parts of the stored-procedure contract this
//! crate documents and calls directly: per-space delta/base views and the
//! `for_geometry`/`here_quad`/`mercator_quad` tiling functions.
//!
//! Dataset statistics and tag/HEAD resolution are deliberately **not**
//! implemented here — they belong to the tag/version lookup and statistics
//! services named as external collaborators. `geoexport-core` consumes those
//! through a trait so production wiring and tests can each supply their own
//! client.

use anyhow::{Context, Result};
use sqlx::PgPool;

fn validate_identifier(name: &str, what: &str) -> Result<()> {
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        anyhow::bail!("{what} {name:?} contains invalid characters");
    }
    Ok(())
}

fn delta_view(space_id: &str) -> Result<String> {
    validate_identifier(space_id, "space id")?;
    Ok(format!("{space_id}_delta_view"))
}

fn base_view(space_id: &str) -> Result<String> {
    validate_identifier(space_id, "space id")?;
    Ok(format!("{space_id}_base_view"))
}

/// Feature ids changed in the half-open version range `(start_version, end_version]`.
///
/// Rows for deleted features are included with no geometry; callers that
/// need tile coverage should treat a missing geometry as "no delta tiles"
/// (see [`tile_coverage`]).
pub async fn changed_feature_ids(
    pool: &PgPool,
    space_id: &str,
    start_version: i64,
    end_version: i64,
) -> Result<Vec<String>> {
    let view = delta_view(space_id)?;

    let rows: Vec<(String,)> = sqlx::query_as(&format!(
        "SELECT DISTINCT feature_id FROM {view} \
         WHERE version > $1 AND version <= $2"
    ))
    .bind(start_version)
    .bind(end_version)
    .fetch_all(pool)
    .await
    .with_context(|| format!("failed to query delta view for space {space_id}"))?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Compute the tile ids covering the current geometry of each id in `ids` at
/// `version`, at `target_level` using `quad_type`.
///
/// Calls the documented `for_geometry`/`here_quad`/`mercator_quad` stored
/// procedures. Ids with no geometry at `version` (deleted, or not yet
/// created) contribute no tiles.
pub async fn tile_coverage(
    pool: &PgPool,
    space_id: &str,
    version: i64,
    ids: &[String],
    target_level: i32,
    quad_type: crate::models::QuadType,
) -> Result<Vec<String>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }

    let view = delta_view(space_id)?;
    let quad_fn = match quad_type {
        crate::models::QuadType::HereQuad => "here_quad",
        crate::models::QuadType::MercatorQuad => "mercator_quad",
    };

    let query = format!(
        "SELECT DISTINCT {quad_fn}(tile.col_x, tile.row_y, tile.level) AS tile_id \
         FROM {view} AS f \
         CROSS JOIN LATERAL for_geometry(f.geometry, $1, '{quad_type}') AS tile(col_x, row_y, level) \
         WHERE f.feature_id = ANY($2) AND f.version = $3 AND f.geometry IS NOT NULL"
    );

    let rows: Vec<(String,)> = sqlx::query_as(&query)
        .bind(target_level)
        .bind(ids)
        .bind(version)
        .fetch_all(pool)
        .await
        .with_context(|| format!("failed to compute tile coverage for space {space_id}"))?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Compute the tile ids covering the *previous* (start-version) geometry of
/// each id in `ids`, using the base view rather than the delta view.
///
/// This is the second pass of the changed-tiles algorithm: it recovers tiles
/// that a deletion or a geometry move emptied out.
pub async fn base_tile_coverage(
    pool: &PgPool,
    space_id: &str,
    start_version: i64,
    ids: &[String],
    target_level: i32,
    quad_type: crate::models::QuadType,
) -> Result<Vec<String>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }

    let view = base_view(space_id)?;
    let quad_fn = match quad_type {
        crate::models::QuadType::HereQuad => "here_quad",
        crate::models::QuadType::MercatorQuad => "mercator_quad",
    };

    let query = format!(
        "SELECT DISTINCT {quad_fn}(tile.col_x, tile.row_y, tile.level) AS tile_id \
         FROM {view} AS f \
         CROSS JOIN LATERAL for_geometry(f.geometry, $1, '{quad_type}') AS tile(col_x, row_y, level) \
         WHERE f.feature_id = ANY($2) AND f.version = $3 AND f.geometry IS NOT NULL"
    );

    let rows: Vec<(String,)> = sqlx::query_as(&query)
        .bind(target_level)
        .bind(ids)
        .bind(start_version)
        .fetch_all(pool)
        .await
        .with_context(|| format!("failed to compute base tile coverage for space {space_id}"))?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}
