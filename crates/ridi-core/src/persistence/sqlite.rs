//! SQLite-backed persistence implementation.

use std::path::Path;

use chrono::{Duration, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::models::{
    MapDataRecord, MapDataStatus, MapDataVersion, NewMapData, NewPlan, NewRegionBoundary,
    NewRoute, PlanQueueMessage, PlanRecord, PlanState, RegionRecord, RouteBreakdownStat,
    RouteRecord, RuleSetRoadTag, ServiceRecord, ServiceStatus, TripType,
};

use super::{ArtifactKind, Persistence, PromotionSummary};

use crate::migrations::SQLITE as MIGRATOR;

/// SQLite-backed persistence provider.
#[derive(Clone)]
pub struct SqlitePersistence {
    pool: SqlitePool,
}

impl SqlitePersistence {
    /// Create a new SQLite persistence provider from an existing pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create and initialize a new SQLite persistence from a file path.
    ///
    /// Creates parent directories and the database file when missing, then
    /// runs all migrations.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| CoreError::Database(sqlx::Error::Io(e)))?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        Self::connect(&url).await
    }

    /// Connect to a `sqlite:` URL and run migrations.
    pub async fn connect(url: &str) -> Result<Self> {
        // In-memory databases are per connection.
        let max_connections = if url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;

        MIGRATOR.run(&pool).await?;

        Ok(Self { pool })
    }

    /// Underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait::async_trait]
impl Persistence for SqlitePersistence {
    async fn map_data_get(&self, id: &str) -> Result<Option<MapDataRecord>> {
        let record = sqlx::query_as::<_, MapDataRecord>("SELECT * FROM map_data WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }

    async fn map_data_get_next(&self, region: &str) -> Result<Option<MapDataRecord>> {
        let record = sqlx::query_as::<_, MapDataRecord>(
            "SELECT * FROM map_data WHERE region = ? AND version = 'next'",
        )
        .bind(region)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn map_data_get_current(&self, region: &str) -> Result<Option<MapDataRecord>> {
        let record = sqlx::query_as::<_, MapDataRecord>(
            "SELECT * FROM map_data WHERE region = ? AND version = 'current'",
        )
        .bind(region)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn map_data_list_by_version(
        &self,
        version: MapDataVersion,
    ) -> Result<Vec<MapDataRecord>> {
        let records = sqlx::query_as::<_, MapDataRecord>(
            "SELECT * FROM map_data WHERE version = ? ORDER BY region, created_at",
        )
        .bind(version.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn map_data_list_discarded_and_previous(&self) -> Result<Vec<MapDataRecord>> {
        let records = sqlx::query_as::<_, MapDataRecord>(
            r#"
            SELECT * FROM map_data
            WHERE version IN ('discarded', 'previous')
            ORDER BY created_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn map_data_create_next(&self, new: &NewMapData) -> Result<MapDataRecord> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let record = sqlx::query_as::<_, MapDataRecord>(
            r#"
            INSERT INTO map_data (
                id, region, version, status, pbf_location, pbf_md5, cache_location,
                kml_location, router_version, next_download_after, created_at, updated_at
            ) VALUES (?, ?, 'next', 'new', ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(&id)
        .bind(&new.region)
        .bind(&new.pbf_location)
        .bind(&new.pbf_md5)
        .bind(&new.cache_location)
        .bind(&new.kml_location)
        .bind(&new.router_version)
        .bind(new.next_download_after)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(record)
    }

    async fn map_data_set_discarded(&self, id: &str) -> Result<()> {
        sqlx::query("UPDATE map_data SET version = 'discarded', updated_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn map_data_set_status(&self, id: &str, status: MapDataStatus) -> Result<()> {
        sqlx::query("UPDATE map_data SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn map_data_set_failed(&self, id: &str, error: &str) -> Result<()> {
        sqlx::query("UPDATE map_data SET status = 'error', error = ?, updated_at = ? WHERE id = ?")
            .bind(error)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn map_data_set_error_message(&self, id: &str, error: &str) -> Result<()> {
        sqlx::query("UPDATE map_data SET error = ?, updated_at = ? WHERE id = ?")
            .bind(error)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn map_data_set_pbf_size(&self, id: &str, size: i64) -> Result<()> {
        sqlx::query("UPDATE map_data SET pbf_size = ?, updated_at = ? WHERE id = ?")
            .bind(size)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn map_data_set_pbf_downloaded_size(&self, id: &str, size: i64) -> Result<()> {
        sqlx::query("UPDATE map_data SET pbf_downloaded_size = ?, updated_at = ? WHERE id = ?")
            .bind(size)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn map_data_set_build_metrics(
        &self,
        id: &str,
        cache_size: i64,
        startup_time_s: i64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE map_data SET cache_size = ?, startup_time_s = ?, updated_at = ? WHERE id = ?",
        )
        .bind(cache_size)
        .bind(startup_time_s)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn map_data_retarget(
        &self,
        id: &str,
        router_version: &str,
        cache_location: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE map_data
            SET router_version = ?, cache_location = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(router_version)
        .bind(cache_location)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn map_data_is_path_in_use(
        &self,
        kind: ArtifactKind,
        path: &str,
        except_id: &str,
    ) -> Result<bool> {
        let sql = format!(
            "SELECT COUNT(*) FROM map_data WHERE {} = ? AND id <> ?",
            kind.column()
        );
        let count: i64 = sqlx::query_scalar(&sql)
            .bind(path)
            .bind(except_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count > 0)
    }

    async fn map_data_delete(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM map_data WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn promote_next(&self) -> Result<PromotionSummary> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE regions SET version = 'previous' WHERE version = 'current'")
            .execute(&mut *tx)
            .await?;

        let regions_promoted = sqlx::query(
            r#"
            UPDATE regions SET version = 'current'
            WHERE EXISTS (
                SELECT 1 FROM map_data m
                WHERE m.version = 'next'
                  AND m.region = regions.region
                  AND m.pbf_md5 = regions.pbf_md5
            )
            "#,
        )
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let demoted = sqlx::query(
            "UPDATE map_data SET version = 'previous', updated_at = ? WHERE version = 'current'",
        )
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let promoted = sqlx::query(
            "UPDATE map_data SET version = 'current', updated_at = ? WHERE version = 'next'",
        )
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;

        Ok(PromotionSummary {
            demoted,
            promoted,
            regions_promoted,
        })
    }

    async fn service_get(&self, name: &str) -> Result<Option<ServiceRecord>> {
        let record = sqlx::query_as::<_, ServiceRecord>(
            "SELECT name, router_version, status, updated_at FROM services WHERE name = ?",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn service_upsert(&self, name: &str, router_version: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO services (name, router_version, status, updated_at)
            VALUES (?, ?, 'triggered', ?)
            ON CONFLICT (name) DO UPDATE SET
                router_version = excluded.router_version,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(name)
        .bind(router_version)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn service_set_status(&self, name: &str, status: ServiceStatus) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO services (name, router_version, status, updated_at)
            VALUES (?, NULL, ?, ?)
            ON CONFLICT (name) DO UPDATE SET
                status = excluded.status,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(name)
        .bind(status.as_str())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn service_touch(&self, name: &str) -> Result<()> {
        sqlx::query("UPDATE services SET updated_at = ? WHERE name = ?")
            .bind(Utc::now())
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn region_upsert(&self, boundary: &NewRegionBoundary) -> Result<()> {
        let (min_lon, min_lat, max_lon, max_lat) =
            boundary.bbox().ok_or_else(|| CoreError::InvalidValue {
                field: "polygon",
                value: format!("empty ring for {}", boundary.region),
            })?;
        let polygon = serde_json::to_string(&boundary.ring)?;

        sqlx::query(
            r#"
            INSERT INTO regions (
                id, region, pbf_md5, version, polygon,
                min_lon, min_lat, max_lon, max_lat, created_at
            ) VALUES (?, ?, ?, 'next', ?, ?, ?, ?, ?, ?)
            ON CONFLICT (region, pbf_md5) DO UPDATE SET
                polygon = excluded.polygon,
                min_lon = excluded.min_lon,
                min_lat = excluded.min_lat,
                max_lon = excluded.max_lon,
                max_lat = excluded.max_lat,
                version = CASE WHEN regions.version = 'current' THEN 'current' ELSE 'next' END
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&boundary.region)
        .bind(&boundary.pbf_md5)
        .bind(polygon)
        .bind(min_lon)
        .bind(min_lat)
        .bind(max_lon)
        .bind(max_lat)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn region_get(&self, region: &str, pbf_md5: &str) -> Result<Option<RegionRecord>> {
        let record = sqlx::query_as::<_, RegionRecord>(
            "SELECT * FROM regions WHERE region = ? AND pbf_md5 = ?",
        )
        .bind(region)
        .bind(pbf_md5)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn region_set_discarded(&self, region: &str, pbf_md5: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE regions SET version = 'discarded'
            WHERE region = ? AND pbf_md5 = ? AND version <> 'current'
            "#,
        )
        .bind(region)
        .bind(pbf_md5)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn region_list_current(&self) -> Result<Vec<RegionRecord>> {
        let records = sqlx::query_as::<_, RegionRecord>(
            "SELECT * FROM regions WHERE version = 'current' ORDER BY region",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn region_count_current(&self) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM regions WHERE version = 'current'")
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    async fn region_candidates_at(&self, lat: f64, lon: f64) -> Result<Vec<RegionRecord>> {
        let records = sqlx::query_as::<_, RegionRecord>(
            r#"
            SELECT * FROM regions
            WHERE version = 'current'
              AND min_lon <= ? AND max_lon >= ?
              AND min_lat <= ? AND max_lat >= ?
            ORDER BY region
            "#,
        )
        .bind(lon)
        .bind(lon)
        .bind(lat)
        .bind(lat)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn region_delete_discarded_and_previous(
        &self,
        region: &str,
        pbf_md5: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            DELETE FROM regions
            WHERE region = ? AND pbf_md5 = ? AND version IN ('discarded', 'previous')
            "#,
        )
        .bind(region)
        .bind(pbf_md5)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn plan_insert(&self, plan: &NewPlan) -> Result<PlanRecord> {
        let now = Utc::now();
        let trip_type = plan.trip_type.unwrap_or(TripType::StartFinish);
        let record = sqlx::query_as::<_, PlanRecord>(
            r#"
            INSERT INTO plans (
                id, user_id, trip_type, start_lat, start_lon, finish_lat, finish_lon,
                bearing, distance, rule_set_id, region, state, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL, 'new', ?, ?)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&plan.user_id)
        .bind(trip_type.as_str())
        .bind(&plan.start_lat)
        .bind(&plan.start_lon)
        .bind(&plan.finish_lat)
        .bind(&plan.finish_lon)
        .bind(&plan.bearing)
        .bind(&plan.distance)
        .bind(&plan.rule_set_id)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(record)
    }

    async fn plan_get(&self, id: &str) -> Result<Option<PlanRecord>> {
        let record = sqlx::query_as::<_, PlanRecord>("SELECT * FROM plans WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }

    async fn plan_set_state(&self, id: &str, state: PlanState) -> Result<()> {
        let result = sqlx::query("UPDATE plans SET state = ?, updated_at = ? WHERE id = ?")
            .bind(state.as_str())
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::not_found("plan", id));
        }
        Ok(())
    }

    async fn plan_set_region(&self, id: &str, region: &str) -> Result<()> {
        sqlx::query("UPDATE plans SET region = ?, updated_at = ? WHERE id = ?")
            .bind(region)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn route_insert(&self, route: &NewRoute) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            r#"
            INSERT INTO routes (
                id, plan_id, user_id, name, coords,
                stats_len_m, stats_junction_count, stats_score, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&route.plan_id)
        .bind(&route.user_id)
        .bind(&route.name)
        .bind(&route.coords)
        .bind(route.stats_len_m)
        .bind(route.stats_junction_count)
        .bind(route.stats_score)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    async fn route_breakdown_insert(&self, stat: &RouteBreakdownStat) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO route_breakdown_stats (route_id, user_id, stat_type, stat_name, len_m, percentage)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&stat.route_id)
        .bind(&stat.user_id)
        .bind(stat.stat_type.as_str())
        .bind(&stat.stat_name)
        .bind(stat.len_m)
        .bind(stat.percentage)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn routes_for_plan(&self, plan_id: &str) -> Result<Vec<RouteRecord>> {
        let records = sqlx::query_as::<_, RouteRecord>(
            "SELECT * FROM routes WHERE plan_id = ? ORDER BY created_at, rowid",
        )
        .bind(plan_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn route_breakdown_for_route(&self, route_id: &str) -> Result<Vec<RouteBreakdownStat>> {
        let records = sqlx::query_as::<_, RouteBreakdownStat>(
            r#"
            SELECT route_id, user_id, stat_type, stat_name, len_m, percentage
            FROM route_breakdown_stats WHERE route_id = ? ORDER BY id
            "#,
        )
        .bind(route_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn rule_set_road_tags(&self, rule_set_id: &str) -> Result<Vec<RuleSetRoadTag>> {
        let records = sqlx::query_as::<_, RuleSetRoadTag>(
            "SELECT rule_set_id, tag_key, value FROM rule_set_road_tags WHERE rule_set_id = ? ORDER BY tag_key",
        )
        .bind(rule_set_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn rule_set_road_tag_upsert(&self, tag: &RuleSetRoadTag) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO rule_set_road_tags (rule_set_id, tag_key, value) VALUES (?, ?, ?)
            ON CONFLICT (rule_set_id, tag_key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(&tag.rule_set_id)
        .bind(&tag.tag_key)
        .bind(tag.value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn plan_queue_send(&self, plan_id: &str) -> Result<i64> {
        let now = Utc::now();
        let msg_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO plan_queue (plan_id, read_ct, visible_at, enqueued_at)
            VALUES (?, 0, ?, ?)
            RETURNING msg_id
            "#,
        )
        .bind(plan_id)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(msg_id)
    }

    async fn plan_queue_read(
        &self,
        visibility_secs: i64,
        qty: i64,
    ) -> Result<Vec<PlanQueueMessage>> {
        let now = Utc::now();
        let messages = sqlx::query_as::<_, PlanQueueMessage>(
            r#"
            UPDATE plan_queue
            SET read_ct = read_ct + 1, visible_at = ?
            WHERE msg_id IN (
                SELECT msg_id FROM plan_queue
                WHERE visible_at <= ?
                ORDER BY msg_id
                LIMIT ?
            )
            RETURNING msg_id, plan_id, read_ct, visible_at, enqueued_at
            "#,
        )
        .bind(now + Duration::seconds(visibility_secs))
        .bind(now)
        .bind(qty)
        .fetch_all(&self.pool)
        .await?;
        Ok(messages)
    }

    async fn plan_queue_set_visibility(&self, msg_id: i64, visibility_secs: i64) -> Result<()> {
        sqlx::query("UPDATE plan_queue SET visible_at = ? WHERE msg_id = ?")
            .bind(Utc::now() + Duration::seconds(visibility_secs))
            .bind(msg_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn plan_queue_delete(&self, msg_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM plan_queue WHERE msg_id = ?")
            .bind(msg_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn health_check_db(&self) -> Result<bool> {
        let one: i64 = sqlx::query_scalar("SELECT 1").fetch_one(&self.pool).await?;
        Ok(one == 1)
    }
}
