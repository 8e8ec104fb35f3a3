// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL-backed persistence implementation.

use chrono::{Duration, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::models::{
    MapDataRecord, MapDataStatus, MapDataVersion, NewMapData, NewPlan, NewRegionBoundary,
    NewRoute, PlanQueueMessage, PlanRecord, PlanState, RegionRecord, RouteBreakdownStat,
    RouteRecord, RuleSetRoadTag, ServiceRecord, ServiceStatus, TripType,
};

use super::{ArtifactKind, Persistence, PromotionSummary};

/// PostgreSQL-backed persistence implementation.
#[derive(Clone)]
pub struct PostgresPersistence {
    pool: PgPool,
}

impl PostgresPersistence {
    /// Create a new Postgres-backed persistence implementation.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait::async_trait]
impl Persistence for PostgresPersistence {
    async fn map_data_get(&self, id: &str) -> Result<Option<MapDataRecord>> {
        let record = sqlx::query_as::<_, MapDataRecord>("SELECT * FROM map_data WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }

    async fn map_data_get_next(&self, region: &str) -> Result<Option<MapDataRecord>> {
        let record = sqlx::query_as::<_, MapDataRecord>(
            "SELECT * FROM map_data WHERE region = $1 AND version = 'next'",
        )
        .bind(region)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn map_data_get_current(&self, region: &str) -> Result<Option<MapDataRecord>> {
        let record = sqlx::query_as::<_, MapDataRecord>(
            "SELECT * FROM map_data WHERE region = $1 AND version = 'current'",
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
            "SELECT * FROM map_data WHERE version = $1 ORDER BY region, created_at",
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
        let now = Utc::now();
        let record = sqlx::query_as::<_, MapDataRecord>(
            r#"
            INSERT INTO map_data (
                id, region, version, status, pbf_location, pbf_md5, cache_location,
                kml_location, router_version, next_download_after, created_at, updated_at
            ) VALUES ($1, $2, 'next', 'new', $3, $4, $5, $6, $7, $8, $9, $9)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&new.region)
        .bind(&new.pbf_location)
        .bind(&new.pbf_md5)
        .bind(&new.cache_location)
        .bind(&new.kml_location)
        .bind(&new.router_version)
        .bind(new.next_download_after)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(record)
    }

    async fn map_data_set_discarded(&self, id: &str) -> Result<()> {
        sqlx::query("UPDATE map_data SET version = 'discarded', updated_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn map_data_set_status(&self, id: &str, status: MapDataStatus) -> Result<()> {
        sqlx::query("UPDATE map_data SET status = $1, updated_at = NOW() WHERE id = $2")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn map_data_set_failed(&self, id: &str, error: &str) -> Result<()> {
        sqlx::query(
            "UPDATE map_data SET status = 'error', error = $1, updated_at = NOW() WHERE id = $2",
        )
        .bind(error)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn map_data_set_error_message(&self, id: &str, error: &str) -> Result<()> {
        sqlx::query("UPDATE map_data SET error = $1, updated_at = NOW() WHERE id = $2")
            .bind(error)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn map_data_set_pbf_size(&self, id: &str, size: i64) -> Result<()> {
        sqlx::query("UPDATE map_data SET pbf_size = $1, updated_at = NOW() WHERE id = $2")
            .bind(size)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn map_data_set_pbf_downloaded_size(&self, id: &str, size: i64) -> Result<()> {
        sqlx::query(
            "UPDATE map_data SET pbf_downloaded_size = $1, updated_at = NOW() WHERE id = $2",
        )
        .bind(size)
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
            r#"
            UPDATE map_data
            SET cache_size = $1, startup_time_s = $2, updated_at = NOW()
            WHERE id = $3
            "#,
        )
        .bind(cache_size)
        .bind(startup_time_s)
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
            SET router_version = $1, cache_location = $2, updated_at = NOW()
            WHERE id = $3
            "#,
        )
        .bind(router_version)
        .bind(cache_location)
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
            "SELECT EXISTS (SELECT 1 FROM map_data WHERE {} = $1 AND id <> $2)",
            kind.column()
        );
        let in_use: bool = sqlx::query_scalar(&sql)
            .bind(path)
            .bind(except_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(in_use)
    }

    async fn map_data_delete(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM map_data WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn promote_next(&self) -> Result<PromotionSummary> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE regions SET version = 'previous' WHERE version = 'current'")
            .execute(&mut *tx)
            .await?;

        let regions_promoted = sqlx::query(
            r#"
            UPDATE regions r SET version = 'current'
            FROM map_data m
            WHERE m.version = 'next'
              AND m.region = r.region
              AND m.pbf_md5 = r.pbf_md5
            "#,
        )
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let demoted = sqlx::query(
            "UPDATE map_data SET version = 'previous', updated_at = NOW() WHERE version = 'current'",
        )
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let promoted = sqlx::query(
            "UPDATE map_data SET version = 'current', updated_at = NOW() WHERE version = 'next'",
        )
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
            "SELECT name, router_version, status, updated_at FROM services WHERE name = $1",
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
            VALUES ($1, $2, 'triggered', NOW())
            ON CONFLICT (name) DO UPDATE SET
                router_version = EXCLUDED.router_version,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(name)
        .bind(router_version)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn service_set_status(&self, name: &str, status: ServiceStatus) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO services (name, router_version, status, updated_at)
            VALUES ($1, NULL, $2, NOW())
            ON CONFLICT (name) DO UPDATE SET
                status = EXCLUDED.status,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(name)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn service_touch(&self, name: &str) -> Result<()> {
        sqlx::query("UPDATE services SET updated_at = NOW() WHERE name = $1")
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
            ) VALUES ($1, $2, $3, 'next', $4, $5, $6, $7, $8, NOW())
            ON CONFLICT (region, pbf_md5) DO UPDATE SET
                polygon = EXCLUDED.polygon,
                min_lon = EXCLUDED.min_lon,
                min_lat = EXCLUDED.min_lat,
                max_lon = EXCLUDED.max_lon,
                max_lat = EXCLUDED.max_lat,
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
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn region_get(&self, region: &str, pbf_md5: &str) -> Result<Option<RegionRecord>> {
        let record = sqlx::query_as::<_, RegionRecord>(
            "SELECT * FROM regions WHERE region = $1 AND pbf_md5 = $2",
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
            WHERE region = $1 AND pbf_md5 = $2 AND version <> 'current'
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
              AND min_lon <= $1 AND max_lon >= $1
              AND min_lat <= $2 AND max_lat >= $2
            ORDER BY region
            "#,
        )
        .bind(lon)
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
            WHERE region = $1 AND pbf_md5 = $2 AND version IN ('discarded', 'previous')
            "#,
        )
        .bind(region)
        .bind(pbf_md5)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn plan_insert(&self, plan: &NewPlan) -> Result<PlanRecord> {
        let trip_type = plan.trip_type.unwrap_or(TripType::StartFinish);
        let record = sqlx::query_as::<_, PlanRecord>(
            r#"
            INSERT INTO plans (
                id, user_id, trip_type, start_lat, start_lon, finish_lat, finish_lon,
                bearing, distance, rule_set_id, region, state, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, NULL, 'new', NOW(), NOW())
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
        .fetch_one(&self.pool)
        .await?;
        Ok(record)
    }

    async fn plan_get(&self, id: &str) -> Result<Option<PlanRecord>> {
        let record = sqlx::query_as::<_, PlanRecord>("SELECT * FROM plans WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }

    async fn plan_set_state(&self, id: &str, state: PlanState) -> Result<()> {
        let result = sqlx::query("UPDATE plans SET state = $1, updated_at = NOW() WHERE id = $2")
            .bind(state.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::not_found("plan", id));
        }
        Ok(())
    }

    async fn plan_set_region(&self, id: &str, region: &str) -> Result<()> {
        sqlx::query("UPDATE plans SET region = $1, updated_at = NOW() WHERE id = $2")
            .bind(region)
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
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW())
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
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    async fn route_breakdown_insert(&self, stat: &RouteBreakdownStat) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO route_breakdown_stats (route_id, user_id, stat_type, stat_name, len_m, percentage)
            VALUES ($1, $2, $3, $4, $5, $6)
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
            "SELECT * FROM routes WHERE plan_id = $1 ORDER BY created_at, id",
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
            FROM route_breakdown_stats WHERE route_id = $1 ORDER BY id
            "#,
        )
        .bind(route_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn rule_set_road_tags(&self, rule_set_id: &str) -> Result<Vec<RuleSetRoadTag>> {
        let records = sqlx::query_as::<_, RuleSetRoadTag>(
            "SELECT rule_set_id, tag_key, value FROM rule_set_road_tags WHERE rule_set_id = $1 ORDER BY tag_key",
        )
        .bind(rule_set_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn rule_set_road_tag_upsert(&self, tag: &RuleSetRoadTag) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO rule_set_road_tags (rule_set_id, tag_key, value) VALUES ($1, $2, $3)
            ON CONFLICT (rule_set_id, tag_key) DO UPDATE SET value = EXCLUDED.value
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
        let msg_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO plan_queue (plan_id, read_ct, visible_at, enqueued_at)
            VALUES ($1, 0, NOW(), NOW())
            RETURNING msg_id
            "#,
        )
        .bind(plan_id)
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
            SET read_ct = read_ct + 1, visible_at = $1
            WHERE msg_id IN (
                SELECT msg_id FROM plan_queue
                WHERE visible_at <= $2
                ORDER BY msg_id
                LIMIT $3
                FOR UPDATE SKIP LOCKED
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
        sqlx::query("UPDATE plan_queue SET visible_at = $1 WHERE msg_id = $2")
            .bind(Utc::now() + Duration::seconds(visibility_secs))
            .bind(msg_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn plan_queue_delete(&self, msg_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM plan_queue WHERE msg_id = $1")
            .bind(msg_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn health_check_db(&self) -> Result<bool> {
        let one: i32 = sqlx::query_scalar("SELECT 1").fetch_one(&self.pool).await?;
        Ok(one == 1)
    }
}
