//! HTTP request handlers
//!
//! Handlers are stateless: they validate/learn synchronously and hand all
//! side effects to the async sink as detached tasks, so the response never
//! waits on catalog refinement or analytics writes.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::error;

use coordcheck_common::model::{
    AbsoluteOverride, CompanionEntry, DeviceLastPosition, LearnReport, LearnResponse,
    ObservationStatus, PointStatsRecord, PositionReport, SourceRef, SourceType,
    ValidateResponse, Verdict, VerdictRecord,
};
use coordcheck_common::params::{ConfigChange, ConfigParam, UpdateOutcome};
use coordcheck_common::time;

use crate::validate::{seed_anchor, ValidationOutcome};
use crate::AppState;

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: String,
    module: String,
    version: String,
}

#[derive(Debug, Serialize)]
pub struct BuildInfoResponse {
    version: String,
    git_rev: String,
    built_at: String,
    profile: String,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct CompanionsResponse {
    object_id: String,
    companions: Vec<CompanionEntry>,
}

#[derive(Debug, Deserialize)]
pub struct SetAbsoluteRequest {
    point_type: String,
    point_id: String,
    latitude: f64,
    longitude: f64,
    accuracy: f32,
    /// Provenance tag for the override
    source: String,
    /// Expiry, unix seconds
    expires_at: i64,
}

#[derive(Debug, Serialize)]
pub struct CalculatedInfo {
    latitude: f64,
    longitude: f64,
    confidence: f64,
    observations: i64,
    last_seen: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct PointInfoResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    absolute: Option<AbsoluteOverride>,
    #[serde(skip_serializing_if = "Option::is_none")]
    calculated: Option<CalculatedInfo>,
    stationary: bool,
}

#[derive(Debug, Deserialize)]
pub struct PointInfoQuery {
    /// Object whose observation history decides `stationary`
    #[serde(default)]
    object_id: String,
}

#[derive(Debug, Serialize)]
pub struct ConfigResponse {
    parameters: Vec<ConfigParam>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateConfigRequest {
    key: String,
    value: String,
    #[serde(default)]
    reason: String,
}

#[derive(Debug, Serialize)]
pub struct UpdateConfigResponse {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    old_value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    new_value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ConfigHistoryResponse {
    changes: Vec<ConfigChange>,
}

type HandlerError = (StatusCode, Json<StatusResponse>);

fn internal_error(e: coordcheck_common::Error) -> HandlerError {
    error!("request failed: {}", e);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(StatusResponse {
            status: format!("error: {}", e),
        }),
    )
}

fn bad_request(msg: &str) -> HandlerError {
    (
        StatusCode::BAD_REQUEST,
        Json(StatusResponse {
            status: format!("error: {}", msg),
        }),
    )
}

// ============================================================================
// Health / build info
// ============================================================================

/// GET /health - Health check endpoint
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        module: "coordcheck-server".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// GET /build_info - Build identification
pub async fn build_info() -> Json<BuildInfoResponse> {
    Json(BuildInfoResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        git_rev: env!("BUILD_GIT_REV").to_string(),
        built_at: env!("BUILD_TIME_UTC").to_string(),
        profile: env!("BUILD_PROFILE").to_string(),
    })
}

// ============================================================================
// Validation flow
// ============================================================================

/// POST /validate - Validate one position report
pub async fn validate(
    State(ctx): State<AppState>,
    Json(report): Json<PositionReport>,
) -> Result<Json<ValidateResponse>, HandlerError> {
    let outcome = ctx
        .validator
        .validate(&report)
        .await
        .map_err(internal_error)?;

    schedule_side_effects(&ctx, &report, &outcome).await;

    Ok(Json(outcome.response))
}

/// Schedule the background work for a non-INVALID verdict
///
/// Ordering matters only within one caller: batch streams call this in
/// report order, so side effects start in report order too. Completion
/// order of the detached tasks is unspecified.
pub(crate) async fn schedule_side_effects(
    ctx: &AppState,
    report: &PositionReport,
    outcome: &ValidationOutcome,
) {
    if outcome.response.verdict == Verdict::Invalid {
        return;
    }

    // Last accepted position feeds the next speed check
    {
        let catalog = ctx.catalog.clone();
        let device_id = report.device_id.clone();
        let position = DeviceLastPosition {
            lat: report.latitude,
            lon: report.longitude,
            timestamp: report.timestamp,
            wall_time: time::now(),
        };
        ctx.sink
            .spawn_detached("update-last-position", async move {
                catalog.put_last_position(&device_id, &position).await
            })
            .await;
    }

    // Every catalog miss seeds an anchor and a point-stats row
    for unknown in &outcome.unknown_sources {
        let catalog = ctx.catalog.clone();
        let sink = ctx.sink.clone();
        let source = unknown.source.clone();
        let anchor = seed_anchor(unknown, report.latitude, report.longitude);
        let stats = PointStatsRecord {
            source_type: source.source_type,
            source_id: source.source_id.clone(),
            latitude: report.latitude,
            longitude: report.longitude,
            observations: 1,
            last_updated: time::now(),
        };
        ctx.sink
            .spawn_detached("learn-unknown-source", async move {
                catalog.put_anchor(&source, &anchor).await?;
                sink.record_point_stats(stats).await;
                Ok(())
            })
            .await;
    }

    ctx.sink
        .record_verdict(VerdictRecord {
            device_id: report.device_id.clone(),
            latitude: report.latitude,
            longitude: report.longitude,
            accuracy: report.accuracy,
            timestamp: report.timestamp,
            has_wifi: !report.wifi.is_empty(),
            has_bt: !report.bluetooth.is_empty(),
            has_cell: !report.cell_towers.is_empty(),
            verdict: outcome.response.verdict,
            confidence: outcome.response.confidence,
            flow_type: "refinement".to_string(),
            insert_time: time::now(),
        })
        .await;
}

// ============================================================================
// Learning flow
// ============================================================================

/// POST /learn - Feed one report into the learning pipeline
pub async fn learn(
    State(ctx): State<AppState>,
    Json(report): Json<LearnReport>,
) -> Result<Json<LearnResponse>, HandlerError> {
    let response = ctx.learner.learn(&report).await.map_err(internal_error)?;

    let event = ctx.learner.event_for(&report, &response);
    ctx.sink.publish_learning(event);

    Ok(Json(response))
}

/// GET /companions/:object_id - Sources currently stationary for an object
pub async fn get_companions(
    State(ctx): State<AppState>,
    Path(object_id): Path<String>,
) -> Result<Json<CompanionsResponse>, HandlerError> {
    let companions = ctx
        .catalog
        .get_companions(&object_id)
        .await
        .map_err(internal_error)?;

    Ok(Json(CompanionsResponse {
        object_id,
        companions,
    }))
}

// ============================================================================
// Absolute overrides and point inspection
// ============================================================================

fn parse_point_type(raw: &str) -> Result<SourceType, HandlerError> {
    SourceType::parse(raw).ok_or_else(|| bad_request(&format!("unknown point type: {}", raw)))
}

/// Build a source identity from wire values, canonicalizing MAC-shaped ids
/// the same way report readings are
fn source_ref_from(source_type: SourceType, id: &str) -> SourceRef {
    match source_type {
        SourceType::Wifi => SourceRef::wifi(id),
        SourceType::Ble => SourceRef::ble(id),
        SourceType::Cell => SourceRef {
            source_type: SourceType::Cell,
            source_id: id.to_string(),
        },
    }
}

/// PUT /absolute - Store an operator override for a source
pub async fn set_absolute(
    State(ctx): State<AppState>,
    Json(request): Json<SetAbsoluteRequest>,
) -> Result<Json<StatusResponse>, HandlerError> {
    let source_type = parse_point_type(&request.point_type)?;
    let source = source_ref_from(source_type, &request.point_id);

    let expires_at = Utc
        .timestamp_opt(request.expires_at, 0)
        .single()
        .ok_or_else(|| bad_request("invalid expires_at"))?;

    let absolute = AbsoluteOverride {
        lat: request.latitude,
        lon: request.longitude,
        accuracy: request.accuracy,
        source: request.source,
        set_at: time::now(),
        expires_at,
    };

    // An already-expired override is silently discarded by the catalog
    ctx.catalog
        .put_absolute(&source, &absolute)
        .await
        .map_err(internal_error)?;

    Ok(Json(StatusResponse {
        status: "ok".to_string(),
    }))
}

/// DELETE /absolute/:point_type/:point_id - Remove an operator override
pub async fn remove_absolute(
    State(ctx): State<AppState>,
    Path((point_type, point_id)): Path<(String, String)>,
) -> Result<Json<StatusResponse>, HandlerError> {
    let source_type = parse_point_type(&point_type)?;
    let source = source_ref_from(source_type, &point_id);

    ctx.catalog
        .delete_absolute(&source)
        .await
        .map_err(internal_error)?;

    Ok(Json(StatusResponse {
        status: "ok".to_string(),
    }))
}

/// GET /points/:point_type/:point_id - Inspect one source
///
/// Returns the operator override (which takes precedence over learned
/// coordinates), the learned anchor, and whether the source is currently
/// STATIONARY for the object given in the query.
pub async fn get_point_info(
    State(ctx): State<AppState>,
    Path((point_type, point_id)): Path<(String, String)>,
    Query(query): Query<PointInfoQuery>,
) -> Result<Json<PointInfoResponse>, HandlerError> {
    let source_type = parse_point_type(&point_type)?;
    let source = source_ref_from(source_type, &point_id);

    let absolute = ctx
        .catalog
        .get_absolute(&source)
        .await
        .map_err(internal_error)?;

    let calculated = ctx
        .catalog
        .get_anchor(&source)
        .await
        .map_err(internal_error)?
        .map(|anchor| CalculatedInfo {
            latitude: anchor.lat,
            longitude: anchor.lon,
            confidence: anchor.confidence,
            observations: anchor.observation_count,
            last_seen: anchor.last_seen,
        });

    let stationary = ctx
        .catalog
        .get_observation(&query.object_id, &source)
        .await
        .map_err(internal_error)?
        .map(|agg| agg.status == ObservationStatus::Stationary)
        .unwrap_or(false);

    Ok(Json(PointInfoResponse {
        absolute,
        calculated,
        stationary,
    }))
}

// ============================================================================
// Runtime configuration
// ============================================================================

/// GET /config - Tunable parameters with current values
pub async fn get_config(State(ctx): State<AppState>) -> Json<ConfigResponse> {
    Json(ConfigResponse {
        parameters: ctx.config.describe(),
    })
}

/// POST /config - Apply one runtime parameter change
pub async fn update_config(
    State(ctx): State<AppState>,
    Json(request): Json<UpdateConfigRequest>,
) -> Json<UpdateConfigResponse> {
    match ctx
        .config
        .update(&request.key, &request.value, &request.reason)
    {
        UpdateOutcome::Applied {
            old_value,
            new_value,
        } => Json(UpdateConfigResponse {
            status: "ok".to_string(),
            old_value: Some(old_value),
            new_value: Some(new_value),
            detail: None,
        }),
        UpdateOutcome::UnknownKey => Json(UpdateConfigResponse {
            status: "unknown".to_string(),
            old_value: None,
            new_value: None,
            detail: None,
        }),
        UpdateOutcome::InvalidValue(detail) => Json(UpdateConfigResponse {
            status: "invalid".to_string(),
            old_value: None,
            new_value: None,
            detail: Some(detail),
        }),
    }
}

/// POST /config/reset - Restore environment defaults
pub async fn reset_config(State(ctx): State<AppState>) -> Json<StatusResponse> {
    ctx.config.reset();
    Json(StatusResponse {
        status: "ok".to_string(),
    })
}

/// GET /config/history - Audit trail of runtime changes
pub async fn get_config_history(State(ctx): State<AppState>) -> Json<ConfigHistoryResponse> {
    Json(ConfigHistoryResponse {
        changes: ctx.config.history(),
    })
}
