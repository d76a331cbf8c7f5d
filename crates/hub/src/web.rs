//! HTTP transport: maps the REST routes onto [`Farm`] operations and
//! [`FarmError`] onto status codes.

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{FromRequestParts, Path, Query, State};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::net::TcpListener;

use crate::error::FarmError;
use crate::farm::Farm;
use crate::models::{Caller, Method, NewPlant, Reading, Role, SensorType};
use crate::state::SharedState;

#[derive(Clone)]
pub struct AppState {
    pub farm: Farm,
    pub shared: SharedState,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Farm(#[from] FarmError),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("forbidden: {0}")]
    Forbidden(String),
}

type ApiResult<T> = Result<T, ApiError>;

impl From<JsonRejection> for ApiError {
    fn from(rej: JsonRejection) -> Self {
        ApiError::BadRequest(rej.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rej: QueryRejection) -> Self {
        ApiError::BadRequest(rej.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            ApiError::Farm(FarmError::NotFound { .. }) => {
                (StatusCode::NOT_FOUND, "NOT_FOUND", self.to_string())
            }
            ApiError::Farm(FarmError::InvalidInput(msg)) => {
                (StatusCode::BAD_REQUEST, "INVALID_INPUT", msg.clone())
            }
            ApiError::Farm(FarmError::Conflict(msg)) => {
                (StatusCode::CONFLICT, "CONFLICT", msg.clone())
            }
            ApiError::Farm(FarmError::Database(e)) => {
                tracing::error!(error = %e, "database error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "an internal error occurred".to_string(),
                )
            }
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, "FORBIDDEN", msg.clone()),
        };

        (status, Json(json!({ "error": message, "code": code }))).into_response()
    }
}

// ---------------------------------------------------------------------------
// Caller identity
// ---------------------------------------------------------------------------

const CALLER_ID_HEADER: &str = "x-caller-id";
const CALLER_ROLE_HEADER: &str = "x-caller-role";

/// Caller resolved from the `x-caller-id` / `x-caller-role` headers.
/// Missing headers mean an anonymous user.
pub struct RequestCaller(pub Caller);

impl<S> FromRequestParts<S> for RequestCaller
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = |name: &str| -> ApiResult<Option<String>> {
            parts
                .headers
                .get(name)
                .map(|v| {
                    v.to_str()
                        .map(|s| s.trim().to_string())
                        .map_err(|_| ApiError::BadRequest(format!("{name} is not valid text")))
                })
                .transpose()
        };

        let role = match header(CALLER_ROLE_HEADER)?.as_deref() {
            None | Some("user") => Role::User,
            Some("admin") => Role::Admin,
            Some(other) => {
                return Err(ApiError::BadRequest(format!("unknown caller role '{other}'")))
            }
        };

        let caller = match header(CALLER_ID_HEADER)?.filter(|id| !id.is_empty()) {
            Some(id) => Caller::new(id, role),
            None => Caller {
                role,
                ..Caller::anonymous()
            },
        };
        Ok(RequestCaller(caller))
    }
}

fn require_admin(caller: &Caller) -> ApiResult<()> {
    if caller.is_admin() {
        Ok(())
    } else {
        Err(ApiError::Forbidden(format!(
            "{caller} may not modify the plant registry"
        )))
    }
}

// ---------------------------------------------------------------------------
// Request bodies
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SensorDataRequest {
    plant_id: i64,
    #[serde(flatten)]
    reading: Reading,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateCommandRequest {
    plant_id: i64,
    amount_ml: i64,
    method: String,
    #[serde(default, with = "time::serde::rfc3339::option")]
    scheduled_time: Option<OffsetDateTime>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecuteRequest {
    command_id: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WateringRequest {
    plant_id: i64,
    amount_ml: i64,
    method: String,
}

#[derive(Debug, Deserialize)]
struct RangeQuery {
    start: String,
    end: String,
}

fn parse_time(field: &str, s: &str) -> ApiResult<OffsetDateTime> {
    OffsetDateTime::parse(s, &Rfc3339)
        .map_err(|e| ApiError::BadRequest(format!("{field} is not an RFC 3339 timestamp: {e}")))
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/plants", get(list_plants).post(create_plant))
        .route(
            "/api/plants/{id}",
            get(get_plant).put(update_plant).delete(delete_plant),
        )
        .route("/api/sensors/data", post(record_sensor_data))
        .route("/api/sensors/logs/plant/{plant_id}", get(list_sensor_logs))
        .route(
            "/api/sensors/logs/plant/{plant_id}/range",
            get(list_sensor_logs_in_range),
        )
        .route("/api/alerts/plant/{plant_id}", get(list_alerts))
        .route(
            "/api/alerts/plant/{plant_id}/sensor/{sensor_type}",
            get(list_alerts_by_sensor),
        )
        .route("/api/pump_commands", get(list_commands).post(create_command))
        .route("/api/pump_commands/pending", get(list_pending_commands))
        .route("/api/pump_commands/claim", post(claim_due_commands))
        .route("/api/pump_commands/execute", post(execute_command))
        .route("/api/pump_commands/plant/{plant_id}", get(list_plant_commands))
        .route("/api/watering/log", post(log_watering))
        .route("/api/watering/logs/plant/{plant_id}", get(list_watering))
        .with_state(state)
}

async fn api_status(State(state): State<AppState>) -> impl IntoResponse {
    let st = state.shared.read().await;
    Json(st.to_status())
}

// -- Plant registry ---------------------------------------------------------

async fn list_plants(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.farm.list_plants().await?))
}

async fn get_plant(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.farm.get_plant(id).await?))
}

async fn create_plant(
    State(state): State<AppState>,
    RequestCaller(caller): RequestCaller,
    body: Result<Json<NewPlant>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    require_admin(&caller)?;
    let Json(plant) = body?;
    let created = state.farm.create_plant(&caller, &plant).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn update_plant(
    State(state): State<AppState>,
    RequestCaller(caller): RequestCaller,
    Path(id): Path<i64>,
    body: Result<Json<NewPlant>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    require_admin(&caller)?;
    let Json(plant) = body?;
    Ok(Json(state.farm.update_plant(&caller, id, &plant).await?))
}

async fn delete_plant(
    State(state): State<AppState>,
    RequestCaller(caller): RequestCaller,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    require_admin(&caller)?;
    state.farm.delete_plant(&caller, id).await?;
    state.shared.write().await.forget_plant(id);
    Ok(StatusCode::NO_CONTENT)
}

// -- Telemetry & alerts -----------------------------------------------------

async fn record_sensor_data(
    State(state): State<AppState>,
    RequestCaller(caller): RequestCaller,
    body: Result<Json<SensorDataRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(req) = body?;
    let recorded = state
        .farm
        .record_telemetry(&caller, req.plant_id, &req.reading)
        .await?;
    state
        .shared
        .write()
        .await
        .record_reading(&recorded.log, &recorded.alerts);

    Ok((StatusCode::CREATED, Json(recorded)))
}

async fn list_sensor_logs(
    State(state): State<AppState>,
    Path(plant_id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.farm.list_telemetry(plant_id).await?))
}

async fn list_sensor_logs_in_range(
    State(state): State<AppState>,
    Path(plant_id): Path<i64>,
    query: Result<Query<RangeQuery>, QueryRejection>,
) -> ApiResult<impl IntoResponse> {
    let Query(range) = query?;
    let start = parse_time("start", &range.start)?;
    let end = parse_time("end", &range.end)?;
    Ok(Json(
        state
            .farm
            .list_telemetry_in_range(plant_id, start, end)
            .await?,
    ))
}

async fn list_alerts(
    State(state): State<AppState>,
    Path(plant_id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.farm.list_alerts(plant_id).await?))
}

async fn list_alerts_by_sensor(
    State(state): State<AppState>,
    Path((plant_id, sensor_type)): Path<(i64, String)>,
) -> ApiResult<impl IntoResponse> {
    let sensor: SensorType = sensor_type.parse()?;
    Ok(Json(
        state.farm.list_alerts_by_sensor(plant_id, sensor).await?,
    ))
}

// -- Pump commands ----------------------------------------------------------

async fn create_command(
    State(state): State<AppState>,
    RequestCaller(caller): RequestCaller,
    body: Result<Json<CreateCommandRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(req) = body?;
    let method: Method = req.method.parse()?;

    let cmd = state
        .farm
        .create_command(&caller, req.plant_id, req.amount_ml, method, req.scheduled_time)
        .await?;
    state.shared.write().await.record_command(&cmd, "queued");

    Ok((StatusCode::CREATED, Json(cmd)))
}

/// Due commands as of now. Read-only: nothing is claimed.
async fn list_pending_commands(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(
        state.farm.list_due_commands(OffsetDateTime::now_utc()).await?,
    ))
}

/// Claims every due command for the calling actuator agent.
async fn claim_due_commands(
    State(state): State<AppState>,
    RequestCaller(caller): RequestCaller,
) -> ApiResult<impl IntoResponse> {
    let due = state
        .farm
        .poll_due_commands(&caller, OffsetDateTime::now_utc())
        .await?;

    if !due.is_empty() {
        let mut st = state.shared.write().await;
        for cmd in &due {
            st.record_command(cmd, "claimed");
        }
    }
    Ok(Json(due))
}

async fn execute_command(
    State(state): State<AppState>,
    RequestCaller(caller): RequestCaller,
    body: Result<Json<ExecuteRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(req) = body?;
    let cmd = state.farm.acknowledge_command(&caller, req.command_id).await?;
    state.shared.write().await.record_command(&cmd, "executed");
    Ok(Json(cmd))
}

async fn list_commands(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.farm.list_commands().await?))
}

async fn list_plant_commands(
    State(state): State<AppState>,
    Path(plant_id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.farm.list_commands_for_plant(plant_id).await?))
}

// -- Watering history -------------------------------------------------------

async fn log_watering(
    State(state): State<AppState>,
    RequestCaller(caller): RequestCaller,
    body: Result<Json<WateringRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(req) = body?;
    let method: Method = req.method.parse()?;

    let log = state
        .farm
        .log_watering(&caller, req.plant_id, req.amount_ml, method)
        .await?;
    state.shared.write().await.record_watering(&log);

    Ok((StatusCode::CREATED, Json(log)))
}

async fn list_watering(
    State(state): State<AppState>,
    Path(plant_id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.farm.list_watering(plant_id).await?))
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;

    tracing::info!(%addr, "http api listening");

    axum::serve(listener, router(state)).await?;
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
