//! Encounter, condition and dice REST endpoints

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use super::AppState;
use crate::combat::{
    ActionRequest, BatchEntry, CombatError, ConditionKind, CreateEncounter, ErrorKind, HpChange,
    NewCondition, ParticipantSpec, RestKind,
};

/// Build the encounter router
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/encounters", post(create_encounter).get(list_encounters))
        .route("/encounters/{id}", get(get_encounter))
        .route("/encounters/{id}/advance", post(advance_turn))
        .route("/encounters/{id}/actions", post(execute_action))
        .route("/encounters/{id}/death-saves/{participant}", post(roll_death_save))
        .route("/encounters/{id}/participants", post(add_participant))
        .route(
            "/encounters/{id}/participants/{participant}",
            delete(remove_participant),
        )
        .route("/encounters/{id}/hp/{participant}", post(apply_hp_change))
        .route("/encounters/{id}/conditions", post(add_condition))
        .route(
            "/encounters/{id}/conditions/{target}/{kind}",
            delete(remove_condition),
        )
        .route("/encounters/{id}/conditions/{target}/tick", post(tick_conditions))
        .route(
            "/encounters/{id}/conditions/{target}/saves/{instance}",
            post(attempt_save),
        )
        .route("/encounters/{id}/conditions/{target}", get(conditions_of))
        .route("/encounters/{id}/rest/{target}", post(rest))
        .route("/encounters/{id}/exhaustion/{target}", post(apply_exhaustion))
        .route("/encounters/{id}/end", post(end_encounter))
        .route("/dice/roll", post(roll_dice))
        .route("/dice/batch", post(roll_batch))
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub kind: &'static str,
}

/// An engine error on its way to the client
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    kind: ErrorKind,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl ToString) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            kind: ErrorKind::ValidationError,
            message: message.to_string(),
        }
    }
}

impl From<CombatError> for ApiError {
    fn from(err: CombatError) -> Self {
        let kind = err.kind();
        let status = match kind {
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::InvalidState => StatusCode::CONFLICT,
            ErrorKind::ValidationError => StatusCode::BAD_REQUEST,
            ErrorKind::ActionEconomyViolation => StatusCode::UNPROCESSABLE_ENTITY,
        };
        Self {
            status,
            kind,
            message: err.to_string(),
        }
    }
}

impl From<crate::combat::DiceError> for ApiError {
    fn from(err: crate::combat::DiceError) -> Self {
        CombatError::from(err).into()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        debug!("Request failed ({}): {}", self.kind.as_str(), self.message);
        (
            self.status,
            Json(ErrorResponse {
                error: self.message,
                kind: self.kind.as_str(),
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Parse an optional JSON body, falling back to defaults when empty
fn optional_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(ApiError::bad_request)
}

async fn create_encounter(
    State(state): State<AppState>,
    Json(req): Json<CreateEncounter>,
) -> Result<impl IntoResponse, ApiError> {
    let created = state.engine.create_encounter(req)?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn list_encounters(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.engine.list_encounters())
}

async fn get_encounter(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.engine.get_encounter_state(&id)?))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AdvanceRequest {
    pub process_effects: bool,
    pub process_auras: bool,
}

async fn advance_turn(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let req: AdvanceRequest = optional_body(&body)?;
    let advance = state
        .engine
        .advance_turn(&id, req.process_effects, req.process_auras)?;
    Ok(Json(advance))
}

async fn execute_action(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ActionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.engine.execute_action(&id, req)?))
}

async fn roll_death_save(
    State(state): State<AppState>,
    Path((id, participant)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.engine.roll_death_save(&id, &participant)?))
}

async fn add_participant(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(spec): Json<ParticipantSpec>,
) -> Result<impl IntoResponse, ApiError> {
    let participant = state.engine.add_participant(&id, spec)?;
    Ok((StatusCode::CREATED, Json(participant)))
}

async fn remove_participant(
    State(state): State<AppState>,
    Path((id, participant)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.engine.remove_participant(&id, &participant)?))
}

async fn apply_hp_change(
    State(state): State<AppState>,
    Path((id, participant)): Path<(String, String)>,
    Json(change): Json<HpChange>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.engine.apply_hp_change(&id, &participant, change)?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddConditionRequest {
    pub target_id: String,
    #[serde(flatten)]
    pub condition: NewCondition,
}

async fn add_condition(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<AddConditionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let instance = state
        .engine
        .add_condition(&id, &req.target_id, req.condition)?;
    Ok((StatusCode::CREATED, Json(instance)))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveConditionQuery {
    pub source_id: Option<String>,
}

async fn remove_condition(
    State(state): State<AppState>,
    Path((id, target, kind)): Path<(String, String, ConditionKind)>,
    Query(query): Query<RemoveConditionQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let outcome =
        state
            .engine
            .remove_condition(&id, &target, kind, query.source_id.as_deref())?;
    Ok(Json(outcome))
}

async fn tick_conditions(
    State(state): State<AppState>,
    Path((id, target)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.engine.tick_conditions(&id, &target)?))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SaveRequest {
    pub modifier: i32,
}

async fn attempt_save(
    State(state): State<AppState>,
    Path((id, target, instance)): Path<(String, String, Uuid)>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let req: SaveRequest = optional_body(&body)?;
    Ok(Json(
        state
            .engine
            .attempt_save(&id, &target, instance, req.modifier)?,
    ))
}

async fn end_encounter(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.engine.end_encounter(&id)?))
}

async fn conditions_of(
    State(state): State<AppState>,
    Path((id, target)): Path<(String, String)>,
) -> ApiResult<crate::combat::ConditionSummary> {
    Ok(Json(state.engine.conditions_of(&id, &target)?))
}

#[derive(Debug, Deserialize)]
pub struct RestRequest {
    pub kind: RestKind,
}

async fn rest(
    State(state): State<AppState>,
    Path((id, target)): Path<(String, String)>,
    Json(req): Json<RestRequest>,
) -> ApiResult<crate::combat::RestReport> {
    Ok(Json(state.engine.rest(&id, &target, req.kind)?))
}

#[derive(Debug, Deserialize)]
pub struct ExhaustionRequest {
    pub delta: i32,
}

async fn apply_exhaustion(
    State(state): State<AppState>,
    Path((id, target)): Path<(String, String)>,
    Json(req): Json<ExhaustionRequest>,
) -> ApiResult<crate::combat::ExhaustionOutcome> {
    Ok(Json(state.engine.apply_exhaustion(&id, &target, req.delta)?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollRequest {
    pub expression: String,
    #[serde(default)]
    pub advantage: bool,
    #[serde(default)]
    pub disadvantage: bool,
}

async fn roll_dice(
    State(state): State<AppState>,
    Json(req): Json<RollRequest>,
) -> ApiResult<crate::combat::RollResult> {
    let roll = state
        .engine
        .roll_dice(&req.expression, req.advantage, req.disadvantage)?;
    Ok(Json(roll))
}

#[derive(Debug, Deserialize)]
pub struct BatchRequest {
    pub rolls: Vec<BatchEntry>,
}

async fn roll_batch(
    State(state): State<AppState>,
    Json(req): Json<BatchRequest>,
) -> ApiResult<crate::combat::BatchOutcome> {
    Ok(Json(state.engine.roll_batch(&req.rolls)?))
}
