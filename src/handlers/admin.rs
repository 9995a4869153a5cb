//! Admin handlers: the console's bulk actions over HTTP

use crate::batch::{self, BatchSummary};
use crate::db;
use crate::db::forms::FormImportSummary;
use crate::export::{sanitize_filename, ExportData, ExportGrouping};
use crate::models::*;
use crate::validation::validate_create_period;
use crate::workflow::forms::FormConfig;
use crate::workflow::ReviewError;
use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Extension, Json,
};
use serde::Deserialize;
use uuid::Uuid;

use super::{ok, ApiResult, AppState};

#[derive(Debug, Deserialize)]
pub struct ExportQuery {
    #[serde(default)]
    pub per: ExportGrouping,
    /// Only this reviewee's reviews
    pub reviewee: Option<Uuid>,
}

// =============================================================================
// Periods & Stages
// =============================================================================

pub async fn list_periods(State(state): State<AppState>) -> ApiResult<Vec<PeriodResponse>> {
    let mut conn = state.pool.acquire().await?;
    let periods = db::periods::list_periods(&mut conn).await?;
    ok(periods.into_iter().map(PeriodResponse::from).collect())
}

/// Create a period; an existing one with the same year and round is returned
pub async fn create_period(
    State(state): State<AppState>,
    Extension(admin): Extension<StaffUser>,
    Json(input): Json<CreatePeriod>,
) -> ApiResult<PeriodResponse> {
    validate_create_period(&input)?;
    let mut conn = state.pool.acquire().await?;

    let (period, created) =
        db::periods::get_or_create_period(&mut conn, input.year, input.round).await?;
    if created {
        tracing::info!(period = %period.name(), admin = %admin.username, "Review period created");
    }

    ok(PeriodResponse::from(period))
}

/// A period with all of its stages, hidden ones included
pub async fn get_period(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<ReviewCycleResponse> {
    let now = state.clock.now();
    let mut conn = state.pool.acquire().await?;

    let cycle = db::periods::load_cycle(&mut conn, id)
        .await?
        .ok_or_else(|| ReviewError::not_found("Review period not found"))?;

    let current_stage = cycle.current_stage(now).cloned().map(StageResponse::from);
    ok(ReviewCycleResponse {
        period: PeriodResponse::from(cycle.period),
        stages: cycle.stages.into_iter().map(StageResponse::from).collect(),
        current_stage,
    })
}

pub async fn add_default_stages(
    State(state): State<AppState>,
    Extension(admin): Extension<StaffUser>,
    Path(id): Path<Uuid>,
) -> ApiResult<Vec<StageResponse>> {
    let now = state.clock.now();
    let mut tx = state.pool.begin().await?;

    db::periods::get_period(&mut tx, id)
        .await?
        .ok_or_else(|| ReviewError::not_found("Review period not found"))?;
    let planned = db::periods::add_default_stages(&mut tx, id, now, state.timezone).await?;
    let stages = db::periods::period_stages(&mut tx, id).await?;
    tx.commit().await?;

    tracing::info!(
        period_id = %id,
        created = planned.iter().filter(|s| s.created).count(),
        admin = %admin.username,
        "Default stages added"
    );

    ok(stages.into_iter().map(StageResponse::from).collect())
}

pub async fn update_stage(
    State(state): State<AppState>,
    Extension(admin): Extension<StaffUser>,
    Path(id): Path<Uuid>,
    Json(input): Json<UpdateStage>,
) -> ApiResult<StageResponse> {
    let mut conn = state.pool.acquire().await?;

    let stage = db::periods::update_stage(&mut conn, id, &input)
        .await?
        .ok_or_else(|| ReviewError::not_found("Stage not found"))?;

    tracing::info!(stage_id = %id, code = ?stage.code, admin = %admin.username, "Stage updated");
    ok(StageResponse::from(stage))
}

// =============================================================================
// Forms & Nominations
// =============================================================================

/// Create or replace the period's forms from a YAML body, or from the
/// bundled forms when the body is empty. The year and round in the body
/// are not used; the forms go to the period in the path.
pub async fn add_forms(
    State(state): State<AppState>,
    Extension(admin): Extension<StaffUser>,
    Path(id): Path<Uuid>,
    body: String,
) -> ApiResult<FormImportSummary> {
    let config = if body.trim().is_empty() {
        FormConfig::default_forms()?
    } else {
        FormConfig::parse(&body)?
    };

    let mut tx = state.pool.begin().await?;
    db::periods::get_period(&mut tx, id)
        .await?
        .ok_or_else(|| ReviewError::not_found("Review period not found"))?;
    let summary = db::forms::create_review_forms(&mut tx, id, &config).await?;
    tx.commit().await?;

    tracing::info!(
        period_id = %id,
        forms = summary.forms,
        questions = summary.questions,
        admin = %admin.username,
        "Review forms imported"
    );
    ok(summary)
}

pub async fn nominate_line_managers(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<BatchSummary> {
    let now = state.clock.now();
    let mut tx = state.pool.begin().await?;

    db::periods::get_period(&mut tx, id)
        .await?
        .ok_or_else(|| ReviewError::not_found("Review period not found"))?;
    let summary = batch::nominate_line_managers(&mut tx, id, now).await?;
    tx.commit().await?;

    ok(summary)
}

/// Set or clear one nomination's deadline override
pub async fn set_deadline(
    State(state): State<AppState>,
    Extension(admin): Extension<StaffUser>,
    Path(id): Path<Uuid>,
    Json(input): Json<SetDeadlineRequest>,
) -> ApiResult<NominationResponse> {
    let mut tx = state.pool.begin().await?;

    db::nominations::set_closes_override(&mut tx, id, input.closes_override)
        .await?
        .ok_or_else(|| ReviewError::not_found("Nomination not found"))?;
    let detail = db::nominations::nomination_detail(&mut tx, id)
        .await?
        .ok_or_else(|| ReviewError::not_found("Nomination not found"))?;
    tx.commit().await?;

    tracing::info!(
        nomination_id = %id,
        closes_override = ?input.closes_override,
        admin = %admin.username,
        "Nomination deadline set"
    );
    ok(NominationResponse::from(&detail))
}

pub async fn list_invitations(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Vec<InvitationSummary>> {
    let mut conn = state.pool.acquire().await?;
    ok(db::external::invitation_summaries(&mut conn, id, None).await?)
}

// =============================================================================
// Export
// =============================================================================

/// The period's completed reviews as a zip of Markdown documents
pub async fn export_period(
    State(state): State<AppState>,
    Extension(admin): Extension<StaffUser>,
    Path(id): Path<Uuid>,
    Query(query): Query<ExportQuery>,
) -> Result<Response, ReviewError> {
    let mut conn = state.pool.acquire().await?;

    let period = db::periods::get_period(&mut conn, id)
        .await?
        .ok_or_else(|| ReviewError::not_found("Review period not found"))?;
    let mut filename = sanitize_filename(&period.name());

    let mut data = ExportData::load(&mut conn, period).await?;
    if let Some(reviewee_id) = query.reviewee {
        let reviewee = db::staff::find_by_id(&mut conn, reviewee_id)
            .await?
            .ok_or_else(|| ReviewError::not_found("Reviewee not found"))?;
        filename = format!("{}_{}", filename, sanitize_filename(&reviewee.username));
        data.retain_reviewee(reviewee_id);
    }
    let (bytes, summary) = data.archive(query.per, state.timezone)?;

    tracing::info!(
        period_id = %id,
        reviewee = ?query.reviewee,
        documents = summary.documents,
        nominations = summary.nominations,
        failed = summary.failed,
        admin = %admin.username,
        "Reviews exported"
    );

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/zip".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}.zip\"", filename),
            ),
        ],
        bytes,
    )
        .into_response())
}
