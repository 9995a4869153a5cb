//! Nominations, responses and invitations, as staff see them

use crate::db;
use crate::db::nominations::NewNomination;
use crate::mailer::Email;
use crate::models::*;
use crate::validation::{validate_response, ValidationError};
use crate::workflow::invitations::{
    check_resend_cooldown, format_deadline, invitation_body, invite_url, personalize,
    DEFAULT_INVITE_MESSAGE,
};
use crate::workflow::nominations::{
    effective_deadline, ensure_accepting_responses, ensure_nominations_open, ensure_reviewee,
    plan_response_write, resolve_target, NominationTarget, ResponseOutcome,
};
use crate::workflow::ReviewError;
use axum::{
    extract::{Path, State},
    Extension, Json,
};
use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use uuid::Uuid;

use super::{ok, ApiResult, AppState};

const MAX_INVITE_MESSAGE_LENGTH: usize = 5_000;

/// Nominate a reviewer for the caller, or replace the matching nomination
pub async fn create_nomination(
    State(state): State<AppState>,
    Extension(user): Extension<StaffUser>,
    Json(input): Json<CreateNominationRequest>,
) -> ApiResult<NominationResponse> {
    let now = state.clock.now();
    let target = resolve_target(input.role, &input.value, input.name.as_deref())?;

    let mut tx = state.pool.begin().await?;

    let cycle = db::periods::current_cycle(&mut tx, now).await?;
    ensure_nominations_open(cycle.as_ref().and_then(|c| c.current_code(now)))?;
    let Some(cycle) = cycle else {
        return Err(ReviewError::forbidden("Not currently accepting nominations"));
    };

    let nomination = match target {
        NominationTarget::Internal { username } => {
            let reviewer = db::staff::find_by_username(&mut tx, &username)
                .await?
                .filter(|u| u.is_current(now))
                .ok_or_else(|| ReviewError::not_found(format!("User {} not found", username)))?;
            if reviewer.id == user.id {
                return Err(ReviewError::Validation(
                    "You cannot nominate yourself".to_string(),
                ));
            }

            db::nominations::upsert_nomination(
                &mut tx,
                &NewNomination {
                    period_id: cycle.period.id,
                    reviewee_id: user.id,
                    reviewer_id: Some(reviewer.id),
                    external_email: None,
                    external_name: None,
                    role: input.role,
                    closes_override: None,
                },
            )
            .await?
        }
        NominationTarget::External { email, name } => {
            let nomination = db::nominations::upsert_nomination(
                &mut tx,
                &NewNomination {
                    period_id: cycle.period.id,
                    reviewee_id: user.id,
                    reviewer_id: None,
                    external_email: Some(&email),
                    external_name: name.as_deref(),
                    role: input.role,
                    closes_override: None,
                },
            )
            .await?;
            db::external::get_or_create_invitation(&mut tx, nomination.id).await?;
            nomination
        }
    };

    let detail = db::nominations::nomination_detail(&mut tx, nomination.id)
        .await?
        .ok_or_else(|| ReviewError::not_found("Nomination not found"))?;

    tx.commit().await?;

    tracing::info!(
        nomination_id = %detail.id,
        reviewee = %user.username,
        role = ?detail.role,
        "Nomination saved"
    );

    ok(NominationResponse::from(&detail))
}

/// Remove one of the caller's nominations while nominations are open
pub async fn delete_nomination(
    State(state): State<AppState>,
    Extension(user): Extension<StaffUser>,
    Path(id): Path<Uuid>,
) -> ApiResult<()> {
    let now = state.clock.now();
    let mut tx = state.pool.begin().await?;

    let nomination = db::nominations::find_nomination(&mut tx, id)
        .await?
        .ok_or_else(|| ReviewError::not_found("Nomination not found"))?;
    ensure_reviewee(nomination.reviewee_id, user.id)?;

    let cycle = db::periods::load_cycle(&mut tx, nomination.period_id).await?;
    ensure_nominations_open(cycle.and_then(|c| c.current_code(now)))?;

    db::nominations::delete_nomination(&mut tx, id).await?;
    tx.commit().await?;

    tracing::info!(nomination_id = %id, reviewee = %user.username, "Nomination deleted");
    ok(())
}

/// Answer one question of a nomination the caller reviews
pub async fn save_response(
    State(state): State<AppState>,
    Extension(user): Extension<StaffUser>,
    Json(input): Json<UpdateResponseRequest>,
) -> ApiResult<ResponseValue> {
    validate_response(&input)?;
    let now = state.clock.now();
    let mut tx = state.pool.begin().await?;

    let nomination = db::nominations::find_nomination(&mut tx, input.nomination_id)
        .await?
        .ok_or_else(|| ReviewError::not_found("Nomination not found"))?;
    if nomination.reviewer_id != Some(user.id) {
        return Err(ReviewError::forbidden(
            "Only the nominated reviewer can respond",
        ));
    }

    let response = apply_response(&mut tx, &nomination, &input, now).await?;
    tx.commit().await?;

    ok(response)
}

/// Stage, deadline and form checks shared by staff and external reviewers,
/// then the upsert itself. The caller has checked who may write.
pub(crate) async fn apply_response(
    conn: &mut PgConnection,
    nomination: &Nomination,
    input: &UpdateResponseRequest,
    now: DateTime<Utc>,
) -> Result<ResponseValue, ReviewError> {
    let cycle = db::periods::load_cycle(&mut *conn, nomination.period_id)
        .await?
        .ok_or_else(|| ReviewError::not_found("Review period not found"))?;
    let deadline = effective_deadline(
        nomination.closes_override,
        cycle.stage_date(StageCode::FeedbackClose),
    );
    ensure_accepting_responses(cycle.current_code(now), deadline, now)?;

    db::forms::question_for_role(
        &mut *conn,
        input.question_id,
        nomination.period_id,
        nomination.role,
    )
    .await?
    .ok_or_else(|| ReviewError::not_found("Question not found for this nomination"))?;

    let existing =
        db::nominations::find_response_for_update(&mut *conn, nomination.id, input.question_id)
            .await?;

    match plan_response_write(existing, &input.value, now) {
        ResponseOutcome::Unchanged(existing) => Ok(ResponseValue::from(existing)),
        ResponseOutcome::Save(write) => {
            let saved =
                db::nominations::save_response(conn, nomination.id, input.question_id, &write)
                    .await?;
            tracing::info!(
                nomination_id = %nomination.id,
                question_id = %input.question_id,
                change = ?write.change,
                "Response saved"
            );
            Ok(ResponseValue::from(saved))
        }
    }
}

/// Email the invitation of one of the caller's external nominations
pub async fn send_invite(
    State(state): State<AppState>,
    Extension(user): Extension<StaffUser>,
    Path(id): Path<Uuid>,
    Json(input): Json<SendInviteRequest>,
) -> ApiResult<SendInviteResponse> {
    let now = state.clock.now();
    let template = invite_template(input.message.as_deref())?;

    let mut tx = state.pool.begin().await?;

    let nomination = db::nominations::nomination_detail(&mut tx, id)
        .await?
        .ok_or_else(|| ReviewError::not_found("Nomination not found"))?;
    if nomination.reviewee_id != user.id {
        return Err(ReviewError::forbidden(
            "Only reviewee can send invitations",
        ));
    }
    if nomination.role != ReviewerRole::External {
        return Err(ReviewError::Validation(
            "Only external nominations can be sent an invitation".to_string(),
        ));
    }
    let email = nomination
        .external_email
        .clone()
        .ok_or_else(|| ReviewError::Validation("Nomination has no email address".to_string()))?;

    let invitation = db::external::get_or_create_invitation(&mut tx, nomination.id).await?;
    // Serialise concurrent sends of the same invitation
    db::external::find_invitation_by_code_for_update(&mut tx, invitation.code).await?;
    check_resend_cooldown(
        db::external::last_message_sent(&mut tx, nomination.id).await?,
        now,
    )?;

    let sender = user.full_name();
    let name = nomination.external_name.clone().unwrap_or_else(|| email.clone());
    let message = personalize(
        template,
        &name,
        &sender,
        &format_deadline(nomination.closes(), state.timezone),
    );
    let body = invitation_body(
        &message,
        invitation.code,
        &invite_url(&state.public_url, &email, invitation.code),
    );

    db::external::insert_message(&mut tx, nomination.id, &email, user.id, &message, now).await?;

    state
        .mailer
        .send(Email {
            from: state.mail_sender.clone(),
            to: email.clone(),
            subject: format!("Feedback request from {}", sender),
            body,
        })
        .await?;

    tx.commit().await?;

    tracing::info!(nomination_id = %id, reviewee = %user.username, "Invitation sent");

    ok(SendInviteResponse {
        sent_to: email,
        sent_at: now,
    })
}

fn invite_template(message: Option<&str>) -> Result<&str, ValidationError> {
    match message.map(str::trim).filter(|m| !m.is_empty()) {
        Some(m) if m.len() > MAX_INVITE_MESSAGE_LENGTH => Err(ValidationError::TooLong {
            field: "message".to_string(),
            max: MAX_INVITE_MESSAGE_LENGTH,
        }),
        Some(m) => Ok(m),
        None => Ok(DEFAULT_INVITE_MESSAGE),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invite_template_defaults_when_blank() {
        assert_eq!(invite_template(None).unwrap(), DEFAULT_INVITE_MESSAGE);
        assert_eq!(invite_template(Some("   ")).unwrap(), DEFAULT_INVITE_MESSAGE);
    }

    #[test]
    fn test_invite_template_uses_own_text() {
        assert_eq!(
            invite_template(Some("  Hi %NAME%, could you help?  ")).unwrap(),
            "Hi %NAME%, could you help?"
        );
    }

    #[test]
    fn test_invite_template_rejects_long_text() {
        let long = "x".repeat(MAX_INVITE_MESSAGE_LENGTH + 1);
        assert!(matches!(
            invite_template(Some(&long)),
            Err(ValidationError::TooLong { .. })
        ));
    }
}
