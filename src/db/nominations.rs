//! Nominations and their responses

use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use uuid::Uuid;

use crate::models::{Nomination, NominationDetail, ReviewFormResponse, ReviewerRole};
use crate::workflow::nominations::ResponseWrite;

const DETAIL_SELECT: &str = r#"
    SELECT
        n.id, n.period_id, n.role, n.reviewee_id,
        ee.first_name AS reviewee_first_name,
        ee.last_name AS reviewee_last_name,
        n.reviewer_id,
        er.first_name AS reviewer_first_name,
        er.last_name AS reviewer_last_name,
        n.external_name, n.external_email, n.closes_override,
        fc.date AS feedback_close,
        inv.code AS invitation_code
    FROM nominations n
    JOIN staff_users ee ON ee.id = n.reviewee_id
    LEFT JOIN staff_users er ON er.id = n.reviewer_id
    LEFT JOIN review_stages fc ON fc.period_id = n.period_id AND fc.code = 'FEEDBACK_CLOSE'
    LEFT JOIN external_invitations inv ON inv.nomination_id = n.id
"#;

const DETAIL_ORDER: &str = " ORDER BY ee.last_name, ee.first_name, n.role, n.created_at";

fn detail_query(filter: &str) -> String {
    format!("{} WHERE {}{}", DETAIL_SELECT, filter, DETAIL_ORDER)
}

/// Fields of a nomination to create or replace
#[derive(Debug, Clone)]
pub struct NewNomination<'a> {
    pub period_id: Uuid,
    pub reviewee_id: Uuid,
    pub reviewer_id: Option<Uuid>,
    pub external_email: Option<&'a str>,
    pub external_name: Option<&'a str>,
    pub role: ReviewerRole,
    pub closes_override: Option<DateTime<Utc>>,
}

/// Insert, or update role and name of the nomination with the same
/// (period, reviewee, reviewer, external email). An existing deadline
/// override is kept unless a new one is given.
pub async fn upsert_nomination(
    conn: &mut PgConnection,
    nomination: &NewNomination<'_>,
) -> Result<Nomination, sqlx::Error> {
    sqlx::query_as::<_, Nomination>(
        r#"
        INSERT INTO nominations
            (period_id, reviewee_id, reviewer_id, external_email, external_name, role, closes_override)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT ON CONSTRAINT nominations_unique_reviewer DO UPDATE SET
            role = EXCLUDED.role,
            external_name = EXCLUDED.external_name,
            closes_override = COALESCE(EXCLUDED.closes_override, nominations.closes_override)
        RETURNING *
        "#,
    )
    .bind(nomination.period_id)
    .bind(nomination.reviewee_id)
    .bind(nomination.reviewer_id)
    .bind(nomination.external_email)
    .bind(nomination.external_name)
    .bind(nomination.role)
    .bind(nomination.closes_override)
    .fetch_one(conn)
    .await
}

pub async fn find_nomination(
    conn: &mut PgConnection,
    id: Uuid,
) -> Result<Option<Nomination>, sqlx::Error> {
    sqlx::query_as::<_, Nomination>("SELECT * FROM nominations WHERE id = $1")
        .bind(id)
        .fetch_optional(conn)
        .await
}

pub async fn delete_nomination(conn: &mut PgConnection, id: Uuid) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM nominations WHERE id = $1")
        .bind(id)
        .execute(conn)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn nomination_detail(
    conn: &mut PgConnection,
    id: Uuid,
) -> Result<Option<NominationDetail>, sqlx::Error> {
    sqlx::query_as::<_, NominationDetail>(&detail_query("n.id = $1"))
        .bind(id)
        .fetch_optional(conn)
        .await
}

pub async fn nominations_for_reviewee(
    conn: &mut PgConnection,
    period_id: Uuid,
    reviewee_id: Uuid,
) -> Result<Vec<NominationDetail>, sqlx::Error> {
    sqlx::query_as::<_, NominationDetail>(&detail_query(
        "n.period_id = $1 AND n.reviewee_id = $2",
    ))
    .bind(period_id)
    .bind(reviewee_id)
    .fetch_all(conn)
    .await
}

pub async fn nominations_for_reviewees(
    conn: &mut PgConnection,
    period_id: Uuid,
    reviewee_ids: &[Uuid],
) -> Result<Vec<NominationDetail>, sqlx::Error> {
    if reviewee_ids.is_empty() {
        return Ok(Vec::new());
    }
    sqlx::query_as::<_, NominationDetail>(&detail_query(
        "n.period_id = $1 AND n.reviewee_id = ANY($2)",
    ))
    .bind(period_id)
    .bind(reviewee_ids)
    .fetch_all(conn)
    .await
}

pub async fn nominations_for_reviewer(
    conn: &mut PgConnection,
    period_id: Uuid,
    reviewer_id: Uuid,
) -> Result<Vec<NominationDetail>, sqlx::Error> {
    sqlx::query_as::<_, NominationDetail>(&detail_query(
        "n.period_id = $1 AND n.reviewer_id = $2",
    ))
    .bind(period_id)
    .bind(reviewer_id)
    .fetch_all(conn)
    .await
}

/// Nominations whose invitation was claimed by this external user
pub async fn nominations_for_external_user(
    conn: &mut PgConnection,
    external_user_id: Uuid,
) -> Result<Vec<NominationDetail>, sqlx::Error> {
    sqlx::query_as::<_, NominationDetail>(&detail_query("inv.user_id = $1"))
        .bind(external_user_id)
        .fetch_all(conn)
        .await
}

pub async fn period_nominations(
    conn: &mut PgConnection,
    period_id: Uuid,
) -> Result<Vec<NominationDetail>, sqlx::Error> {
    sqlx::query_as::<_, NominationDetail>(&detail_query("n.period_id = $1"))
        .bind(period_id)
        .fetch_all(conn)
        .await
}

pub async fn set_closes_override(
    conn: &mut PgConnection,
    id: Uuid,
    closes_override: Option<DateTime<Utc>>,
) -> Result<Option<Nomination>, sqlx::Error> {
    sqlx::query_as::<_, Nomination>(
        "UPDATE nominations SET closes_override = $2 WHERE id = $1 RETURNING *",
    )
    .bind(id)
    .bind(closes_override)
    .fetch_optional(conn)
    .await
}

/// Point a nomination at another reviewee, keeping its responses
pub async fn set_reviewee(
    conn: &mut PgConnection,
    id: Uuid,
    reviewee_id: Uuid,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("UPDATE nominations SET reviewee_id = $2 WHERE id = $1")
        .bind(id)
        .bind(reviewee_id)
        .execute(conn)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Set (or clear) the deadline override on all of a reviewer's nominations
pub async fn extend_reviewer(
    conn: &mut PgConnection,
    period_id: Uuid,
    reviewer_id: Uuid,
    closes_override: Option<DateTime<Utc>>,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE nominations SET closes_override = $3 WHERE period_id = $1 AND reviewer_id = $2",
    )
    .bind(period_id)
    .bind(reviewer_id)
    .bind(closes_override)
    .execute(conn)
    .await?;
    Ok(result.rows_affected())
}

/// Set the deadline override on all nominations of a role, optionally
/// only those of one reviewer
pub async fn extend_role(
    conn: &mut PgConnection,
    period_id: Uuid,
    role: ReviewerRole,
    reviewer_id: Option<Uuid>,
    closes_override: DateTime<Utc>,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE nominations SET closes_override = $4
        WHERE period_id = $1 AND role = $2 AND ($3::uuid IS NULL OR reviewer_id = $3)
        "#,
    )
    .bind(period_id)
    .bind(role)
    .bind(reviewer_id)
    .bind(closes_override)
    .execute(conn)
    .await?;
    Ok(result.rows_affected())
}

// =============================================================================
// Responses
// =============================================================================

pub async fn responses_for(
    conn: &mut PgConnection,
    nomination_ids: &[Uuid],
) -> Result<Vec<ReviewFormResponse>, sqlx::Error> {
    if nomination_ids.is_empty() {
        return Ok(Vec::new());
    }
    sqlx::query_as::<_, ReviewFormResponse>(
        "SELECT * FROM review_form_responses WHERE nomination_id = ANY($1)",
    )
    .bind(nomination_ids)
    .fetch_all(conn)
    .await
}

pub async fn find_response_for_update(
    conn: &mut PgConnection,
    nomination_id: Uuid,
    question_id: Uuid,
) -> Result<Option<ReviewFormResponse>, sqlx::Error> {
    sqlx::query_as::<_, ReviewFormResponse>(
        r#"
        SELECT * FROM review_form_responses
        WHERE nomination_id = $1 AND question_id = $2
        FOR UPDATE
        "#,
    )
    .bind(nomination_id)
    .bind(question_id)
    .fetch_optional(conn)
    .await
}

/// Write a value, creating the response if there is none yet
pub async fn save_response(
    conn: &mut PgConnection,
    nomination_id: Uuid,
    question_id: Uuid,
    write: &ResponseWrite<'_>,
) -> Result<ReviewFormResponse, sqlx::Error> {
    sqlx::query_as::<_, ReviewFormResponse>(
        r#"
        INSERT INTO review_form_responses (nomination_id, question_id, value, created, last_modified)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (nomination_id, question_id) DO UPDATE
            SET value = EXCLUDED.value, last_modified = EXCLUDED.last_modified
        RETURNING *
        "#,
    )
    .bind(nomination_id)
    .bind(question_id)
    .bind(write.value)
    .bind(write.created)
    .bind(write.last_modified)
    .fetch_one(conn)
    .await
}
