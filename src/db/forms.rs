//! Review forms and their questions

use serde::Serialize;
use sqlx::PgConnection;
use uuid::Uuid;

use crate::models::{ReviewForm, ReviewFormQuestion, ReviewerRole};
use crate::workflow::forms::{FormConfig, FormDefinition};

/// What an import touched
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FormImportSummary {
    pub forms: usize,
    pub questions: usize,
}

pub async fn upsert_form(
    conn: &mut PgConnection,
    period_id: Uuid,
    form: &FormDefinition,
) -> Result<ReviewForm, sqlx::Error> {
    sqlx::query_as::<_, ReviewForm>(
        r#"
        INSERT INTO review_forms (period_id, role, title, description)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (period_id, role) DO UPDATE
            SET title = EXCLUDED.title, description = EXCLUDED.description
        RETURNING *
        "#,
    )
    .bind(period_id)
    .bind(form.role)
    .bind(&form.title)
    .bind(&form.description)
    .fetch_one(conn)
    .await
}

/// Create or replace every form in `config` for the period. Questions are
/// matched by sequence number; questions beyond the new count are kept.
pub async fn create_review_forms(
    conn: &mut PgConnection,
    period_id: Uuid,
    config: &FormConfig,
) -> Result<FormImportSummary, sqlx::Error> {
    let mut summary = FormImportSummary::default();

    for definition in &config.forms {
        let form = upsert_form(&mut *conn, period_id, definition).await?;
        summary.forms += 1;

        for (sequence, question) in definition.sequenced_questions() {
            sqlx::query(
                r#"
                INSERT INTO review_form_questions (form_id, sequence, title, description)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (form_id, sequence) DO UPDATE
                    SET title = EXCLUDED.title, description = EXCLUDED.description
                "#,
            )
            .bind(form.id)
            .bind(sequence)
            .bind(&question.title)
            .bind(&question.description)
            .execute(&mut *conn)
            .await?;
            summary.questions += 1;
        }

        tracing::info!(
            role = ?definition.role,
            questions = definition.questions.len(),
            "Review form saved"
        );
    }

    Ok(summary)
}

pub async fn period_forms(
    conn: &mut PgConnection,
    period_id: Uuid,
) -> Result<Vec<ReviewForm>, sqlx::Error> {
    sqlx::query_as::<_, ReviewForm>("SELECT * FROM review_forms WHERE period_id = $1 ORDER BY role")
        .bind(period_id)
        .fetch_all(conn)
        .await
}

pub async fn form_questions(
    conn: &mut PgConnection,
    form_ids: &[Uuid],
) -> Result<Vec<ReviewFormQuestion>, sqlx::Error> {
    if form_ids.is_empty() {
        return Ok(Vec::new());
    }
    sqlx::query_as::<_, ReviewFormQuestion>(
        "SELECT * FROM review_form_questions WHERE form_id = ANY($1) ORDER BY form_id, sequence",
    )
    .bind(form_ids)
    .fetch_all(conn)
    .await
}

/// A question, provided it belongs to the (period, role) form
pub async fn question_for_role(
    conn: &mut PgConnection,
    question_id: Uuid,
    period_id: Uuid,
    role: ReviewerRole,
) -> Result<Option<ReviewFormQuestion>, sqlx::Error> {
    sqlx::query_as::<_, ReviewFormQuestion>(
        r#"
        SELECT q.* FROM review_form_questions q
        JOIN review_forms f ON f.id = q.form_id
        WHERE q.id = $1 AND f.period_id = $2 AND f.role = $3
        "#,
    )
    .bind(question_id)
    .bind(period_id)
    .bind(role)
    .fetch_optional(conn)
    .await
}
