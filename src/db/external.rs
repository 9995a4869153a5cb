//! External reviewers: invitations, messages, users and login tokens

use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use uuid::Uuid;

use crate::models::{
    ExternalInvitation, ExternalInvitationMessage, ExternalUser, ExternalUserToken,
    InvitationSummary,
};
use crate::workflow::invitations::{generate_code, MAX_CODE_ATTEMPTS};
use crate::workflow::ReviewError;

#[derive(Debug, thiserror::Error)]
pub enum InvitationError {
    #[error("No unused invitation code found after {0} attempts")]
    CodesExhausted(usize),

    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

impl From<InvitationError> for ReviewError {
    fn from(err: InvitationError) -> Self {
        match err {
            InvitationError::Database(e) => ReviewError::Database(e),
            InvitationError::CodesExhausted(_) => {
                tracing::error!("{}", err);
                ReviewError::rule("Could not create an invitation. Please try again.")
            }
        }
    }
}

pub async fn find_invitation(
    conn: &mut PgConnection,
    nomination_id: Uuid,
) -> Result<Option<ExternalInvitation>, sqlx::Error> {
    sqlx::query_as::<_, ExternalInvitation>(
        "SELECT * FROM external_invitations WHERE nomination_id = $1",
    )
    .bind(nomination_id)
    .fetch_optional(conn)
    .await
}

/// Locks the invitation row until the transaction ends
pub async fn find_invitation_by_code_for_update(
    conn: &mut PgConnection,
    code: i32,
) -> Result<Option<ExternalInvitation>, sqlx::Error> {
    sqlx::query_as::<_, ExternalInvitation>(
        "SELECT * FROM external_invitations WHERE code = $1 FOR UPDATE",
    )
    .bind(code)
    .fetch_optional(conn)
    .await
}

/// Fetch the nomination's invitation, creating it with a fresh code when
/// missing. A code already in use is re-rolled.
pub async fn get_or_create_invitation(
    conn: &mut PgConnection,
    nomination_id: Uuid,
) -> Result<ExternalInvitation, InvitationError> {
    if let Some(invitation) = find_invitation(&mut *conn, nomination_id).await? {
        return Ok(invitation);
    }

    for attempt in 1..=MAX_CODE_ATTEMPTS {
        let code = generate_code(&mut rand::thread_rng());
        let inserted = sqlx::query_as::<_, ExternalInvitation>(
            r#"
            INSERT INTO external_invitations (nomination_id, code)
            VALUES ($1, $2)
            ON CONFLICT DO NOTHING
            RETURNING *
            "#,
        )
        .bind(nomination_id)
        .bind(code)
        .fetch_optional(&mut *conn)
        .await?;

        if let Some(invitation) = inserted {
            tracing::info!(%nomination_id, "Invitation created");
            return Ok(invitation);
        }

        // Either the code is taken or another request created the invitation
        if let Some(invitation) = find_invitation(&mut *conn, nomination_id).await? {
            return Ok(invitation);
        }
        tracing::debug!(attempt, "Invitation code collision, retrying");
    }

    Err(InvitationError::CodesExhausted(MAX_CODE_ATTEMPTS))
}

pub async fn bind_invitation(
    conn: &mut PgConnection,
    nomination_id: Uuid,
    user_id: Uuid,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE external_invitations SET user_id = $2 WHERE nomination_id = $1")
        .bind(nomination_id)
        .bind(user_id)
        .execute(conn)
        .await?;
    Ok(())
}

pub async fn last_message_sent(
    conn: &mut PgConnection,
    invitation_id: Uuid,
) -> Result<Option<DateTime<Utc>>, sqlx::Error> {
    sqlx::query_scalar::<_, Option<DateTime<Utc>>>(
        "SELECT MAX(sent_at) FROM external_invitation_messages WHERE invitation_id = $1",
    )
    .bind(invitation_id)
    .fetch_one(conn)
    .await
}

pub async fn insert_message(
    conn: &mut PgConnection,
    invitation_id: Uuid,
    sent_to: &str,
    sent_by: Uuid,
    message: &str,
    sent_at: DateTime<Utc>,
) -> Result<ExternalInvitationMessage, sqlx::Error> {
    sqlx::query_as::<_, ExternalInvitationMessage>(
        r#"
        INSERT INTO external_invitation_messages (invitation_id, sent_at, sent_to, sent_by, message)
        VALUES ($1, $2, $3, $4, $5)
        RETURNING *
        "#,
    )
    .bind(invitation_id)
    .bind(sent_at)
    .bind(sent_to)
    .bind(sent_by)
    .bind(message)
    .fetch_one(conn)
    .await
}

/// Invitations of a period, optionally narrowed to one reviewee
pub async fn invitation_summaries(
    conn: &mut PgConnection,
    period_id: Uuid,
    reviewee_id: Option<Uuid>,
) -> Result<Vec<InvitationSummary>, sqlx::Error> {
    sqlx::query_as::<_, InvitationSummary>(
        r#"
        SELECT
            inv.nomination_id,
            inv.code,
            n.external_name,
            n.external_email,
            ee.first_name AS reviewee_first_name,
            ee.email AS reviewee_email,
            inv.user_id IS NOT NULL AS claimed,
            COUNT(m.id) AS messages_sent,
            MAX(m.sent_at) AS last_sent_at
        FROM external_invitations inv
        JOIN nominations n ON n.id = inv.nomination_id
        JOIN staff_users ee ON ee.id = n.reviewee_id
        LEFT JOIN external_invitation_messages m ON m.invitation_id = inv.nomination_id
        WHERE n.period_id = $1 AND ($2::uuid IS NULL OR n.reviewee_id = $2)
        GROUP BY inv.nomination_id, inv.code, n.external_name, n.external_email,
                 ee.first_name, ee.email, ee.last_name
        ORDER BY ee.last_name, ee.first_name, n.external_email
        "#,
    )
    .bind(period_id)
    .bind(reviewee_id)
    .fetch_all(conn)
    .await
}

// =============================================================================
// External users
// =============================================================================

pub async fn find_external_user(
    conn: &mut PgConnection,
    id: Uuid,
) -> Result<Option<ExternalUser>, sqlx::Error> {
    sqlx::query_as::<_, ExternalUser>("SELECT * FROM external_users WHERE id = $1")
        .bind(id)
        .fetch_optional(conn)
        .await
}

pub async fn find_external_user_by_email(
    conn: &mut PgConnection,
    email: &str,
) -> Result<Option<ExternalUser>, sqlx::Error> {
    sqlx::query_as::<_, ExternalUser>("SELECT * FROM external_users WHERE email = $1")
        .bind(email)
        .fetch_optional(conn)
        .await
}

/// The name is only used when the user is created
pub async fn get_or_create_external_user(
    conn: &mut PgConnection,
    email: &str,
    name: Option<&str>,
) -> Result<ExternalUser, sqlx::Error> {
    let inserted = sqlx::query_as::<_, ExternalUser>(
        r#"
        INSERT INTO external_users (email, name)
        VALUES ($1, $2)
        ON CONFLICT (email) DO NOTHING
        RETURNING *
        "#,
    )
    .bind(email)
    .bind(name)
    .fetch_optional(&mut *conn)
    .await?;

    match inserted {
        Some(user) => {
            tracing::info!(user_id = %user.id, "External user created");
            Ok(user)
        }
        None => {
            sqlx::query_as::<_, ExternalUser>("SELECT * FROM external_users WHERE email = $1")
                .bind(email)
                .fetch_one(conn)
                .await
        }
    }
}

// =============================================================================
// Tokens
// =============================================================================

pub async fn insert_token(
    conn: &mut PgConnection,
    email: &str,
    code: Option<i32>,
    secret: &str,
    expiry: DateTime<Utc>,
) -> Result<ExternalUserToken, sqlx::Error> {
    sqlx::query_as::<_, ExternalUserToken>(
        r#"
        INSERT INTO external_user_tokens (email, code, secret, expiry)
        VALUES ($1, $2, $3, $4)
        RETURNING *
        "#,
    )
    .bind(email)
    .bind(code)
    .bind(secret)
    .bind(expiry)
    .fetch_one(conn)
    .await
}

pub async fn find_token_for_update(
    conn: &mut PgConnection,
    secret: &str,
) -> Result<Option<ExternalUserToken>, sqlx::Error> {
    sqlx::query_as::<_, ExternalUserToken>(
        "SELECT * FROM external_user_tokens WHERE secret = $1 FOR UPDATE",
    )
    .bind(secret)
    .fetch_optional(conn)
    .await
}

/// Returns false when another request redeemed the token first
pub async fn mark_token_redeemed(
    conn: &mut PgConnection,
    token_id: Uuid,
    now: DateTime<Utc>,
    client_ip: &str,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE external_user_tokens
        SET redeemed_at = $2, client_ip = $3
        WHERE id = $1 AND redeemed_at IS NULL
        "#,
    )
    .bind(token_id)
    .bind(now)
    .bind(client_ip)
    .execute(conn)
    .await?;
    Ok(result.rows_affected() == 1)
}
