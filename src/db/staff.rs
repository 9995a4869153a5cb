//! Staff users

use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use uuid::Uuid;

use crate::models::StaffUser;

#[derive(Debug, Clone)]
pub struct NewStaffUser<'a> {
    pub username: &'a str,
    pub email: &'a str,
    pub first_name: &'a str,
    pub last_name: &'a str,
    pub password_hash: &'a str,
    pub line_manager_id: Option<Uuid>,
    pub is_admin: bool,
}

pub async fn find_by_username(
    conn: &mut PgConnection,
    username: &str,
) -> Result<Option<StaffUser>, sqlx::Error> {
    sqlx::query_as::<_, StaffUser>("SELECT * FROM staff_users WHERE username = $1")
        .bind(username)
        .fetch_optional(conn)
        .await
}

pub async fn find_by_id(
    conn: &mut PgConnection,
    id: Uuid,
) -> Result<Option<StaffUser>, sqlx::Error> {
    sqlx::query_as::<_, StaffUser>("SELECT * FROM staff_users WHERE id = $1")
        .bind(id)
        .fetch_optional(conn)
        .await
}

pub async fn find_by_email(
    conn: &mut PgConnection,
    email: &str,
) -> Result<Option<StaffUser>, sqlx::Error> {
    sqlx::query_as::<_, StaffUser>(
        "SELECT * FROM staff_users WHERE LOWER(email) = LOWER($1) ORDER BY created_at LIMIT 1",
    )
    .bind(email)
    .fetch_optional(conn)
    .await
}

pub async fn create_staff_user(
    conn: &mut PgConnection,
    user: &NewStaffUser<'_>,
) -> Result<StaffUser, sqlx::Error> {
    sqlx::query_as::<_, StaffUser>(
        r#"
        INSERT INTO staff_users
            (username, email, first_name, last_name, password_hash, line_manager_id, is_admin)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        RETURNING *
        "#,
    )
    .bind(user.username)
    .bind(user.email)
    .bind(user.first_name)
    .bind(user.last_name)
    .bind(user.password_hash)
    .bind(user.line_manager_id)
    .bind(user.is_admin)
    .fetch_one(conn)
    .await
}

/// Active staff without an end date in the past
pub async fn current_staff(
    conn: &mut PgConnection,
    now: DateTime<Utc>,
) -> Result<Vec<StaffUser>, sqlx::Error> {
    sqlx::query_as::<_, StaffUser>(
        r#"
        SELECT * FROM staff_users
        WHERE is_active = true AND (end_date IS NULL OR end_date >= $1)
        ORDER BY last_name, first_name
        "#,
    )
    .bind(now)
    .fetch_all(conn)
    .await
}

pub async fn line_reports(
    conn: &mut PgConnection,
    manager_id: Uuid,
    now: DateTime<Utc>,
) -> Result<Vec<StaffUser>, sqlx::Error> {
    sqlx::query_as::<_, StaffUser>(
        r#"
        SELECT * FROM staff_users
        WHERE line_manager_id = $1
          AND is_active = true AND (end_date IS NULL OR end_date >= $2)
        ORDER BY last_name, first_name
        "#,
    )
    .bind(manager_id)
    .bind(now)
    .fetch_all(conn)
    .await
}

pub async fn touch_last_login(
    conn: &mut PgConnection,
    id: Uuid,
    now: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE staff_users SET last_login_at = $2 WHERE id = $1")
        .bind(id)
        .bind(now)
        .execute(conn)
        .await?;
    Ok(())
}
