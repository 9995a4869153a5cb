//! Review periods and their stages

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use sqlx::PgConnection;
use std::collections::HashMap;
use uuid::Uuid;

use crate::models::{ReviewPeriod, ReviewRound, ReviewStage, StageCode, UpdateStage};
use crate::workflow::stages::{self, PlannedStage};

/// A period loaded together with its stages (ordered by date)
#[derive(Debug, Clone)]
pub struct Cycle {
    pub period: ReviewPeriod,
    pub stages: Vec<ReviewStage>,
}

impl Cycle {
    pub fn current_stage(&self, now: DateTime<Utc>) -> Option<&ReviewStage> {
        stages::current_stage(&self.stages, now)
    }

    pub fn current_code(&self, now: DateTime<Utc>) -> Option<StageCode> {
        self.current_stage(now).map(|s| s.code)
    }

    pub fn stage_date(&self, code: StageCode) -> Option<DateTime<Utc>> {
        stages::stage_date(&self.stages, code)
    }
}

pub async fn find_period(
    conn: &mut PgConnection,
    year: i32,
    round: ReviewRound,
) -> Result<Option<ReviewPeriod>, sqlx::Error> {
    sqlx::query_as::<_, ReviewPeriod>("SELECT * FROM review_periods WHERE year = $1 AND round = $2")
        .bind(year)
        .bind(round)
        .fetch_optional(conn)
        .await
}

pub async fn get_period(
    conn: &mut PgConnection,
    id: Uuid,
) -> Result<Option<ReviewPeriod>, sqlx::Error> {
    sqlx::query_as::<_, ReviewPeriod>("SELECT * FROM review_periods WHERE id = $1")
        .bind(id)
        .fetch_optional(conn)
        .await
}

pub async fn list_periods(conn: &mut PgConnection) -> Result<Vec<ReviewPeriod>, sqlx::Error> {
    sqlx::query_as::<_, ReviewPeriod>("SELECT * FROM review_periods ORDER BY year DESC, round")
        .fetch_all(conn)
        .await
}

/// Returns the period and whether it was newly created
pub async fn get_or_create_period(
    conn: &mut PgConnection,
    year: i32,
    round: ReviewRound,
) -> Result<(ReviewPeriod, bool), sqlx::Error> {
    let inserted = sqlx::query_as::<_, ReviewPeriod>(
        r#"
        INSERT INTO review_periods (year, round)
        VALUES ($1, $2)
        ON CONFLICT (year, round) DO NOTHING
        RETURNING *
        "#,
    )
    .bind(year)
    .bind(round)
    .fetch_optional(&mut *conn)
    .await?;

    match inserted {
        Some(period) => Ok((period, true)),
        None => {
            let period = sqlx::query_as::<_, ReviewPeriod>(
                "SELECT * FROM review_periods WHERE year = $1 AND round = $2",
            )
            .bind(year)
            .bind(round)
            .fetch_one(conn)
            .await?;
            Ok((period, false))
        }
    }
}

pub async fn period_stages(
    conn: &mut PgConnection,
    period_id: Uuid,
) -> Result<Vec<ReviewStage>, sqlx::Error> {
    sqlx::query_as::<_, ReviewStage>(
        "SELECT * FROM review_stages WHERE period_id = $1 ORDER BY date, code",
    )
    .bind(period_id)
    .fetch_all(conn)
    .await
}

pub async fn load_cycle(
    conn: &mut PgConnection,
    period_id: Uuid,
) -> Result<Option<Cycle>, sqlx::Error> {
    let Some(period) = get_period(&mut *conn, period_id).await? else {
        return Ok(None);
    };
    let stages = period_stages(conn, period_id).await?;
    Ok(Some(Cycle { period, stages }))
}

/// The cycle whose latest due OPEN stage is the most recent, if any
pub async fn current_cycle(
    conn: &mut PgConnection,
    now: DateTime<Utc>,
) -> Result<Option<Cycle>, sqlx::Error> {
    let opens = sqlx::query_as::<_, ReviewStage>(
        "SELECT * FROM review_stages WHERE code = $1 AND date <= $2",
    )
    .bind(StageCode::Open)
    .bind(now)
    .fetch_all(&mut *conn)
    .await?;

    match stages::current_period_id(&opens, now) {
        Some(period_id) => load_cycle(conn, period_id).await,
        None => Ok(None),
    }
}

/// Add the catalog stages a period is missing, a week apart. Stages the
/// period already has are left alone.
pub async fn add_default_stages(
    conn: &mut PgConnection,
    period_id: Uuid,
    now: DateTime<Utc>,
    tz: Tz,
) -> Result<Vec<PlannedStage>, sqlx::Error> {
    let existing: HashMap<StageCode, DateTime<Utc>> = period_stages(&mut *conn, period_id)
        .await?
        .into_iter()
        .map(|s| (s.code, s.date))
        .collect();

    let planned = stages::plan_default_stages(&existing, now, tz);

    for stage in planned.iter().filter(|s| s.created) {
        let definition = stage.code.definition();
        sqlx::query(
            r#"
            INSERT INTO review_stages (period_id, code, title, description, visible, configuration, date)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (period_id, code) DO NOTHING
            "#,
        )
        .bind(period_id)
        .bind(stage.code)
        .bind(stage.code.title())
        .bind(definition.description)
        .bind(definition.visible)
        .bind(definition.configuration)
        .bind(stage.date)
        .execute(&mut *conn)
        .await?;
    }

    Ok(planned)
}

pub async fn update_stage(
    conn: &mut PgConnection,
    stage_id: Uuid,
    input: &UpdateStage,
) -> Result<Option<ReviewStage>, sqlx::Error> {
    sqlx::query_as::<_, ReviewStage>(
        r#"
        UPDATE review_stages SET
            title = COALESCE($2, title),
            description = COALESCE($3, description),
            visible = COALESCE($4, visible),
            date = COALESCE($5, date)
        WHERE id = $1
        RETURNING *
        "#,
    )
    .bind(stage_id)
    .bind(&input.title)
    .bind(&input.description)
    .bind(input.visible)
    .bind(input.date)
    .fetch_optional(conn)
    .await
}
