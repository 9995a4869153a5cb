//! Staff views of the current review cycle

use crate::db;
use crate::models::*;
use crate::workflow::nominations::responses_visible_to;
use crate::workflow::ReviewError;
use axum::{extract::State, Extension};
use sqlx::PgConnection;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use super::{no_cycle, ok, ApiResult, AppState};

/// Current period, its visible stages and the current stage
pub async fn get_cycle(State(state): State<AppState>) -> ApiResult<ReviewCycleResponse> {
    let now = state.clock.now();
    let mut conn = state.pool.acquire().await?;

    let Some(cycle) = db::periods::current_cycle(&mut conn, now).await? else {
        return no_cycle();
    };

    let current_stage = cycle.current_stage(now).cloned().map(StageResponse::from);
    ok(ReviewCycleResponse {
        period: PeriodResponse::from(cycle.period),
        stages: cycle
            .stages
            .into_iter()
            .filter(|s| s.visible)
            .map(StageResponse::from)
            .collect(),
        current_stage,
    })
}

/// Nominations where the caller is the reviewee
pub async fn my_nominations(
    State(state): State<AppState>,
    Extension(user): Extension<StaffUser>,
) -> ApiResult<Vec<NominationResponse>> {
    let now = state.clock.now();
    let mut conn = state.pool.acquire().await?;

    let Some(cycle) = db::periods::current_cycle(&mut conn, now).await? else {
        return no_cycle();
    };

    let nominations =
        db::nominations::nominations_for_reviewee(&mut conn, cycle.period.id, user.id).await?;
    ok(nominations.iter().map(NominationResponse::from).collect())
}

/// Nominations where the caller is the reviewer, with form and responses
pub async fn to_review(
    State(state): State<AppState>,
    Extension(user): Extension<StaffUser>,
) -> ApiResult<Vec<ReviewerNominationResponse>> {
    let now = state.clock.now();
    let mut conn = state.pool.acquire().await?;

    let Some(cycle) = db::periods::current_cycle(&mut conn, now).await? else {
        return no_cycle();
    };

    let nominations =
        db::nominations::nominations_for_reviewer(&mut conn, cycle.period.id, user.id).await?;
    ok(review_views(&mut conn, nominations, |_| true).await?)
}

/// Current line reports with their nominations. Responses show once a
/// nomination has closed, or when the manager wrote them.
pub async fn line_reports(
    State(state): State<AppState>,
    Extension(user): Extension<StaffUser>,
) -> ApiResult<Vec<LineReportResponse>> {
    let now = state.clock.now();
    let mut conn = state.pool.acquire().await?;

    let Some(cycle) = db::periods::current_cycle(&mut conn, now).await? else {
        return no_cycle();
    };

    let reports = db::staff::line_reports(&mut conn, user.id, now).await?;
    let report_ids: Vec<Uuid> = reports.iter().map(|r| r.id).collect();
    let nominations =
        db::nominations::nominations_for_reviewees(&mut conn, cycle.period.id, &report_ids)
            .await?;

    let views = review_views(&mut conn, nominations, |n| {
        responses_visible_to(n.reviewer_id, user.id, n.closes(), now)
    })
    .await?;

    ok(group_by_reviewee(&reports, views))
}

/// Forms of the current period
pub async fn cycle_forms(State(state): State<AppState>) -> ApiResult<Vec<FormResponse>> {
    let now = state.clock.now();
    let mut conn = state.pool.acquire().await?;

    let Some(cycle) = db::periods::current_cycle(&mut conn, now).await? else {
        return no_cycle();
    };

    let forms = db::forms::period_forms(&mut conn, cycle.period.id).await?;
    let form_ids: Vec<Uuid> = forms.iter().map(|f| f.id).collect();
    let questions = db::forms::form_questions(&mut conn, &form_ids).await?;

    let mut by_form = questions_by_form(questions);
    ok(forms
        .into_iter()
        .map(|f| {
            let questions = by_form.remove(&f.id).unwrap_or_default();
            FormResponse::new(f, questions)
        })
        .collect())
}

/// The caller's external nominations that have an invitation
pub async fn external_invites(
    State(state): State<AppState>,
    Extension(user): Extension<StaffUser>,
) -> ApiResult<Vec<InvitationSummary>> {
    let now = state.clock.now();
    let mut conn = state.pool.acquire().await?;

    let Some(cycle) = db::periods::current_cycle(&mut conn, now).await? else {
        return no_cycle();
    };

    ok(db::external::invitation_summaries(&mut conn, cycle.period.id, Some(user.id)).await?)
}

// =============================================================================
// Shared Builders
// =============================================================================

/// Attach each nomination's form and, where `show` allows, its responses.
/// Nominations may come from several periods.
pub(crate) async fn review_views<F>(
    conn: &mut PgConnection,
    nominations: Vec<NominationDetail>,
    show: F,
) -> Result<Vec<ReviewerNominationResponse>, ReviewError>
where
    F: Fn(&NominationDetail) -> bool,
{
    let period_ids: HashSet<Uuid> = nominations.iter().map(|n| n.period_id).collect();
    let mut forms = Vec::new();
    for period_id in period_ids {
        forms.extend(db::forms::period_forms(&mut *conn, period_id).await?);
    }
    let form_ids: Vec<Uuid> = forms.iter().map(|f| f.id).collect();
    let questions = db::forms::form_questions(&mut *conn, &form_ids).await?;

    let visible_ids: Vec<Uuid> = nominations
        .iter()
        .filter(|n| show(n))
        .map(|n| n.id)
        .collect();
    let responses = db::nominations::responses_for(&mut *conn, &visible_ids).await?;

    Ok(assemble_views(nominations, forms, questions, responses))
}

fn questions_by_form(questions: Vec<ReviewFormQuestion>) -> HashMap<Uuid, Vec<ReviewFormQuestion>> {
    let mut by_form: HashMap<Uuid, Vec<ReviewFormQuestion>> = HashMap::new();
    for question in questions {
        by_form.entry(question.form_id).or_default().push(question);
    }
    for list in by_form.values_mut() {
        list.sort_by_key(|q| q.sequence);
    }
    by_form
}

fn assemble_views(
    nominations: Vec<NominationDetail>,
    forms: Vec<ReviewForm>,
    questions: Vec<ReviewFormQuestion>,
    responses: Vec<ReviewFormResponse>,
) -> Vec<ReviewerNominationResponse> {
    let mut by_form = questions_by_form(questions);
    let forms: HashMap<(Uuid, ReviewerRole), FormResponse> = forms
        .into_iter()
        .map(|f| {
            let questions = by_form.remove(&f.id).unwrap_or_default();
            ((f.period_id, f.role), FormResponse::new(f, questions))
        })
        .collect();

    let mut by_nomination: HashMap<Uuid, Vec<ResponseValue>> = HashMap::new();
    for response in responses {
        by_nomination
            .entry(response.nomination_id)
            .or_default()
            .push(ResponseValue::from(response));
    }

    nominations
        .iter()
        .map(|n| ReviewerNominationResponse {
            nomination: NominationResponse::from(n),
            form: forms.get(&(n.period_id, n.role)).cloned(),
            responses: by_nomination.remove(&n.id).unwrap_or_default(),
        })
        .collect()
}

fn group_by_reviewee(
    reports: &[StaffUser],
    views: Vec<ReviewerNominationResponse>,
) -> Vec<LineReportResponse> {
    let mut by_reviewee: HashMap<Uuid, Vec<ReviewerNominationResponse>> = HashMap::new();
    for view in views {
        by_reviewee
            .entry(view.nomination.reviewee.id)
            .or_default()
            .push(view);
    }

    reports
        .iter()
        .map(|report| LineReportResponse {
            person: PersonSummary::from(report),
            nominations: by_reviewee.remove(&report.id).unwrap_or_default(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn nomination(period_id: Uuid, role: ReviewerRole, reviewee_id: Uuid) -> NominationDetail {
        NominationDetail {
            id: Uuid::new_v4(),
            period_id,
            role,
            reviewee_id,
            reviewee_first_name: "Ann".to_string(),
            reviewee_last_name: "Lee".to_string(),
            reviewer_id: Some(Uuid::new_v4()),
            reviewer_first_name: Some("Bob".to_string()),
            reviewer_last_name: Some("Ray".to_string()),
            external_name: None,
            external_email: None,
            closes_override: None,
            feedback_close: None,
            invitation_code: None,
        }
    }

    fn form(period_id: Uuid, role: ReviewerRole) -> ReviewForm {
        ReviewForm {
            id: Uuid::new_v4(),
            period_id,
            role,
            title: role.label().to_string(),
            description: None,
        }
    }

    fn question(form_id: Uuid, sequence: i32) -> ReviewFormQuestion {
        ReviewFormQuestion {
            id: Uuid::new_v4(),
            form_id,
            sequence,
            title: format!("Question {}", sequence),
            description: None,
        }
    }

    fn response(nomination_id: Uuid, question_id: Uuid) -> ReviewFormResponse {
        let at = Utc.with_ymd_and_hms(2024, 7, 1, 12, 0, 0).unwrap();
        ReviewFormResponse {
            id: Uuid::new_v4(),
            nomination_id,
            question_id,
            value: "Great work".to_string(),
            created: at,
            last_modified: at,
        }
    }

    #[test]
    fn test_assemble_views_matches_form_by_period_and_role() {
        let p1 = Uuid::new_v4();
        let p2 = Uuid::new_v4();
        let reviewee = Uuid::new_v4();
        let n1 = nomination(p1, ReviewerRole::DirectReport, reviewee);
        let n2 = nomination(p2, ReviewerRole::DirectReport, reviewee);
        let f1 = form(p1, ReviewerRole::DirectReport);
        let f2 = form(p2, ReviewerRole::DirectReport);
        let questions = vec![question(f1.id, 2), question(f1.id, 1), question(f2.id, 1)];
        let (f1_id, f2_id) = (f1.id, f2.id);

        let views = assemble_views(vec![n1, n2], vec![f1, f2], questions, Vec::new());

        assert_eq!(views.len(), 2);
        let form1 = views[0].form.as_ref().unwrap();
        assert_eq!(form1.id, f1_id);
        let sequences: Vec<i32> = form1.questions.iter().map(|q| q.sequence).collect();
        assert_eq!(sequences, vec![1, 2]);
        assert_eq!(views[1].form.as_ref().unwrap().id, f2_id);
    }

    #[test]
    fn test_assemble_views_without_form() {
        let n = nomination(Uuid::new_v4(), ReviewerRole::WiderTeam, Uuid::new_v4());
        let views = assemble_views(vec![n], Vec::new(), Vec::new(), Vec::new());
        assert!(views[0].form.is_none());
        assert!(views[0].responses.is_empty());
    }

    #[test]
    fn test_assemble_views_attaches_responses_to_their_nomination() {
        let period = Uuid::new_v4();
        let reviewee = Uuid::new_v4();
        let n1 = nomination(period, ReviewerRole::WiderTeam, reviewee);
        let n2 = nomination(period, ReviewerRole::WiderTeam, reviewee);
        let q = Uuid::new_v4();
        let responses = vec![response(n2.id, q)];
        let n2_id = n2.id;

        let views = assemble_views(vec![n1, n2], Vec::new(), Vec::new(), responses);
        assert!(views[0].responses.is_empty());
        assert_eq!(views[1].nomination.id, n2_id);
        assert_eq!(views[1].responses.len(), 1);
        assert_eq!(views[1].responses[0].question_id, q);
    }

    #[test]
    fn test_group_by_reviewee_keeps_reports_without_nominations() {
        let now = Utc.with_ymd_and_hms(2024, 7, 1, 12, 0, 0).unwrap();
        let staff = |first: &str| StaffUser {
            id: Uuid::new_v4(),
            username: first.to_lowercase(),
            email: format!("{}@example.org", first.to_lowercase()),
            first_name: first.to_string(),
            last_name: "Smith".to_string(),
            password_hash: String::new(),
            line_manager_id: None,
            end_date: None,
            is_admin: false,
            is_active: true,
            created_at: now,
            last_login_at: None,
        };
        let reports = vec![staff("Cara"), staff("Dev")];
        let n = nomination(Uuid::new_v4(), ReviewerRole::DirectReport, reports[1].id);
        let views = assemble_views(vec![n], Vec::new(), Vec::new(), Vec::new());

        let grouped = group_by_reviewee(&reports, views);
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped[0].person.first_name, "Cara");
        assert!(grouped[0].nominations.is_empty());
        assert_eq!(grouped[1].nominations.len(), 1);
    }
}
