//! Bulk operations on a review period, shared by the CLI and the admin
//! endpoints
//!
//! Each operation is split into a pure planning step and a loop that writes
//! the plan. Items that cannot be handled are logged and skipped.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgConnection;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use crate::db;
use crate::db::nominations::{upsert_nomination, NewNomination};
use crate::db::periods::Cycle;
use crate::models::{InvitationSummary, NominationDetail, ReviewerRole, StaffUser, StageCode};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub saved: usize,
    pub skipped: usize,
}

/// A nomination to upsert: (reviewee, reviewer)
pub type Pair = (Uuid, Uuid);

// =============================================================================
// Line managers
// =============================================================================

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LineManagerPlan {
    /// Direct-report nominations to create: (manager, report)
    pub create: Vec<Pair>,
    /// Existing direct-report nominations to point at a new manager:
    /// (nomination, manager)
    pub reassign: Vec<(Uuid, Uuid)>,
    /// Reports whose nomination already names their manager
    pub unchanged: usize,
    /// Usernames whose manager is not current staff, or who already review
    /// their manager in another role
    pub skipped: Vec<String>,
}

/// Every current staff member reviews their line manager. A report has one
/// direct-report nomination per period, so when the manager changes the
/// existing nomination moves to the new manager.
pub fn plan_line_manager_nominations(
    staff: &[StaffUser],
    nominations: &[NominationDetail],
) -> LineManagerPlan {
    let current: HashSet<Uuid> = staff.iter().map(|s| s.id).collect();
    let internal_pairs: HashSet<Pair> = nominations
        .iter()
        .filter(|n| n.external_email.is_none())
        .filter_map(|n| n.reviewer_id.map(|r| (n.reviewee_id, r)))
        .collect();
    let mut direct_reports: HashMap<Uuid, &NominationDetail> = HashMap::new();
    for n in nominations.iter().filter(|n| n.role == ReviewerRole::DirectReport) {
        if let Some(reviewer_id) = n.reviewer_id {
            direct_reports.entry(reviewer_id).or_insert(n);
        }
    }

    let mut plan = LineManagerPlan::default();
    for user in staff {
        let manager_id = match user.line_manager_id {
            Some(id) if current.contains(&id) => id,
            Some(_) => {
                plan.skipped.push(user.username.clone());
                continue;
            }
            None => continue,
        };

        match direct_reports.get(&user.id) {
            Some(n) if n.reviewee_id == manager_id => plan.unchanged += 1,
            _ if internal_pairs.contains(&(manager_id, user.id)) => {
                plan.skipped.push(user.username.clone())
            }
            Some(n) => plan.reassign.push((n.id, manager_id)),
            None => plan.create.push((manager_id, user.id)),
        }
    }

    plan
}

pub async fn nominate_line_managers(
    conn: &mut PgConnection,
    period_id: Uuid,
    now: DateTime<Utc>,
) -> Result<BatchSummary, sqlx::Error> {
    let staff = db::staff::current_staff(&mut *conn, now).await?;
    let nominations = db::nominations::period_nominations(&mut *conn, period_id).await?;
    let plan = plan_line_manager_nominations(&staff, &nominations);

    for username in &plan.skipped {
        tracing::warn!(%username, "Cannot nominate line manager, skipping");
    }
    for &(reviewee_id, reviewer_id) in &plan.create {
        upsert_nomination(
            &mut *conn,
            &internal(period_id, reviewee_id, reviewer_id, ReviewerRole::DirectReport),
        )
        .await?;
    }
    for &(nomination_id, manager_id) in &plan.reassign {
        db::nominations::set_reviewee(&mut *conn, nomination_id, manager_id).await?;
        tracing::info!(
            %nomination_id,
            %manager_id,
            "Direct-report nomination moved to new line manager"
        );
    }

    let summary = BatchSummary {
        saved: plan.create.len() + plan.reassign.len() + plan.unchanged,
        skipped: plan.skipped.len(),
    };
    tracing::info!(
        created = plan.create.len(),
        moved = plan.reassign.len(),
        skipped = summary.skipped,
        "Line manager nominations saved"
    );
    Ok(summary)
}

// =============================================================================
// Self-assessment
// =============================================================================

/// Staff ids listed one per line. Blank lines and `#` comments are
/// ignored, as are lines that are not ids.
pub fn parse_exclude_list(text: &str) -> HashSet<Uuid> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| match line.parse::<Uuid>() {
            Ok(id) => Some(id),
            Err(_) => {
                tracing::warn!(%line, "Ignoring line in exclude list");
                None
            }
        })
        .collect()
}

pub fn plan_self_assessments(staff: &[StaffUser], exclude: &HashSet<Uuid>) -> Vec<Uuid> {
    staff
        .iter()
        .map(|s| s.id)
        .filter(|id| !exclude.contains(id))
        .collect()
}

pub async fn self_nominate(
    conn: &mut PgConnection,
    period_id: Uuid,
    now: DateTime<Utc>,
    exclude: &HashSet<Uuid>,
) -> Result<BatchSummary, sqlx::Error> {
    let staff = db::staff::current_staff(&mut *conn, now).await?;
    let ids = plan_self_assessments(&staff, exclude);

    for &id in &ids {
        upsert_nomination(
            &mut *conn,
            &internal(period_id, id, id, ReviewerRole::SelfAssessment),
        )
        .await?;
    }

    let summary = BatchSummary {
        saved: ids.len(),
        skipped: staff.len() - ids.len(),
    };
    tracing::info!(saved = summary.saved, excluded = summary.skipped, "Self-assessments saved");
    Ok(summary)
}

// =============================================================================
// Part 1 assessments
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssessmentGap {
    pub reviewee_id: Uuid,
    pub reviewee: String,
    pub reviewer_id: Uuid,
    pub reviewer: String,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct AssessmentPlan {
    /// Assessments that do not exist yet
    pub missing: Vec<AssessmentGap>,
    /// Existing assessments whose deadline is not the PART1 stage date
    pub outdated: Vec<OutdatedAssessment>,
    /// The pair already has a nomination with another role
    pub conflicts: Vec<AssessmentGap>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutdatedAssessment {
    pub nomination_id: Uuid,
    #[serde(flatten)]
    pub gap: AssessmentGap,
}

/// For every direct-report nomination, the line manager assesses the report
/// with `deadline`, the PART1 stage date.
pub fn plan_assessments(
    nominations: &[NominationDetail],
    deadline: Option<DateTime<Utc>>,
) -> AssessmentPlan {
    let existing: HashMap<Pair, &NominationDetail> = nominations
        .iter()
        .filter_map(|n| n.reviewer_id.map(|r| ((n.reviewee_id, r), n)))
        .collect();
    let mut plan = AssessmentPlan::default();
    let mut seen = HashSet::new();

    for n in nominations.iter().filter(|n| n.role == ReviewerRole::DirectReport) {
        let Some(report_id) = n.reviewer_id else {
            continue;
        };
        let pair = (report_id, n.reviewee_id);
        if !seen.insert(pair) {
            continue;
        }
        let gap = AssessmentGap {
            reviewee_id: report_id,
            reviewee: n.reviewer_name(),
            reviewer_id: n.reviewee_id,
            reviewer: n.reviewee_name(),
        };
        match existing.get(&pair) {
            None => plan.missing.push(gap),
            Some(a) if a.role == ReviewerRole::AssessmentPt1 => {
                if deadline.is_some() && a.closes_override != deadline {
                    plan.outdated.push(OutdatedAssessment {
                        nomination_id: a.id,
                        gap,
                    });
                }
            }
            Some(_) => plan.conflicts.push(gap),
        }
    }

    plan
}

/// Report missing part 1 assessments and, with `create`, create them with
/// the PART1 stage date as their deadline. Existing assessments are moved
/// to that date too.
pub async fn nominate_assessments(
    conn: &mut PgConnection,
    cycle: &Cycle,
    create: bool,
) -> Result<AssessmentPlan, sqlx::Error> {
    let deadline = cycle.stage_date(StageCode::Part1);
    let nominations = db::nominations::period_nominations(&mut *conn, cycle.period.id).await?;
    let plan = plan_assessments(&nominations, deadline);

    for gap in &plan.conflicts {
        tracing::warn!(
            reviewee = %gap.reviewee,
            reviewer = %gap.reviewer,
            "Pair already has a nomination with another role, skipping assessment"
        );
    }

    if create {
        for gap in &plan.missing {
            let mut nomination = internal(
                cycle.period.id,
                gap.reviewee_id,
                gap.reviewer_id,
                ReviewerRole::AssessmentPt1,
            );
            nomination.closes_override = deadline;
            upsert_nomination(&mut *conn, &nomination).await?;
        }
        for outdated in &plan.outdated {
            db::nominations::set_closes_override(&mut *conn, outdated.nomination_id, deadline)
                .await?;
        }
        tracing::info!(
            created = plan.missing.len(),
            updated = plan.outdated.len(),
            "Assessment nominations saved"
        );
    }

    Ok(plan)
}

// =============================================================================
// Invitations
// =============================================================================

/// "first name,email" for each reviewee with an invitation that was never
/// sent, one line per reviewee
pub fn unsent_invites_csv(invitations: &[InvitationSummary]) -> String {
    let mut seen = HashSet::new();
    let mut out = String::from("first_name,email\n");

    for inv in invitations.iter().filter(|i| i.messages_sent == 0) {
        if seen.insert(inv.reviewee_email.to_lowercase()) {
            out.push_str(&csv_field(&inv.reviewee_first_name));
            out.push(',');
            out.push_str(&csv_field(&inv.reviewee_email));
            out.push('\n');
        }
    }

    out
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn internal(
    period_id: Uuid,
    reviewee_id: Uuid,
    reviewer_id: Uuid,
    role: ReviewerRole,
) -> NewNomination<'static> {
    NewNomination {
        period_id,
        reviewee_id,
        reviewer_id: Some(reviewer_id),
        external_email: None,
        external_name: None,
        role,
        closes_override: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn staff(username: &str, manager: Option<Uuid>) -> StaffUser {
        StaffUser {
            id: Uuid::new_v4(),
            username: username.to_string(),
            email: format!("{}@example.org", username),
            first_name: username.to_string(),
            last_name: "Test".to_string(),
            password_hash: String::new(),
            line_manager_id: manager,
            end_date: None,
            is_admin: false,
            is_active: true,
            created_at: Utc::now(),
            last_login_at: None,
        }
    }

    fn detail(role: ReviewerRole, reviewee: Uuid, reviewer: Uuid) -> NominationDetail {
        NominationDetail {
            id: Uuid::new_v4(),
            period_id: Uuid::nil(),
            role,
            reviewee_id: reviewee,
            reviewee_first_name: "Mia".to_string(),
            reviewee_last_name: "Boss".to_string(),
            reviewer_id: Some(reviewer),
            reviewer_first_name: Some("Rob".to_string()),
            reviewer_last_name: Some("Report".to_string()),
            external_name: None,
            external_email: None,
            closes_override: None,
            feedback_close: None,
            invitation_code: None,
        }
    }

    fn invite(first_name: &str, email: &str, sent: i64) -> InvitationSummary {
        InvitationSummary {
            nomination_id: Uuid::new_v4(),
            code: 123456,
            external_name: None,
            external_email: Some("x@example.com".to_string()),
            reviewee_first_name: first_name.to_string(),
            reviewee_email: email.to_string(),
            claimed: false,
            messages_sent: sent,
            last_sent_at: None,
        }
    }

    #[test]
    fn test_line_manager_plan() {
        let boss = staff("boss", None);
        let report = staff("report", Some(boss.id));
        let orphan = staff("orphan", Some(Uuid::new_v4()));
        let plan = plan_line_manager_nominations(&[boss.clone(), report.clone(), orphan], &[]);

        assert_eq!(plan.create, vec![(boss.id, report.id)]);
        assert!(plan.reassign.is_empty());
        assert_eq!(plan.skipped, vec!["orphan".to_string()]);
    }

    #[test]
    fn test_line_manager_rerun_is_unchanged() {
        let boss = staff("boss", None);
        let report = staff("report", Some(boss.id));
        let existing = detail(ReviewerRole::DirectReport, boss.id, report.id);
        let plan = plan_line_manager_nominations(&[boss, report], &[existing]);

        assert!(plan.create.is_empty());
        assert!(plan.reassign.is_empty());
        assert_eq!(plan.unchanged, 1);
    }

    #[test]
    fn test_line_manager_change_moves_nomination() {
        let old_boss = staff("old", None);
        let new_boss = staff("new", None);
        let report = staff("report", Some(new_boss.id));
        let existing = detail(ReviewerRole::DirectReport, old_boss.id, report.id);
        let staff = [old_boss, new_boss.clone(), report];
        let plan = plan_line_manager_nominations(&staff, &[existing.clone()]);

        assert!(plan.create.is_empty());
        assert_eq!(plan.reassign, vec![(existing.id, new_boss.id)]);
        assert_eq!(plan.unchanged, 0);
    }

    #[test]
    fn test_line_manager_already_reviewed_in_other_role() {
        let boss = staff("boss", None);
        let report = staff("report", Some(boss.id));
        let existing = detail(ReviewerRole::WiderTeam, boss.id, report.id);
        let plan = plan_line_manager_nominations(&[boss, report], &[existing]);

        assert!(plan.create.is_empty());
        assert_eq!(plan.skipped, vec!["report".to_string()]);
    }

    #[test]
    fn test_exclude_list_ignores_unknown_lines() {
        let id = Uuid::new_v4();
        let text = format!("# leavers\n{}\n\nnot-an-id\n", id);
        let exclude = parse_exclude_list(&text);
        assert_eq!(exclude.len(), 1);
        assert!(exclude.contains(&id));
    }

    #[test]
    fn test_self_assessment_plan_excludes() {
        let a = staff("a", None);
        let b = staff("b", None);
        let exclude = HashSet::from([b.id, Uuid::new_v4()]);
        assert_eq!(plan_self_assessments(&[a.clone(), b], &exclude), vec![a.id]);
    }

    #[test]
    fn test_assessment_plan_reverses_direct_report() {
        let manager = Uuid::new_v4();
        let report = Uuid::new_v4();
        let plan = plan_assessments(&[detail(ReviewerRole::DirectReport, manager, report)], None);

        assert_eq!(plan.missing.len(), 1);
        assert_eq!(plan.missing[0].reviewee_id, report);
        assert_eq!(plan.missing[0].reviewer_id, manager);
        assert_eq!(plan.missing[0].reviewee, "Rob Report");
        assert_eq!(plan.missing[0].reviewer, "Mia Boss");
    }

    #[test]
    fn test_assessment_plan_skips_existing() {
        let manager = Uuid::new_v4();
        let report = Uuid::new_v4();
        let deadline = Utc::now();
        let mut assessment = detail(ReviewerRole::AssessmentPt1, report, manager);
        assessment.closes_override = Some(deadline);
        let plan = plan_assessments(
            &[detail(ReviewerRole::DirectReport, manager, report), assessment],
            Some(deadline),
        );
        assert!(plan.missing.is_empty());
        assert!(plan.outdated.is_empty());
        assert!(plan.conflicts.is_empty());
    }

    #[test]
    fn test_assessment_plan_finds_outdated_deadline() {
        let manager = Uuid::new_v4();
        let report = Uuid::new_v4();
        let deadline = Utc::now();
        let mut assessment = detail(ReviewerRole::AssessmentPt1, report, manager);
        assessment.closes_override = Some(deadline - chrono::Duration::days(30));
        let plan = plan_assessments(
            &[detail(ReviewerRole::DirectReport, manager, report), assessment.clone()],
            Some(deadline),
        );

        assert!(plan.missing.is_empty());
        assert_eq!(plan.outdated.len(), 1);
        assert_eq!(plan.outdated[0].nomination_id, assessment.id);
        assert_eq!(plan.outdated[0].gap.reviewee_id, report);
    }

    #[test]
    fn test_assessment_plan_reports_conflict() {
        let manager = Uuid::new_v4();
        let report = Uuid::new_v4();
        let plan = plan_assessments(
            &[
                detail(ReviewerRole::DirectReport, manager, report),
                detail(ReviewerRole::ProjectManager, report, manager),
            ],
            None,
        );
        assert!(plan.missing.is_empty());
        assert_eq!(plan.conflicts.len(), 1);
    }

    #[test]
    fn test_unsent_invites_csv() {
        let csv = unsent_invites_csv(&[
            invite("Sam", "sam@example.org", 0),
            invite("Sam", "SAM@example.org", 0),
            invite("Kim", "kim@example.org", 2),
            invite("Lee, Jr", "lee@example.org", 0),
        ]);
        assert_eq!(
            csv,
            "first_name,email\nSam,sam@example.org\n\"Lee, Jr\",lee@example.org\n"
        );
    }
}
