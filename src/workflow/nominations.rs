//! Nomination lifecycle, deadline resolution and response gating

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::stages::StageCode;
use super::ReviewError;
use crate::models::{ReviewFormResponse, ReviewerRole};
use crate::validation::{normalize_email, validate_email, ValidationError};

/// Who a new nomination points at
#[derive(Debug, Clone, PartialEq)]
pub enum NominationTarget {
    Internal {
        username: String,
    },
    External {
        email: String,
        name: Option<String>,
    },
}

/// Roles staff may nominate for themselves. Self-assessment and part 1
/// assessments are created by batch commands only.
pub fn is_self_service_role(role: ReviewerRole) -> bool {
    matches!(
        role,
        ReviewerRole::ProjectManager
            | ReviewerRole::DirectReport
            | ReviewerRole::WiderTeam
            | ReviewerRole::External
    )
}

/// Interpret the `value` of a nomination request for the given role: an
/// email address for external reviewers, a username otherwise.
pub fn resolve_target(
    role: ReviewerRole,
    value: &str,
    name: Option<&str>,
) -> Result<NominationTarget, ValidationError> {
    if !is_self_service_role(role) {
        return Err(ValidationError::InvalidRole {
            role: role.label().to_string(),
        });
    }

    let value = value.trim();
    if value.is_empty() {
        return Err(ValidationError::Required {
            field: "value".to_string(),
        });
    }

    if role == ReviewerRole::External {
        let email = normalize_email(value);
        validate_email(&email)?;
        let name = name
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string);
        if let Some(ref n) = name {
            if n.len() > 100 {
                return Err(ValidationError::TooLong {
                    field: "name".to_string(),
                    max: 100,
                });
            }
        }
        Ok(NominationTarget::External { email, name })
    } else {
        Ok(NominationTarget::Internal {
            username: value.to_string(),
        })
    }
}

/// Override if set, else the period's feedback close date, else none
pub fn effective_deadline(
    closes_override: Option<DateTime<Utc>>,
    feedback_close: Option<DateTime<Utc>>,
) -> Option<DateTime<Utc>> {
    closes_override.or(feedback_close)
}

pub fn is_past_deadline(deadline: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    deadline.is_some_and(|d| now > d)
}

/// Nominations can only be created or deleted while nominations are open
pub fn ensure_nominations_open(current: Option<StageCode>) -> Result<(), ReviewError> {
    match current {
        Some(StageCode::Nominations) => Ok(()),
        _ => Err(ReviewError::forbidden("Not currently accepting nominations")),
    }
}

pub fn ensure_reviewee(reviewee_id: Uuid, user_id: Uuid) -> Result<(), ReviewError> {
    if reviewee_id == user_id {
        Ok(())
    } else {
        Err(ReviewError::forbidden("Only reviewee can delete nomination"))
    }
}

/// Responses are accepted from feedback opening until the nomination's own
/// deadline.
pub fn ensure_accepting_responses(
    current: Option<StageCode>,
    deadline: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<(), ReviewError> {
    if !current.is_some_and(StageCode::accepts_responses) {
        return Err(ReviewError::forbidden("Feedback is not open yet."));
    }
    if is_past_deadline(deadline, now) {
        return Err(ReviewError::rule(
            "This nomination is now closed for submissions.",
        ));
    }
    Ok(())
}

/// Line managers only see a report's feedback once it has closed, unless
/// they wrote it themselves.
pub fn responses_visible_to(
    reviewer_id: Option<Uuid>,
    viewer_id: Uuid,
    deadline: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> bool {
    reviewer_id == Some(viewer_id) || deadline.map_or(true, |d| d <= now)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseChange {
    Created,
    Updated,
    Unchanged,
}

pub fn response_change(existing: Option<&str>, value: &str) -> ResponseChange {
    match existing {
        None => ResponseChange::Created,
        Some(old) if old == value => ResponseChange::Unchanged,
        Some(_) => ResponseChange::Updated,
    }
}

/// Values to store for one answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseWrite<'a> {
    pub change: ResponseChange,
    pub value: &'a str,
    pub created: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum ResponseOutcome<'a> {
    /// The stored value was submitted again
    Unchanged(ReviewFormResponse),
    Save(ResponseWrite<'a>),
}

/// A new value replaces the stored one and moves `last_modified` to `now`;
/// `created` stays at the first submission.
pub fn plan_response_write(
    existing: Option<ReviewFormResponse>,
    value: &str,
    now: DateTime<Utc>,
) -> ResponseOutcome<'_> {
    let change = response_change(existing.as_ref().map(|r| r.value.as_str()), value);
    match existing {
        Some(existing) if change == ResponseChange::Unchanged => {
            ResponseOutcome::Unchanged(existing)
        }
        existing => ResponseOutcome::Save(ResponseWrite {
            change,
            value,
            created: existing.map_or(now, |r| r.created),
            last_modified: now,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn at(d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, d, h, 0, 0).unwrap()
    }

    #[test]
    fn test_effective_deadline_prefers_override() {
        assert_eq!(effective_deadline(Some(at(20, 0)), Some(at(10, 0))), Some(at(20, 0)));
    }

    #[test]
    fn test_effective_deadline_falls_back_to_feedback_close() {
        assert_eq!(effective_deadline(None, Some(at(10, 0))), Some(at(10, 0)));
    }

    #[test]
    fn test_effective_deadline_none() {
        assert_eq!(effective_deadline(None, None), None);
        assert!(!is_past_deadline(None, at(31, 23)));
    }

    #[test]
    fn test_nominations_open_only_during_nominations() {
        assert!(ensure_nominations_open(Some(StageCode::Nominations)).is_ok());
        assert!(matches!(
            ensure_nominations_open(Some(StageCode::Open)),
            Err(ReviewError::Forbidden(_))
        ));
        assert!(ensure_nominations_open(Some(StageCode::NominationsClose)).is_err());
        assert!(ensure_nominations_open(None).is_err());
    }

    #[test]
    fn test_only_reviewee_can_delete() {
        let me = Uuid::new_v4();
        assert!(ensure_reviewee(me, me).is_ok());
        assert!(matches!(
            ensure_reviewee(me, Uuid::new_v4()),
            Err(ReviewError::Forbidden(_))
        ));
    }

    #[test]
    fn test_response_at_deadline_is_accepted() {
        let deadline = at(10, 23);
        let stage = Some(StageCode::FeedbackOpens);
        assert!(ensure_accepting_responses(stage, Some(deadline), deadline).is_ok());
        assert!(
            ensure_accepting_responses(stage, Some(deadline), deadline - Duration::hours(1))
                .is_ok()
        );
    }

    #[test]
    fn test_response_after_deadline_is_rejected() {
        let deadline = at(10, 23);
        let err = ensure_accepting_responses(
            Some(StageCode::FeedbackClose),
            Some(deadline),
            deadline + Duration::seconds(1),
        )
        .unwrap_err();
        assert!(matches!(err, ReviewError::Rule(_)));
        assert_eq!(err.to_string(), "This nomination is now closed for submissions.");
    }

    #[test]
    fn test_override_extends_past_feedback_close() {
        let close = at(10, 23);
        let extended = effective_deadline(Some(at(17, 23)), Some(close));
        assert!(ensure_accepting_responses(Some(StageCode::Part1), extended, at(12, 9)).is_ok());
    }

    #[test]
    fn test_response_before_feedback_opens_is_rejected() {
        let err = ensure_accepting_responses(Some(StageCode::NominationsClose), None, at(1, 0))
            .unwrap_err();
        assert!(matches!(err, ReviewError::Forbidden(_)));
        assert!(ensure_accepting_responses(None, None, at(1, 0)).is_err());
    }

    #[test]
    fn test_no_deadline_stays_open() {
        assert!(ensure_accepting_responses(Some(StageCode::Part2), None, at(31, 23)).is_ok());
    }

    #[test]
    fn test_resolve_internal_target() {
        let target = resolve_target(ReviewerRole::WiderTeam, " jsmith ", None).unwrap();
        assert_eq!(
            target,
            NominationTarget::Internal {
                username: "jsmith".to_string()
            }
        );
    }

    #[test]
    fn test_resolve_external_target_normalizes_email() {
        let target =
            resolve_target(ReviewerRole::External, " Ann@Example.COM ", Some(" Ann Lee ")).unwrap();
        assert_eq!(
            target,
            NominationTarget::External {
                email: "ann@example.com".to_string(),
                name: Some("Ann Lee".to_string()),
            }
        );
    }

    #[test]
    fn test_resolve_external_target_rejects_bad_email() {
        assert!(matches!(
            resolve_target(ReviewerRole::External, "not-an-email", None),
            Err(ValidationError::InvalidEmail)
        ));
    }

    #[test]
    fn test_resolve_target_rejects_batch_roles() {
        assert!(matches!(
            resolve_target(ReviewerRole::SelfAssessment, "me", None),
            Err(ValidationError::InvalidRole { .. })
        ));
        assert!(resolve_target(ReviewerRole::AssessmentPt1, "me", None).is_err());
    }

    #[test]
    fn test_resolve_target_requires_value() {
        assert!(matches!(
            resolve_target(ReviewerRole::ProjectManager, "  ", None),
            Err(ValidationError::Required { .. })
        ));
    }

    #[test]
    fn test_line_manager_visibility() {
        let manager = Uuid::new_v4();
        let peer = Uuid::new_v4();
        let deadline = Some(at(10, 23));

        assert!(!responses_visible_to(Some(peer), manager, deadline, at(9, 0)));
        assert!(responses_visible_to(Some(peer), manager, deadline, at(11, 0)));
        assert!(responses_visible_to(Some(manager), manager, deadline, at(9, 0)));
        assert!(responses_visible_to(None, manager, None, at(9, 0)));
    }

    #[test]
    fn test_response_change() {
        assert_eq!(response_change(None, "a"), ResponseChange::Created);
        assert_eq!(response_change(Some("a"), "a"), ResponseChange::Unchanged);
        assert_eq!(response_change(Some("a"), "b"), ResponseChange::Updated);
    }

    fn stored(value: &str, at: DateTime<Utc>) -> ReviewFormResponse {
        ReviewFormResponse {
            id: Uuid::new_v4(),
            nomination_id: Uuid::new_v4(),
            question_id: Uuid::new_v4(),
            value: value.to_string(),
            created: at,
            last_modified: at,
        }
    }

    #[test]
    fn test_first_answer_is_created_now() {
        match plan_response_write(None, "Good", at(10, 9)) {
            ResponseOutcome::Save(write) => {
                assert_eq!(write.change, ResponseChange::Created);
                assert_eq!(write.value, "Good");
                assert_eq!(write.created, at(10, 9));
                assert_eq!(write.last_modified, at(10, 9));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_answer_at_deadline_keeps_latest_value() {
        let deadline = at(12, 17);
        assert!(
            ensure_accepting_responses(Some(StageCode::FeedbackOpens), Some(deadline), deadline)
                .is_ok()
        );

        match plan_response_write(Some(stored("Good", at(10, 9))), "Very good", deadline) {
            ResponseOutcome::Save(write) => {
                assert_eq!(write.change, ResponseChange::Updated);
                assert_eq!(write.value, "Very good");
                assert_eq!(write.created, at(10, 9));
                assert_eq!(write.last_modified, deadline);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_same_answer_is_not_rewritten() {
        let existing = stored("Good", at(10, 9));
        match plan_response_write(Some(existing.clone()), "Good", at(11, 9)) {
            ResponseOutcome::Unchanged(kept) => {
                assert_eq!(kept.id, existing.id);
                assert_eq!(kept.last_modified, at(10, 9));
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
