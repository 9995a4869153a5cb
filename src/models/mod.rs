//! Data models for the application

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

pub use crate::workflow::stages::StageCode;

// =============================================================================
// Enums
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "review_round", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewRound {
    #[serde(alias = "FY")]
    FullYear,
    #[serde(alias = "MY")]
    MidYear,
}

impl ReviewRound {
    pub fn label(self) -> &'static str {
        match self {
            Self::FullYear => "Full Year",
            Self::MidYear => "Mid Year",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "reviewer_role", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewerRole {
    #[serde(alias = "PM")]
    ProjectManager,
    #[serde(alias = "DR")]
    DirectReport,
    #[serde(alias = "WT")]
    WiderTeam,
    #[serde(alias = "EX")]
    External,
    #[serde(alias = "SA")]
    SelfAssessment,
    #[sqlx(rename = "ASSESSMENT_PT_1")]
    #[serde(rename = "ASSESSMENT_PT_1", alias = "A1")]
    AssessmentPt1,
}

impl ReviewerRole {
    pub fn label(self) -> &'static str {
        match self {
            Self::ProjectManager => "Project Manager",
            Self::DirectReport => "Direct Report",
            Self::WiderTeam => "Wider Team",
            Self::External => "External",
            Self::SelfAssessment => "Self-Assessment",
            Self::AssessmentPt1 => "Assessment - Part 1",
        }
    }
}

impl std::str::FromStr for ReviewerRole {
    type Err = String;

    /// Accepts the long names and the two-letter codes
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.trim().to_uppercase()))
            .map_err(|_| format!("Unknown reviewer role: {}", s))
    }
}

impl std::str::FromStr for ReviewRound {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.trim().to_uppercase()))
            .map_err(|_| format!("Unknown review round: {}", s))
    }
}

// =============================================================================
// Review Period & Stages
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ReviewPeriod {
    pub id: Uuid,
    pub year: i32,
    pub round: ReviewRound,
    pub created_at: DateTime<Utc>,
}

impl ReviewPeriod {
    /// e.g. "2024 Mid Year"
    pub fn name(&self) -> String {
        format!("{} {}", self.year, self.round.label())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ReviewStage {
    pub id: Uuid,
    pub period_id: Uuid,
    pub code: StageCode,
    pub title: String,
    pub description: Option<String>,
    pub visible: bool,
    pub configuration: Option<String>,
    pub date: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreatePeriod {
    pub year: i32,
    pub round: ReviewRound,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateStage {
    pub title: Option<String>,
    pub description: Option<String>,
    pub visible: Option<bool>,
    pub date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PeriodResponse {
    pub id: Uuid,
    pub year: i32,
    pub round: ReviewRound,
    pub name: String,
}

impl From<ReviewPeriod> for PeriodResponse {
    fn from(period: ReviewPeriod) -> Self {
        Self {
            name: period.name(),
            id: period.id,
            year: period.year,
            round: period.round,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StageResponse {
    pub id: Uuid,
    pub code: StageCode,
    pub label: String,
    pub title: String,
    pub description: Option<String>,
    pub visible: bool,
    pub configuration: Option<serde_json::Value>,
    pub date: DateTime<Utc>,
}

impl From<ReviewStage> for StageResponse {
    fn from(stage: ReviewStage) -> Self {
        Self {
            id: stage.id,
            code: stage.code,
            label: stage.code.label(),
            title: stage.title,
            description: stage.description,
            visible: stage.visible,
            configuration: stage
                .configuration
                .as_deref()
                .and_then(|c| serde_json::from_str(c).ok()),
            date: stage.date,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReviewCycleResponse {
    pub period: PeriodResponse,
    pub stages: Vec<StageResponse>,
    pub current_stage: Option<StageResponse>,
}

// =============================================================================
// Staff
// =============================================================================

#[derive(Debug, Clone, FromRow)]
pub struct StaffUser {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub password_hash: String,
    pub line_manager_id: Option<Uuid>,
    pub end_date: Option<DateTime<Utc>>,
    pub is_admin: bool,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub last_login_at: Option<DateTime<Utc>>,
}

impl StaffUser {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }

    /// Still employed at `now`
    pub fn is_current(&self, now: DateTime<Utc>) -> bool {
        self.is_active && self.end_date.map_or(true, |end| end >= now)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StaffUserResponse {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub is_admin: bool,
    pub created_at: DateTime<Utc>,
    pub last_login_at: Option<DateTime<Utc>>,
}

impl From<StaffUser> for StaffUserResponse {
    fn from(user: StaffUser) -> Self {
        Self {
            id: user.id,
            username: user.username,
            email: user.email,
            first_name: user.first_name,
            last_name: user.last_name,
            is_admin: user.is_admin,
            created_at: user.created_at,
            last_login_at: user.last_login_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PersonSummary {
    pub id: Uuid,
    pub first_name: String,
    pub last_name: String,
}

impl From<&StaffUser> for PersonSummary {
    fn from(user: &StaffUser) -> Self {
        Self {
            id: user.id,
            first_name: user.first_name.clone(),
            last_name: user.last_name.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

// =============================================================================
// Nomination
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Nomination {
    pub id: Uuid,
    pub period_id: Uuid,
    pub reviewee_id: Uuid,
    pub reviewer_id: Option<Uuid>,
    pub external_name: Option<String>,
    pub external_email: Option<String>,
    pub role: ReviewerRole,
    pub closes_override: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Nomination joined with people's names, its invitation code, and the
/// period's feedback close date
#[derive(Debug, Clone, FromRow)]
pub struct NominationDetail {
    pub id: Uuid,
    pub period_id: Uuid,
    pub role: ReviewerRole,
    pub reviewee_id: Uuid,
    pub reviewee_first_name: String,
    pub reviewee_last_name: String,
    pub reviewer_id: Option<Uuid>,
    pub reviewer_first_name: Option<String>,
    pub reviewer_last_name: Option<String>,
    pub external_name: Option<String>,
    pub external_email: Option<String>,
    pub closes_override: Option<DateTime<Utc>>,
    pub feedback_close: Option<DateTime<Utc>>,
    pub invitation_code: Option<i32>,
}

impl NominationDetail {
    pub fn reviewer_name(&self) -> String {
        if let Some(ref name) = self.external_name {
            return name.clone();
        }
        match (&self.reviewer_first_name, &self.reviewer_last_name) {
            (Some(first), Some(last)) => format!("{} {}", first, last),
            _ => self.external_email.clone().unwrap_or_default(),
        }
    }

    pub fn reviewee_name(&self) -> String {
        format!("{} {}", self.reviewee_first_name, self.reviewee_last_name)
    }

    pub fn closes(&self) -> Option<DateTime<Utc>> {
        crate::workflow::nominations::effective_deadline(self.closes_override, self.feedback_close)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NominationResponse {
    pub id: Uuid,
    pub role: ReviewerRole,
    pub role_label: &'static str,
    pub reviewee: PersonSummary,
    pub reviewer_id: Option<Uuid>,
    pub reviewer_name: String,
    pub external_email: Option<String>,
    pub closes: Option<DateTime<Utc>>,
    pub invitation_code: Option<i32>,
}

impl From<&NominationDetail> for NominationResponse {
    fn from(n: &NominationDetail) -> Self {
        Self {
            id: n.id,
            role: n.role,
            role_label: n.role.label(),
            reviewee: PersonSummary {
                id: n.reviewee_id,
                first_name: n.reviewee_first_name.clone(),
                last_name: n.reviewee_last_name.clone(),
            },
            reviewer_id: n.reviewer_id,
            reviewer_name: n.reviewer_name(),
            external_email: n.external_email.clone(),
            closes: n.closes(),
            invitation_code: n.invitation_code,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateNominationRequest {
    /// Username for staff reviewers, email address for external reviewers
    pub value: String,
    pub role: ReviewerRole,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SetDeadlineRequest {
    pub closes_override: Option<DateTime<Utc>>,
}

// =============================================================================
// Forms & Responses
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ReviewForm {
    pub id: Uuid,
    pub period_id: Uuid,
    pub role: ReviewerRole,
    pub title: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ReviewFormQuestion {
    pub id: Uuid,
    pub form_id: Uuid,
    pub sequence: i32,
    pub title: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ReviewFormResponse {
    pub id: Uuid,
    pub nomination_id: Uuid,
    pub question_id: Uuid,
    pub value: String,
    pub created: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FormResponse {
    pub id: Uuid,
    pub role: ReviewerRole,
    pub title: String,
    pub description: Option<String>,
    pub questions: Vec<ReviewFormQuestion>,
}

impl FormResponse {
    pub fn new(form: ReviewForm, questions: Vec<ReviewFormQuestion>) -> Self {
        Self {
            id: form.id,
            role: form.role,
            title: form.title,
            description: form.description,
            questions,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ResponseValue {
    pub id: Uuid,
    pub question_id: Uuid,
    pub value: String,
    pub last_modified: DateTime<Utc>,
}

impl From<ReviewFormResponse> for ResponseValue {
    fn from(r: ReviewFormResponse) -> Self {
        Self {
            id: r.id,
            question_id: r.question_id,
            value: r.value,
            last_modified: r.last_modified,
        }
    }
}

/// A nomination as seen by someone who reads or writes its responses
#[derive(Debug, Clone, Serialize)]
pub struct ReviewerNominationResponse {
    pub nomination: NominationResponse,
    pub form: Option<FormResponse>,
    pub responses: Vec<ResponseValue>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LineReportResponse {
    pub person: PersonSummary,
    pub nominations: Vec<ReviewerNominationResponse>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateResponseRequest {
    pub nomination_id: Uuid,
    pub question_id: Uuid,
    pub value: String,
}

// =============================================================================
// External Reviewers
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ExternalUser {
    pub id: Uuid,
    pub email: String,
    pub name: Option<String>,
    pub failure_count: i16,
    pub is_enabled: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ExternalInvitation {
    pub nomination_id: Uuid,
    pub user_id: Option<Uuid>,
    pub code: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ExternalInvitationMessage {
    pub id: Uuid,
    pub invitation_id: Uuid,
    pub sent_at: DateTime<Utc>,
    pub sent_to: String,
    pub sent_by: Uuid,
    pub message: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct ExternalUserToken {
    pub id: Uuid,
    pub email: String,
    pub code: Option<i32>,
    pub secret: String,
    pub expiry: DateTime<Utc>,
    pub redeemed_at: Option<DateTime<Utc>>,
    pub client_ip: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
#[allow(dead_code)]
pub struct ExternalSession {
    pub id: Uuid,
    pub external_user_id: Uuid,
    pub token_hash: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SendInviteRequest {
    /// Personal message; the default invitation text when absent
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SendInviteResponse {
    pub sent_to: String,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SendTokenRequest {
    pub email: String,
    pub code: Option<i32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SendTokenResponse {
    pub ok: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedeemTokenRequest {
    pub token: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExternalSessionResponse {
    pub email: String,
    pub name: Option<String>,
    pub session_expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RedeemTokenResponse {
    pub token: String,
    pub session: ExternalSessionResponse,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct InvitationSummary {
    pub nomination_id: Uuid,
    pub code: i32,
    pub external_name: Option<String>,
    pub external_email: Option<String>,
    pub reviewee_first_name: String,
    pub reviewee_email: String,
    pub claimed: bool,
    pub messages_sent: i64,
    pub last_sent_at: Option<DateTime<Utc>>,
}

// =============================================================================
// API Responses
// =============================================================================

#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn empty() -> Self {
        Self {
            success: true,
            data: None,
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn detail() -> NominationDetail {
        NominationDetail {
            id: Uuid::new_v4(),
            period_id: Uuid::new_v4(),
            role: ReviewerRole::WiderTeam,
            reviewee_id: Uuid::new_v4(),
            reviewee_first_name: "Sam".to_string(),
            reviewee_last_name: "Jones".to_string(),
            reviewer_id: Some(Uuid::new_v4()),
            reviewer_first_name: Some("Kim".to_string()),
            reviewer_last_name: Some("Park".to_string()),
            external_name: None,
            external_email: None,
            closes_override: None,
            feedback_close: None,
            invitation_code: None,
        }
    }

    #[test]
    fn test_role_accepts_short_codes() {
        assert_eq!("DR".parse::<ReviewerRole>().unwrap(), ReviewerRole::DirectReport);
        assert_eq!("a1".parse::<ReviewerRole>().unwrap(), ReviewerRole::AssessmentPt1);
        assert_eq!(
            "ASSESSMENT_PT_1".parse::<ReviewerRole>().unwrap(),
            ReviewerRole::AssessmentPt1
        );
        assert_eq!("external".parse::<ReviewerRole>().unwrap(), ReviewerRole::External);
        assert!("boss".parse::<ReviewerRole>().is_err());
    }

    #[test]
    fn test_round_parsing_and_period_name() {
        assert_eq!("MY".parse::<ReviewRound>().unwrap(), ReviewRound::MidYear);
        assert_eq!("full_year".parse::<ReviewRound>().unwrap(), ReviewRound::FullYear);
        let period = ReviewPeriod {
            id: Uuid::new_v4(),
            year: 2024,
            round: ReviewRound::MidYear,
            created_at: Utc::now(),
        };
        assert_eq!(period.name(), "2024 Mid Year");
    }

    #[test]
    fn test_role_serializes_long_name() {
        assert_eq!(
            serde_json::to_string(&ReviewerRole::AssessmentPt1).unwrap(),
            "\"ASSESSMENT_PT_1\""
        );
        assert_eq!(
            serde_json::to_string(&ReviewerRole::WiderTeam).unwrap(),
            "\"WIDER_TEAM\""
        );
    }

    #[test]
    fn test_reviewer_name_prefers_external_name() {
        let mut n = detail();
        assert_eq!(n.reviewer_name(), "Kim Park");

        n.reviewer_id = None;
        n.reviewer_first_name = None;
        n.reviewer_last_name = None;
        n.external_email = Some("ann@example.com".to_string());
        assert_eq!(n.reviewer_name(), "ann@example.com");

        n.external_name = Some("Ann Lee".to_string());
        assert_eq!(n.reviewer_name(), "Ann Lee");
    }

    #[test]
    fn test_detail_closes_uses_override() {
        let close = Utc.with_ymd_and_hms(2024, 7, 5, 22, 59, 59).unwrap();
        let extended = Utc.with_ymd_and_hms(2024, 7, 12, 22, 59, 59).unwrap();
        let mut n = detail();
        assert_eq!(n.closes(), None);
        n.feedback_close = Some(close);
        assert_eq!(n.closes(), Some(close));
        n.closes_override = Some(extended);
        assert_eq!(NominationResponse::from(&n).closes, Some(extended));
    }

    #[test]
    fn test_staff_is_current() {
        let now = Utc.with_ymd_and_hms(2024, 7, 1, 0, 0, 0).unwrap();
        let mut user = StaffUser {
            id: Uuid::new_v4(),
            username: "sjones".to_string(),
            email: "sam@example.org".to_string(),
            first_name: "Sam".to_string(),
            last_name: "Jones".to_string(),
            password_hash: String::new(),
            line_manager_id: None,
            end_date: None,
            is_admin: false,
            is_active: true,
            created_at: now,
            last_login_at: None,
        };
        assert!(user.is_current(now));
        user.end_date = Some(now);
        assert!(user.is_current(now));
        user.end_date = Some(now - chrono::Duration::days(1));
        assert!(!user.is_current(now));
    }

    #[test]
    fn test_staff_response_hides_password() {
        let now = Utc.with_ymd_and_hms(2024, 7, 1, 0, 0, 0).unwrap();
        let user = StaffUser {
            id: Uuid::new_v4(),
            username: "sjones".to_string(),
            email: "sam@example.org".to_string(),
            first_name: "Sam".to_string(),
            last_name: "Jones".to_string(),
            password_hash: "$argon2id$secret".to_string(),
            line_manager_id: None,
            end_date: None,
            is_admin: true,
            is_active: true,
            created_at: now,
            last_login_at: Some(now),
        };
        let json = serde_json::to_value(StaffUserResponse::from(user)).unwrap();
        assert_eq!(json["username"], "sjones");
        assert_eq!(json["is_admin"], true);
        assert!(json["created_at"].is_string());
        assert!(json.get("password_hash").is_none());
    }

    #[test]
    fn test_stage_response_parses_configuration() {
        let stage = ReviewStage {
            id: Uuid::new_v4(),
            period_id: Uuid::new_v4(),
            code: StageCode::Nominations,
            title: "Nominations Open".to_string(),
            description: None,
            visible: true,
            configuration: Some(r#"{"LMInfo":"hi"}"#.to_string()),
            date: Utc::now(),
        };
        let response = StageResponse::from(stage);
        assert_eq!(response.label, "2. Nominations Open");
        assert_eq!(response.configuration.unwrap()["LMInfo"], "hi");
    }
}
