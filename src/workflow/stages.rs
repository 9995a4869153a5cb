//! Stage catalog, default weekly schedule, and current stage/period resolution
//!
//! Period state is never stored: it is whatever stage most recently became
//! due. [`current_stage`] and [`current_period_id`] are the only places that
//! decide this, and every handler and command goes through them.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::models::ReviewStage;

const NOMINATIONS_OPEN_DESCRIPTION: &str = "Nominations are now open for reviewers.

All Direct Reports should review their line managers. In addition, please select up to **three** project managers or directors for \"manager\" reviewers, and up to **three** peers or wider team members who you have worked closely with.

External should only be used for those in predominantly external roles.

Please discuss your choices with your line manager. They will be able to see this list on their dashboard page.";

const NOMINATIONS_OPEN_CONFIG: &str = r#"{"LMInfo":"If you are a line manager, then you will be able to see who your line reports have nominated here. \n\nPlease discuss the choices with them."}"#;

const FEEDBACK_OPENS_DESCRIPTION: &str = "Please complete the review forms for each of the staff members below.

Each form has a save button, and there is no separate submit button you have to click. Please click save before navigating away from the page or leaving your computer unattended.

You should see a green message pop up to confirm that your work has been saved.";

const FEEDBACK_CLOSES_DESCRIPTION: &str = "Please find the submitted feedback on your line reports below.

At the top of each section you will find the assessment form for you to complete.";

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(type_name = "stage_code", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageCode {
    Open,
    Nominations,
    NominationsClose,
    FeedbackOpens,
    FeedbackClose,
    #[sqlx(rename = "PART1")]
    #[serde(rename = "PART1")]
    Part1,
    ReviewMeetings,
    OneOnOne,
    #[sqlx(rename = "PART2")]
    #[serde(rename = "PART2")]
    Part2,
    Other,
}

/// Fixed properties of one catalog entry
#[derive(Debug)]
pub struct StageDefinition {
    pub code: StageCode,
    pub name: &'static str,
    pub morning: bool,
    pub visible: bool,
    pub title: Option<&'static str>,
    pub description: Option<&'static str>,
    pub configuration: Option<&'static str>,
}

const fn stage(code: StageCode, name: &'static str) -> StageDefinition {
    StageDefinition {
        code,
        name,
        morning: false,
        visible: true,
        title: None,
        description: None,
        configuration: None,
    }
}

static CATALOG: [StageDefinition; 10] = [
    StageDefinition {
        morning: true,
        visible: false,
        ..stage(StageCode::Open, "Opens")
    },
    StageDefinition {
        morning: true,
        description: Some(NOMINATIONS_OPEN_DESCRIPTION),
        configuration: Some(NOMINATIONS_OPEN_CONFIG),
        ..stage(StageCode::Nominations, "Nominations Open")
    },
    stage(StageCode::NominationsClose, "Nominations Close"),
    StageDefinition {
        morning: true,
        description: Some(FEEDBACK_OPENS_DESCRIPTION),
        ..stage(StageCode::FeedbackOpens, "Feedback Opens")
    },
    StageDefinition {
        description: Some(FEEDBACK_CLOSES_DESCRIPTION),
        ..stage(StageCode::FeedbackClose, "Feedback Closes")
    },
    StageDefinition {
        title: Some("Part 1 Appraisal Form to be submitted to HR"),
        ..stage(StageCode::Part1, "Part 1")
    },
    StageDefinition {
        morning: true,
        ..stage(StageCode::ReviewMeetings, "Review Meetings")
    },
    StageDefinition {
        morning: true,
        title: Some("1:1 Meetings between Line Managers and Reports"),
        ..stage(StageCode::OneOnOne, "1-on-1")
    },
    StageDefinition {
        title: Some("Part 2 Appraisal Form to be submitted to HR"),
        ..stage(StageCode::Part2, "Part 2")
    },
    stage(StageCode::Other, "Other"),
];

impl StageCode {
    /// All codes in catalog order
    pub fn all() -> impl Iterator<Item = StageCode> {
        CATALOG.iter().map(|d| d.code)
    }

    pub fn definition(self) -> &'static StageDefinition {
        &CATALOG[self.index()]
    }

    pub fn index(self) -> usize {
        self as usize
    }

    /// Display label, e.g. "4. Feedback Opens"
    pub fn label(self) -> String {
        format!("{}. {}", self.index() + 1, self.definition().name)
    }

    pub fn title(self) -> &'static str {
        let def = self.definition();
        def.title.unwrap_or(def.name)
    }

    /// Local time of day a stage becomes due: start of day for morning
    /// stages, last second of the day otherwise.
    pub fn time_of_day(self) -> NaiveTime {
        if self.definition().morning {
            NaiveTime::MIN
        } else {
            NaiveTime::from_hms_opt(23, 59, 59).unwrap_or(NaiveTime::MIN)
        }
    }

    /// Whether staff may still edit responses once this stage is current
    pub fn accepts_responses(self) -> bool {
        self >= StageCode::FeedbackOpens && self != StageCode::Other
    }
}

/// One stage of a default schedule
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedStage {
    pub code: StageCode,
    pub date: DateTime<Utc>,
    /// False when the period already had this stage and it was kept as is
    pub created: bool,
}

/// First Monday on or after `today`
fn monday_on_or_after(today: NaiveDate) -> NaiveDate {
    let days_ahead = (7 - today.weekday().num_days_from_monday()) % 7;
    today + Duration::days(days_ahead as i64)
}

fn local_to_utc(tz: Tz, date: NaiveDate, time: NaiveTime) -> DateTime<Utc> {
    let naive = date.and_time(time);
    tz.from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|| Utc.from_utc_datetime(&naive))
}

/// 23:59:59 local on `date`, the time evening stages and deadlines fall on
pub fn end_of_day(date: NaiveDate, tz: Tz) -> DateTime<Utc> {
    local_to_utc(tz, date, StageCode::FeedbackClose.time_of_day())
}

/// Lay out one stage per catalog entry (excluding "Other"), one week apart,
/// starting the Monday on or after `now` in the review time zone.
///
/// Stages already present in `existing` keep their date, and the cursor
/// continues a week after that date.
pub fn plan_default_stages(
    existing: &HashMap<StageCode, DateTime<Utc>>,
    now: DateTime<Utc>,
    tz: Tz,
) -> Vec<PlannedStage> {
    let mut cursor = monday_on_or_after(now.with_timezone(&tz).date_naive());
    let mut planned = Vec::new();

    for code in StageCode::all().filter(|c| *c != StageCode::Other) {
        let (date, created) = match existing.get(&code) {
            Some(date) => (*date, false),
            None => (local_to_utc(tz, cursor, code.time_of_day()), true),
        };
        planned.push(PlannedStage {
            code,
            date,
            created,
        });
        cursor = date.with_timezone(&tz).date_naive() + Duration::weeks(1);
    }

    planned
}

/// The stage with the greatest date not after `now`
pub fn current_stage(stages: &[ReviewStage], now: DateTime<Utc>) -> Option<&ReviewStage> {
    stages
        .iter()
        .filter(|s| s.date <= now)
        .max_by_key(|s| s.date)
}

/// The period owning the latest OPEN stage that is already due
pub fn current_period_id(stages: &[ReviewStage], now: DateTime<Utc>) -> Option<Uuid> {
    stages
        .iter()
        .filter(|s| s.code == StageCode::Open && s.date <= now)
        .max_by_key(|s| s.date)
        .map(|s| s.period_id)
}

/// Stage date for a code within one period's stages
pub fn stage_date(stages: &[ReviewStage], code: StageCode) -> Option<DateTime<Utc>> {
    stages.iter().find(|s| s.code == code).map(|s| s.date)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Timelike, Weekday};

    fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    fn row(period_id: Uuid, code: StageCode, date: DateTime<Utc>) -> ReviewStage {
        ReviewStage {
            id: Uuid::new_v4(),
            period_id,
            code,
            title: code.title().to_string(),
            description: None,
            visible: true,
            configuration: None,
            date,
        }
    }

    #[test]
    fn test_end_of_day_is_local() {
        let date = NaiveDate::from_ymd_opt(2024, 7, 5).unwrap();
        // BST is UTC+1
        assert_eq!(
            end_of_day(date, chrono_tz::Europe::London),
            Utc.with_ymd_and_hms(2024, 7, 5, 22, 59, 59).unwrap()
        );
        assert_eq!(
            end_of_day(date, chrono_tz::UTC),
            Utc.with_ymd_and_hms(2024, 7, 5, 23, 59, 59).unwrap()
        );
    }

    #[test]
    fn test_catalog_order_matches_enum() {
        for (ix, code) in StageCode::all().enumerate() {
            assert_eq!(code.index(), ix);
            assert_eq!(code.definition().code, code);
        }
        assert_eq!(StageCode::all().count(), 10);
    }

    #[test]
    fn test_labels_and_titles() {
        assert_eq!(StageCode::Open.label(), "1. Opens");
        assert_eq!(StageCode::FeedbackClose.label(), "5. Feedback Closes");
        assert_eq!(StageCode::Nominations.title(), "Nominations Open");
        assert_eq!(
            StageCode::OneOnOne.title(),
            "1:1 Meetings between Line Managers and Reports"
        );
        assert!(!StageCode::Open.definition().visible);
        assert!(StageCode::Part2.definition().visible);
    }

    #[test]
    fn test_nominations_configuration_is_json() {
        let config = StageCode::Nominations.definition().configuration.unwrap();
        let value: serde_json::Value = serde_json::from_str(config).unwrap();
        assert!(value.get("LMInfo").is_some());
    }

    #[test]
    fn test_monday_on_or_after() {
        let wed = NaiveDate::from_ymd_opt(2024, 6, 5).unwrap();
        assert_eq!(
            monday_on_or_after(wed),
            NaiveDate::from_ymd_opt(2024, 6, 10).unwrap()
        );
        let mon = NaiveDate::from_ymd_opt(2024, 6, 10).unwrap();
        assert_eq!(monday_on_or_after(mon), mon);
    }

    #[test]
    fn test_default_schedule_has_nine_weekly_stages() {
        let now = at(2024, 6, 5, 15);
        let plan = plan_default_stages(&HashMap::new(), now, chrono_tz::UTC);

        assert_eq!(plan.len(), 9);
        assert!(plan.iter().all(|p| p.created));
        assert!(plan.iter().all(|p| p.code != StageCode::Other));

        let first = plan[0].date;
        assert_eq!(first.weekday(), Weekday::Mon);
        assert_eq!(first.date_naive(), NaiveDate::from_ymd_opt(2024, 6, 10).unwrap());

        for pair in plan.windows(2) {
            assert!(pair[1].date > pair[0].date);
            let days = (pair[1].date.date_naive() - pair[0].date.date_naive()).num_days();
            assert_eq!(days, 7);
        }
    }

    #[test]
    fn test_default_schedule_times_follow_morning_flag() {
        let plan = plan_default_stages(&HashMap::new(), at(2024, 6, 5, 15), chrono_tz::UTC);
        for p in &plan {
            let t = p.date.time();
            if p.code.definition().morning {
                assert_eq!((t.hour(), t.minute(), t.second()), (0, 0, 0));
            } else {
                assert_eq!((t.hour(), t.minute(), t.second()), (23, 59, 59));
            }
        }
    }

    #[test]
    fn test_default_schedule_uses_local_time() {
        let plan = plan_default_stages(
            &HashMap::new(),
            at(2024, 6, 5, 15),
            chrono_tz::Europe::London,
        );
        // Midnight BST is 23:00 UTC the day before
        assert_eq!(plan[0].date, at(2024, 6, 9, 23));
        let local = plan[0].date.with_timezone(&chrono_tz::Europe::London);
        assert_eq!(local.hour(), 0);
        assert_eq!(local.weekday(), Weekday::Mon);
    }

    #[test]
    fn test_default_schedule_is_idempotent() {
        let now = at(2024, 6, 5, 15);
        let first = plan_default_stages(&HashMap::new(), now, chrono_tz::UTC);
        let existing: HashMap<_, _> = first.iter().map(|p| (p.code, p.date)).collect();

        // Rerun a fortnight later: nothing is created and nothing moves
        let second = plan_default_stages(&existing, now + Duration::weeks(2), chrono_tz::UTC);
        assert!(second.iter().all(|p| !p.created));
        let dates: Vec<_> = second.iter().map(|p| p.date).collect();
        let expected: Vec<_> = first.iter().map(|p| p.date).collect();
        assert_eq!(dates, expected);
    }

    #[test]
    fn test_default_schedule_continues_from_existing_stage() {
        let now = at(2024, 6, 5, 15);
        let mut existing = HashMap::new();
        // Admin moved feedback close three weeks later than the default
        existing.insert(StageCode::FeedbackClose, at(2024, 7, 29, 12));

        let plan = plan_default_stages(&existing, now, chrono_tz::UTC);
        let close = plan.iter().find(|p| p.code == StageCode::FeedbackClose).unwrap();
        assert!(!close.created);
        assert_eq!(close.date, at(2024, 7, 29, 12));

        let part1 = plan.iter().find(|p| p.code == StageCode::Part1).unwrap();
        assert_eq!(
            part1.date.date_naive(),
            NaiveDate::from_ymd_opt(2024, 8, 5).unwrap()
        );
    }

    #[test]
    fn test_current_stage_is_latest_due() {
        let period = Uuid::new_v4();
        let stages = vec![
            row(period, StageCode::Open, at(2024, 6, 10, 0)),
            row(period, StageCode::Nominations, at(2024, 6, 17, 0)),
            row(period, StageCode::NominationsClose, at(2024, 6, 24, 23)),
        ];

        assert!(current_stage(&stages, at(2024, 6, 1, 0)).is_none());
        assert_eq!(
            current_stage(&stages, at(2024, 6, 10, 0)).map(|s| s.code),
            Some(StageCode::Open)
        );
        assert_eq!(
            current_stage(&stages, at(2024, 6, 20, 0)).map(|s| s.code),
            Some(StageCode::Nominations)
        );
        assert_eq!(
            current_stage(&stages, at(2025, 1, 1, 0)).map(|s| s.code),
            Some(StageCode::NominationsClose)
        );
    }

    #[test]
    fn test_current_period_picks_latest_open_stage() {
        let old = Uuid::new_v4();
        let new = Uuid::new_v4();
        let future = Uuid::new_v4();
        let stages = vec![
            row(old, StageCode::Open, at(2023, 11, 6, 0)),
            row(new, StageCode::Open, at(2024, 6, 10, 0)),
            row(future, StageCode::Open, at(2024, 11, 4, 0)),
            row(old, StageCode::Part2, at(2024, 7, 1, 0)),
        ];

        assert_eq!(current_period_id(&stages, at(2023, 1, 1, 0)), None);
        assert_eq!(current_period_id(&stages, at(2024, 1, 1, 0)), Some(old));
        assert_eq!(current_period_id(&stages, at(2024, 8, 1, 0)), Some(new));
    }

    #[test]
    fn test_accepts_responses() {
        assert!(!StageCode::Nominations.accepts_responses());
        assert!(!StageCode::NominationsClose.accepts_responses());
        assert!(StageCode::FeedbackOpens.accepts_responses());
        assert!(StageCode::Part2.accepts_responses());
        assert!(!StageCode::Other.accepts_responses());
    }
}
