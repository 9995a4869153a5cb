//! Review export: completed reviews rendered as Markdown and packed in a zip

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::Deserialize;
use sqlx::PgConnection;
use std::collections::{BTreeMap, HashMap};
use std::io::{Cursor, Write};
use thiserror::Error;
use uuid::Uuid;
use zip::write::FileOptions;
use zip::ZipWriter;

use crate::db;
use crate::models::{
    NominationDetail, ReviewForm, ReviewFormQuestion, ReviewFormResponse, ReviewPeriod,
    ReviewerRole,
};

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("No {role} form in this period")]
    MissingForm { role: String },

    #[error("Archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// One document per nomination, or one per reviewee holding all of theirs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ExportGrouping {
    #[default]
    Reviewee,
    Nomination,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ExportSummary {
    pub documents: usize,
    pub nominations: usize,
    /// Nominations without any response
    pub empty: usize,
    /// Nominations that failed to render
    pub failed: usize,
}

/// Everything needed to render a period's reviews
pub struct ExportData {
    pub period: ReviewPeriod,
    pub nominations: Vec<NominationDetail>,
    pub forms: HashMap<ReviewerRole, (ReviewForm, Vec<ReviewFormQuestion>)>,
    pub responses: HashMap<Uuid, Vec<ReviewFormResponse>>,
}

impl ExportData {
    pub async fn load(conn: &mut PgConnection, period: ReviewPeriod) -> Result<Self, sqlx::Error> {
        let nominations = db::nominations::period_nominations(&mut *conn, period.id).await?;
        let forms = db::forms::period_forms(&mut *conn, period.id).await?;
        let form_ids: Vec<Uuid> = forms.iter().map(|f| f.id).collect();
        let questions = db::forms::form_questions(&mut *conn, &form_ids).await?;
        let nomination_ids: Vec<Uuid> = nominations.iter().map(|n| n.id).collect();
        let responses = db::nominations::responses_for(conn, &nomination_ids).await?;

        let mut by_form: HashMap<Uuid, Vec<ReviewFormQuestion>> = HashMap::new();
        for question in questions {
            by_form.entry(question.form_id).or_default().push(question);
        }
        let forms = forms
            .into_iter()
            .map(|form| {
                let questions = by_form.remove(&form.id).unwrap_or_default();
                (form.role, (form, questions))
            })
            .collect();

        let mut by_nomination: HashMap<Uuid, Vec<ReviewFormResponse>> = HashMap::new();
        for response in responses {
            by_nomination
                .entry(response.nomination_id)
                .or_default()
                .push(response);
        }

        Ok(Self {
            period,
            nominations,
            forms,
            responses: by_nomination,
        })
    }

    /// Keep only one reviewee's nominations
    pub fn retain_reviewee(&mut self, reviewee_id: Uuid) {
        self.nominations.retain(|n| n.reviewee_id == reviewee_id);
    }

    /// File name for each reviewee. Reviewees who share a name get their id
    /// appended so their reviews stay apart.
    fn reviewee_names(&self) -> HashMap<Uuid, String> {
        let mut by_name: HashMap<String, Vec<Uuid>> = HashMap::new();
        for n in &self.nominations {
            let name = sanitize_filename(&format!(
                "{}_{}",
                n.reviewee_last_name, n.reviewee_first_name
            ));
            let ids = by_name.entry(name).or_default();
            if !ids.contains(&n.reviewee_id) {
                ids.push(n.reviewee_id);
            }
        }

        by_name
            .into_iter()
            .flat_map(|(name, ids)| {
                let shared = ids.len() > 1;
                ids.into_iter().map(move |id| {
                    let file = if shared {
                        format!("{}_{}", name, id)
                    } else {
                        name.clone()
                    };
                    (id, file)
                })
            })
            .collect()
    }

    fn has_responses(&self, nomination: &NominationDetail) -> bool {
        self.responses
            .get(&nomination.id)
            .is_some_and(|r| !r.is_empty())
    }

    /// Markdown for one nomination: heading, reviewer, then each question
    /// with its answer
    pub fn render_nomination(
        &self,
        nomination: &NominationDetail,
        tz: Tz,
    ) -> Result<String, ExportError> {
        let (form, questions) =
            self.forms
                .get(&nomination.role)
                .ok_or_else(|| ExportError::MissingForm {
                    role: nomination.role.label().to_string(),
                })?;
        let responses = self
            .responses
            .get(&nomination.id)
            .map(Vec::as_slice)
            .unwrap_or_default();

        let mut out = String::new();
        out.push_str(&format!(
            "# {}\n\n## {} {}\n\n",
            nomination.reviewee_name(),
            self.period.name(),
            form.title
        ));
        out.push_str(&format!("**Reviewer:** {}\n\n", reviewer_line(nomination)));
        let last_modified = responses.iter().map(|r| r.last_modified).max();
        out.push_str(&format!(
            "**Last Modified:** {}\n\n",
            format_timestamp(last_modified, tz)
        ));
        if let Some(ref description) = form.description {
            out.push_str(description.trim());
            out.push_str("\n\n");
        }

        for question in questions {
            out.push_str(&format!("### {}\n\n", question.title));
            if let Some(ref description) = question.description {
                out.push_str(&format!("_{}_\n\n", description.trim()));
            }
            if let Some(response) = responses.iter().find(|r| r.question_id == question.id) {
                out.push_str(response.value.trim());
                out.push_str("\n\n");
            }
        }

        Ok(out)
    }

    /// Render every nomination with responses into documents keyed by path.
    /// A nomination that fails to render is logged and left out.
    pub fn documents(
        &self,
        grouping: ExportGrouping,
        tz: Tz,
    ) -> (BTreeMap<String, String>, ExportSummary) {
        let names = self.reviewee_names();
        let mut documents: BTreeMap<String, String> = BTreeMap::new();
        let mut summary = ExportSummary::default();

        for nomination in &self.nominations {
            if !self.has_responses(nomination) {
                summary.empty += 1;
                continue;
            }
            let text = match self.render_nomination(nomination, tz) {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!(nomination_id = %nomination.id, "Skipping export: {}", e);
                    summary.failed += 1;
                    continue;
                }
            };
            summary.nominations += 1;

            let Some(reviewee) = names.get(&nomination.reviewee_id) else {
                continue;
            };
            match grouping {
                ExportGrouping::Nomination => {
                    let name = sanitize_filename(&format!(
                        "{}_{}",
                        nomination.role.label(),
                        nomination.reviewer_name()
                    ));
                    let mut path = format!("{}/{}.md", reviewee, name);
                    if documents.contains_key(&path) {
                        path = format!("{}/{}_{}.md", reviewee, name, nomination.id);
                    }
                    documents.insert(path, text);
                }
                ExportGrouping::Reviewee => {
                    let doc = documents.entry(format!("{}.md", reviewee)).or_default();
                    if !doc.is_empty() {
                        doc.push_str("\n---\n\n");
                    }
                    doc.push_str(&text);
                }
            }
        }

        summary.documents = documents.len();
        (documents, summary)
    }

    pub fn archive(
        &self,
        grouping: ExportGrouping,
        tz: Tz,
    ) -> Result<(Vec<u8>, ExportSummary), ExportError> {
        let (documents, summary) = self.documents(grouping, tz);
        let folder = sanitize_filename(&self.period.name());
        let bytes = write_zip(
            documents
                .iter()
                .map(|(path, text)| (format!("{}/{}", folder, path), text.as_str())),
        )?;
        Ok((bytes, summary))
    }
}

fn reviewer_line(nomination: &NominationDetail) -> String {
    match (&nomination.external_name, &nomination.external_email) {
        (Some(name), Some(email)) => format!("{} ({})", name, email),
        _ => nomination.reviewer_name(),
    }
}

fn format_timestamp(at: Option<DateTime<Utc>>, tz: Tz) -> String {
    match at {
        Some(at) => at.with_timezone(&tz).format("%d %b %Y %H:%M").to_string(),
        None => "Never".to_string(),
    }
}

pub fn write_zip<'a>(
    files: impl IntoIterator<Item = (String, &'a str)>,
) -> Result<Vec<u8>, ExportError> {
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    let options = FileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    for (path, text) in files {
        zip.start_file(path, options)?;
        zip.write_all(text.as_bytes())?;
    }

    Ok(zip.finish()?.into_inner())
}

/// Keep letters, digits, '-', '_' and '.'; everything else becomes '_'
pub fn sanitize_filename(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();

    let sanitized = sanitized.trim_start_matches('.').trim_matches('_');

    if sanitized.is_empty() {
        "review".to_string()
    } else {
        sanitized.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ReviewRound;
    use chrono::TimeZone;
    use std::io::Read;

    fn period() -> ReviewPeriod {
        ReviewPeriod {
            id: Uuid::new_v4(),
            year: 2024,
            round: ReviewRound::MidYear,
            created_at: Utc::now(),
        }
    }

    fn nomination(period_id: Uuid, role: ReviewerRole, reviewer: &str) -> NominationDetail {
        NominationDetail {
            id: Uuid::new_v4(),
            period_id,
            role,
            reviewee_id: Uuid::new_v4(),
            reviewee_first_name: "Sam".to_string(),
            reviewee_last_name: "Jones".to_string(),
            reviewer_id: Some(Uuid::new_v4()),
            reviewer_first_name: Some(reviewer.to_string()),
            reviewer_last_name: Some("Park".to_string()),
            external_name: None,
            external_email: None,
            closes_override: None,
            feedback_close: None,
            invitation_code: None,
        }
    }

    fn form(period_id: Uuid, role: ReviewerRole) -> (ReviewForm, Vec<ReviewFormQuestion>) {
        let form = ReviewForm {
            id: Uuid::new_v4(),
            period_id,
            role,
            title: "Wider Team Feedback".to_string(),
            description: Some("About your colleague".to_string()),
        };
        let questions = (1..=2)
            .map(|sequence| ReviewFormQuestion {
                id: Uuid::new_v4(),
                form_id: form.id,
                sequence,
                title: format!("Question {}", sequence),
                description: None,
            })
            .collect();
        (form, questions)
    }

    fn response(nomination_id: Uuid, question_id: Uuid, value: &str) -> ReviewFormResponse {
        let at = Utc.with_ymd_and_hms(2024, 7, 1, 9, 30, 0).unwrap();
        ReviewFormResponse {
            id: Uuid::new_v4(),
            nomination_id,
            question_id,
            value: value.to_string(),
            created: at,
            last_modified: at,
        }
    }

    /// Two wider-team nominations for Sam, one answered, one not
    fn data() -> ExportData {
        let period = period();
        let answered = nomination(period.id, ReviewerRole::WiderTeam, "Kim");
        let mut unanswered = nomination(period.id, ReviewerRole::WiderTeam, "Lee");
        unanswered.reviewee_id = answered.reviewee_id;
        let (form, questions) = form(period.id, ReviewerRole::WiderTeam);
        let responses = vec![response(answered.id, questions[0].id, "Great work")];

        ExportData {
            nominations: vec![answered.clone(), unanswered],
            forms: HashMap::from([(ReviewerRole::WiderTeam, (form, questions))]),
            responses: HashMap::from([(answered.id, responses)]),
            period,
        }
    }

    #[test]
    fn test_render_nomination() {
        let data = data();
        let text = data
            .render_nomination(&data.nominations[0], chrono_tz::Europe::London)
            .unwrap();
        assert!(text.starts_with("# Sam Jones\n\n## 2024 Mid Year Wider Team Feedback"));
        assert!(text.contains("**Reviewer:** Kim Park"));
        assert!(text.contains("**Last Modified:** 01 Jul 2024 10:30"));
        assert!(text.contains("### Question 1\n\nGreat work"));
        assert!(text.contains("### Question 2"));
    }

    #[test]
    fn test_missing_form_is_skipped() {
        let mut data = data();
        data.nominations[0].role = ReviewerRole::ProjectManager;
        data.responses.insert(data.nominations[0].id, vec![]);
        let mut extra = data.nominations[0].clone();
        extra.id = Uuid::new_v4();
        data.responses
            .insert(extra.id, vec![response(extra.id, Uuid::new_v4(), "x")]);
        data.nominations.push(extra);

        let (documents, summary) = data.documents(ExportGrouping::Nomination, chrono_tz::UTC);
        assert!(documents.is_empty());
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.empty, 2);
    }

    #[test]
    fn test_group_by_nomination_paths() {
        let (documents, summary) = data().documents(ExportGrouping::Nomination, chrono_tz::UTC);
        assert_eq!(summary.nominations, 1);
        assert_eq!(summary.empty, 1);
        let paths: Vec<&String> = documents.keys().collect();
        assert_eq!(paths, vec!["Jones_Sam/Wider_Team_Kim_Park.md"]);
    }

    #[test]
    fn test_archive_contains_documents() {
        let (bytes, summary) = data()
            .archive(ExportGrouping::Reviewee, chrono_tz::UTC)
            .unwrap();
        assert_eq!(summary.documents, 1);

        let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        assert_eq!(archive.len(), 1);
        let mut file = archive.by_name("2024_Mid_Year/Jones_Sam.md").unwrap();
        let mut text = String::new();
        file.read_to_string(&mut text).unwrap();
        assert!(text.contains("Great work"));
    }

    /// A second Sam Jones, a different person, with one answered nomination
    fn add_namesake(data: &mut ExportData) -> Uuid {
        let other = nomination(data.period.id, ReviewerRole::WiderTeam, "Ash");
        let question_id = data.forms[&ReviewerRole::WiderTeam].1[0].id;
        data.responses.insert(
            other.id,
            vec![response(other.id, question_id, "Helpful in standups")],
        );
        data.nominations.push(other.clone());
        other.reviewee_id
    }

    #[test]
    fn test_namesakes_get_separate_documents() {
        let mut data = data();
        let first = data.nominations[0].reviewee_id;
        let second = add_namesake(&mut data);

        let (documents, summary) = data.documents(ExportGrouping::Reviewee, chrono_tz::UTC);
        assert_eq!(summary.documents, 2);
        let first_doc = &documents[&format!("Jones_Sam_{}.md", first)];
        let second_doc = &documents[&format!("Jones_Sam_{}.md", second)];
        assert!(first_doc.contains("Great work"));
        assert!(!first_doc.contains("Helpful in standups"));
        assert!(second_doc.contains("Helpful in standups"));
        assert!(!second_doc.contains("Great work"));

        let (documents, _) = data.documents(ExportGrouping::Nomination, chrono_tz::UTC);
        assert!(documents.contains_key(&format!("Jones_Sam_{}/Wider_Team_Kim_Park.md", first)));
        assert!(documents.contains_key(&format!("Jones_Sam_{}/Wider_Team_Ash_Park.md", second)));
    }

    #[test]
    fn test_export_one_reviewee() {
        let mut data = data();
        let first = data.nominations[0].reviewee_id;
        add_namesake(&mut data);
        data.retain_reviewee(first);

        let (documents, summary) = data.documents(ExportGrouping::Reviewee, chrono_tz::UTC);
        assert_eq!(summary.nominations, 1);
        let paths: Vec<&String> = documents.keys().collect();
        assert_eq!(paths, vec!["Jones_Sam.md"]);
        assert!(documents["Jones_Sam.md"].contains("Great work"));
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("Jones, Sam"), "Jones__Sam");
        assert_eq!(sanitize_filename("../etc/passwd"), "etc_passwd");
        assert_eq!(sanitize_filename("///"), "review");
    }
}
