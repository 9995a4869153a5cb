//! Review form definitions loaded from YAML

use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;

use crate::models::{ReviewRound, ReviewerRole};

/// Forms used when a period is given forms without a configuration file
pub const DEFAULT_FORMS: &str = include_str!("default-questions.yml");

#[derive(Debug, Error)]
pub enum FormConfigError {
    #[error("Could not read form configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid form configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Form configuration contains no forms")]
    NoForms,

    #[error("Form for {role} has no title")]
    MissingTitle { role: String },

    #[error("Form for {role} has no questions")]
    NoQuestions { role: String },

    #[error("Question {sequence} of the {role} form has no title")]
    MissingQuestionTitle { role: String, sequence: usize },

    #[error("More than one form for {role}")]
    DuplicateRole { role: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct FormConfig {
    #[serde(default)]
    pub period: Option<ReviewRound>,
    #[serde(default)]
    pub year: Option<i32>,
    pub forms: Vec<FormDefinition>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FormDefinition {
    pub role: ReviewerRole,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub questions: Vec<QuestionDefinition>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QuestionDefinition {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
}

impl FormConfig {
    pub fn parse(source: &str) -> Result<Self, FormConfigError> {
        let config: FormConfig = serde_yaml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, FormConfigError> {
        let source = std::fs::read_to_string(path)?;
        Self::parse(&source)
    }

    pub fn default_forms() -> Result<Self, FormConfigError> {
        Self::parse(DEFAULT_FORMS)
    }

    fn validate(&self) -> Result<(), FormConfigError> {
        if self.forms.is_empty() {
            return Err(FormConfigError::NoForms);
        }

        let mut roles = HashSet::new();
        for form in &self.forms {
            let role = form.role.label().to_string();
            if !roles.insert(form.role) {
                return Err(FormConfigError::DuplicateRole { role });
            }
            if form.title.trim().is_empty() {
                return Err(FormConfigError::MissingTitle { role });
            }
            if form.questions.is_empty() {
                return Err(FormConfigError::NoQuestions { role });
            }
            for (sequence, question) in form.sequenced_questions() {
                if question.title.trim().is_empty() {
                    return Err(FormConfigError::MissingQuestionTitle {
                        role,
                        sequence: sequence as usize,
                    });
                }
            }
        }

        Ok(())
    }
}

impl FormDefinition {
    /// Questions paired with their 1-based sequence number
    pub fn sequenced_questions(&self) -> impl Iterator<Item = (i32, &QuestionDefinition)> {
        self.questions
            .iter()
            .enumerate()
            .map(|(ix, q)| (ix as i32 + 1, q))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWO_FORMS: &str = r#"
period: MY
year: 2024
forms:
  - role: DR
    title: Direct report feedback
    description: About your line manager
    questions:
      - title: What went well?
      - title: What could be better?
        description: Be specific
      - title: Anything else?
  - role: EXTERNAL
    title: External feedback
    questions:
      - title: How was working together?
      - title: Strengths
      - title: Development areas
"#;

    #[test]
    fn test_parse_two_forms_with_three_questions() {
        let config = FormConfig::parse(TWO_FORMS).unwrap();
        assert_eq!(config.period, Some(ReviewRound::MidYear));
        assert_eq!(config.year, Some(2024));
        assert_eq!(config.forms.len(), 2);
        assert_eq!(config.forms[0].role, ReviewerRole::DirectReport);
        assert_eq!(config.forms[1].role, ReviewerRole::External);

        for form in &config.forms {
            let sequences: Vec<i32> = form.sequenced_questions().map(|(s, _)| s).collect();
            assert_eq!(sequences, vec![1, 2, 3]);
        }
        let (_, second) = config.forms[0].sequenced_questions().nth(1).unwrap();
        assert_eq!(second.description.as_deref(), Some("Be specific"));
    }

    #[test]
    fn test_default_forms_are_valid() {
        let config = FormConfig::default_forms().unwrap();
        assert!(!config.forms.is_empty());
        assert!(config.forms.iter().any(|f| f.role == ReviewerRole::External));
    }

    #[test]
    fn test_rejects_empty_config() {
        assert!(matches!(
            FormConfig::parse("forms: []"),
            Err(FormConfigError::NoForms)
        ));
    }

    #[test]
    fn test_rejects_duplicate_role() {
        let yaml = r#"
forms:
  - role: PM
    title: A
    questions: [{title: Q}]
  - role: PROJECT_MANAGER
    title: B
    questions: [{title: Q}]
"#;
        assert!(matches!(
            FormConfig::parse(yaml),
            Err(FormConfigError::DuplicateRole { .. })
        ));
    }

    #[test]
    fn test_rejects_form_without_questions() {
        let yaml = "forms:\n  - role: WT\n    title: Wider team\n";
        assert!(matches!(
            FormConfig::parse(yaml),
            Err(FormConfigError::NoQuestions { .. })
        ));
    }

    #[test]
    fn test_rejects_untitled_question() {
        let yaml = "forms:\n  - role: SA\n    title: Self\n    questions:\n      - description: no title\n";
        assert!(matches!(
            FormConfig::parse(yaml),
            Err(FormConfigError::MissingQuestionTitle { sequence: 1, .. })
        ));
    }

    #[test]
    fn test_rejects_unknown_role() {
        let yaml = "forms:\n  - role: CEO\n    title: X\n    questions: [{title: Q}]\n";
        assert!(matches!(FormConfig::parse(yaml), Err(FormConfigError::Yaml(_))));
    }
}
