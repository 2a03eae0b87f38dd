//! Completion response schema
//!
//! Strict decoding of the classifier output. Required fields must be
//! present with the right types; a miss rejects the whole response rather
//! than silently substituting defaults. Extra fields the service invents
//! are tolerated.

use serde::Deserialize;

/// One classified activity from the completion output.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ActivityDraft {
    /// Project name the activity belongs to (may be a proposal)
    pub project: String,

    /// One-sentence summary of what happened
    pub description: String,

    /// Calendar date of the activity, YYYY-MM-DD
    pub date: String,

    #[serde(default = "default_activity_type")]
    pub activity_type: String,

    #[serde(default)]
    pub technologies: Vec<String>,

    /// Index into the sessions listed in the prompt, when the service
    /// attributed the activity to one
    #[serde(default)]
    pub session: Option<usize>,

    #[serde(default)]
    pub tweet_draft: Option<String>,
}

fn default_activity_type() -> String {
    "work".to_string()
}

/// A project the service proposes creating.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ProjectSuggestion {
    pub name: String,

    #[serde(default)]
    pub reason: String,

    #[serde(default)]
    pub keywords: Vec<String>,
}

/// Top-level classifier output.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ClassifierResponse {
    pub activities: Vec<ActivityDraft>,

    #[serde(default)]
    pub new_projects: Vec<ProjectSuggestion>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_response_decodes() {
        let raw = r#"{
            "activities": [
                {
                    "project": "data pipeline",
                    "description": "Fixed the ingest retry loop",
                    "date": "2026-03-01",
                    "activity_type": "coding",
                    "technologies": ["rust", "sqlite"],
                    "session": 0,
                    "tweet_draft": "Squashed a nasty retry bug today"
                }
            ],
            "new_projects": [
                {"name": "data pipeline", "reason": "repeated work", "keywords": ["etl"]}
            ]
        }"#;

        let response: ClassifierResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(response.activities.len(), 1);
        assert_eq!(response.activities[0].session, Some(0));
        assert_eq!(response.new_projects[0].keywords, vec!["etl"]);
    }

    #[test]
    fn test_optional_fields_default() {
        let raw = r#"{
            "activities": [
                {"project": "misc", "description": "Read docs", "date": "2026-03-01"}
            ]
        }"#;

        let response: ClassifierResponse = serde_json::from_str(raw).unwrap();
        let draft = &response.activities[0];
        assert_eq!(draft.activity_type, "work");
        assert!(draft.technologies.is_empty());
        assert_eq!(draft.session, None);
        assert_eq!(draft.tweet_draft, None);
        assert!(response.new_projects.is_empty());
    }

    #[test]
    fn test_missing_required_field_rejected() {
        let raw = r#"{
            "activities": [
                {"project": "misc", "date": "2026-03-01"}
            ]
        }"#;

        assert!(serde_json::from_str::<ClassifierResponse>(raw).is_err());
    }

    #[test]
    fn test_wrong_type_rejected() {
        let raw = r#"{"activities": "none"}"#;
        assert!(serde_json::from_str::<ClassifierResponse>(raw).is_err());
    }

    #[test]
    fn test_unknown_fields_tolerated() {
        let raw = r#"{
            "activities": [],
            "confidence": 0.9,
            "notes": "nothing much happened"
        }"#;

        let response: ClassifierResponse = serde_json::from_str(raw).unwrap();
        assert!(response.activities.is_empty());
    }
}
