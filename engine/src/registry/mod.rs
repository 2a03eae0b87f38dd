//! Project registry resolution
//!
//! Turns classifier output into concrete project assignments. Projects are
//! created conservatively: a proposed name must accumulate enough activity
//! across enough distinct days before it becomes a real project; until
//! then its activities land in the default bucket and the evidence is
//! tallied for future batches. A proposal close enough in name to an
//! existing project folds into it instead, with keywords unioned.
//!
//! Resolution is pure: it reads the current projects and tallies and emits
//! a set of writes for the batch commit, never touching the database.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use tracing::debug;

use crate::classifier::{ActivityDraft, ClassifierResponse, ProjectSuggestion};
use crate::config::RegistryConfig;
use crate::grouper::Session;
use crate::store::{NewActivity, NewProject, Project, ProposalTally};

/// Writes the resolution wants applied in the batch commit.
#[derive(Debug, Default)]
pub struct Resolution {
    pub activities: Vec<NewActivity>,
    pub project_creates: Vec<NewProject>,
    pub keyword_merges: Vec<(String, Vec<String>)>,
    pub tally_upserts: Vec<ProposalTally>,
    pub tally_deletes: Vec<String>,
}

pub struct Registry {
    config: RegistryConfig,
}

/// Proposal evidence accumulated within one batch before it is weighed
/// against the persisted tally.
struct ProposalGroup {
    display_name: String,
    keywords: Vec<String>,
    suggestion_reason: String,
    days: Vec<String>,
    draft_indexes: Vec<usize>,
}

impl Registry {
    pub fn new(config: RegistryConfig) -> Self {
        Self { config }
    }

    /// Resolve one batch of classifier output against the registry state.
    ///
    /// `sessions` supplies timestamps and event provenance for drafts that
    /// name a session index; `batch_event_ids` is the fallback provenance
    /// for drafts that do not.
    pub fn resolve(
        &self,
        response: &ClassifierResponse,
        sessions: &[Session],
        batch_event_ids: &[i64],
        existing: &[Project],
        pending: &[ProposalTally],
        now: DateTime<Utc>,
    ) -> Resolution {
        let mut resolution = Resolution::default();

        // Final project name per draft, filled in as drafts resolve
        let mut assignments: Vec<Option<String>> = vec![None; response.activities.len()];

        let mut proposals: BTreeMap<String, ProposalGroup> = BTreeMap::new();

        for (index, draft) in response.activities.iter().enumerate() {
            let normalized = normalize_name(&draft.project);

            if let Some(project) = self.match_existing(&normalized, existing) {
                if project.name != draft.project {
                    debug!(
                        proposed = %draft.project,
                        resolved = %project.name,
                        "folded proposed project into existing project"
                    );
                }
                self.merge_keywords(project, &response.new_projects, &mut resolution);
                assignments[index] = Some(project.name.clone());
                continue;
            }

            let suggestion = find_suggestion(&draft.project, &response.new_projects);
            let group = proposals
                .entry(normalized)
                .or_insert_with(|| ProposalGroup {
                    display_name: draft.project.clone(),
                    keywords: suggestion.map(|s| s.keywords.clone()).unwrap_or_default(),
                    suggestion_reason: suggestion.map(|s| s.reason.clone()).unwrap_or_default(),
                    days: Vec::new(),
                    draft_indexes: Vec::new(),
                });

            let day = activity_day(draft);
            if !group.days.contains(&day) {
                group.days.push(day);
            }
            group.draft_indexes.push(index);
        }

        let mut needs_bucket = false;

        for (normalized, group) in proposals {
            let prior = pending.iter().find(|t| t.normalized_name == normalized);

            let total_count =
                prior.map(|t| t.activity_count).unwrap_or(0) + group.draft_indexes.len() as i64;

            let mut all_days: Vec<String> =
                prior.map(|t| t.activity_days.clone()).unwrap_or_default();
            for day in &group.days {
                if !all_days.contains(day) {
                    all_days.push(day.clone());
                }
            }

            let mut keywords: Vec<String> = prior.map(|t| t.keywords.clone()).unwrap_or_default();
            for keyword in &group.keywords {
                if !keywords.contains(keyword) {
                    keywords.push(keyword.clone());
                }
            }

            if total_count >= self.config.min_activities_for_project as i64
                && all_days.len() >= self.config.min_distinct_days_for_project
            {
                debug!(
                    project = %group.display_name,
                    activities = total_count,
                    days = all_days.len(),
                    "promoting proposal to project"
                );
                resolution.project_creates.push(NewProject {
                    name: group.display_name.clone(),
                    description: group.suggestion_reason,
                    keywords,
                });
                resolution.tally_deletes.push(normalized);
                for index in group.draft_indexes {
                    assignments[index] = Some(group.display_name.clone());
                }
            } else {
                needs_bucket = true;
                resolution.tally_upserts.push(ProposalTally {
                    normalized_name: normalized,
                    display_name: group.display_name,
                    keywords,
                    activity_count: total_count,
                    activity_days: all_days,
                    first_seen: prior.map(|t| t.first_seen).unwrap_or(now),
                    last_seen: now,
                });
                for index in group.draft_indexes {
                    assignments[index] = Some(self.config.default_project_bucket.clone());
                }
            }
        }

        // The bucket project is created lazily, the first time something
        // falls into it (insert-or-ignore keeps reruns harmless).
        if needs_bucket
            && !existing
                .iter()
                .any(|p| p.name == self.config.default_project_bucket)
        {
            resolution.project_creates.push(NewProject {
                name: self.config.default_project_bucket.clone(),
                description: "Uncategorized activity".to_string(),
                keywords: Vec::new(),
            });
        }

        for (index, draft) in response.activities.iter().enumerate() {
            let project_name = assignments[index]
                .clone()
                .unwrap_or_else(|| self.config.default_project_bucket.clone());

            let (timestamp, raw_event_ids) = match draft.session.and_then(|i| sessions.get(i)) {
                Some(session) => (session.start(), session.event_ids()),
                None => (draft_timestamp(draft, now), batch_event_ids.to_vec()),
            };

            let source_refs = sessions_sources(draft, sessions);

            resolution.activities.push(NewActivity {
                timestamp,
                project_name,
                activity_type: draft.activity_type.clone(),
                description: draft.description.clone(),
                source_refs,
                raw_event_ids,
                tweet_draft: draft.tweet_draft.clone(),
            });
        }

        resolution
    }

    /// Best existing project for a normalized proposal name, by token-set
    /// similarity at or above the configured threshold. Ties go to the
    /// earliest-created project.
    fn match_existing<'a>(&self, normalized: &str, existing: &'a [Project]) -> Option<&'a Project> {
        let mut best: Option<(&Project, f64)> = None;

        for project in existing {
            let score = name_similarity(normalized, &normalize_name(&project.name));
            if score < self.config.similarity_threshold {
                continue;
            }
            let better = match best {
                None => true,
                Some((current, current_score)) => {
                    score > current_score
                        || (score == current_score && project.created_at < current.created_at)
                }
            };
            if better {
                best = Some((project, score));
            }
        }

        best.map(|(p, _)| p)
    }

    /// Union a suggestion's keywords into an existing project's keyword
    /// set when the suggestion named (a variant of) that project.
    fn merge_keywords(
        &self,
        project: &Project,
        suggestions: &[ProjectSuggestion],
        resolution: &mut Resolution,
    ) {
        let mut merged = project.keywords.clone();
        for suggestion in suggestions {
            let score = name_similarity(
                &normalize_name(&suggestion.name),
                &normalize_name(&project.name),
            );
            if score < self.config.similarity_threshold {
                continue;
            }
            for keyword in &suggestion.keywords {
                if !merged.contains(keyword) {
                    merged.push(keyword.clone());
                }
            }
        }

        if merged.len() != project.keywords.len()
            && !resolution
                .keyword_merges
                .iter()
                .any(|(name, _)| name == &project.name)
        {
            resolution.keyword_merges.push((project.name.clone(), merged));
        }
    }
}

fn find_suggestion<'a>(
    draft_project: &str,
    suggestions: &'a [ProjectSuggestion],
) -> Option<&'a ProjectSuggestion> {
    let normalized = normalize_name(draft_project);
    suggestions
        .iter()
        .find(|s| normalize_name(&s.name) == normalized)
}

/// Calendar day bucket for the distinct-days rule.
fn activity_day(draft: &ActivityDraft) -> String {
    draft.date.chars().take(10).collect()
}

fn draft_timestamp(draft: &ActivityDraft, now: DateTime<Utc>) -> DateTime<Utc> {
    match NaiveDate::parse_from_str(&draft.date, "%Y-%m-%d") {
        Ok(date) => match date.and_hms_opt(0, 0, 0) {
            Some(naive) => Utc.from_utc_datetime(&naive),
            None => now,
        },
        Err(_) => now,
    }
}

fn sessions_sources(draft: &ActivityDraft, sessions: &[Session]) -> Vec<String> {
    let mut sources = Vec::new();
    let selected: Box<dyn Iterator<Item = &Session>> =
        match draft.session.and_then(|i| sessions.get(i)) {
            Some(session) => Box::new(std::iter::once(session)),
            None => Box::new(sessions.iter()),
        };

    for session in selected {
        for event in session.events() {
            if !sources.contains(&event.source) {
                sources.push(event.source.clone());
            }
        }
    }

    sources
}

/// Normalize a project name for comparison: lowercase, hyphens and
/// underscores become spaces, runs of whitespace collapse.
pub fn normalize_name(name: &str) -> String {
    let lowered = name.to_lowercase().replace(['-', '_'], " ");
    lowered.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Token-set similarity between two normalized names.
///
/// Dice coefficient over the token sets: 2|A ∩ B| / (|A| + |B|). Names
/// split on non-alphanumeric characters, so "data pipeline" and
/// "data pipeline v2" score 0.8 while unrelated names score near zero.
pub fn name_similarity(a: &str, b: &str) -> f64 {
    let tokens_a = tokenize(a);
    let tokens_b = tokenize(b);

    if tokens_a.is_empty() && tokens_b.is_empty() {
        return 1.0;
    }
    if tokens_a.is_empty() || tokens_b.is_empty() {
        return 0.0;
    }

    let common = tokens_a.iter().filter(|t| tokens_b.contains(*t)).count();

    (2.0 * common as f64) / (tokens_a.len() + tokens_b.len()) as f64
}

fn tokenize(name: &str) -> Vec<String> {
    let mut tokens: Vec<String> = Vec::new();
    for token in name
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
    {
        let token = token.to_lowercase();
        if !tokens.contains(&token) {
            tokens.push(token);
        }
    }
    tokens
}
