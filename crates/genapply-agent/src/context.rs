use genapply_core::{EditType, ErrorClass};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Files of the project being edited, keyed by project-relative path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectManifest {
    files: BTreeMap<String, String>,
}

impl ProjectManifest {
    pub fn new(files: BTreeMap<String, String>) -> Self {
        Self { files }
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn get(&self, path: &str) -> Option<&str> {
        self.files.get(path).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.files.iter().map(|(p, c)| (p.as_str(), c.as_str()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub path: String,
    /// Relevance in `0.0..=1.0`.
    pub score: f32,
    pub reason: String,
}

#[derive(thiserror::Error, Debug)]
pub enum ContextError {
    #[error("no project files to search")]
    EmptyManifest,
    #[error("no file matched the request")]
    NoMatch,
    #[error("context search failed: {0}")]
    Search(#[from] anyhow::Error),
}

impl ContextError {
    pub fn class(&self) -> ErrorClass {
        ErrorClass::DegradedFeature
    }
}

/// Picks the files of a manifest that an edit request is about.
pub trait ContextSearch: Send + Sync {
    /// Ranked best first.
    fn search(&self, prompt: &str, manifest: &ProjectManifest) -> anyhow::Result<Vec<SearchResult>>;

    fn select_target_file(&self, results: &[SearchResult], _prompt: &str) -> Option<SearchResult> {
        results
            .iter()
            .fold(None::<&SearchResult>, |best, r| match best {
                Some(b) if b.score >= r.score => Some(b),
                _ => Some(r),
            })
            .cloned()
    }
}

/// Scores files by prompt keywords found in their path and content.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeywordSearch;

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "with", "that", "this", "make", "please", "can", "you", "add", "change",
    "update", "into", "from", "all", "some", "should", "would", "want", "need", "use",
];

fn keywords(prompt: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for word in prompt
        .split(|c: char| !c.is_alphanumeric() && c != '_' && c != '-')
        .map(str::to_ascii_lowercase)
    {
        if word.len() >= 3 && !STOPWORDS.contains(&word.as_str()) && !out.contains(&word) {
            out.push(word);
        }
    }
    out
}

impl ContextSearch for KeywordSearch {
    fn search(&self, prompt: &str, manifest: &ProjectManifest) -> anyhow::Result<Vec<SearchResult>> {
        let words = keywords(prompt);
        if words.is_empty() {
            return Ok(Vec::new());
        }
        let mut results = Vec::new();
        for (path, content) in manifest.iter() {
            let lower_path = path.to_ascii_lowercase();
            let lower_content = content.to_ascii_lowercase();
            let mut points = 0usize;
            let mut matched = Vec::new();
            for word in &words {
                let in_path = lower_path.contains(word.as_str());
                let in_content = lower_content.contains(word.as_str());
                if in_path {
                    points += 2;
                }
                if in_content {
                    points += 1;
                }
                if in_path || in_content {
                    matched.push(word.as_str());
                }
            }
            if points == 0 {
                continue;
            }
            results.push(SearchResult {
                path: path.to_string(),
                score: points as f32 / (words.len() * 3) as f32,
                reason: format!("matched {}", matched.join(", ")),
            });
        }
        results.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.path.cmp(&b.path)));
        Ok(results)
    }
}

/// What an edit request gets to see of the existing project.
#[derive(Debug, Clone, PartialEq)]
pub struct EditContext {
    pub target: SearchResult,
    pub content: String,
    pub edit_type: EditType,
    pub related: Vec<String>,
}

pub fn build_edit_context(
    search: &dyn ContextSearch,
    prompt: &str,
    manifest: &ProjectManifest,
) -> Result<EditContext, ContextError> {
    if manifest.is_empty() {
        return Err(ContextError::EmptyManifest);
    }
    let results = search.search(prompt, manifest)?;
    let target = search
        .select_target_file(&results, prompt)
        .ok_or(ContextError::NoMatch)?;
    let content = manifest
        .get(&target.path)
        .ok_or(ContextError::NoMatch)?
        .to_string();
    let related = results
        .iter()
        .filter(|r| r.path != target.path)
        .take(4)
        .map(|r| r.path.clone())
        .collect();
    Ok(EditContext {
        edit_type: infer_edit_type(prompt),
        target,
        content,
        related,
    })
}

pub fn infer_edit_type(prompt: &str) -> EditType {
    let lower = prompt.to_ascii_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));
    if has(&["rebuild", "start over", "from scratch", "rewrite everything"]) {
        EditType::FullRebuild
    } else if has(&["fix", "bug", "error", "broken", "crash", "not working"]) {
        EditType::FixIssue
    } else if has(&["style", "color", "colour", "css", "theme", "font", "tailwind", "layout"]) {
        EditType::UpdateStyle
    } else if has(&["refactor", "clean up", "cleanup", "reorganize", "restructure"]) {
        EditType::Refactor
    } else if has(&["add ", "new ", "create", "implement", "include"]) {
        EditType::AddFeature
    } else {
        EditType::UpdateComponent
    }
}
