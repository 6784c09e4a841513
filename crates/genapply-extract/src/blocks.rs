use genapply_core::FileRecord;
use indexmap::IndexMap;
use regex::Regex;
use serde::Serialize;
use std::cmp::Ordering;
use std::ops::Range;

/// One file block found by a grammar, with the byte span it occupies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockMatch {
    pub span: Range<usize>,
    pub path: String,
    pub content: String,
}

/// A single way of writing a file block into prose.
pub trait BlockGrammar: Send + Sync {
    fn name(&self) -> &'static str;

    /// Closed blocks only.
    fn scan(&self, text: &str) -> Vec<BlockMatch>;

    /// Offset of the first place a block of this grammar begins, closed or
    /// not. Defaults to the first closed block.
    fn first_marker(&self, text: &str) -> Option<usize> {
        self.scan(text).first().map(|block| block.span.start)
    }
}

/// `<file path="P">…</file>`
#[derive(Debug, Clone)]
pub struct TaggedGrammar {
    block: Regex,
    open: Regex,
}

impl TaggedGrammar {
    pub fn new() -> Self {
        Self {
            block: Regex::new(r#"(?s)<file\s+path\s*=\s*["']([^"']+)["']\s*>(.*?)</file>"#)
                .expect("valid regex"),
            open: Regex::new(r#"<file\s+path\s*="#).expect("valid regex"),
        }
    }
}

impl Default for TaggedGrammar {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockGrammar for TaggedGrammar {
    fn name(&self) -> &'static str {
        "tagged"
    }

    fn scan(&self, text: &str) -> Vec<BlockMatch> {
        self.block
            .captures_iter(text)
            .filter_map(|caps| {
                let whole = caps.get(0)?;
                let path = caps.get(1)?.as_str().trim();
                if path.is_empty() {
                    return None;
                }
                Some(BlockMatch {
                    span: whole.range(),
                    path: path.to_string(),
                    content: caps.get(2)?.as_str().trim().to_string(),
                })
            })
            .collect()
    }

    fn first_marker(&self, text: &str) -> Option<usize> {
        self.open.find(text).map(|m| m.start())
    }
}

/// Markdown fences whose info string names a target path, either as an
/// attribute (`tsx path="src/App.tsx"`, `file=…`, `filename=…`) or as
/// `lang:path`. Fences without a path are illustration and ignored.
#[derive(Debug, Clone)]
pub struct FencedGrammar {
    fence: Regex,
    attribute: Regex,
}

impl FencedGrammar {
    pub fn new() -> Self {
        Self {
            fence: Regex::new(r"(?ms)^[ \t]*```([^`\n]*)\n(.*?)\r?\n[ \t]*```[ \t]*\r?$")
                .expect("valid regex"),
            attribute: Regex::new(
                r#"(?:^|\s)(?:path|file|filename)\s*=\s*(?:"([^"]+)"|'([^']+)'|(\S+))"#,
            )
            .expect("valid regex"),
        }
    }

    fn path_from_info(&self, info: &str) -> Option<String> {
        if let Some(caps) = self.attribute.captures(info) {
            let raw = caps.get(1).or_else(|| caps.get(2)).or_else(|| caps.get(3))?;
            let path = raw.as_str().trim();
            return (!path.is_empty()).then(|| path.to_string());
        }
        let first = info.split_whitespace().next()?;
        let (lang, path) = first.split_once(':')?;
        if lang.is_empty() || path.is_empty() || !lang.chars().all(|c| c.is_ascii_alphanumeric()) {
            return None;
        }
        Some(path.to_string())
    }
}

impl Default for FencedGrammar {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockGrammar for FencedGrammar {
    fn name(&self) -> &'static str {
        "fenced"
    }

    fn scan(&self, text: &str) -> Vec<BlockMatch> {
        self.fence
            .captures_iter(text)
            .filter_map(|caps| {
                let whole = caps.get(0)?;
                let path = self.path_from_info(caps.get(1)?.as_str().trim())?;
                let content = caps
                    .get(2)?
                    .as_str()
                    .trim_matches(|c: char| c == '\n' || c == '\r');
                Some(BlockMatch {
                    span: whole.range(),
                    path,
                    content: content.to_string(),
                })
            })
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Extraction {
    pub files: Vec<FileRecord>,
    pub explanation: String,
}

/// Recovers file records from generated text by running every grammar over
/// the whole text and merging their matches by path.
///
/// Stateless: streaming callers re-run it over the accumulated buffer.
pub struct FileBlockParser {
    grammars: Vec<Box<dyn BlockGrammar>>,
}

impl FileBlockParser {
    pub fn new() -> Self {
        Self::with_grammars(vec![
            Box::new(TaggedGrammar::new()),
            Box::new(FencedGrammar::new()),
        ])
    }

    pub fn with_grammars(grammars: Vec<Box<dyn BlockGrammar>>) -> Self {
        Self { grammars }
    }

    pub fn extract(&self, text: &str) -> Extraction {
        let matches = self
            .grammars
            .iter()
            .flat_map(|grammar| grammar.scan(text))
            .collect();
        Extraction {
            files: merge_blocks(matches),
            explanation: self.explanation(text),
        }
    }

    /// Paths whose blocks are already closed in `text`, first appearance
    /// first.
    pub fn completed_paths(&self, text: &str) -> Vec<String> {
        self.extract(text)
            .files
            .into_iter()
            .map(|file| file.path)
            .collect()
    }

    fn explanation(&self, text: &str) -> String {
        let first_marker = self
            .grammars
            .iter()
            .filter_map(|grammar| grammar.first_marker(text))
            .min();
        match first_marker {
            Some(offset) => text[..offset].trim().to_string(),
            None => text.trim().to_string(),
        }
    }
}

impl Default for FileBlockParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Deduplicates by path. The longer content wins, equal lengths fall back
/// to lexicographic order, so the result does not depend on which grammar
/// produced which match. Output order is first appearance in the text.
pub fn merge_blocks(mut matches: Vec<BlockMatch>) -> Vec<FileRecord> {
    matches.sort_by_key(|block| block.span.start);
    let mut merged: IndexMap<String, String> = IndexMap::new();
    for block in matches {
        match merged.get_mut(&block.path) {
            Some(existing) => {
                if prefer(&block.content, existing) == Ordering::Greater {
                    *existing = block.content;
                }
            }
            None => {
                merged.insert(block.path, block.content);
            }
        }
    }
    merged
        .into_iter()
        .map(|(path, content)| FileRecord { path, content })
        .collect()
}

fn prefer(candidate: &str, existing: &str) -> Ordering {
    candidate
        .chars()
        .count()
        .cmp(&existing.chars().count())
        .then_with(|| candidate.cmp(existing))
}
