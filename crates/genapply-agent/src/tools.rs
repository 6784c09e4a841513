use crate::context::{ContextSearch, ProjectManifest};
use anyhow::{Result, anyhow};
use genapply_llm::ProviderTool;
use serde_json::{Value, json};
use std::sync::Arc;

const MAX_RESULTS: usize = 5;

/// `search_project`: lets the model rank the request's files or read one.
pub struct SearchProjectTool {
    search: Arc<dyn ContextSearch>,
    manifest: Arc<ProjectManifest>,
}

impl SearchProjectTool {
    pub fn new(search: Arc<dyn ContextSearch>, manifest: Arc<ProjectManifest>) -> Self {
        Self { search, manifest }
    }
}

impl ProviderTool for SearchProjectTool {
    fn name(&self) -> &str {
        "search_project"
    }

    fn description(&self) -> &str {
        "Search the current project files. Pass `query` to rank files by relevance, or `path` to read one file."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {"type": "string", "description": "Words describing what to look for"},
                "path": {"type": "string", "description": "Exact project path to read"}
            }
        })
    }

    fn call(&self, args: &Value) -> Result<String> {
        if let Some(path) = args.get("path").and_then(|v| v.as_str()) {
            let content = self
                .manifest
                .get(path)
                .ok_or_else(|| anyhow!("no such file: {path}"))?;
            return Ok(content.to_string());
        }
        let query = args
            .get("query")
            .and_then(|v| v.as_str())
            .filter(|q| !q.trim().is_empty())
            .ok_or_else(|| anyhow!("`query` or `path` is required"))?;
        let results = self.search.search(query, &self.manifest)?;
        let top: Vec<Value> = results
            .iter()
            .take(MAX_RESULTS)
            .map(|r| json!({"path": r.path, "score": r.score, "reason": r.reason}))
            .collect();
        Ok(serde_json::to_string(&top)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::KeywordSearch;
    use std::collections::BTreeMap;

    fn tool() -> SearchProjectTool {
        let manifest = ProjectManifest::new(BTreeMap::from([
            ("src/Footer.jsx".to_string(), "<footer>(c)</footer>".to_string()),
            ("src/App.jsx".to_string(), "<main/>".to_string()),
        ]));
        SearchProjectTool::new(Arc::new(KeywordSearch), Arc::new(manifest))
    }

    #[test]
    fn query_returns_ranked_paths() {
        let out = tool().call(&json!({"query": "footer"})).expect("call");
        let parsed: Value = serde_json::from_str(&out).expect("json");
        assert_eq!(parsed[0]["path"], "src/Footer.jsx");
        assert_eq!(parsed.as_array().map(Vec::len), Some(1));
    }

    #[test]
    fn path_reads_a_file_and_unknown_paths_fail() {
        assert_eq!(
            tool().call(&json!({"path": "src/App.jsx"})).expect("read"),
            "<main/>"
        );
        assert!(tool().call(&json!({"path": "src/Nope.jsx"})).is_err());
        assert!(tool().call(&json!({})).is_err());
    }
}
