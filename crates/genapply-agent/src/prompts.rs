//! System prompts for code generation.
//!
//! `GENERATION_SYSTEM_PROMPT` fixes the output format the file block parser
//! understands; edit requests layer the target file on top of it.

use crate::context::EditContext;

pub const GENERATION_SYSTEM_PROMPT: &str = r#"You are an expert front-end engineer generating a small web project.

## OUTPUT FORMAT
1. Start with a short explanation of what you are about to build (1-3 sentences).
2. Emit every file as a complete block:
<file path="src/components/Example.jsx">
...full file content...
</file>
3. Paths are relative to the project root. Never use "..", absolute paths, or lockfiles.
4. Always emit the whole file. Never emit diffs or partial snippets.

## RULES
- Use React with modern function components and Tailwind CSS classes.
- Import every package you use; it will be installed from your imports.
- Do not touch configuration files unless the request requires it.
"#;

const EDIT_RULES: &str = r#"## EDIT MODE
You are modifying an existing project. Change only what the request asks for.
Return the complete updated content of every file you change, using the same path."#;

/// Build the system prompt for one generation.
///
/// Layers:
/// 1. Base generation prompt
/// 2. Edit rules plus the target file (edit mode only)
/// 3. Search tool hint when the model can query the project
pub fn build_system_prompt(edit: Option<&EditContext>, search_enabled: bool) -> String {
    let mut parts = vec![GENERATION_SYSTEM_PROMPT.to_string()];

    if let Some(ctx) = edit {
        parts.push(EDIT_RULES.to_string());
        parts.push(format!(
            "## TARGET FILE\nMost relevant file: {} (score {:.2}, {})\n<file path=\"{}\">\n{}\n</file>",
            ctx.target.path, ctx.target.score, ctx.target.reason, ctx.target.path, ctx.content
        ));
        if !ctx.related.is_empty() {
            parts.push(format!("Other related files: {}", ctx.related.join(", ")));
        }
    }

    if search_enabled {
        parts.push(
            "## TOOLS\nCall `search_project` to look up other project files before editing them."
                .to_string(),
        );
    }

    parts.join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::SearchResult;
    use genapply_core::EditType;

    #[test]
    fn plain_generation_uses_the_base_prompt() {
        let prompt = build_system_prompt(None, false);
        assert_eq!(prompt, GENERATION_SYSTEM_PROMPT);
    }

    #[test]
    fn edit_mode_embeds_target_and_rationale() {
        let ctx = EditContext {
            target: SearchResult {
                path: "src/App.jsx".to_string(),
                score: 0.75,
                reason: "matched app".to_string(),
            },
            content: "export default function App() {}".to_string(),
            edit_type: EditType::UpdateComponent,
            related: vec!["src/main.jsx".to_string()],
        };
        let prompt = build_system_prompt(Some(&ctx), true);
        assert!(prompt.contains("## EDIT MODE"));
        assert!(prompt.contains("Most relevant file: src/App.jsx (score 0.75, matched app)"));
        assert!(prompt.contains("export default function App() {}"));
        assert!(prompt.contains("Other related files: src/main.jsx"));
        assert!(prompt.ends_with("before editing them."));
    }
}
