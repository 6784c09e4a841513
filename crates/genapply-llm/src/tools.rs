use genapply_core::{StreamCallback, StreamChunk};
use serde_json::{Value, json};
use std::sync::Arc;

/// A function the model may call mid-generation.
pub trait ProviderTool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON schema of the arguments object.
    fn parameters(&self) -> Value;
    fn call(&self, args: &Value) -> anyhow::Result<String>;
}

/// The set of tools attached to one generation.
#[derive(Clone, Default)]
pub struct ToolBox {
    tools: Vec<Arc<dyn ProviderTool>>,
}

impl ToolBox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, tool: Arc<dyn ProviderTool>) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|tool| tool.name()).collect()
    }

    /// OpenAI-compatible `tools` array.
    pub fn openai_tools(&self) -> Vec<Value> {
        self.tools
            .iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.name(),
                        "description": tool.description(),
                        "parameters": tool.parameters(),
                    }
                })
            })
            .collect()
    }

    /// Gemini `functionDeclarations` list.
    pub fn function_declarations(&self) -> Vec<Value> {
        self.tools
            .iter()
            .map(|tool| {
                json!({
                    "name": tool.name(),
                    "description": tool.description(),
                    "parameters": tool.parameters(),
                })
            })
            .collect()
    }

    /// Runs a tool call and reports it on `cb`. Failures become the tool
    /// result text so the model can react to them.
    pub fn invoke(&self, name: &str, args: &Value, cb: &StreamCallback) -> String {
        cb(StreamChunk::ToolCallStart {
            tool_name: name.to_string(),
            args_summary: summarize(args),
        });
        let outcome = match self.tools.iter().find(|tool| tool.name() == name) {
            Some(tool) => tool.call(args),
            None => Err(anyhow::anyhow!("unknown tool: {name}")),
        };
        let (success, output) = match outcome {
            Ok(output) => (true, output),
            Err(err) => (false, format!("error: {err}")),
        };
        cb(StreamChunk::ToolCallEnd {
            tool_name: name.to_string(),
            success,
            summary: summarize(&Value::String(output.clone())),
        });
        output
    }
}

fn summarize(value: &Value) -> String {
    let text = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    if text.chars().count() > 120 {
        let head: String = text.chars().take(117).collect();
        format!("{head}...")
    } else {
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Echo;

    impl ProviderTool for Echo {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "Echo the query"
        }
        fn parameters(&self) -> Value {
            json!({"type": "object", "properties": {"query": {"type": "string"}}})
        }
        fn call(&self, args: &Value) -> anyhow::Result<String> {
            args.get("query")
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| anyhow::anyhow!("missing query"))
        }
    }

    #[test]
    fn invoke_reports_start_and_end() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let cb: StreamCallback = Arc::new(move |chunk: StreamChunk| {
            if let StreamChunk::ToolCallEnd { success, .. } = chunk {
                sink.lock().expect("lock").push(success);
            }
        });
        let tools = ToolBox::new().with(Arc::new(Echo));
        assert_eq!(tools.invoke("echo", &json!({"query": "hi"}), &cb), "hi");
        assert_eq!(
            tools.invoke("echo", &json!({}), &cb),
            "error: missing query"
        );
        assert_eq!(
            tools.invoke("nope", &json!({}), &cb),
            "error: unknown tool: nope"
        );
        assert_eq!(*seen.lock().expect("lock"), vec![true, false, false]);
    }

    #[test]
    fn schemas_render_for_both_wire_formats() {
        let tools = ToolBox::new().with(Arc::new(Echo));
        assert_eq!(tools.openai_tools()[0]["function"]["name"], "echo");
        assert_eq!(tools.function_declarations()[0]["name"], "echo");
        assert_eq!(tools.names(), vec!["echo"]);
    }
}
