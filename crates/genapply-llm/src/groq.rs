use crate::http::{HttpSettings, for_each_sse_value};
use crate::{GenerationPrompt, LlmProvider, ProviderError, ToolBox};
use genapply_core::{
    CancellationToken, LlmConfig, MessageRole, ProviderId, StreamCallback, StreamChunk,
};
use serde_json::{Value, json};
use std::collections::BTreeMap;

/// OpenAI-compatible chat completions client for Groq.
#[derive(Debug, Clone)]
pub struct GroqProvider {
    endpoint: String,
    api_key: String,
    http: HttpSettings,
    max_tool_rounds: u8,
}

#[derive(Debug, Default)]
struct StreamToolCall {
    id: Option<String>,
    name: String,
    arguments: String,
}

struct RoundOutput {
    text: String,
    tool_calls: Vec<(String, String, String)>,
}

impl GroqProvider {
    pub fn new(endpoint: String, api_key: String, cfg: &LlmConfig) -> Result<Self, ProviderError> {
        Ok(Self {
            endpoint,
            api_key,
            http: HttpSettings::new(ProviderId::Groq, cfg)?,
            max_tool_rounds: cfg.max_tool_rounds,
        })
    }

    fn initial_messages(prompt: &GenerationPrompt) -> Vec<Value> {
        let mut messages = vec![json!({"role": "system", "content": prompt.system})];
        for turn in &prompt.history {
            let role = match turn.role {
                MessageRole::User => "user",
                MessageRole::Assistant => "assistant",
            };
            messages.push(json!({"role": role, "content": turn.content}));
        }
        messages.push(json!({"role": "user", "content": prompt.user}));
        messages
    }

    fn payload(&self, prompt: &GenerationPrompt, messages: &[Value], tools: Option<&ToolBox>) -> Value {
        let mut payload = json!({
            "model": prompt.model,
            "messages": messages,
            "stream": true,
            "temperature": prompt.temperature,
            "max_tokens": prompt.max_tokens,
        });
        if let Some(tools) = tools {
            payload["tools"] = json!(tools.openai_tools());
            payload["tool_choice"] = json!("auto");
        }
        payload
    }

    fn stream_round(
        &self,
        payload: &Value,
        cb: &StreamCallback,
        cancel: &CancellationToken,
    ) -> Result<RoundOutput, ProviderError> {
        let resp = self.http.send(|client| {
            client
                .post(&self.endpoint)
                .bearer_auth(&self.api_key)
                .json(payload)
        })?;

        let mut text = String::new();
        let mut parts: BTreeMap<u64, StreamToolCall> = BTreeMap::new();
        for_each_sse_value(resp, cancel, |value| {
            let Some(choice) = value
                .get("choices")
                .and_then(|v| v.as_array())
                .and_then(|arr| arr.first())
            else {
                return;
            };
            if let Some(delta) = choice.get("delta") {
                if let Some(content) = delta.get("content").and_then(|v| v.as_str())
                    && !content.is_empty()
                {
                    text.push_str(content);
                    cb(StreamChunk::ContentDelta(content.to_string()));
                }
                if let Some(tool_calls) = delta.get("tool_calls").and_then(|v| v.as_array()) {
                    merge_stream_tool_calls(tool_calls, &mut parts);
                }
            }
        })?;

        let tool_calls = parts
            .into_iter()
            .filter(|(_, call)| !call.name.trim().is_empty())
            .map(|(index, call)| {
                (
                    call.id.unwrap_or_else(|| format!("tool_call_{}", index + 1)),
                    call.name,
                    call.arguments,
                )
            })
            .collect();
        Ok(RoundOutput { text, tool_calls })
    }
}

impl LlmProvider for GroqProvider {
    fn id(&self) -> ProviderId {
        ProviderId::Groq
    }

    fn stream(
        &self,
        prompt: &GenerationPrompt,
        tools: &ToolBox,
        cb: StreamCallback,
        cancel: &CancellationToken,
    ) -> Result<String, ProviderError> {
        let mut messages = Self::initial_messages(prompt);
        let mut full_text = String::new();

        for round in 0..=self.max_tool_rounds {
            let offer_tools = !tools.is_empty() && round < self.max_tool_rounds;
            let payload = self.payload(prompt, &messages, offer_tools.then_some(tools));
            let output = self.stream_round(&payload, &cb, cancel)?;
            full_text.push_str(&output.text);
            if output.tool_calls.is_empty() || !offer_tools {
                break;
            }

            messages.push(json!({
                "role": "assistant",
                "content": if output.text.is_empty() { Value::Null } else { json!(output.text) },
                "tool_calls": output.tool_calls.iter().map(|(id, name, arguments)| json!({
                    "id": id,
                    "type": "function",
                    "function": {"name": name, "arguments": arguments},
                })).collect::<Vec<_>>(),
            }));
            for (id, name, arguments) in &output.tool_calls {
                let args: Value = serde_json::from_str(arguments).unwrap_or_else(|_| json!({}));
                let result = tools.invoke(name, &args, &cb);
                messages.push(json!({
                    "role": "tool",
                    "tool_call_id": id,
                    "content": result,
                }));
            }
        }

        cb(StreamChunk::Done);
        Ok(full_text)
    }
}

fn merge_stream_tool_calls(chunks: &[Value], out: &mut BTreeMap<u64, StreamToolCall>) {
    for (idx, item) in chunks.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(|v| v.as_u64())
            .unwrap_or(idx as u64);
        let entry = out.entry(index).or_default();
        if let Some(id) = item.get("id").and_then(|v| v.as_str())
            && !id.trim().is_empty()
        {
            entry.id = Some(id.to_string());
        }
        if let Some(function) = item.get("function") {
            if let Some(name) = function.get("name").and_then(|v| v.as_str())
                && !name.trim().is_empty()
            {
                entry.name = name.to_string();
            }
            if let Some(arguments) = function.get("arguments").and_then(|v| v.as_str()) {
                entry.arguments.push_str(arguments);
            }
        }
    }
}
