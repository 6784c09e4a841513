use crate::http::{HttpSettings, for_each_sse_value};
use crate::{GenerationPrompt, LlmProvider, ProviderError, ToolBox};
use genapply_core::{
    CancellationToken, LlmConfig, MessageRole, ProviderId, StreamCallback, StreamChunk,
};
use serde_json::{Value, json};

/// Gemini `streamGenerateContent` client.
#[derive(Debug, Clone)]
pub struct GoogleProvider {
    endpoint: String,
    api_key: String,
    http: HttpSettings,
    max_tool_rounds: u8,
}

struct RoundOutput {
    text: String,
    function_calls: Vec<Value>,
}

impl GoogleProvider {
    pub fn new(endpoint: String, api_key: String, cfg: &LlmConfig) -> Result<Self, ProviderError> {
        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key,
            http: HttpSettings::new(ProviderId::Google, cfg)?,
            max_tool_rounds: cfg.max_tool_rounds,
        })
    }

    fn url(&self, model: &str) -> String {
        format!("{}/{model}:streamGenerateContent?alt=sse", self.endpoint)
    }

    fn initial_contents(prompt: &GenerationPrompt) -> Vec<Value> {
        let mut contents: Vec<Value> = prompt
            .history
            .iter()
            .map(|turn| {
                let role = match turn.role {
                    MessageRole::User => "user",
                    MessageRole::Assistant => "model",
                };
                json!({"role": role, "parts": [{"text": turn.content}]})
            })
            .collect();
        contents.push(json!({"role": "user", "parts": [{"text": prompt.user}]}));
        contents
    }

    fn payload(&self, prompt: &GenerationPrompt, contents: &[Value], tools: Option<&ToolBox>) -> Value {
        let mut payload = json!({
            "systemInstruction": {"parts": [{"text": prompt.system}]},
            "contents": contents,
            "generationConfig": {
                "temperature": prompt.temperature,
                "maxOutputTokens": prompt.max_tokens,
            },
        });
        if let Some(tools) = tools {
            payload["tools"] = json!([{"functionDeclarations": tools.function_declarations()}]);
        }
        payload
    }

    fn stream_round(
        &self,
        model: &str,
        payload: &Value,
        cb: &StreamCallback,
        cancel: &CancellationToken,
    ) -> Result<RoundOutput, ProviderError> {
        let url = self.url(model);
        let resp = self.http.send(|client| {
            client
                .post(&url)
                .header("x-goog-api-key", &self.api_key)
                .json(payload)
        })?;

        let mut text = String::new();
        let mut function_calls = Vec::new();
        for_each_sse_value(resp, cancel, |value| {
            let parts = value
                .get("candidates")
                .and_then(|v| v.as_array())
                .and_then(|arr| arr.first())
                .and_then(|candidate| candidate.get("content"))
                .and_then(|content| content.get("parts"))
                .and_then(|parts| parts.as_array());
            for part in parts.into_iter().flatten() {
                if let Some(delta) = part.get("text").and_then(|v| v.as_str())
                    && !delta.is_empty()
                {
                    text.push_str(delta);
                    cb(StreamChunk::ContentDelta(delta.to_string()));
                }
                if let Some(call) = part.get("functionCall") {
                    function_calls.push(call.clone());
                }
            }
        })?;
        Ok(RoundOutput {
            text,
            function_calls,
        })
    }
}

impl LlmProvider for GoogleProvider {
    fn id(&self) -> ProviderId {
        ProviderId::Google
    }

    fn stream(
        &self,
        prompt: &GenerationPrompt,
        tools: &ToolBox,
        cb: StreamCallback,
        cancel: &CancellationToken,
    ) -> Result<String, ProviderError> {
        let mut contents = Self::initial_contents(prompt);
        let mut full_text = String::new();

        for round in 0..=self.max_tool_rounds {
            let offer_tools = !tools.is_empty() && round < self.max_tool_rounds;
            let payload = self.payload(prompt, &contents, offer_tools.then_some(tools));
            let output = self.stream_round(&prompt.model, &payload, &cb, cancel)?;
            full_text.push_str(&output.text);
            if output.function_calls.is_empty() || !offer_tools {
                break;
            }

            let mut model_parts = Vec::new();
            if !output.text.is_empty() {
                model_parts.push(json!({"text": output.text}));
            }
            let mut responses = Vec::new();
            for call in output.function_calls {
                let name = call
                    .get("name")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                let args = call.get("args").cloned().unwrap_or_else(|| json!({}));
                let result = tools.invoke(&name, &args, &cb);
                responses.push(json!({
                    "functionResponse": {"name": name, "response": {"content": result}}
                }));
                model_parts.push(json!({"functionCall": call}));
            }
            contents.push(json!({"role": "model", "parts": model_parts}));
            contents.push(json!({"role": "user", "parts": responses}));
        }

        cb(StreamChunk::Done);
        Ok(full_text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{MockHttpResponse, recording_callback, start_mock_server};
    use crate::{ChatTurn, ProviderTool};
    use std::sync::Arc;

    fn prompt() -> GenerationPrompt {
        GenerationPrompt {
            system: "You write code.".to_string(),
            history: vec![
                ChatTurn {
                    role: MessageRole::User,
                    content: "earlier".to_string(),
                },
                ChatTurn {
                    role: MessageRole::Assistant,
                    content: "reply".to_string(),
                },
            ],
            user: "make a header".to_string(),
            model: "gemini-2.5-flash".to_string(),
            temperature: 0.5,
            max_tokens: 512,
        }
    }

    fn provider(base_url: &str) -> GoogleProvider {
        let cfg = LlmConfig {
            max_retries: 0,
            ..LlmConfig::default()
        };
        GoogleProvider::new(format!("{base_url}/v1beta/models/"), "g-key".to_string(), &cfg)
            .expect("provider")
    }

    struct Manifest;

    impl ProviderTool for Manifest {
        fn name(&self) -> &str {
            "search_project"
        }
        fn description(&self) -> &str {
            "search"
        }
        fn parameters(&self) -> Value {
            json!({"type": "object"})
        }
        fn call(&self, _args: &Value) -> anyhow::Result<String> {
            Ok("src/App.jsx".to_string())
        }
    }

    #[test]
    fn streams_text_parts_and_builds_gemini_payload() {
        let server = start_mock_server(vec![MockHttpResponse::sse(&[
            r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"Here "}]}}]}"#,
            r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"it is"}]},"finishReason":"STOP"}]}"#,
        ])]);
        let (cb, seen) = recording_callback();
        let text = provider(&server.base_url)
            .stream(&prompt(), &ToolBox::new(), cb, &CancellationToken::new())
            .expect("stream");
        assert_eq!(text, "Here it is");
        assert_eq!(*seen.lock().expect("lock"), vec!["Here ", "it is", "[DONE]"]);

        let (request_line, body) = &server.requests()[0];
        assert!(request_line.starts_with(
            "POST /v1beta/models/gemini-2.5-flash:streamGenerateContent?alt=sse"
        ));
        let body: Value = serde_json::from_str(body).expect("json body");
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "You write code.");
        assert_eq!(body["contents"][1]["role"], "model");
        assert_eq!(body["contents"][2]["parts"][0]["text"], "make a header");
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 512);
    }

    #[test]
    fn function_calls_get_function_responses() {
        let server = start_mock_server(vec![
            MockHttpResponse::sse(&[
                r#"{"candidates":[{"content":{"role":"model","parts":[{"functionCall":{"name":"search_project","args":{"query":"app"}}}]}}]}"#,
            ]),
            MockHttpResponse::sse(&[
                r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"updated"}]}}]}"#,
            ]),
        ]);
        let (cb, seen) = recording_callback();
        let tools = ToolBox::new().with(Arc::new(Manifest));
        let text = provider(&server.base_url)
            .stream(&prompt(), &tools, cb, &CancellationToken::new())
            .expect("stream");
        assert_eq!(text, "updated");
        assert_eq!(
            *seen.lock().expect("lock"),
            vec!["[call search_project]", "[done search_project]", "updated", "[DONE]"]
        );

        let requests = server.requests();
        let first: Value = serde_json::from_str(&requests[0].1).expect("json");
        assert_eq!(
            first["tools"][0]["functionDeclarations"][0]["name"],
            "search_project"
        );
        let second: Value = serde_json::from_str(&requests[1].1).expect("json");
        let contents = second["contents"].as_array().expect("contents");
        let reply = contents.last().expect("function response");
        assert_eq!(
            reply["parts"][0]["functionResponse"]["response"]["content"],
            "src/App.jsx"
        );
    }

    #[test]
    fn tools_are_withheld_on_the_last_round() {
        let call = r#"{"candidates":[{"content":{"parts":[{"functionCall":{"name":"search_project","args":{}}}]}}]}"#;
        let server = start_mock_server(vec![MockHttpResponse::sse(&[call])]);
        let cfg = LlmConfig {
            max_retries: 0,
            max_tool_rounds: 1,
            ..LlmConfig::default()
        };
        let provider = GoogleProvider::new(server.base_url.clone(), "k".to_string(), &cfg)
            .expect("provider");
        let (cb, _) = recording_callback();
        provider
            .stream(
                &prompt(),
                &ToolBox::new().with(Arc::new(Manifest)),
                cb,
                &CancellationToken::new(),
            )
            .expect("stream");
        let requests = server.requests();
        assert_eq!(requests.len(), 2);
        let last: Value = serde_json::from_str(&requests[1].1).expect("json");
        assert!(last.get("tools").is_none());
    }
}
