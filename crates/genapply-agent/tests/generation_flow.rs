use genapply_agent::{
    ConversationStore, GenerationContext, GenerationOrchestrator, GenerationRequest,
    GenerationState,
};
use genapply_core::{
    AppConfig, CancellationToken, EditOutcome, EditType, EventSink, MessageRole, ProgressEvent,
    ProviderId,
};
use genapply_testkit::{CollectingSink, ScriptedProvider, ScriptedRegistry};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;

fn orchestrator(registry: &ScriptedRegistry) -> GenerationOrchestrator {
    GenerationOrchestrator::new(
        &AppConfig::default(),
        Arc::new(ConversationStore::default()),
        Arc::new(registry.clone()),
    )
}

fn run(
    orchestrator: &GenerationOrchestrator,
    request: &GenerationRequest,
    sink: &CollectingSink,
) -> genapply_agent::GenerationOutcome {
    let sink: Arc<dyn EventSink> = Arc::new(sink.clone());
    orchestrator.run(request, sink, &CancellationToken::new())
}

fn project() -> GenerationContext {
    GenerationContext {
        sandbox_id: Some("sb-1".to_string()),
        current_files: BTreeMap::from([
            (
                "src/components/Header.jsx".to_string(),
                "export default function Header() { return <h1>Shop</h1>; }".to_string(),
            ),
            ("src/App.jsx".to_string(), "import Header from './components/Header';".to_string()),
        ]),
    }
}

#[test]
fn new_project_streams_then_completes_with_files_and_packages() {
    let registry = ScriptedRegistry::new(ScriptedProvider::streaming(
        ProviderId::Google,
        &[
            "Here is the code.\n<file path=\"src/App.jsx\">",
            "import React from 'react';\nimport { motion } from 'framer-motion';\nexport default function App() {}",
            "</file>",
        ],
    ));
    let orchestrator = orchestrator(&registry);
    let sink = CollectingSink::new();

    let outcome = run(&orchestrator, &GenerationRequest::new("build a landing page"), &sink);

    assert_eq!(outcome.state, GenerationState::Done);
    assert_eq!(outcome.provider, Some(ProviderId::Google));
    assert_eq!(
        sink.kinds(),
        vec![
            "status",
            "status",
            "status",
            "stream",
            "stream",
            "stream",
            "file-generated",
            "complete"
        ]
    );
    let events = sink.events();
    assert!(matches!(
        &events[6],
        ProgressEvent::FileGenerated { file_name, current: 1 } if file_name == "src/App.jsx"
    ));
    match events.last() {
        Some(ProgressEvent::Complete {
            explanation,
            file_count,
            packages,
            generated_code,
            ..
        }) => {
            assert_eq!(explanation.as_deref(), Some("Here is the code."));
            assert_eq!(*file_count, Some(1));
            assert_eq!(packages.as_deref(), Some(&["framer-motion".to_string()][..]));
            assert!(generated_code.as_deref().is_some_and(|c| c.ends_with("</file>")));
        }
        other => panic!("expected complete, got {other:?}"),
    }

    let state = orchestrator.conversations().snapshot().expect("conversation");
    assert_eq!(state.messages.len(), 2);
    assert_eq!(state.messages[1].role, MessageRole::Assistant);
    let metadata = state.messages[1].metadata.clone().expect("metadata");
    assert_eq!(metadata.edited_files, vec!["src/App.jsx".to_string()]);
    assert_eq!(state.project_evolution.major_changes.len(), 1);
    assert!(state.edits.is_empty());
}

#[test]
fn missing_credentials_fail_over_with_a_warning() {
    let registry = ScriptedRegistry::with_credentials(
        ScriptedProvider::streaming(ProviderId::Groq, &["ok"]),
        &[("GROQ_API_KEY", "q-key")],
    );
    let sink = CollectingSink::new();
    let request = GenerationRequest {
        provider: Some(ProviderId::Google),
        ..GenerationRequest::new("hello")
    };

    let outcome = run(&orchestrator(&registry), &request, &sink);

    assert_eq!(outcome.state, GenerationState::Done);
    assert_eq!(outcome.provider, Some(ProviderId::Groq));
    assert!(sink.kinds().contains(&"warning"));
    let choice = &registry.resolved()[0];
    assert_eq!(choice.failed_over_from, Some(ProviderId::Google));
    assert_eq!(choice.model, "moonshotai/kimi-k2-instruct");
}

#[test]
fn no_credentials_anywhere_fails_before_streaming() {
    let registry = ScriptedRegistry::with_credentials(
        ScriptedProvider::streaming(ProviderId::Google, &["never"]),
        &[],
    );
    let sink = CollectingSink::new();

    let outcome = run(&orchestrator(&registry), &GenerationRequest::new("hello"), &sink);

    assert_eq!(outcome.state, GenerationState::Failed);
    assert_eq!(sink.kinds(), vec!["status", "error"]);
    assert!(registry.provider().prompts().is_empty());
}

#[test]
fn edit_requests_embed_the_best_matching_file() {
    let registry = ScriptedRegistry::new(ScriptedProvider::streaming(
        ProviderId::Google,
        &["<file path=\"src/components/Header.jsx\">export default function Header() { return <h1 className=\"text-blue-600\">Shop</h1>; }</file>"],
    ));
    let orchestrator = orchestrator(&registry);
    let sink = CollectingSink::new();
    let request = GenerationRequest {
        is_edit: true,
        context: Some(project()),
        ..GenerationRequest::new("change the header color to blue")
    };

    let outcome = run(&orchestrator, &request, &sink);

    assert_eq!(outcome.state, GenerationState::Done);
    let system = &registry.provider().prompts()[0].system;
    assert!(system.contains("## EDIT MODE"));
    assert!(system.contains("Most relevant file: src/components/Header.jsx"));
    assert!(system.contains("return <h1>Shop</h1>;"));

    let state = orchestrator.conversations().snapshot().expect("conversation");
    assert_eq!(state.edits.len(), 1);
    assert_eq!(state.edits[0].edit_type, EditType::UpdateStyle);
    assert_eq!(state.edits[0].outcome, EditOutcome::Success);
    assert!(state.project_evolution.major_changes.is_empty());
}

#[test]
fn edit_context_failure_degrades_to_plain_generation() {
    let registry = ScriptedRegistry::new(ScriptedProvider::streaming(
        ProviderId::Google,
        &["<file path=\"src/App.jsx\">x</file>"],
    ));
    let sink = CollectingSink::new();
    let request = GenerationRequest {
        is_edit: true,
        ..GenerationRequest::new("tweak the header")
    };

    let outcome = run(&orchestrator(&registry), &request, &sink);

    assert_eq!(outcome.state, GenerationState::Done);
    assert!(sink.kinds().contains(&"warning"));
    assert_eq!(sink.kinds().last(), Some(&"complete"));
    assert!(!registry.provider().prompts()[0].system.contains("## EDIT MODE"));
}

#[test]
fn provider_failure_mid_stream_is_one_error_event() {
    let registry = ScriptedRegistry::new(
        ScriptedProvider::streaming(ProviderId::Google, &["partial "]).failing("connection reset"),
    );
    let sink = CollectingSink::new();

    let outcome = run(&orchestrator(&registry), &GenerationRequest::new("hello"), &sink);

    assert_eq!(outcome.state, GenerationState::Failed);
    assert_eq!(sink.terminal_count(), 1);
    match sink.events().last() {
        Some(ProgressEvent::Error { error }) => assert!(error.contains("connection reset")),
        other => panic!("expected error, got {other:?}"),
    }
}

#[test]
fn later_requests_see_earlier_turns_as_history() {
    let registry = ScriptedRegistry::new(ScriptedProvider::streaming(ProviderId::Google, &["done"]));
    let orchestrator = orchestrator(&registry);

    run(&orchestrator, &GenerationRequest::new("first"), &CollectingSink::new());
    run(&orchestrator, &GenerationRequest::new("second"), &CollectingSink::new());

    let prompts = registry.provider().prompts();
    assert!(prompts[0].history.is_empty());
    assert_eq!(prompts[1].history.len(), 2);
    assert_eq!(prompts[1].history[0].content, "first");
    assert_eq!(prompts[1].history[1].role, MessageRole::Assistant);
    assert_eq!(prompts[1].user, "second");
}

#[test]
fn search_tool_calls_are_reported_as_status() {
    let registry = ScriptedRegistry::new(
        ScriptedProvider::new(ProviderId::Groq)
            .tool_call("search_project", json!({"query": "header"}))
            .text("<file path=\"src/App.jsx\">x</file>"),
    );
    let sink = CollectingSink::new();
    let request = GenerationRequest {
        enable_search: true,
        context: Some(project()),
        ..GenerationRequest::new("add a cart badge")
    };

    let outcome = run(&orchestrator(&registry), &request, &sink);

    assert_eq!(outcome.state, GenerationState::Done);
    assert!(registry.provider().prompts()[0].system.contains("search_project"));
    assert!(sink.events().iter().any(|event| matches!(
        event,
        ProgressEvent::Status { message } if message.starts_with("Calling search_project")
    )));
}

#[test]
fn closed_sink_cancels_the_stream() {
    let registry = ScriptedRegistry::new(ScriptedProvider::streaming(
        ProviderId::Google,
        &["a", "b", "c"],
    ));
    let orchestrator = orchestrator(&registry);
    let sink = CollectingSink::closing_after(4);

    let outcome = run(&orchestrator, &GenerationRequest::new("hello"), &sink);

    assert_eq!(outcome.state, GenerationState::Failed);
    let streamed = sink.kinds().iter().filter(|k| **k == "stream").count();
    assert_eq!(streamed, 1);
    let state = orchestrator.conversations().snapshot().expect("conversation");
    assert_eq!(state.messages.len(), 1);
}
