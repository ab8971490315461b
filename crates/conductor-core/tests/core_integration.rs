#![allow(clippy::unwrap_used, clippy::expect_used)]

use conductor_core::*;
use serde_json::json;
use std::collections::BTreeMap;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// 1. Interrupt serialization roundtrip
// ---------------------------------------------------------------------------

#[test]
fn interrupt_serialization_roundtrip() {
    let interrupt = HumanInterrupt::info_request(
        "worker-1",
        "Need campaign details",
        vec![
            InputSpec::required("audience", "Primary audience").with_example("developers"),
            InputSpec::optional("notes", "Anything else"),
        ],
    )
    .with_context("task_description", json!("Draft the launch email"))
    .for_task("task-1")
    .for_project("proj-1");

    let encoded = serde_json::to_value(&interrupt).unwrap();
    assert_eq!(encoded["kind"], "info_request");
    assert_eq!(encoded["required_inputs"][0]["type"], "text");

    let decoded: HumanInterrupt = serde_json::from_value(encoded).unwrap();
    assert_eq!(decoded, interrupt);
    assert_eq!(decoded.required_keys().collect::<Vec<_>>(), vec!["audience"]);
}

// ---------------------------------------------------------------------------
// 2. Responses submitted by an external UI
// ---------------------------------------------------------------------------

#[test]
fn response_from_external_json() {
    let id = Uuid::new_v4();
    let response: HumanResponse = serde_json::from_value(json!({
        "interrupt_id": id,
        "inputs": { "audience": "developers", "budget": 5000 },
        "responded_at": "2026-03-01T10:00:00Z",
    }))
    .unwrap();

    assert_eq!(response.interrupt_id, id);
    assert_eq!(response.approved, None);
    assert_eq!(response.task_id, None);
    assert_eq!(response.inputs["budget"], json!(5000));
}

#[test]
fn response_satisfies_declared_inputs() {
    let interrupt = HumanInterrupt::info_request(
        "worker-1",
        "Need details",
        vec![
            InputSpec::required("audience", "Audience"),
            InputSpec::required("budget", "Budget"),
        ],
    );
    let mut supplied = BTreeMap::new();
    supplied.insert("audience".to_string(), json!("developers"));
    assert_eq!(interrupt.missing_inputs(&supplied), vec!["budget".to_string()]);

    let response = HumanResponse::new(interrupt.id)
        .with_inputs(supplied)
        .with_input("budget", 5000);
    assert!(interrupt.missing_inputs(&response.inputs).is_empty());
}

// ---------------------------------------------------------------------------
// 3. Display view
// ---------------------------------------------------------------------------

#[test]
fn tool_connection_view_lists_each_tool() {
    let interrupt = HumanInterrupt::tool_connection(
        "work-planner",
        "Connect the tools",
        &["mailchimp".to_string(), "crm".to_string()],
    );
    let view = interrupt.display();
    assert_eq!(view.kind, "tool_connection");
    let keys: Vec<&str> = view.inputs_needed.iter().map(|i| i.key.as_str()).collect();
    assert_eq!(keys, vec!["tool_mailchimp", "tool_crm"]);
    assert!(keys.iter().all(|k| k.starts_with(TOOL_INPUT_PREFIX)));
    assert_eq!(interrupt.requested_tools(), vec!["mailchimp", "crm"]);

    let rendered = serde_json::to_value(&view).unwrap();
    assert_eq!(rendered["type"], "tool_connection");
    assert_eq!(rendered["inputs_needed"][0]["type"], "connection");
}

#[test]
fn approval_request_offers_standard_options() {
    let interrupt = HumanInterrupt::approval_request("worker-1", "Send the campaign?");
    assert_eq!(interrupt.options, APPROVAL_OPTIONS.map(String::from).to_vec());
}

// ---------------------------------------------------------------------------
// 4. Error reasons
// ---------------------------------------------------------------------------

#[test]
fn errors_carry_stable_reasons_and_messages() {
    let err = ConductorError::CapabilityExceeded {
        reason: "needs contract law".into(),
        hint: Some("legal".into()),
    };
    assert_eq!(err.reason(), "capability_exceeded");
    assert_eq!(err.to_string(), "Capability exceeded: needs contract law");

    let err: ConductorError = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
    assert_eq!(err.reason(), "io");
}
