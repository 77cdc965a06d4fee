//! Schemas are visible only with a lease or elevation, and never leak
//! through denials, discovery or the audit trail.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use leasegate::audit::AuditEventType;
use leasegate::dispatcher::ToolCall;
use leasegate::error::AccessError;
use leasegate::governance::scope_hash;
use leasegate::lease::LeaseTerms;
use leasegate::policy::GovernanceMode;
use leasegate::schema_gate::{bootstrap_schema, GET_TOOL_SCHEMA, SEARCH_TOOLS};

use crate::common::{registry, EchoOperation, FailingStore, Harness, Reply};

const MARKER: &str = "SECRET-SCHEMA-MARKER";

/// Whether any string anywhere inside `value` mentions the marker.
fn mentions_marker(value: &Value) -> bool {
    match value {
        Value::String(s) => s.contains(MARKER),
        Value::Array(items) => items.iter().any(mentions_marker),
        Value::Object(map) => map
            .iter()
            .any(|(k, v)| k.contains(MARKER) || mentions_marker(v)),
        _ => false,
    }
}

#[tokio::test]
async fn no_lease_no_schema() {
    let h = Harness::memory(Reply::Deny);
    let err = h
        .schemas
        .get_schema("A", "write_file")
        .await
        .expect_err("withheld");
    assert_eq!(err.to_string(), "schema not available");
    assert_eq!(err.kind(), AccessError::ElevationMissing);
}

#[tokio::test]
async fn unknown_and_unauthorised_look_the_same() {
    let h = Harness::memory(Reply::Deny);
    let unknown = h.schemas.get_schema("A", "no_such_tool").await.expect_err("unknown");
    let withheld = h.schemas.get_schema("A", "write_file").await.expect_err("withheld");
    assert_eq!(unknown.to_string(), withheld.to_string());
    assert_eq!(format!("{unknown}"), "schema not available");
}

#[tokio::test]
async fn lease_holder_sees_the_schema() {
    let h = Harness::memory(Reply::Deny);
    h.leases
        .grant(LeaseTerms::new(
            "A",
            "write_file",
            Duration::from_secs(60),
            1,
            GovernanceMode::Permission,
        ))
        .await
        .expect("grant");

    let schema = h.schemas.get_schema("A", "write_file").await.expect("visible");
    assert!(mentions_marker(&schema));
    assert!(h.schemas.get_schema("B", "write_file").await.is_err());
}

#[tokio::test]
async fn tool_level_elevation_exposes_the_schema() {
    let h = Harness::memory(Reply::Deny);
    let hash = scope_hash("A", "write_file", "write_file").expect("hash");
    h.governance
        .grant_elevation(&hash, Duration::from_secs(60))
        .await
        .expect("elevate");
    assert!(h.schemas.get_schema("A", "write_file").await.is_ok());

    // A resource-scoped elevation is not enough for the whole tool.
    let other = scope_hash("A", "execute_command", "ls").expect("hash");
    h.governance
        .grant_elevation(&other, Duration::from_secs(60))
        .await
        .expect("elevate");
    assert!(h.schemas.get_schema("A", "execute_command").await.is_err());
}

#[tokio::test]
async fn spent_lease_hides_the_schema_again() {
    let h = Harness::memory(Reply::Deny);
    h.leases
        .grant(LeaseTerms::new(
            "A",
            "write_file",
            Duration::from_secs(60),
            1,
            GovernanceMode::Permission,
        ))
        .await
        .expect("grant");
    h.leases.consume("A", "write_file").await.expect("consume");

    let err = h.schemas.get_schema("A", "write_file").await.expect_err("spent");
    assert_eq!(err.kind(), AccessError::LeaseBudgetExhausted);
}

#[tokio::test]
async fn bootstrap_schemas_are_public() {
    let h = Harness::memory(Reply::Deny);
    for tool in [SEARCH_TOOLS, GET_TOOL_SCHEMA] {
        let schema = h.schemas.get_schema("anyone", tool).await.expect("public");
        assert_eq!(Some(schema), bootstrap_schema(tool));
    }
}

#[tokio::test]
async fn store_failure_withholds_the_schema() {
    let h = Harness::new(Arc::new(FailingStore::default()), Reply::Deny);
    let err = h.schemas.get_schema("A", "write_file").await.expect_err("fail closed");
    assert_eq!(err.kind(), AccessError::StoreUnavailable);
    assert_eq!(err.to_string(), "schema not available");
}

#[test]
fn discovery_lists_tools_without_schemas() {
    let registry = registry();
    let results = registry.search("file");
    assert!(results.iter().any(|t| t.name == "write_file"));
    let rendered = serde_json::to_value(&results).expect("json");
    assert!(!mentions_marker(&rendered));
    assert!(!rendered.to_string().contains("input_schema"));
    assert_eq!(registry.search("").len(), registry.len());
}

#[tokio::test]
async fn nothing_in_denials_or_audit_carries_a_schema() {
    let h = Harness::memory(Reply::Raw("not json".to_owned()));
    let op = EchoOperation::default();

    let mut rendered = Vec::new();
    let attempts = [
        ToolCall::new("A", "write_file", json!({ "path": "/tmp/a" })),
        ToolCall::new("A", "write_file", json!({ "path": "/tmp/a" })).with_token("forged"),
        ToolCall::new("B", "execute_command", json!({ "command": "id" })),
    ];
    for call in &attempts {
        let err = h.dispatcher.dispatch(call, &op).await.expect_err("denied");
        rendered.push(err.to_string());
        rendered.push(format!("{err:?}"));
    }
    for tool in ["write_file", "execute_command", "missing"] {
        let err = h.schemas.get_schema("A", tool).await.expect_err("denied");
        rendered.push(err.to_string());
        rendered.push(format!("{err:?}"));
    }
    if let Err(err) = h.dispatcher.request_lease("A", "write_file").await {
        rendered.push(err.to_string());
        rendered.push(format!("{err:?}"));
    }

    for text in &rendered {
        assert!(!text.contains(MARKER), "leaked in {text}");
        assert!(!text.contains("properties"), "schema shape in {text}");
    }
    for (event_type, fields) in h.audit.events() {
        assert!(!mentions_marker(&fields), "{event_type:?} leaked: {fields}");
    }
    assert!(!h
        .audit
        .of_type(AuditEventType::SchemaRequested)
        .iter()
        .any(|e| e.get("schema").is_some()));
}
