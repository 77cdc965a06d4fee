//! Controls exposure of tool schemas.
//!
//! A schema is returned only to a client holding a valid lease or a
//! tool-level elevation for that tool. A refusal is a unit-like error with a
//! fixed message: it says nothing about whether the tool exists, and no part
//! of the schema reaches the caller or the audit trail.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::debug;

use crate::audit::{AuditEventType, AuditSink};
use crate::error::AccessError;
use crate::governance::{scope_hash, GovernanceState};
use crate::lease::LeaseManager;
use crate::registry::ToolRegistry;

/// Bootstrap discovery operation listing tools.
pub const SEARCH_TOOLS: &str = "search_tools";

/// Bootstrap discovery operation fetching one tool's schema.
pub const GET_TOOL_SCHEMA: &str = "get_tool_schema";

/// Fixed schema for a built-in bootstrap operation.
pub fn bootstrap_schema(tool: &str) -> Option<Value> {
    match tool {
        SEARCH_TOOLS => Some(json!({
            "type": "object",
            "properties": { "query": { "type": "string" } },
            "required": ["query"],
        })),
        GET_TOOL_SCHEMA => Some(json!({
            "type": "object",
            "properties": { "tool_name": { "type": "string" } },
            "required": ["tool_name"],
        })),
        _ => None,
    }
}

/// Schema request refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("schema not available")]
pub struct SchemaDenied {
    kind: AccessError,
}

impl SchemaDenied {
    /// Internal reason, for audit and tests only.
    pub fn kind(&self) -> AccessError {
        self.kind
    }
}

/// Gate in front of the registry's schemas.
#[derive(Clone)]
pub struct SchemaGate {
    governance: Arc<GovernanceState>,
    leases: LeaseManager,
    registry: Arc<ToolRegistry>,
    audit: Arc<dyn AuditSink>,
}

impl std::fmt::Debug for SchemaGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaGate").finish_non_exhaustive()
    }
}

impl SchemaGate {
    /// Create a gate.
    pub fn new(
        governance: Arc<GovernanceState>,
        leases: LeaseManager,
        registry: Arc<ToolRegistry>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            governance,
            leases,
            registry,
            audit,
        }
    }

    /// The schema for `tool_id`, if `client_id` may see it.
    ///
    /// # Errors
    ///
    /// [`SchemaDenied`] when there is no valid lease or elevation, the tool
    /// is unknown, or the store cannot answer.
    pub async fn get_schema(&self, client_id: &str, tool_id: &str) -> Result<Value, SchemaDenied> {
        let result = self.authorize(client_id, tool_id).await;
        self.audit.log(
            AuditEventType::SchemaRequested,
            json!({
                "client_id": client_id,
                "tool_id": tool_id,
                "granted": result.is_ok(),
                "category": result.as_ref().err().map(|d| d.kind.category()),
            }),
        );
        result
    }

    async fn authorize(&self, client_id: &str, tool_id: &str) -> Result<Value, SchemaDenied> {
        if self.leases.is_bootstrap(tool_id) {
            return bootstrap_schema(tool_id)
                .or_else(|| self.registry.get(tool_id).map(|r| r.input_schema.clone()))
                .ok_or(SchemaDenied {
                    kind: AccessError::PolicyDenied,
                });
        }
        let Some(record) = self.registry.get(tool_id) else {
            return Err(SchemaDenied {
                kind: AccessError::PolicyDenied,
            });
        };

        let lease_err = match self.leases.validate(client_id, tool_id).await {
            Ok(_) => return Ok(record.input_schema.clone()),
            Err(e) => e.access_error(),
        };
        if lease_err == AccessError::StoreUnavailable {
            return Err(SchemaDenied { kind: lease_err });
        }

        let hash = scope_hash(client_id, tool_id, tool_id).map_err(|e| SchemaDenied {
            kind: e.access_error(),
        })?;
        match self.governance.check_elevation(&hash).await {
            Ok(true) => Ok(record.input_schema.clone()),
            Ok(false) => {
                debug!(%client_id, %tool_id, "schema withheld");
                let kind = match lease_err {
                    AccessError::LeaseNotFound => AccessError::ElevationMissing,
                    other => other,
                };
                Err(SchemaDenied { kind })
            }
            Err(e) => Err(SchemaDenied {
                kind: e.access_error(),
            }),
        }
    }
}
