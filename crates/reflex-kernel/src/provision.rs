//! Agent provisioning for needs no registered agent can meet
//!
//! Requests are keyed by their capability signature (capability plus sorted
//! constraints). A duplicate request gets back the earlier response for as
//! long as that response stays valid.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use reflex_capabilities::{AgentDescriptor, CapabilityRegistry, RegistryError};
use reflex_types::{stable_hash, AgentId};

/// File written into every agent workspace
pub const AGENT_MANIFEST: &str = "agent.json";

#[derive(Error, Debug)]
pub enum ProvisioningError {
    #[error("Workspace I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Manifest serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Provisioning rejected: {0}")]
    Rejected(String),
}

pub type Result<T> = std::result::Result<T, ProvisioningError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisionRequest {
    pub capability: String,
    #[serde(default)]
    pub constraints: Vec<String>,
    #[serde(default)]
    pub context: Map<String, Value>,
}

impl ProvisionRequest {
    pub fn new(capability: impl Into<String>) -> Self {
        Self {
            capability: capability.into(),
            constraints: Vec::new(),
            context: Map::new(),
        }
    }

    pub fn with_constraints(mut self, constraints: Vec<String>) -> Self {
        self.constraints = constraints;
        self
    }

    pub fn with_context(mut self, context: Map<String, Value>) -> Self {
        self.context = context;
        self
    }

    /// Idempotency key; context does not participate
    pub fn signature(&self) -> String {
        let mut constraints = self.constraints.clone();
        constraints.sort();
        constraints.dedup();
        stable_hash(&json!({
            "capability": self.capability,
            "constraints": constraints,
        }))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisionResponse {
    pub agent_id: AgentId,
    pub workspace_path: PathBuf,
    pub status: String,
    pub capability: String,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait AgentCreatorManager: Send + Sync {
    async fn provision(&self, request: &ProvisionRequest) -> Result<ProvisionResponse>;
}

/// Creates one directory per agent under a workspace root and registers the
/// new agent so later lookups find it.
pub struct WorkspaceAgentCreator {
    root: PathBuf,
    registry: Arc<dyn CapabilityRegistry>,
    validity: Duration,
    engine: String,
    // held across creation so duplicates are serialized
    issued: Mutex<HashMap<String, ProvisionResponse>>,
}

impl WorkspaceAgentCreator {
    pub fn new(root: impl Into<PathBuf>, registry: Arc<dyn CapabilityRegistry>) -> Self {
        Self {
            root: root.into(),
            registry,
            validity: Duration::from_secs(3600),
            engine: "native".to_string(),
            issued: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_validity(mut self, validity: Duration) -> Self {
        self.validity = validity;
        self
    }

    /// Engine mode provisioned agents run on
    pub fn with_engine(mut self, engine: impl Into<String>) -> Self {
        self.engine = engine.into();
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn still_valid(&self, response: &ProvisionResponse) -> bool {
        let age = Utc::now().signed_duration_since(response.created_at);
        let fresh = age.to_std().map(|age| age < self.validity).unwrap_or(true);
        fresh && tokio::fs::try_exists(&response.workspace_path).await.unwrap_or(false)
    }

    async fn create(&self, request: &ProvisionRequest, signature: &str) -> Result<ProvisionResponse> {
        if request.capability.trim().is_empty() {
            return Err(ProvisioningError::Rejected("empty capability".to_string()));
        }

        let agent_id = AgentId::new();
        let workspace = self.root.join(agent_id.as_str());
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| ProvisioningError::Io { path, source }
        };
        tokio::fs::create_dir_all(&workspace).await.map_err(io_err(&workspace))?;

        let created_at = Utc::now();
        let manifest = json!({
            "agent_id": agent_id,
            "capability": request.capability,
            "constraints": request.constraints,
            "context": request.context,
            "signature": signature,
            "engine": self.engine,
            "created_at": created_at,
        });
        let manifest_path = workspace.join(AGENT_MANIFEST);
        tokio::fs::write(&manifest_path, serde_json::to_vec_pretty(&manifest)?)
            .await
            .map_err(io_err(&manifest_path))?;

        self.registry.register(
            AgentDescriptor::new(agent_id.clone(), [request.capability.clone()])
                .with_engine(self.engine.clone())
                .with_description(format!("provisioned for {}", request.capability))
                .with_workspace(workspace.to_string_lossy()),
        )?;

        Ok(ProvisionResponse {
            agent_id,
            workspace_path: workspace,
            status: "ready".to_string(),
            capability: request.capability.clone(),
            created_at,
        })
    }
}

#[async_trait]
impl AgentCreatorManager for WorkspaceAgentCreator {
    async fn provision(&self, request: &ProvisionRequest) -> Result<ProvisionResponse> {
        let signature = request.signature();
        let mut issued = self.issued.lock().await;

        if let Some(previous) = issued.get(&signature) {
            if self.still_valid(previous).await {
                debug!(agent_id = %previous.agent_id, capability = %request.capability, "reusing provisioned agent");
                return Ok(previous.clone());
            }
            if let Some(stale) = issued.remove(&signature) {
                info!(agent_id = %stale.agent_id, "provisioned agent expired");
                if let Err(err) = self.registry.unregister(&stale.agent_id) {
                    debug!(error = %err, "expired agent was not registered");
                }
            }
        }

        let response = self.create(request, &signature).await?;
        info!(
            agent_id = %response.agent_id,
            capability = %response.capability,
            workspace = %response.workspace_path.display(),
            "agent provisioned"
        );
        issued.insert(signature, response.clone());
        Ok(response)
    }
}
