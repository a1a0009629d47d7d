//! Deterministic instance addressing plus forward and fan-out dispatch.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

use agentcell_core::{Error, Result};
use agentcell_scheduler::TaskHandler;

use crate::instance::{AgentDescriptor, AgentInstance, InstanceRequest, InstanceResponse};

pub const DEFAULT_INSTANCE_KEY: &str = "default";

/// Maps `(agent_type, instance_key)` pairs to live [`AgentInstance`]s.
///
/// Agent types are registered once at startup with their descriptor and
/// handler; instances are created lazily on first resolve and cached for
/// the life of the process. With a data directory configured each instance
/// gets its own SQLite file named by its identity hash; without one the
/// stores are in-memory.
pub struct AgentRegistry {
    agents: HashMap<String, (AgentDescriptor, Arc<dyn TaskHandler>)>,
    instances: Mutex<HashMap<String, Arc<AgentInstance>>>,
    data_dir: Option<PathBuf>,
}

impl AgentRegistry {
    pub fn new(data_dir: Option<PathBuf>) -> Self {
        Self {
            agents: HashMap::new(),
            instances: Mutex::new(HashMap::new()),
            data_dir,
        }
    }

    /// Register an agent type. Last registration of a type wins.
    pub fn register(&mut self, descriptor: AgentDescriptor, handler: Arc<dyn TaskHandler>) {
        self.agents
            .insert(descriptor.agent_type.clone(), (descriptor, handler));
    }

    pub fn agent_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.agents.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    /// Identity of an `(agent_type, instance_key)` pair: the full hex
    /// SHA-256 of the two joined by a NUL byte, so distinct pairs can never
    /// produce the same preimage. The hash doubles as the store filename.
    pub fn instance_id(agent_type: &str, instance_key: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(agent_type.as_bytes());
        hasher.update([0u8]);
        hasher.update(instance_key.as_bytes());
        let digest = hasher.finalize();
        digest.iter().map(|b| format!("{b:02x}")).collect()
    }

    /// Resolve a pair to its instance, creating and caching it on first
    /// use. The same pair always yields the same live instance.
    pub async fn resolve(
        &self,
        agent_type: &str,
        instance_key: &str,
    ) -> Result<Arc<AgentInstance>> {
        let (descriptor, handler) = self
            .agents
            .get(agent_type)
            .ok_or_else(|| Error::NotFound(format!("Unknown agent type '{agent_type}'")))?;

        let id = Self::instance_id(agent_type, instance_key);
        let mut instances = self.instances.lock().await;
        if let Some(existing) = instances.get(&id) {
            return Ok(existing.clone());
        }

        let db_path = match &self.data_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                Some(dir.join(format!("{id}.db")))
            }
            None => None,
        };
        tracing::info!(agent = agent_type, key = instance_key, id = %id, "creating agent instance");
        let instance = AgentInstance::open(id.clone(), descriptor.clone(), handler.clone(), db_path)?;
        instances.insert(id, instance.clone());
        Ok(instance)
    }

    /// Dispatch one request to the resolved instance.
    pub async fn forward(
        &self,
        agent_type: &str,
        instance_key: &str,
        request: InstanceRequest,
    ) -> Result<InstanceResponse> {
        let instance = self.resolve(agent_type, instance_key).await?;
        Ok(instance.handle(request).await)
    }

    /// Issue `request` to the default instance of every registered agent
    /// type in parallel. A failing type contributes `{"error": ...}` in its
    /// slot; it never aborts the others.
    pub async fn fan_out(
        &self,
        request: InstanceRequest,
    ) -> HashMap<String, serde_json::Value> {
        let calls = self.agents.keys().map(|agent_type| {
            let request = request.clone();
            async move {
                let value = match self
                    .forward(agent_type, DEFAULT_INSTANCE_KEY, request)
                    .await
                {
                    Ok(resp) if resp.status < 400 => resp.body,
                    Ok(resp) => serde_json::json!({"error": resp.body["error"]}),
                    Err(e) => serde_json::json!({"error": e.to_string()}),
                };
                (agent_type.clone(), value)
            }
        });
        futures::future::join_all(calls).await.into_iter().collect()
    }
}
