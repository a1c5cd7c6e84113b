use std::sync::Arc;

use anyhow::{Context, Result};
use flume::Sender;

use crate::agent::cadence::{spawn_cadence, CadenceHandle, CadenceSettings};
use crate::agent::{Agent, AgentEvent};
use crate::config::AgentConfig;
use crate::llm_client::{ModelClient, OpenAiCompatClient};
use crate::store::{KvStore, RestKv};
use crate::tools::{builtin_registry, Tool, ToolRegistry};

pub struct BackendRuntime {
    pub config: AgentConfig,
    pub agent: Arc<Agent>,
    pub tool_registry: Arc<ToolRegistry>,
}

/// Wires the agent from config. Model, store and extra tools can be
/// swapped in before `build`.
pub struct BackendRuntimeBuilder {
    config: AgentConfig,
    event_tx: Sender<AgentEvent>,
    model: Option<Arc<dyn ModelClient>>,
    kv: Option<Arc<dyn KvStore>>,
    extra_tools: Vec<Arc<dyn Tool>>,
}

impl BackendRuntimeBuilder {
    pub fn new(config: AgentConfig, event_tx: Sender<AgentEvent>) -> Self {
        Self {
            config,
            event_tx,
            model: None,
            kv: None,
            extra_tools: Vec::new(),
        }
    }

    pub fn with_model(mut self, model: Arc<dyn ModelClient>) -> Self {
        self.model = Some(model);
        self
    }

    pub fn with_kv(mut self, kv: Arc<dyn KvStore>) -> Self {
        self.kv = Some(kv);
        self
    }

    pub fn with_tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.extra_tools.push(tool);
        self
    }

    pub async fn build(self) -> Result<BackendRuntime> {
        let config = self.config;

        let tool_registry = Arc::new(
            builtin_registry(&config)
                .await
                .context("Failed to build tool registry")?,
        );
        for tool in self.extra_tools {
            tool_registry.register(tool).await;
        }

        let model = match self.model {
            Some(model) => model,
            None => Arc::new(
                OpenAiCompatClient::from_config(&config)
                    .context("Failed to create model client")?,
            ),
        };

        let kv = match self.kv {
            Some(kv) => Some(kv),
            None => RestKv::from_config(&config)
                .context("Failed to create key-value client")?
                .map(|kv| Arc::new(kv) as Arc<dyn KvStore>),
        };

        let agent = Arc::new(Agent::new(
            config.clone(),
            model,
            tool_registry.clone(),
            kv,
            self.event_tx,
        ));

        Ok(BackendRuntime {
            config,
            agent,
            tool_registry,
        })
    }
}

impl BackendRuntime {
    pub async fn bootstrap(config: AgentConfig, event_tx: Sender<AgentEvent>) -> Result<Self> {
        BackendRuntimeBuilder::new(config, event_tx).build().await
    }

    /// Run the boot protocol, then start the cadence controller. The
    /// controller idles until the boot gate opens and autonomy is active.
    pub async fn start(&self) -> CadenceHandle {
        let gate = self.agent.boot().await;
        tracing::info!("Boot finished: {:?}", gate);
        spawn_cadence(
            self.agent.clone(),
            CadenceSettings::from_config(&self.config),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::BootGate;
    use crate::llm_client::scripted::ScriptedModel;
    use crate::store::MemoryKv;

    #[tokio::test]
    async fn builder_wires_injected_model_and_store() {
        let (tx, _rx) = flume::unbounded();
        let kv = Arc::new(MemoryKv::new());
        let runtime = BackendRuntimeBuilder::new(AgentConfig::default(), tx)
            .with_model(Arc::new(ScriptedModel::new(vec![])))
            .with_kv(kv.clone())
            .build()
            .await
            .unwrap();

        assert!(runtime.agent.persistence_enabled());
        assert!(runtime
            .tool_registry
            .list_names()
            .await
            .contains(&"write_journal".to_string()));

        let cadence = runtime.start().await;
        assert_eq!(runtime.agent.gate().await, BootGate::Ready);
        assert!(kv.keys().contains(&"persona:meta".to_string()));
        cadence.shutdown().await;
    }

    #[tokio::test]
    async fn missing_store_credentials_disable_persistence() {
        let (tx, _rx) = flume::unbounded();
        let runtime = BackendRuntimeBuilder::new(AgentConfig::default(), tx)
            .with_model(Arc::new(ScriptedModel::new(vec![])))
            .build()
            .await
            .unwrap();
        assert!(!runtime.agent.persistence_enabled());
    }
}
