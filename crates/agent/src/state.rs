//! Agent state — AgentState struct, shared state type alias.

use std::sync::Arc;

use crate::client::runtime::RuntimeOps;
use crate::conf::AgentConfig;
use crate::cri::Cri;
use crate::ports::PortAllocator;
use crate::proto::runtime::v1 as cri;
use crate::status::StatusStore;

pub struct AgentState {
    pub config: AgentConfig,
    pub cri: Cri,
    pub store: StatusStore,
    pub ports: PortAllocator,
}

impl AgentState {
    pub fn new(config: AgentConfig, runtime: Arc<dyn RuntimeOps>) -> Self {
        let ports = PortAllocator::new(config.min_port, config.max_port);
        Self {
            cri: Cri::new(runtime),
            store: StatusStore::new(),
            ports,
            config,
        }
    }

    /// Credentials for the platform registry, if configured.
    pub fn registry_auth(&self) -> Option<cri::AuthConfig> {
        match (&self.config.registry_user, &self.config.registry_pass) {
            (Some(username), Some(password)) => Some(cri::AuthConfig {
                username: username.clone(),
                password: password.clone(),
                ..Default::default()
            }),
            _ => None,
        }
    }
}

pub type SharedState = Arc<AgentState>;
