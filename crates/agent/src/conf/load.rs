//! Load — config loading from file and environment variables.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use grep_regex::RegexMatcherBuilder;

use super::model::AgentConfig;

impl AgentConfig {
    /// Load configuration from file or environment variables
    /// Priority: Environment Variables > Config File > Defaults
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        let config_path = std::env::var("AGENT_CONFIG_FILE")
            .unwrap_or_else(|_| "/etc/chunkhost/agent.toml".to_string());

        let mut config = if Path::new(&config_path).exists() {
            tracing::info!("Loading configuration from: {}", config_path);
            Self::from_file(&config_path)?
        } else {
            tracing::info!(
                "Config file not found at {}, using environment variables",
                config_path
            );
            Self::default()
        };

        // Environment variables override file config for critical settings
        if let Ok(node_id) = std::env::var("AGENT_NODE_ID") {
            config.node_id = node_id;
        }
        if let Ok(bind) = std::env::var("AGENT_BIND_ADDRESS") {
            config.bind_address = bind;
        }
        if let Ok(cri) = std::env::var("AGENT_CRI_ENDPOINT") {
            config.cri_endpoint = cri;
        }
        if let Ok(cp) = std::env::var("AGENT_CONTROL_PLANE_ENDPOINT") {
            config.control_plane_endpoint = cp;
        }
        if let Ok(push) = std::env::var("AGENT_IMAGE_PUSH_ENDPOINT") {
            config.image_push_endpoint = push;
        }
        if let Ok(dir) = std::env::var("AGENT_CHECKPOINT_FILE_DIR") {
            config.checkpoint_file_dir = dir;
        }

        Ok(config)
    }

    /// Load configuration from TOML file
    pub fn from_file(path: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let mut file = File::open(path)?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;

        let config: AgentConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Validate that configuration values are sane
    pub fn validate(&self) -> Result<(), String> {
        if self.node_id.is_empty() {
            return Err("node_id must not be empty (set AGENT_NODE_ID)".to_string());
        }
        if self.bind_address.is_empty() {
            return Err("bind_address must not be empty".to_string());
        }
        if self.min_port >= self.max_port {
            return Err(format!(
                "port range is empty: min_port {} >= max_port {}",
                self.min_port, self.max_port
            ));
        }
        if self.sync_interval_secs == 0 {
            return Err("sync_interval_secs must be > 0".to_string());
        }
        if self.max_attempts == 0 {
            return Err("max_attempts must be > 0".to_string());
        }
        if self.gc_interval_secs == 0 {
            return Err("gc_interval_secs must be > 0".to_string());
        }
        if self.checkpoint_file_dir.is_empty() {
            return Err("checkpoint_file_dir must not be empty".to_string());
        }
        if self.workload_namespace.is_empty() {
            return Err("workload_namespace must not be empty".to_string());
        }
        if self.registry_endpoint.is_empty() {
            return Err("registry_endpoint must not be empty".to_string());
        }
        RegexMatcherBuilder::new()
            .build(&self.checkpoint_ready_pattern)
            .map_err(|e| format!("checkpoint_ready_pattern is not a valid regex: {}", e))?;
        for pod in &self.system_pods {
            if pod.name.is_empty() || pod.uid.is_empty() || pod.image.is_empty() {
                return Err(format!(
                    "system pod entry is incomplete: name={:?} uid={:?} image={:?}",
                    pod.name, pod.uid, pod.image
                ));
            }
        }
        Ok(())
    }
}
