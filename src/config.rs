// src/config.rs

//! Manages server configuration: loading from TOML and field defaults.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;

#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    #[serde(default = "default_host")]
    pub host: String,
    /// The network port for incoming connections.
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Number of worker tasks in the continuation pool.
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
    /// Sent privately to every client right after its connect notice.
    #[serde(default = "default_welcome_message")]
    pub welcome_message: String,
    #[serde(default)]
    pub gateway: GatewayConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            log_level: default_log_level(),
            worker_threads: default_worker_threads(),
            welcome_message: default_welcome_message(),
            gateway: GatewayConfig::default(),
        }
    }
}

/// Configuration for the external command gateway. Disabled by default;
/// slash commands then get the unsupported-commands reply.
#[derive(Deserialize, Debug, Clone)]
pub struct GatewayConfig {
    #[serde(default)]
    pub enabled: bool,
    /// The shell executable the command is handed to.
    #[serde(default = "default_shell")]
    pub shell: String,
    /// Argument template; `{0}` is replaced with the command text.
    #[serde(default = "default_template")]
    pub template: String,
    #[serde(default = "default_command_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            shell: default_shell(),
            template: default_template(),
            timeout_ms: default_command_timeout_ms(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    10000
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_worker_threads() -> usize {
    4
}
fn default_welcome_message() -> String {
    "Welcome to the chat!".to_string()
}
fn default_shell() -> String {
    "/bin/sh".to_string()
}
fn default_template() -> String {
    "-c {0}".to_string()
}
fn default_command_timeout_ms() -> u64 {
    10_000 // 10 seconds
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        let config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse TOML from '{path}'"))?;
        Ok(config)
    }
}
