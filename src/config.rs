//! Declarative allocator configuration.
//!
//! The daemon receives network-instance definitions from its config
//! channel; this module gives them a typed YAML form with validation
//! and turns each definition into the runtime status the allocator
//! works against.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ipnet::Ipv4Net;
use log::info;
use serde::{Deserialize, Serialize};

use crate::dhcp::ensure_dhcp_range;
use crate::status::{DhcpRange, NetworkInstanceStatus, NetworkInstanceType};
use crate::types::NetworkInstanceId;

/// Top-level configuration document.
#[derive(Debug, Serialize, Deserialize)]
pub struct AllocatorConfig {
    #[serde(default)]
    pub settings: AllocatorSettings,
    pub network_instances: Vec<NetworkInstanceConfig>,
}

impl AllocatorConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut seen = std::collections::HashSet::new();
        for instance in &self.network_instances {
            if !seen.insert(instance.id) {
                return Err(ValidationError::DuplicateInstance(instance.id.to_string()));
            }
            instance.validate()?;
        }
        Ok(())
    }
}

/// Allocator-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocatorSettings {
    /// Directory holding the registry and address map checkpoints.
    pub persist_dir: PathBuf,
    /// How often unused persisted numbers are garbage collected.
    #[serde(with = "humantime_serde")]
    pub gc_interval: Duration,
}

impl Default for AllocatorSettings {
    fn default() -> Self {
        AllocatorSettings {
            persist_dir: PathBuf::from("/persist/netalloc"),
            gc_interval: Duration::from_secs(600),
        }
    }
}

/// One network instance definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkInstanceConfig {
    pub id: NetworkInstanceId,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: NetworkInstanceType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subnet: Option<Ipv4Net>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<Ipv4Addr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dhcp_start: Option<Ipv4Addr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dhcp_end: Option<Ipv4Addr>,
}

impl NetworkInstanceConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.is_empty() {
            return Err(ValidationError::InvalidInstance {
                name: self.id.to_string(),
                reason: "name cannot be empty".to_string(),
            });
        }
        match self.kind {
            // Switch instances manage no addressing; whatever is
            // configured is ignored downstream
            NetworkInstanceType::Switch => Ok(()),
            NetworkInstanceType::Local => {
                let Some(subnet) = self.subnet else {
                    return Err(ValidationError::InvalidInstance {
                        name: self.name.clone(),
                        reason: "local instance requires a subnet".to_string(),
                    });
                };
                if let Some(gateway) = self.gateway {
                    if !subnet.contains(&gateway) {
                        return Err(ValidationError::InvalidInstance {
                            name: self.name.clone(),
                            reason: format!("gateway {} outside subnet {}", gateway, subnet),
                        });
                    }
                }
                match (self.dhcp_start, self.dhcp_end) {
                    (Some(start), Some(end)) => {
                        if start > end {
                            return Err(ValidationError::InvalidInstance {
                                name: self.name.clone(),
                                reason: format!("inverted DHCP range {}-{}", start, end),
                            });
                        }
                        Ok(())
                    }
                    (None, None) => Ok(()),
                    _ => Err(ValidationError::InvalidInstance {
                        name: self.name.clone(),
                        reason: "DHCP range requires both start and end".to_string(),
                    }),
                }
            }
        }
    }

    /// Build the runtime status for this instance, applying the DHCP
    /// range sizing policy so activation sees the effective range.
    pub fn into_status(self) -> NetworkInstanceStatus {
        let mut status = NetworkInstanceStatus::new(
            self.id,
            self.name,
            self.kind,
            self.subnet,
            self.gateway,
            DhcpRange {
                start: self.dhcp_start,
                end: self.dhcp_end,
                size: 0,
            },
        );
        ensure_dhcp_range(&mut status);
        status
    }
}

/// Configuration validation errors
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("invalid network instance '{name}': {reason}")]
    InvalidInstance { name: String, reason: String },
    #[error("duplicate network instance {0}")]
    DuplicateInstance(String),
}

/// Load and validate an allocator configuration from a YAML file.
pub fn load_config(path: &Path) -> color_eyre::Result<AllocatorConfig> {
    info!("loading allocator configuration from {:?}", path);
    let file = std::fs::File::open(path)?;
    let config: AllocatorConfig = serde_yaml::from_reader(file)?;
    config.validate()?;
    info!(
        "loaded {} network instance definitions",
        config.network_instances.len()
    );
    Ok(config)
}
