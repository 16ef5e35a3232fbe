// Controller settings, parsed once at startup from the XML document
// described in §6.1. Parsing is ambient plumbing around the core, not
// the core itself, but a missing or malformed config is still a fatal
// configuration error (§7.1).

use serde::Deserialize;
use tracing::Level;

use crate::types::NodeDefinition;

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename = "ControllerSettings")]
pub struct ControllerSettings {
    #[serde(rename = "ConnectionString")]
    pub connection_string: String,
    #[serde(rename = "NodeName")]
    pub node_name: String,
    #[serde(rename = "Port")]
    pub port: u16,
    #[serde(rename = "LogLevel", default = "default_log_level")]
    pub log_level: String,
    #[serde(rename = "MaxChunkItemCount")]
    pub max_chunk_item_count: u32,
    #[serde(rename = "RedundantNodesPerLocation")]
    pub redundant_nodes_per_location: u32,
    #[serde(rename = "WebInterfacePort")]
    pub web_interface_port: u16,
}

impl ControllerSettings {
    pub fn from_xml_str(xml: &str) -> Result<Self, submerge_base::Error> {
        quick_xml::de::from_str(xml).map_err(submerge_base::Error::from)
    }

    pub fn from_xml_file(path: &std::path::Path) -> Result<Self, submerge_base::Error> {
        let xml = std::fs::read_to_string(path)?;
        Self::from_xml_str(&xml)
    }

    /// The ordered list of controllers named in `ConnectionString`; this
    /// list is the cluster's static membership and the identity compared
    /// during controller-to-controller joins.
    pub fn controllers(&self) -> Result<Vec<NodeDefinition>, submerge_base::Error> {
        self.connection_string
            .split(',')
            .map(|s| NodeDefinition::parse(s.trim()))
            .collect()
    }

    pub fn self_node(&self) -> NodeDefinition {
        NodeDefinition::new(self.node_name.clone(), self.port)
    }

    pub fn tracing_level(&self) -> Level {
        match self.log_level.to_ascii_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "warn" | "warning" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        }
    }
}
