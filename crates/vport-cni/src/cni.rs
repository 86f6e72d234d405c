//! The CNI invocation surface: environment, stdin network config, and the
//! result/error JSON printed back to the runtime.

use std::collections::HashMap;
use std::io::Read;

use serde::{Deserialize, Serialize};

use crate::error::{CniError, CniResult};

/// The CNI operation requested through `CNI_COMMAND`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CniCommand {
    Add,
    Del,
}

/// The plugin invocation as described by the CNI environment variables.
#[derive(Debug, Clone)]
pub struct CniArgs {
    pub command: CniCommand,
    pub container_id: String,
    /// Path to the container's network namespace. Empty on DEL when the
    /// namespace is already gone.
    pub netns: String,
    pub ifname: String,
    /// The raw `CNI_ARGS` string, with `IgnoreUnknown=1` prefixed so
    /// downstream consumers tolerate orchestrator-specific keys.
    pub args: String,
}

impl CniArgs {
    /// Reads the invocation from the process environment.
    pub fn from_env() -> CniResult<Self> {
        let command = match required("CNI_COMMAND")?.as_str() {
            "ADD" => CniCommand::Add,
            "DEL" => CniCommand::Del,
            other => {
                return Err(CniError::UnsupportedCommand {
                    command: other.to_string(),
                })
            }
        };
        let args = match std::env::var("CNI_ARGS") {
            Ok(args) if !args.is_empty() => format!("IgnoreUnknown=1;{args}"),
            _ => "IgnoreUnknown=1".to_string(),
        };
        Ok(CniArgs {
            command,
            container_id: required("CNI_CONTAINERID")?,
            netns: std::env::var("CNI_NETNS").unwrap_or_default(),
            ifname: required("CNI_IFNAME")?,
            args,
        })
    }

    /// Splits the `;`-separated `key=value` pairs of `CNI_ARGS` into a map.
    /// Malformed fragments are skipped.
    pub fn parsed_args(&self) -> HashMap<String, String> {
        self.args
            .split(';')
            .filter_map(|pair| pair.split_once('='))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }
}

fn required(var: &'static str) -> CniResult<String> {
    match std::env::var(var) {
        Ok(value) if !value.is_empty() => Ok(value),
        _ => Err(CniError::MissingEnvironment { var }),
    }
}

/// Kubernetes pod identity carried in `CNI_ARGS`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct K8sArgs {
    pub pod_name: String,
    pub pod_namespace: String,
    pub infra_container_id: String,
}

impl K8sArgs {
    pub fn from_cni_args(args: &CniArgs) -> Self {
        let mut parsed = args.parsed_args();
        let mut take = |key: &str| parsed.remove(key).unwrap_or_default();
        K8sArgs {
            pod_name: take("K8S_POD_NAME"),
            pod_namespace: take("K8S_POD_NAMESPACE"),
            infra_container_id: take("K8S_POD_INFRA_CONTAINER_ID"),
        }
    }
}

/// The network configuration the runtime passes on stdin.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NetworkConfig {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "cniVersion", default)]
    pub cni_version: String,
    /// Network metadata labels, as Mesos embeds them.
    #[serde(default)]
    pub labels: LabelList,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LabelList {
    #[serde(default)]
    pub labels: Vec<Label>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Label {
    pub key: String,
    pub value: String,
}

impl NetworkConfig {
    /// Parses the network config from a reader (stdin in production).
    pub fn from_reader(mut reader: impl Read) -> CniResult<Self> {
        let mut text = String::new();
        reader
            .read_to_string(&mut text)
            .map_err(|e| CniError::NetworkConfig {
                message: e.to_string(),
            })?;
        if text.trim().is_empty() {
            return Ok(NetworkConfig::default());
        }
        serde_json::from_str(&text).map_err(|e| CniError::NetworkConfig {
            message: e.to_string(),
        })
    }

    /// The labels flattened into a key → value map.
    pub fn label_map(&self) -> HashMap<String, String> {
        self.labels
            .labels
            .iter()
            .map(|l| (l.key.clone(), l.value.clone()))
            .collect()
    }
}

/// One configured address in the CNI result.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResultIp {
    pub version: String,
    /// CIDR form, e.g. `10.1.2.3/24`.
    pub address: String,
    pub gateway: String,
}

/// The success JSON printed to stdout after ADD.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CniReply {
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    pub ips: Vec<ResultIp>,
}

impl CniReply {
    pub fn new(cni_version: &str, address: vport_netlink::ConfiguredAddress) -> Self {
        CniReply {
            cni_version: cni_version.to_string(),
            ips: vec![ResultIp {
                version: "4".to_string(),
                address: format!("{}/{}", address.ip, address.prefix_len),
                gateway: address.gateway.to_string(),
            }],
        }
    }
}

/// The structured error JSON printed to stdout on failure, per the CNI
/// contract.
#[derive(Debug, Serialize, Deserialize)]
pub struct CniErrorReply {
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    pub code: u32,
    pub msg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl CniErrorReply {
    pub fn new(cni_version: &str, err: &CniError) -> Self {
        CniErrorReply {
            cni_version: cni_version.to_string(),
            code: err.code(),
            msg: err.to_string(),
            details: None,
        }
    }
}
