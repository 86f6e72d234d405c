//! Orchestrator inventories and the monitor notification sink used by the
//! audit daemon.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;
use vport_audit::{AuditError, AuditResult, DeletionNotifier, WorkloadInventory};

use crate::config::Config;
use crate::port_name::normalize_mesos_id;

/// Live pods from the Kubernetes API server. Pod UIDs are the entity ids.
pub struct KubernetesInventory {
    http: reqwest::Client,
    api_server: String,
}

#[derive(Debug, Deserialize)]
struct PodList {
    #[serde(default)]
    items: Vec<PodItem>,
}

#[derive(Debug, Deserialize)]
struct PodItem {
    metadata: PodIdentity,
}

#[derive(Debug, Deserialize)]
struct PodIdentity {
    #[serde(default)]
    uid: String,
}

impl KubernetesInventory {
    pub fn new(config: &Config) -> Self {
        KubernetesInventory {
            http: reqwest::Client::new(),
            api_server: config.api_server.clone(),
        }
    }
}

#[async_trait]
impl WorkloadInventory for KubernetesInventory {
    async fn list_live_ids(&self) -> AuditResult<Vec<String>> {
        let url = format!("{}/api/v1/pods", self.api_server);
        let pods: PodList = fetch_json(&self.http, &url).await?;
        let ids: Vec<String> = pods
            .items
            .into_iter()
            .map(|pod| pod.metadata.uid)
            .filter(|uid| !uid.is_empty())
            .collect();
        debug!(count = ids.len(), "Fetched live pod inventory");
        Ok(ids)
    }

    /// Pod UIDs are stored verbatim in the entity table.
    fn normalize_id(&self, raw: &str) -> String {
        raw.to_string()
    }
}

/// Live containers from the local Mesos agent.
pub struct MesosInventory {
    http: reqwest::Client,
    agent: String,
}

#[derive(Debug, Deserialize)]
struct MesosContainer {
    #[serde(default)]
    container_id: String,
}

impl MesosInventory {
    pub fn new(config: &Config) -> Self {
        MesosInventory {
            http: reqwest::Client::new(),
            agent: config.mesos_agent.clone(),
        }
    }
}

#[async_trait]
impl WorkloadInventory for MesosInventory {
    async fn list_live_ids(&self) -> AuditResult<Vec<String>> {
        let url = format!("{}/containers", self.agent);
        let containers: Vec<MesosContainer> = fetch_json(&self.http, &url).await?;
        let ids: Vec<String> = containers
            .into_iter()
            .map(|c| c.container_id)
            .filter(|id| !id.is_empty())
            .collect();
        debug!(count = ids.len(), "Fetched live container inventory");
        Ok(ids)
    }

    fn normalize_id(&self, raw: &str) -> String {
        normalize_mesos_id(raw)
    }
}

/// Posts stale-entity deletion notifications to the monitor service so it
/// can release the workload's overlay state.
pub struct MonitorNotifier {
    http: reqwest::Client,
    monitor_url: String,
}

#[derive(Debug, Serialize)]
struct DeletionBody<'a> {
    name: &'a str,
    zone: &'a str,
}

impl MonitorNotifier {
    pub fn new(config: &Config) -> Self {
        MonitorNotifier {
            http: reqwest::Client::new(),
            monitor_url: config.monitor_url.clone(),
        }
    }
}

#[async_trait]
impl DeletionNotifier for MonitorNotifier {
    async fn notify_deleted(&self, name: &str, zone: &str) -> AuditResult<()> {
        let url = format!("{}/deletions", self.monitor_url);
        self.http
            .post(&url)
            .json(&DeletionBody { name, zone })
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| AuditError::Notify {
                message: format!("POST {url}: {e}"),
            })?;
        Ok(())
    }
}

async fn fetch_json<T: serde::de::DeserializeOwned>(
    http: &reqwest::Client,
    url: &str,
) -> AuditResult<T> {
    let response = http
        .get(url)
        .send()
        .await
        .and_then(reqwest::Response::error_for_status)
        .map_err(|e| AuditError::Inventory {
            message: format!("GET {url}: {e}"),
        })?;
    response.json().await.map_err(|e| AuditError::Inventory {
        message: format!("GET {url}: malformed body: {e}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn pod_list_shape() {
        let json = r#"{"items": [
            {"metadata": {"uid": "aaa"}},
            {"metadata": {"uid": ""}},
            {"metadata": {"uid": "bbb"}}
        ]}"#;
        let pods: PodList = serde_json::from_str(json).unwrap();
        let ids: Vec<String> = pods
            .items
            .into_iter()
            .map(|p| p.metadata.uid)
            .filter(|u| !u.is_empty())
            .collect();
        assert_eq!(ids, vec!["aaa", "bbb"]);
    }

    #[test]
    fn mesos_container_shape() {
        let json = r#"[{"container_id": "ab-cd"}, {"container_id": "ef"}]"#;
        let containers: Vec<MesosContainer> = serde_json::from_str(json).unwrap();
        assert_eq!(containers.len(), 2);
        assert_eq!(normalize_mesos_id(&containers[0].container_id), "abcdabcd");
    }
}
