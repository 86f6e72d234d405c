//! Network-identity metadata and its orchestrator-specific resolvers.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

use crate::cni::K8sArgs;
use crate::config::Config;
use crate::error::{CniError, CniResult};

/// The overlay identity a workload attaches under. All five mandatory
/// fields must be set before a port can be created.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkIdentity {
    pub enterprise: String,
    pub domain: String,
    pub zone: String,
    pub network: String,
    pub user: String,
    pub policy_group: Option<String>,
    pub static_ip: Option<String>,
    pub redirection_target: Option<String>,
}

impl NetworkIdentity {
    /// Builds an identity from a flat label map (the Mesos path, and the
    /// generic one for tests).
    pub fn from_labels(labels: &HashMap<String, String>) -> Self {
        let get = |key: &str| labels.get(key).cloned().unwrap_or_default();
        let opt = |key: &str| labels.get(key).filter(|v| !v.is_empty()).cloned();
        NetworkIdentity {
            enterprise: get("enterprise"),
            domain: get("domain"),
            zone: get("zone"),
            network: get("network"),
            user: get("user"),
            policy_group: opt("policy-group"),
            static_ip: opt("static-ip"),
            redirection_target: opt("redirection-target"),
        }
    }

    /// Checks the mandatory fields. The first empty one is reported.
    pub fn validate(&self) -> CniResult<()> {
        for (field, value) in [
            ("enterprise", &self.enterprise),
            ("domain", &self.domain),
            ("zone", &self.zone),
            ("network", &self.network),
            ("user", &self.user),
        ] {
            if value.is_empty() {
                return Err(CniError::IncompleteMetadata { field });
            }
        }
        Ok(())
    }
}

/// Resolves the network identity for one attach request.
#[async_trait]
pub trait MetadataResolver: Send + Sync {
    async fn resolve(&self) -> CniResult<NetworkIdentity>;
}

/// Kubernetes resolver: pod labels from the API server, subnet and policy
/// group from the monitor service, with namespace-derived defaults.
pub struct KubernetesResolver {
    http: reqwest::Client,
    api_server: String,
    monitor_url: String,
    enterprise: String,
    admin_user: String,
    pod: K8sArgs,
}

/// The slice of a pod object the resolver reads.
#[derive(Debug, Deserialize)]
struct PodLabels {
    #[serde(default)]
    metadata: PodMetadata,
}

#[derive(Debug, Default, Deserialize)]
struct PodMetadata {
    #[serde(default)]
    uid: String,
    #[serde(default)]
    labels: HashMap<String, String>,
}

/// Subnet and policy-group assignment from the monitor service.
#[derive(Debug, Deserialize)]
struct PodAssignment {
    #[serde(default)]
    subnet: String,
    #[serde(rename = "policyGroups", default)]
    policy_groups: Vec<String>,
}

impl KubernetesResolver {
    pub fn new(config: &Config, pod: K8sArgs) -> Self {
        KubernetesResolver {
            http: reqwest::Client::new(),
            api_server: config.api_server.clone(),
            monitor_url: config.monitor_url.clone(),
            enterprise: config.enterprise.clone(),
            admin_user: config.admin_user.clone(),
            pod,
        }
    }

    async fn pod(&self) -> CniResult<PodLabels> {
        let url = format!(
            "{}/api/v1/namespaces/{}/pods/{}",
            self.api_server, self.pod.pod_namespace, self.pod.pod_name
        );
        get_json(&self.http, &url).await
    }

    /// The pod's UID, used as the entity id on the switch.
    pub async fn pod_uid(&self) -> CniResult<String> {
        Ok(self.pod().await?.metadata.uid)
    }

    async fn assignment(&self) -> CniResult<PodAssignment> {
        let url = format!(
            "{}/namespaces/{}/pods/{}",
            self.monitor_url, self.pod.pod_namespace, self.pod.pod_name
        );
        get_json(&self.http, &url).await
    }
}

#[async_trait]
impl MetadataResolver for KubernetesResolver {
    async fn resolve(&self) -> CniResult<NetworkIdentity> {
        let labels = self.pod().await?.metadata.labels;
        let assignment = self.assignment().await?;
        debug!(pod = %self.pod.pod_name, ?labels, "Resolved pod labels");

        let identity = pod_identity(
            &labels,
            &assignment,
            &self.pod.pod_namespace,
            &self.enterprise,
            &self.admin_user,
        );
        info!(
            zone = %identity.zone,
            network = %identity.network,
            "Resolved network identity for pod {}", self.pod.pod_name
        );
        Ok(identity)
    }
}

/// Maps pod labels plus the monitor's assignment onto a network identity.
/// Pods without an explicit zone label land in a per-namespace zone; the
/// configured admin user is the fallback user.
fn pod_identity(
    labels: &HashMap<String, String>,
    assignment: &PodAssignment,
    namespace: &str,
    enterprise: &str,
    admin_user: &str,
) -> NetworkIdentity {
    let label = |key: &str| labels.get(key).filter(|v| !v.is_empty()).cloned();
    NetworkIdentity {
        enterprise: enterprise.to_string(),
        domain: enterprise.to_string(),
        zone: label("vport.io/zone").unwrap_or_else(|| namespace.to_string()),
        network: label("vport.io/subnet").unwrap_or_else(|| assignment.subnet.clone()),
        user: label("vport.io/user").unwrap_or_else(|| admin_user.to_string()),
        policy_group: label("vport.io/policy-group")
            .or_else(|| assignment.policy_groups.first().cloned()),
        static_ip: label("vport.io/static-ip"),
        redirection_target: label("vport.io/redirection-target"),
    }
}

/// Mesos resolver: the identity arrives fully formed as labels in the
/// network config on stdin.
pub struct MesosResolver {
    labels: HashMap<String, String>,
}

impl MesosResolver {
    pub fn new(labels: HashMap<String, String>) -> Self {
        MesosResolver { labels }
    }
}

#[async_trait]
impl MetadataResolver for MesosResolver {
    async fn resolve(&self) -> CniResult<NetworkIdentity> {
        Ok(NetworkIdentity::from_labels(&self.labels))
    }
}

pub(crate) async fn get_json<T: serde::de::DeserializeOwned>(
    http: &reqwest::Client,
    url: &str,
) -> CniResult<T> {
    let response = http
        .get(url)
        .send()
        .await
        .map_err(|e| CniError::MetadataResolve {
            message: format!("GET {url}: {e}"),
        })?;
    let response = response
        .error_for_status()
        .map_err(|e| CniError::MetadataResolve {
            message: format!("GET {url}: {e}"),
        })?;
    response.json().await.map_err(|e| CniError::MetadataResolve {
        message: format!("GET {url}: malformed body: {e}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn labels(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn identity_from_labels() {
        let identity = NetworkIdentity::from_labels(&labels(&[
            ("enterprise", "acme"),
            ("domain", "prod"),
            ("zone", "web"),
            ("network", "10.1.2.0"),
            ("user", "ops"),
            ("policy-group", "pg1"),
        ]));
        assert_eq!(identity.enterprise, "acme");
        assert_eq!(identity.policy_group.as_deref(), Some("pg1"));
        assert_eq!(identity.static_ip, None);
        identity.validate().unwrap();
    }

    #[test]
    fn validate_names_the_first_missing_field() {
        let identity = NetworkIdentity {
            enterprise: "acme".to_string(),
            domain: "prod".to_string(),
            ..Default::default()
        };
        match identity.validate() {
            Err(CniError::IncompleteMetadata { field }) => assert_eq!(field, "zone"),
            other => panic!("expected IncompleteMetadata, got {other:?}"),
        }
    }

    #[test]
    fn pod_identity_defaults_zone_and_user() {
        let assignment = PodAssignment {
            subnet: "subnet-a".to_string(),
            policy_groups: vec!["pg-a".to_string()],
        };
        let identity = pod_identity(&labels(&[]), &assignment, "team-x", "acme", "admin");
        assert_eq!(identity.zone, "team-x");
        assert_eq!(identity.user, "admin");
        assert_eq!(identity.network, "subnet-a");
        assert_eq!(identity.policy_group.as_deref(), Some("pg-a"));
        identity.validate().unwrap();
    }

    #[test]
    fn pod_labels_override_assignment() {
        let assignment = PodAssignment {
            subnet: "subnet-a".to_string(),
            policy_groups: Vec::new(),
        };
        let identity = pod_identity(
            &labels(&[
                ("vport.io/zone", "edge"),
                ("vport.io/subnet", "subnet-b"),
                ("vport.io/user", "svc"),
            ]),
            &assignment,
            "team-x",
            "acme",
            "admin",
        );
        assert_eq!(identity.zone, "edge");
        assert_eq!(identity.network, "subnet-b");
        assert_eq!(identity.user, "svc");
        assert_eq!(identity.policy_group, None);
    }

    #[tokio::test]
    async fn mesos_resolver_passes_labels_through() {
        let resolver = MesosResolver::new(labels(&[
            ("enterprise", "acme"),
            ("domain", "prod"),
            ("zone", "batch"),
            ("network", "n1"),
            ("user", "svc"),
        ]));
        let identity = resolver.resolve().await.unwrap();
        assert_eq!(identity.zone, "batch");
        identity.validate().unwrap();
    }
}
