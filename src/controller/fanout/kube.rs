// Cluster inventory backed by the Kubernetes API server. Only nodes and the
// labelled subscriber pods are read; nothing is ever written back.

use std::{env, fs, path::Path};

use futures::future::{BoxFuture, FutureExt};
use hashbrown::HashMap;
use reqwest::{Certificate, Client};
use serde::{de::DeserializeOwned, Deserialize};
use tracing::{debug, instrument};

use crate::controller::config::ControllerConfig;

use super::{
    error::Error,
    inventory::{ClusterInventory, RawNode, RawSubscriber},
};

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

// -- API response shapes, only the fields we read --

#[derive(Debug, Deserialize)]
struct List<T> {
    #[serde(default)]
    items: Vec<T>,
}

#[derive(Debug, Default, Deserialize)]
struct ObjectMeta {
    #[serde(default)]
    name: String,
    #[serde(default)]
    labels: HashMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
struct Node {
    #[serde(default)]
    metadata: ObjectMeta,
    #[serde(default)]
    status: NodeStatus,
}

#[derive(Debug, Default, Deserialize)]
struct NodeStatus {
    #[serde(default)]
    addresses: Vec<NodeAddress>,
}

#[derive(Debug, Deserialize)]
struct NodeAddress {
    #[serde(rename = "type")]
    kind: String,
    address: String,
}

#[derive(Debug, Default, Deserialize)]
struct Pod {
    #[serde(default)]
    metadata: ObjectMeta,
    #[serde(default)]
    spec: PodSpec,
    #[serde(default)]
    status: PodStatus,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PodSpec {
    #[serde(default)]
    node_name: Option<String>,
    #[serde(default)]
    containers: Vec<Container>,
}

#[derive(Debug, Deserialize)]
struct Container {
    #[serde(default)]
    env: Vec<EnvVar>,
}

#[derive(Debug, Deserialize)]
struct EnvVar {
    name: String,
    #[serde(default)]
    value: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PodStatus {
    #[serde(default, rename = "podIP")]
    pod_ip: Option<String>,
}

fn node_record(node: Node) -> RawNode {
    let internal_address = node
        .status
        .addresses
        .into_iter()
        .find(|a| a.kind == "InternalIP")
        .map(|a| a.address);
    RawNode {
        name: node.metadata.name,
        internal_address,
    }
}

fn subscriber_record(pod: Pod, topic_label: &str, port_env: &str) -> RawSubscriber {
    let port = pod
        .spec
        .containers
        .iter()
        .flat_map(|c| c.env.iter())
        .find(|e| e.name == port_env)
        .and_then(|e| e.value.clone());
    let mut labels = pod.metadata.labels;
    RawSubscriber {
        name: pod.metadata.name,
        node_name: pod.spec.node_name,
        address: pod.status.pod_ip,
        topic: labels.remove(topic_label),
        port,
    }
}

/// Lists nodes and subscriber pods through the API server's REST interface.
pub struct KubeInventory {
    client: Client,
    base_url: String,
    token: Option<String>,
    namespace: String,
    selector: String,
    topic_label: String,
    port_env: String,
}

impl KubeInventory {
    /// Builds an inventory client from the pod's service account, the way
    /// workloads inside the cluster reach the API server.
    pub fn in_cluster(config: &ControllerConfig) -> Result<Self, Error> {
        let host = env::var("KUBERNETES_SERVICE_HOST")
            .map_err(|_| Error::Config("KUBERNETES_SERVICE_HOST is not set".into()))?;
        let port = env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".into());
        let dir = Path::new(SERVICE_ACCOUNT_DIR);
        let token = fs::read_to_string(dir.join("token"))?;
        let ca = fs::read(dir.join("ca.crt"))?;
        let ca = Certificate::from_pem(&ca)
            .map_err(|e| Error::Config(format!("service account CA: {e}")))?;

        let host = if host.contains(':') {
            format!("[{host}]")
        } else {
            host
        };
        let client = Client::builder()
            .add_root_certificate(ca)
            .timeout(config.discovery_timeout)
            .build()
            .map_err(|e| Error::Config(format!("http client: {e}")))?;
        Ok(Self::with_client(
            client,
            format!("https://{host}:{port}"),
            Some(token.trim().to_string()),
            config,
        ))
    }

    /// Uses a caller-supplied client and API base URL, e.g. a local
    /// `kubectl proxy`.
    pub fn with_client(
        client: Client,
        base_url: impl Into<String>,
        token: Option<String>,
        config: &ControllerConfig,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            namespace: config.namespace.clone(),
            selector: config.subscriber_selector.clone(),
            topic_label: config.topic_label.clone(),
            port_env: config.port_env.clone(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, Error> {
        let mut req = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .query(query);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }

        let resp = req.send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(Error::InventoryUnreachable(format!(
                "GET {path}: {status} {text}"
            )));
        }
        let body = resp.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }

    #[instrument(skip(self), fields(base = %self.base_url))]
    async fn nodes(&self) -> Result<Vec<RawNode>, Error> {
        let list: List<Node> = self.get_json("/api/v1/nodes", &[]).await?;
        debug!(count = list.items.len(), "listed nodes");
        Ok(list.items.into_iter().map(node_record).collect())
    }

    #[instrument(skip(self), fields(namespace = %self.namespace, selector = %self.selector))]
    async fn subscribers(&self) -> Result<Vec<RawSubscriber>, Error> {
        let path = format!("/api/v1/namespaces/{}/pods", self.namespace);
        let list: List<Pod> = self
            .get_json(&path, &[("labelSelector", self.selector.as_str())])
            .await?;
        debug!(count = list.items.len(), "listed subscriber pods");
        Ok(list
            .items
            .into_iter()
            .map(|p| subscriber_record(p, &self.topic_label, &self.port_env))
            .collect())
    }
}

impl ClusterInventory for KubeInventory {
    fn list_nodes(&self) -> BoxFuture<'_, Result<Vec<RawNode>, Error>> {
        self.nodes().boxed()
    }

    fn list_subscribers(&self) -> BoxFuture<'_, Result<Vec<RawSubscriber>, Error>> {
        self.subscribers().boxed()
    }
}

impl std::fmt::Debug for KubeInventory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeInventory")
            .field("base_url", &self.base_url)
            .field("namespace", &self.namespace)
            .field("selector", &self.selector)
            .field("has_token", &self.token.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NODES: &str = r#"{
        "kind": "NodeList",
        "items": [
            {
                "metadata": {"name": "worker-1", "labels": {"kubernetes.io/os": "linux"}},
                "status": {"addresses": [
                    {"type": "Hostname", "address": "worker-1"},
                    {"type": "InternalIP", "address": "172.18.0.3"}
                ]}
            },
            {"metadata": {"name": "worker-2"}, "status": {}}
        ]
    }"#;

    const PODS: &str = r#"{
        "kind": "PodList",
        "items": [
            {
                "metadata": {"name": "sub-a", "labels": {"app": "subscriber", "ps/topic": "3"}},
                "spec": {
                    "nodeName": "worker-1",
                    "containers": [
                        {"name": "sidecar"},
                        {"name": "sub", "env": [
                            {"name": "OTHER", "value": "x"},
                            {"name": "PS_UDP_PORT", "value": "31005"}
                        ]}
                    ]
                },
                "status": {"podIP": "10.244.1.7", "phase": "Running"}
            },
            {
                "metadata": {"name": "sub-pending", "labels": {"app": "subscriber"}},
                "spec": {"containers": [{"name": "sub"}]},
                "status": {"phase": "Pending"}
            }
        ]
    }"#;

    #[test]
    fn parses_node_list() {
        let list: List<Node> = serde_json::from_str(NODES).unwrap();
        let nodes: Vec<_> = list.items.into_iter().map(node_record).collect();
        assert_eq!(
            nodes,
            vec![
                RawNode::builder()
                    .name("worker-1")
                    .internal_address("172.18.0.3")
                    .build(),
                RawNode::builder().name("worker-2").build(),
            ]
        );
    }

    #[test]
    fn parses_pod_list() {
        let list: List<Pod> = serde_json::from_str(PODS).unwrap();
        let subs: Vec<_> = list
            .items
            .into_iter()
            .map(|p| subscriber_record(p, "ps/topic", "PS_UDP_PORT"))
            .collect();
        assert_eq!(
            subs[0],
            RawSubscriber::builder()
                .name("sub-a")
                .node_name("worker-1")
                .address("10.244.1.7")
                .topic("3")
                .port("31005")
                .build()
        );
        assert_eq!(subs[1], RawSubscriber::builder().name("sub-pending").build());
    }

    #[test]
    fn malformed_list_is_a_discovery_error() {
        let err: Error = serde_json::from_str::<List<Pod>>(r#"{"items": 5}"#)
            .unwrap_err()
            .into();
        assert!(err.is_discovery());
    }

    #[test]
    fn trims_base_url() {
        let inv = KubeInventory::with_client(
            Client::new(),
            "http://127.0.0.1:8001/",
            None,
            &ControllerConfig::default(),
        );
        assert_eq!(inv.base_url(), "http://127.0.0.1:8001");
    }
}
