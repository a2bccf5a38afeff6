//! Cluster data-plane clients
//!
//! Components that talk to the live cluster API (node readiness, the
//! authorization map apply) authenticate with short-lived bearer tokens.
//! A [`DataPlaneSession`] caches the built client and rebuilds it from a
//! fresh token once the cached one is older than the token lifetime, so a
//! long readiness wait never fails mid-poll on an expired credential.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Node};
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use serde::Deserialize;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use crate::access;
use crate::controlplane::ControlPlane;
use crate::{Error, Result};

/// Source of short-lived bearer tokens for the cluster API
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Obtain a fresh bearer token for the named cluster
    async fn bearer_token(&self, cluster_name: &str) -> Result<String>;
}

/// Token provider that runs the cloud CLI's `get-token` command
#[derive(Clone, Debug)]
pub struct CliTokenProvider {
    region: String,
}

impl CliTokenProvider {
    /// Create a provider for the given region
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
        }
    }
}

#[derive(Deserialize)]
struct ExecCredential {
    status: ExecCredentialStatus,
}

#[derive(Deserialize)]
struct ExecCredentialStatus {
    token: String,
}

fn parse_exec_credential(json: &str) -> Result<String> {
    let credential: ExecCredential = serde_json::from_str(json)
        .map_err(|e| Error::serialization(format!("parsing get-token output: {e}")))?;
    Ok(credential.status.token)
}

#[async_trait]
impl TokenProvider for CliTokenProvider {
    async fn bearer_token(&self, cluster_name: &str) -> Result<String> {
        let output = Command::new("aws")
            .args([
                "--region",
                &self.region,
                "eks",
                "get-token",
                "--cluster-name",
                cluster_name,
            ])
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::transient(format!(
                "get-token for {cluster_name} failed: {}",
                stderr.trim()
            )));
        }

        parse_exec_credential(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Operations against the live cluster API
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterDataPlane: Send + Sync {
    /// Count of nodes whose Ready condition is True
    async fn ready_node_count(&self) -> Result<u32>;

    /// Apply a ConfigMap server-side; re-applying is last-write-wins
    async fn apply_config_map(&self, map: &ConfigMap) -> Result<()>;
}

/// Count nodes whose Ready condition reports True
pub fn count_ready(nodes: &[Node]) -> u32 {
    nodes
        .iter()
        .filter(|node| {
            let conditions = node.status.as_ref().and_then(|s| s.conditions.as_ref());
            conditions
                .map(|conds| {
                    conds
                        .iter()
                        .any(|c| c.type_ == "Ready" && c.status == "True")
                })
                .unwrap_or(false)
        })
        .count() as u32
}

/// Data plane backed by a real Kubernetes client
#[derive(Clone)]
pub struct KubeDataPlane {
    client: kube::Client,
}

impl KubeDataPlane {
    /// Wrap an already-built client
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClusterDataPlane for KubeDataPlane {
    async fn ready_node_count(&self) -> Result<u32> {
        let api: Api<Node> = Api::all(self.client.clone());
        let nodes = api.list(&ListParams::default()).await?;
        Ok(count_ready(&nodes.items))
    }

    async fn apply_config_map(&self, map: &ConfigMap) -> Result<()> {
        let name = map
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| Error::serialization("config map has no name"))?;
        let namespace = map
            .metadata
            .namespace
            .as_deref()
            .unwrap_or(access::AUTH_CONFIG_NAMESPACE);

        // Server-side apply needs apiVersion and kind in the body, which the
        // typed object does not serialize
        let body = serde_json::json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": { "name": name, "namespace": namespace },
            "data": map.data,
        });

        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        api.patch(
            name,
            &PatchParams::apply(crate::FIELD_MANAGER).force(),
            &Patch::Apply(&body),
        )
        .await?;

        info!(name = %name, namespace = %namespace, "applied config map");
        Ok(())
    }
}

/// A data plane that rebuilds its client when the token ages out
///
/// The cached client is reused while younger than the token lifetime;
/// afterwards a fresh token is fetched and the client rebuilt before the
/// next call proceeds.
pub struct DataPlaneSession {
    control_plane: ControlPlane,
    provider: Arc<dyn TokenProvider>,
    token_lifetime: Duration,
    cached: Mutex<Option<(KubeDataPlane, Instant)>>,
}

impl DataPlaneSession {
    /// Create a session for the given control plane
    pub fn new(
        control_plane: ControlPlane,
        provider: Arc<dyn TokenProvider>,
        token_lifetime: Duration,
    ) -> Self {
        Self {
            control_plane,
            provider,
            token_lifetime,
            cached: Mutex::new(None),
        }
    }

    async fn client(&self) -> Result<KubeDataPlane> {
        let mut cached = self.cached.lock().await;
        if let Some((client, built_at)) = cached.as_ref() {
            if built_at.elapsed() < self.token_lifetime {
                return Ok(client.clone());
            }
            debug!(
                cluster = %self.control_plane.name,
                "cached credentials aged out, rebuilding cluster client"
            );
        }

        let token = self
            .provider
            .bearer_token(&self.control_plane.name)
            .await?;
        let document = access::kube_config_with_token(&self.control_plane, &token);
        let kubeconfig: Kubeconfig = serde_yaml::from_str(&document.to_yaml()?)
            .map_err(|e| Error::serialization(format!("building cluster client config: {e}")))?;
        let config = kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| Error::serialization(format!("building cluster client config: {e}")))?;
        let client = kube::Client::try_from(config)?;

        let data_plane = KubeDataPlane::new(client);
        *cached = Some((data_plane.clone(), Instant::now()));
        Ok(data_plane)
    }
}

#[async_trait]
impl ClusterDataPlane for DataPlaneSession {
    async fn ready_node_count(&self) -> Result<u32> {
        self.client().await?.ready_node_count().await
    }

    async fn apply_config_map(&self, map: &ConfigMap) -> Result<()> {
        self.client().await?.apply_config_map(map).await
    }
}

/// Builds a data plane for a control plane once its endpoint is known
///
/// The endpoint and certificate only exist after the control plane is
/// active, so the orchestrator connects lazily through this seam.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DataPlaneConnector: Send + Sync {
    /// Connect to the given control plane
    async fn connect(&self, control_plane: &ControlPlane) -> Result<Arc<dyn ClusterDataPlane>>;
}

/// Connector producing token-refreshing sessions
pub struct TokenConnector {
    provider: Arc<dyn TokenProvider>,
    token_lifetime: Duration,
}

impl TokenConnector {
    /// Create a connector over the given token provider
    pub fn new(provider: Arc<dyn TokenProvider>, token_lifetime: Duration) -> Self {
        Self {
            provider,
            token_lifetime,
        }
    }

    /// Connector backed by the cloud CLI token command for the given region
    pub fn aws(region: impl Into<String>) -> Self {
        Self::new(
            Arc::new(CliTokenProvider::new(region)),
            Duration::from_secs(crate::TOKEN_LIFETIME_SECS),
        )
    }
}

#[async_trait]
impl DataPlaneConnector for TokenConnector {
    async fn connect(&self, control_plane: &ControlPlane) -> Result<Arc<dyn ClusterDataPlane>> {
        Ok(Arc::new(DataPlaneSession::new(
            control_plane.clone(),
            self.provider.clone(),
            self.token_lifetime,
        )))
    }
}
