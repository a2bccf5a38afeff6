//! Cluster access configuration
//!
//! Two products let callers reach a freshly provisioned cluster:
//!
//! 1. A local kubeconfig document embedding the endpoint, certificate
//!    authority data, and an exec-credential specification that obtains a
//!    short-lived bearer token at use time (nothing secret is embedded
//!    statically). The file is rewritten unconditionally on every call: it
//!    is cheap and must always reflect the current endpoint and certificate.
//! 2. An in-cluster authorization ConfigMap that maps the worker instance
//!    role ARN to the node bootstrap groups, letting worker nodes register
//!    with the control plane. Applied server-side, so re-applying is
//!    last-write-wins idempotent.

use std::collections::BTreeMap;
use std::path::PathBuf;

use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::ObjectMeta;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::controlplane::ControlPlane;
use crate::spec::ClusterSpec;
use crate::{Error, Result};

/// Namespace the authorization ConfigMap lives in
pub const AUTH_CONFIG_NAMESPACE: &str = "kube-system";

/// Username template worker nodes authenticate as
const NODE_USERNAME: &str = "system:node:{{EC2PrivateDNSName}}";

/// Groups granted to registering worker nodes
const NODE_GROUPS: &[&str] = &["system:bootstrappers", "system:nodes"];

/// A kubeconfig document
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct KubeConfigDoc {
    /// Document API version, always `v1`
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    /// Document kind, always `Config`
    pub kind: String,
    /// Cluster entries
    pub clusters: Vec<NamedCluster>,
    /// Context entries
    pub contexts: Vec<NamedContext>,
    /// Name of the active context
    #[serde(rename = "current-context")]
    pub current_context: String,
    /// Preferences block, kept empty
    pub preferences: BTreeMap<String, String>,
    /// User entries
    pub users: Vec<NamedUser>,
}

/// A named cluster entry
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct NamedCluster {
    /// Connection details
    pub cluster: ClusterEntry,
    /// Entry name
    pub name: String,
}

/// Connection details for a cluster entry
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct ClusterEntry {
    /// API server URL
    pub server: String,
    /// Base64-encoded certificate authority data
    #[serde(rename = "certificate-authority-data")]
    pub certificate_authority_data: String,
}

/// A named context entry
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct NamedContext {
    /// Cluster/user pairing
    pub context: ContextEntry,
    /// Entry name
    pub name: String,
}

/// Cluster/user pairing for a context entry
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct ContextEntry {
    /// Referenced cluster entry name
    pub cluster: String,
    /// Referenced user entry name
    pub user: String,
}

/// A named user entry
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct NamedUser {
    /// Entry name
    pub name: String,
    /// Credential source
    pub user: UserEntry,
}

/// Credential source for a user entry
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct UserEntry {
    /// External command obtaining a short-lived token at use time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec: Option<ExecEntry>,
    /// Static bearer token, used for in-process clients only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// Exec-credential specification
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct ExecEntry {
    /// Credential API version
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    /// Command to run
    pub command: String,
    /// Command arguments
    pub args: Vec<String>,
}

impl KubeConfigDoc {
    /// Serialize the document to YAML
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| Error::serialization(e.to_string()))
    }

    fn skeleton(control_plane: &ControlPlane, user: UserEntry) -> Self {
        Self {
            api_version: "v1".to_string(),
            kind: "Config".to_string(),
            clusters: vec![NamedCluster {
                cluster: ClusterEntry {
                    server: control_plane.endpoint.clone(),
                    certificate_authority_data: control_plane.certificate_authority.clone(),
                },
                name: "kubernetes".to_string(),
            }],
            contexts: vec![NamedContext {
                context: ContextEntry {
                    cluster: "kubernetes".to_string(),
                    user: "aws".to_string(),
                },
                name: "aws".to_string(),
            }],
            current_context: "aws".to_string(),
            preferences: BTreeMap::new(),
            users: vec![NamedUser {
                name: "aws".to_string(),
                user,
            }],
        }
    }
}

/// Build the kubeconfig document with an exec-credential user
///
/// Tokens are obtained at use time by the configured command, so the file
/// never goes stale for credential reasons.
pub fn kube_config(spec: &ClusterSpec, control_plane: &ControlPlane) -> KubeConfigDoc {
    KubeConfigDoc::skeleton(
        control_plane,
        UserEntry {
            exec: Some(ExecEntry {
                api_version: "client.authentication.k8s.io/v1beta1".to_string(),
                command: "aws".to_string(),
                args: vec![
                    "--region".to_string(),
                    spec.region().to_string(),
                    "eks".to_string(),
                    "get-token".to_string(),
                    "--cluster-name".to_string(),
                    spec.name().to_string(),
                ],
            }),
            token: None,
        },
    )
}

/// Build a kubeconfig document carrying a pre-fetched bearer token
///
/// Used to construct in-process clients; the token has a bounded lifetime
/// and the caller is responsible for rebuilding the client when it ages out.
pub fn kube_config_with_token(control_plane: &ControlPlane, token: &str) -> KubeConfigDoc {
    KubeConfigDoc::skeleton(
        control_plane,
        UserEntry {
            exec: None,
            token: Some(token.to_string()),
        },
    )
}

/// Write the local cluster-access file, unconditionally
///
/// Always rewrites: the file must reflect the current endpoint and
/// certificate, and writing it is cheap.
pub async fn ensure_kube_config(
    spec: &ClusterSpec,
    control_plane: &ControlPlane,
) -> Result<PathBuf> {
    let document = kube_config(spec, control_plane);
    let path = spec.kube_config_file().to_path_buf();
    tokio::fs::write(&path, document.to_yaml()?).await?;
    info!(file = %path.display(), "wrote cluster access file");
    Ok(path)
}

/// Build the authorization ConfigMap mapping the worker role to node groups
///
/// Applying this to the cluster lets the control plane recognize worker
/// instances and admit them as nodes.
pub fn auth_map(worker_role_arn: &str) -> Result<ConfigMap> {
    #[derive(Serialize)]
    struct RoleMapping<'a> {
        rolearn: &'a str,
        username: &'a str,
        groups: Vec<&'a str>,
    }

    let map_roles = serde_yaml::to_string(&[RoleMapping {
        rolearn: worker_role_arn,
        username: NODE_USERNAME,
        groups: NODE_GROUPS.to_vec(),
    }])
    .map_err(|e| Error::serialization(e.to_string()))?;

    let mut data = BTreeMap::new();
    data.insert("mapRoles".to_string(), map_roles);

    Ok(ConfigMap {
        metadata: ObjectMeta {
            name: Some(crate::AUTH_CONFIG_MAP_NAME.to_string()),
            namespace: Some(AUTH_CONFIG_NAMESPACE.to_string()),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn control_plane() -> ControlPlane {
        ControlPlane {
            name: "t1".to_string(),
            endpoint: "https://ABC.eks.example.com".to_string(),
            certificate_authority: "LS0tLS1CRUdJTg==".to_string(),
        }
    }

    fn spec() -> ClusterSpec {
        ClusterSpec::builder("t1").region("us-east-2").build().unwrap()
    }

    /// Story: The access file embeds endpoint, certificate, and exec spec
    ///
    /// The exec spec carries the command that fetches a short-lived token at
    /// use time; no credential is embedded statically.
    #[test]
    fn kube_config_embeds_exec_credential_spec() {
        let doc = kube_config(&spec(), &control_plane());
        let yaml = doc.to_yaml().unwrap();

        assert!(yaml.contains("server: https://ABC.eks.example.com"));
        assert!(yaml.contains("certificate-authority-data: LS0tLS1CRUdJTg=="));
        assert!(yaml.contains("current-context: aws"));
        assert!(yaml.contains("command: aws"));
        assert!(yaml.contains("get-token"));
        assert!(yaml.contains("us-east-2"));
        assert!(yaml.contains("--cluster-name"));
        assert!(!yaml.contains("token:"), "no static token in the exec variant");
    }

    /// Story: The document survives a serialization roundtrip
    #[test]
    fn kube_config_roundtrips_through_yaml() {
        let doc = kube_config(&spec(), &control_plane());
        let yaml = doc.to_yaml().unwrap();
        let parsed: KubeConfigDoc = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(doc, parsed);
    }

    /// Story: The token variant carries the bearer token and no exec spec
    #[test]
    fn token_variant_for_in_process_clients() {
        let doc = kube_config_with_token(&control_plane(), "k8s-aws-v1.abc");
        let yaml = doc.to_yaml().unwrap();
        assert!(yaml.contains("token: k8s-aws-v1.abc"));
        assert!(!yaml.contains("exec:"));
    }

    /// Story: The access file is rewritten unconditionally
    ///
    /// A second write with a changed endpoint replaces the previous content;
    /// there is no freshness check to go wrong.
    #[tokio::test]
    async fn ensure_kube_config_rewrites_every_time() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kubeconfig.yaml");
        let spec = ClusterSpec::builder("t1").kube_config_file(&path).build().unwrap();

        ensure_kube_config(&spec, &control_plane()).await.unwrap();
        let first = std::fs::read_to_string(&path).unwrap();
        assert!(first.contains("https://ABC.eks.example.com"));

        let moved = ControlPlane {
            endpoint: "https://NEW.eks.example.com".to_string(),
            ..control_plane()
        };
        ensure_kube_config(&spec, &moved).await.unwrap();
        let second = std::fs::read_to_string(&path).unwrap();
        assert!(second.contains("https://NEW.eks.example.com"));
        assert!(!second.contains("https://ABC.eks.example.com"));
    }

    /// Story: The auth map grants the worker role the node bootstrap groups
    #[test]
    fn auth_map_templates_worker_role_arn() {
        let arn = "arn:aws:iam::123456789012:role/AmazonEKSNodeRole";
        let map = auth_map(arn).unwrap();

        assert_eq!(map.metadata.name.as_deref(), Some("aws-auth"));
        assert_eq!(map.metadata.namespace.as_deref(), Some("kube-system"));

        let map_roles = &map.data.as_ref().unwrap()["mapRoles"];
        assert!(map_roles.contains(arn));
        assert!(map_roles.contains("system:node:{{EC2PrivateDNSName}}"));
        assert!(map_roles.contains("system:bootstrappers"));
        assert!(map_roles.contains("system:nodes"));
    }
}
