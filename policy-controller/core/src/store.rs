//! Read-only access to cluster state, provided by the hosting runtime.

use k8s_openapi::api::rbac::v1::{ClusterRoleBinding, RoleBinding};
use kube::{
    core::{ApiResource, GroupVersionKind},
    Resource,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("failed to fetch {kind} {key}: {source}")]
    Upstream {
        kind: String,
        key: String,
        #[source]
        source: BoxError,
    },

    #[error("failed to decode {kind} {key}: {source}")]
    Decode {
        kind: String,
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("{kind} {key} not found")]
    NotFound { kind: String, key: String },
}

/// Looks up objects of arbitrary kinds.
#[async_trait::async_trait]
pub trait ObjectReader: Send + Sync {
    /// Returns `None` if the object does not exist.
    async fn get(
        &self,
        kind: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<Value>, FetchError>;

    async fn list(
        &self,
        kind: &ApiResource,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<Value>, FetchError>;
}

/// Lists RBAC bindings so that a caller's effective roles can be resolved.
#[async_trait::async_trait]
pub trait RoleBindingIndex: Send + Sync {
    /// Lists role bindings in `namespace`, or in all namespaces.
    async fn role_bindings(&self, namespace: Option<&str>) -> Result<Vec<RoleBinding>, FetchError>;

    async fn cluster_role_bindings(&self) -> Result<Vec<ClusterRoleBinding>, FetchError>;
}

/// The OpenShift `User` kind, which carries per-user defaults.
pub fn user_resource() -> ApiResource {
    ApiResource::from_gvk_with_plural(
        &GroupVersionKind::gvk("user.openshift.io", "v1", "User"),
        "users",
    )
}

/// Fetches and decodes a typed object.
pub async fn get<K>(
    reader: &dyn ObjectReader,
    namespace: Option<&str>,
    name: &str,
) -> Result<Option<K>, FetchError>
where
    K: Resource<DynamicType = ()> + DeserializeOwned,
{
    let kind = ApiResource::erase::<K>(&());
    match reader.get(&kind, namespace, name).await? {
        Some(value) => decode(&kind, key(namespace, name), value).map(Some),
        None => Ok(None),
    }
}

/// Like [`get`], but a missing object is an error.
pub async fn require<K>(
    reader: &dyn ObjectReader,
    namespace: Option<&str>,
    name: &str,
) -> Result<K, FetchError>
where
    K: Resource<DynamicType = ()> + DeserializeOwned,
{
    get(reader, namespace, name)
        .await?
        .ok_or_else(|| FetchError::NotFound {
            kind: K::kind(&()).to_string(),
            key: key(namespace, name),
        })
}

/// Lists and decodes typed objects.
pub async fn list<K>(
    reader: &dyn ObjectReader,
    namespace: Option<&str>,
    label_selector: Option<&str>,
) -> Result<Vec<K>, FetchError>
where
    K: Resource<DynamicType = ()> + DeserializeOwned,
{
    let kind = ApiResource::erase::<K>(&());
    reader
        .list(&kind, namespace, label_selector)
        .await?
        .into_iter()
        .map(|value| decode(&kind, key(namespace, "*"), value))
        .collect()
}

fn decode<K: DeserializeOwned>(
    kind: &ApiResource,
    key: String,
    value: Value,
) -> Result<K, FetchError> {
    serde_json::from_value(value).map_err(|source| FetchError::Decode {
        kind: kind.kind.clone(),
        key,
        source,
    })
}

fn key(namespace: Option<&str>, name: &str) -> String {
    match namespace {
        Some(ns) => format!("{ns}/{name}"),
        None => name.to_string(),
    }
}
