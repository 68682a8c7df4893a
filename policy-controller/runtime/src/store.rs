use crate::core::store::{BoxError, FetchError, ObjectReader, RoleBindingIndex};
use k8s_openapi::api::rbac::v1::{ClusterRoleBinding, RoleBinding};
use kube::{
    api::{Api, ListParams},
    core::{ApiResource, DynamicObject, TypeMeta},
    Client,
};
use serde_json::Value;
use std::future::Future;
use tokio::time::{self, Duration};
use tracing::trace;

/// Reads cluster state directly from the API server.
///
/// Every call is bounded by a timeout so that a slow API server surfaces as
/// an internal error instead of stalling the admission request.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    timeout: Duration,
}

impl KubeStore {
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    fn api(&self, kind: &ApiResource, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, kind),
            None => Api::all_with(self.client.clone(), kind),
        }
    }

    async fn call<T, F>(&self, kind: &str, key: String, fut: F) -> Result<T, FetchError>
    where
        F: Future<Output = Result<T, kube::Error>>,
    {
        trace!(%kind, %key, "Fetching");
        let upstream = |source: BoxError| FetchError::Upstream {
            kind: kind.to_string(),
            key: key.clone(),
            source,
        };
        match time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(error)) => Err(upstream(error.into())),
            Err(elapsed) => Err(upstream(elapsed.into())),
        }
    }
}

fn to_value(kind: &ApiResource, key: &str, mut obj: DynamicObject) -> Result<Value, FetchError> {
    // List items carry no type information.
    if obj.types.is_none() {
        obj.types = Some(TypeMeta {
            api_version: kind.api_version.clone(),
            kind: kind.kind.clone(),
        });
    }
    serde_json::to_value(obj).map_err(|source| FetchError::Decode {
        kind: kind.kind.clone(),
        key: key.to_string(),
        source,
    })
}

fn key(namespace: Option<&str>, name: &str) -> String {
    match namespace {
        Some(ns) => format!("{ns}/{name}"),
        None => name.to_string(),
    }
}

#[async_trait::async_trait]
impl ObjectReader for KubeStore {
    async fn get(
        &self,
        kind: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<Value>, FetchError> {
        let key = key(namespace, name);
        let api = self.api(kind, namespace);
        self.call(&kind.kind, key.clone(), api.get_opt(name))
            .await?
            .map(|obj| to_value(kind, &key, obj))
            .transpose()
    }

    async fn list(
        &self,
        kind: &ApiResource,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<Value>, FetchError> {
        let key = key(namespace, "*");
        let mut params = ListParams::default();
        if let Some(selector) = label_selector {
            params = params.labels(selector);
        }
        let api = self.api(kind, namespace);
        self.call(&kind.kind, key.clone(), api.list(&params))
            .await?
            .items
            .into_iter()
            .map(|obj| to_value(kind, &key, obj))
            .collect()
    }
}

#[async_trait::async_trait]
impl RoleBindingIndex for KubeStore {
    async fn role_bindings(&self, namespace: Option<&str>) -> Result<Vec<RoleBinding>, FetchError> {
        let api = match namespace {
            Some(ns) => Api::<RoleBinding>::namespaced(self.client.clone(), ns),
            None => Api::<RoleBinding>::all(self.client.clone()),
        };
        let list = self
            .call(
                "RoleBinding",
                key(namespace, "*"),
                api.list(&ListParams::default()),
            )
            .await?;
        Ok(list.items)
    }

    async fn cluster_role_bindings(&self) -> Result<Vec<ClusterRoleBinding>, FetchError> {
        let api = Api::<ClusterRoleBinding>::all(self.client.clone());
        let list = self
            .call(
                "ClusterRoleBinding",
                "*".to_string(),
                api.list(&ListParams::default()),
            )
            .await?;
        Ok(list.items)
    }
}
