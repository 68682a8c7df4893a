//! Admission policies, each evaluated through [`crate::pipeline::handle`].

mod fair_use;
mod load_balancer;
mod namespace_metadata;
mod namespace_quota;
mod node_selector;
mod organization;
mod reserved_names;

pub use self::{
    fair_use::{FairUseRatio, Workload},
    load_balancer::LoadBalancerAnnotations,
    namespace_metadata::NamespaceMetadata,
    namespace_quota::NamespaceQuota,
    node_selector::{NodeSelector, NodeSelectors},
    organization::Organization,
    reserved_names::ReservedNames,
};

use kube::Resource;
use std::collections::BTreeMap;

fn labels<K: Resource>(obj: Option<&K>) -> BTreeMap<String, String> {
    obj.and_then(|o| o.meta().labels.clone()).unwrap_or_default()
}

fn annotations<K: Resource>(obj: Option<&K>) -> BTreeMap<String, String> {
    obj.and_then(|o| o.meta().annotations.clone())
        .unwrap_or_default()
}

/// Returns the value of `key`, treating an empty value as absent.
fn label<'o, K: Resource>(obj: Option<&'o K>, key: &str) -> Option<&'o str> {
    obj?.meta()
        .labels
        .as_ref()?
        .get(key)
        .map(String::as_str)
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
pub(crate) mod test_util {
    use crate::request::{Operation, RequestDescriptor, UserInfo};
    use k8s_openapi::{api::core::v1::Namespace, apimachinery::pkg::apis::meta::v1::ObjectMeta};
    use kube::Resource;
    use serde::Serialize;
    use std::collections::BTreeMap;

    pub const ORG_LABEL: &str = "appuio.io/organization";

    pub fn request<K>(op: Operation, old: Option<&K>, new: Option<&K>) -> RequestDescriptor
    where
        K: Resource<DynamicType = ()> + Serialize,
    {
        let meta = new.or(old).map(Resource::meta);
        let name = meta.and_then(|m| m.name.clone()).unwrap_or_default();
        let namespace = match meta.and_then(|m| m.namespace.clone()) {
            Some(ns) => ns,
            None => name.clone(),
        };
        RequestDescriptor {
            user: UserInfo::new("alice", ["acme"]),
            namespace,
            name,
            kind: K::kind(&()).to_string(),
            operation: op,
            old_object: old.map(to_value),
            object: new.map(to_value),
        }
    }

    fn to_value<K: Serialize>(obj: &K) -> serde_json::Value {
        serde_json::to_value(obj).expect("object must serialize")
    }

    pub fn namespace(name: &str, labels: BTreeMap<String, String>) -> Namespace {
        Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: if labels.is_empty() { None } else { Some(labels) },
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn org_namespace(name: &str, org: &str) -> Namespace {
        namespace(
            name,
            maplit::btreemap! { ORG_LABEL.to_string() => org.to_string() },
        )
    }
}
