use crate::{
    decision::Verdict,
    patch::PatchOperation,
    pipeline::{Objects, Policy},
    request::{Operation, RequestDescriptor},
    skip::Skipper,
    store::{self, ObjectReader},
};
use anyhow::Result;
use k8s_openapi::api::core::v1::{Namespace, Pod};
use serde_json::Value;
use std::{collections::BTreeMap, sync::Arc};
use tracing::debug;

/// Default node selectors, optionally chosen by a namespace label.
#[derive(Clone, Debug, Default)]
pub struct NodeSelectors {
    pub default: BTreeMap<String, String>,
    /// The namespace label whose value picks an entry of `by_class`.
    pub class_label: Option<String>,
    pub by_class: BTreeMap<String, BTreeMap<String, String>>,
}

/// Adds default node selectors to new pods.
pub struct NodeSelector {
    skipper: Arc<dyn Skipper>,
    reader: Arc<dyn ObjectReader>,
    selectors: NodeSelectors,
}

impl NodeSelector {
    pub fn new(
        skipper: Arc<dyn Skipper>,
        reader: Arc<dyn ObjectReader>,
        selectors: NodeSelectors,
    ) -> Self {
        Self {
            skipper,
            reader,
            selectors,
        }
    }

    async fn selector_for(&self, namespace: &str) -> Result<&BTreeMap<String, String>> {
        let NodeSelectors {
            default,
            class_label,
            by_class,
        } = &self.selectors;
        let Some(class_label) = class_label else {
            return Ok(default);
        };

        let ns = store::require::<Namespace>(&*self.reader, None, namespace).await?;
        let class = ns.metadata.labels.as_ref().and_then(|l| l.get(class_label));
        match class.and_then(|c| by_class.get(c)) {
            Some(selector) => Ok(selector),
            None => {
                debug!(ns = %namespace, ?class, "Using default node selector");
                Ok(default)
            }
        }
    }
}

#[async_trait::async_trait]
impl Policy for NodeSelector {
    type Object = Pod;

    fn name(&self) -> &'static str {
        "node-selector"
    }

    fn skipper(&self) -> &dyn Skipper {
        &*self.skipper
    }

    async fn decide(&self, req: &RequestDescriptor, objects: Objects<Pod>) -> Result<Verdict> {
        if req.operation != Operation::Create {
            return Ok(Verdict::allow("node selectors are only defaulted on creation"));
        }
        let Some(pod) = objects.new.as_ref() else {
            return Ok(Verdict::allow("no pod"));
        };

        let selector = self.selector_for(&req.namespace).await?;
        let existing = pod.spec.as_ref().and_then(|s| s.node_selector.as_ref());

        let missing = selector
            .iter()
            .filter(|(k, _)| existing.map_or(true, |e| !e.contains_key(*k)))
            .collect::<Vec<_>>();
        if missing.is_empty() {
            return Ok(Verdict::allow("node selector is complete"));
        }

        let ops = match existing {
            None => {
                let map = missing
                    .iter()
                    .map(|(k, v)| (k.to_string(), Value::from(v.as_str())))
                    .collect::<serde_json::Map<_, _>>();
                vec![PatchOperation::add(&["spec", "nodeSelector"], map)]
            }
            Some(_) => missing
                .iter()
                .map(|(k, v)| {
                    PatchOperation::add(&["spec", "nodeSelector", k.as_str()], v.as_str())
                })
                .collect(),
        };
        Ok(Verdict::patch("added default node selector", ops))
    }
}
