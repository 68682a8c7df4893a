use crate::{
    decision::Verdict,
    pipeline::{Objects, Policy},
    ratio::Ratio,
    request::{DecodeError, Operation, RequestDescriptor},
    skip::Skipper,
    store::{self, ObjectReader},
};
use anyhow::Result;
use bigdecimal::BigDecimal;
use k8s_openapi::api::{
    apps::v1::{Deployment, StatefulSet},
    core::v1::Pod,
};
use kube::ResourceExt;
use serde::{de, Deserialize, Deserializer};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// Warns when a namespace requests too little memory per CPU core.
pub struct FairUseRatio {
    skipper: Arc<dyn Skipper>,
    reader: Arc<dyn ObjectReader>,
    /// Minimum memory bytes per requested core.
    limit: BigDecimal,
}

/// A workload whose requests count towards the ratio.
#[derive(Clone, Debug)]
pub enum Workload {
    Pod(Box<Pod>),
    Deployment(Box<Deployment>),
    StatefulSet(Box<StatefulSet>),
}

impl FairUseRatio {
    pub fn new(
        skipper: Arc<dyn Skipper>,
        reader: Arc<dyn ObjectReader>,
        limit: BigDecimal,
    ) -> Self {
        Self {
            skipper,
            reader,
            limit,
        }
    }
}

#[async_trait::async_trait]
impl Policy for FairUseRatio {
    type Object = Workload;

    fn name(&self) -> &'static str {
        "fair-use-ratio"
    }

    fn skipper(&self) -> &dyn Skipper {
        &*self.skipper
    }

    async fn decide(
        &self,
        req: &RequestDescriptor,
        objects: Objects<Workload>,
    ) -> Result<Verdict> {
        if req.operation == Operation::Delete {
            return Ok(Verdict::allow("deletions free resources"));
        }
        let Some(workload) = objects.new.as_ref() else {
            return Ok(Verdict::allow("no workload"));
        };

        let mut ratio = Ratio::default();
        let pods = store::list::<Pod>(&*self.reader, Some(&req.namespace), None).await?;
        for pod in &pods {
            // Pods of the workload under review are recorded from the request.
            if workload.owns(&req.name, pod) {
                continue;
            }
            ratio.record_pod(pod)?;
        }

        let recorded = match workload {
            Workload::Pod(pod) => match pod.spec.as_ref() {
                Some(spec) => ratio.record_pod_spec(1, spec),
                None => Ok(()),
            },
            Workload::Deployment(deploy) => ratio.record_deployment(deploy),
            Workload::StatefulSet(sts) => ratio.record_stateful_set(sts),
        };
        recorded.map_err(|source| DecodeError::Quantity {
            field: "object",
            source,
        })?;

        debug!(ns = %req.namespace, pods = pods.len(), %ratio, "Computed memory to CPU ratio");
        if ratio.is_below(&self.limit) {
            return Ok(Verdict::warn(
                format!("ratio {ratio} is below the fair use limit"),
                ratio.render_warning(Some(&self.limit)),
            ));
        }
        Ok(Verdict::allow(format!("ratio {ratio}")))
    }
}

// === impl Workload ===

impl Workload {
    /// Whether `pod` is (a replica of) this workload.
    ///
    /// Replicated workloads own the pods matched by their selector's
    /// `matchLabels`. A selector without `matchLabels` claims nothing.
    fn owns(&self, name: &str, pod: &Pod) -> bool {
        let selector = match self {
            Self::Pod(_) => return pod.name_any() == name,
            Self::Deployment(deploy) => deploy.spec.as_ref().map(|s| &s.selector),
            Self::StatefulSet(sts) => sts.spec.as_ref().map(|s| &s.selector),
        };
        let Some(match_labels) = selector
            .and_then(|s| s.match_labels.as_ref())
            .filter(|l| !l.is_empty())
        else {
            return false;
        };
        let labels = pod.metadata.labels.as_ref();
        match_labels
            .iter()
            .all(|(k, v)| labels.and_then(|l| l.get(k)) == Some(v))
    }
}

impl<'de> Deserialize<'de> for Workload {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        let kind = value
            .get("kind")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let workload = match kind.as_str() {
            "Pod" => serde_json::from_value(value).map(|p| Self::Pod(Box::new(p))),
            "Deployment" => serde_json::from_value(value).map(|d| Self::Deployment(Box::new(d))),
            "StatefulSet" => serde_json::from_value(value).map(|s| Self::StatefulSet(Box::new(s))),
            kind => return Err(de::Error::custom(format!("unsupported workload kind {kind:?}"))),
        };
        workload.map_err(de::Error::custom)
    }
}
