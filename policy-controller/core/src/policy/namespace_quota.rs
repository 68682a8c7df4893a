use super::label;
use crate::{
    decision::Verdict,
    pipeline::{Objects, Policy},
    request::{Operation, RequestDescriptor},
    skip::Skipper,
    store::{self, ObjectReader},
};
use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::{ConfigMap, Namespace};
use std::sync::Arc;

const OVERRIDE_PREFIX: &str = "override-";
const OVERRIDE_KEY: &str = "namespaceQuota";

/// Limits the number of namespaces per organization.
pub struct NamespaceQuota {
    skipper: Arc<dyn Skipper>,
    reader: Arc<dyn ObjectReader>,
    organization_label: String,
    default_quota: usize,
    /// Holds `override-<organization>` ConfigMaps.
    override_namespace: Option<String>,
}

impl NamespaceQuota {
    pub fn new(
        skipper: Arc<dyn Skipper>,
        reader: Arc<dyn ObjectReader>,
        organization_label: impl Into<String>,
        default_quota: usize,
    ) -> Self {
        Self {
            skipper,
            reader,
            organization_label: organization_label.into(),
            default_quota,
            override_namespace: None,
        }
    }

    pub fn with_overrides(mut self, namespace: impl Into<String>) -> Self {
        self.override_namespace = Some(namespace.into());
        self
    }

    async fn quota(&self, org: &str) -> Result<usize> {
        let Some(ns) = self.override_namespace.as_deref() else {
            return Ok(self.default_quota);
        };
        let name = format!("{OVERRIDE_PREFIX}{org}");
        let Some(cm) = store::get::<ConfigMap>(&*self.reader, Some(ns), &name).await? else {
            return Ok(self.default_quota);
        };
        match cm.data.as_ref().and_then(|d| d.get(OVERRIDE_KEY)) {
            Some(value) => value
                .trim()
                .parse::<usize>()
                .with_context(|| format!("invalid {OVERRIDE_KEY} {value:?} in {ns}/{name}")),
            None => Ok(self.default_quota),
        }
    }
}

#[async_trait::async_trait]
impl Policy for NamespaceQuota {
    type Object = Namespace;

    fn name(&self) -> &'static str {
        "namespace-quota"
    }

    fn skipper(&self) -> &dyn Skipper {
        &*self.skipper
    }

    async fn decide(
        &self,
        req: &RequestDescriptor,
        objects: Objects<Namespace>,
    ) -> Result<Verdict> {
        if req.operation != Operation::Create {
            return Ok(Verdict::allow("only creations count against the quota"));
        }
        let Some(org) = label(objects.new.as_ref(), &self.organization_label) else {
            return Ok(Verdict::allow("namespace belongs to no organization"));
        };

        let selector = format!("{}={org}", self.organization_label);
        let count = store::list::<Namespace>(&*self.reader, None, Some(&selector))
            .await?
            .len();
        let quota = self.quota(org).await?;

        if count >= quota {
            return Ok(Verdict::deny(format!(
                "organization {org:?} already has {count} namespaces and may not have more than {quota}; contact support to raise the quota"
            )));
        }
        Ok(Verdict::allow(format!("{count} of {quota} namespaces used")))
    }
}
