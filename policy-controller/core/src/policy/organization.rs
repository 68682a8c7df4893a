use super::label;
use crate::{
    decision::Verdict,
    patch::PatchOperation,
    pipeline::{Objects, Policy},
    request::{Operation, RequestDescriptor},
    skip::Skipper,
    store::{self, ObjectReader},
};
use anyhow::Result;
use k8s_openapi::api::core::v1::Namespace;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// Ensures every namespace belongs to an organization the caller is a member
/// of, defaulting it from the caller's `User` object.
pub struct Organization {
    skipper: Arc<dyn Skipper>,
    reader: Arc<dyn ObjectReader>,
    label: String,
    default_annotation: String,
}

impl Organization {
    pub fn new(
        skipper: Arc<dyn Skipper>,
        reader: Arc<dyn ObjectReader>,
        label: impl Into<String>,
        default_annotation: impl Into<String>,
    ) -> Self {
        Self {
            skipper,
            reader,
            label: label.into(),
            default_annotation: default_annotation.into(),
        }
    }

    async fn default_organization(&self, username: &str) -> Result<Option<String>> {
        let Some(user) = self
            .reader
            .get(&store::user_resource(), None, username)
            .await?
        else {
            debug!(%username, "No User object");
            return Ok(None);
        };
        Ok(user
            .pointer("/metadata/annotations")
            .and_then(|a| a.get(&self.default_annotation))
            .and_then(Value::as_str)
            .filter(|org| !org.is_empty())
            .map(str::to_string))
    }
}

#[async_trait::async_trait]
impl Policy for Organization {
    type Object = Namespace;

    fn name(&self) -> &'static str {
        "organization"
    }

    fn skipper(&self) -> &dyn Skipper {
        &*self.skipper
    }

    async fn decide(
        &self,
        req: &RequestDescriptor,
        objects: Objects<Namespace>,
    ) -> Result<Verdict> {
        let Some(ns) = objects.new.as_ref() else {
            return Ok(Verdict::allow("deletion"));
        };
        let user = &req.user;

        let old_org = label(objects.old.as_ref(), &self.label);
        let new_org = label(Some(ns), &self.label);

        if req.operation == Operation::Update {
            if let Some(old_org) = old_org {
                if new_org != Some(old_org) {
                    return Ok(Verdict::deny(format!(
                        "the organization of a namespace cannot be changed: {} was {old_org:?}, is {:?}",
                        self.label,
                        new_org.unwrap_or_default(),
                    )));
                }
                return Ok(Verdict::allow("organization unchanged"));
            }
        }

        if let Some(org) = new_org {
            if !user.is_member_of(org) {
                return Ok(Verdict::deny(format!(
                    "user {user} is not a member of organization {org:?}"
                )));
            }
            return Ok(Verdict::allow(format!("user is a member of {org}")));
        }

        // Only new namespaces are assigned a default organization.
        if req.operation != Operation::Create {
            return Ok(Verdict::allow("namespace has no organization"));
        }

        let Some(org) = self.default_organization(&user.username).await? else {
            return Ok(Verdict::deny(format!(
                "namespace has no {} label and user {user} has no default organization",
                self.label
            )));
        };
        if !user.is_member_of(&org) {
            return Ok(Verdict::deny(format!(
                "user {user} is not a member of default organization {org:?}"
            )));
        }

        let mut ops = Vec::with_capacity(2);
        if ns.metadata.labels.is_none() {
            ops.push(PatchOperation::add(
                &["metadata", "labels"],
                Value::Object(Default::default()),
            ));
        }
        ops.push(PatchOperation::add(
            &["metadata", "labels", self.label.as_str()],
            org.clone(),
        ));
        Ok(Verdict::patch(format!("defaulted organization to {org}"), ops))
    }
}
