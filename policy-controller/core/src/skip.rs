//! Predicates deciding whether a policy is bypassed for a request.

use crate::{
    request::{RequestDescriptor, UserInfo},
    store::{self, ObjectReader, RoleBindingIndex},
    wildcard::WildcardList,
};
use anyhow::Result;
use k8s_openapi::api::{core::v1::Namespace, rbac::v1::Subject};
use std::sync::Arc;
use tracing::debug;

const SERVICE_ACCOUNT_PREFIX: &str = "system:serviceaccount:";

#[async_trait::async_trait]
pub trait Skipper: Send + Sync {
    async fn skip(&self, req: &RequestDescriptor) -> Result<bool>;
}

/// Always returns the same answer.
#[derive(Copy, Clone, Debug)]
pub struct StaticSkipper(pub bool);

/// Skips if any child skips. Stops at the first child that skips or fails.
#[derive(Clone, Default)]
pub struct MultiSkipper(Vec<Arc<dyn Skipper>>);

/// Skips requests from privileged users, groups or role holders.
#[derive(Clone)]
pub struct PrivilegedIdentitySkipper {
    privileged: Arc<PrivilegedIdentities>,
    bindings: Arc<dyn RoleBindingIndex>,
}

/// Glob lists describing privileged callers.
#[derive(Clone, Debug, Default)]
pub struct PrivilegedIdentities {
    pub groups: WildcardList,
    pub users: WildcardList,
    /// Matched against `<namespace>:<role>`.
    pub roles: WildcardList,
    pub cluster_roles: WildcardList,
}

/// Skips requests targeting namespaces that belong to no organization.
#[derive(Clone)]
pub struct NonOrganizationNamespaceSkipper {
    reader: Arc<dyn ObjectReader>,
    organization_label: String,
}

// === impl StaticSkipper ===

#[async_trait::async_trait]
impl Skipper for StaticSkipper {
    async fn skip(&self, _: &RequestDescriptor) -> Result<bool> {
        Ok(self.0)
    }
}

// === impl MultiSkipper ===

impl MultiSkipper {
    pub fn new(skippers: Vec<Arc<dyn Skipper>>) -> Self {
        Self(skippers)
    }

    pub fn push(mut self, skipper: impl Skipper + 'static) -> Self {
        self.0.push(Arc::new(skipper));
        self
    }
}

#[async_trait::async_trait]
impl Skipper for MultiSkipper {
    async fn skip(&self, req: &RequestDescriptor) -> Result<bool> {
        for skipper in &self.0 {
            if skipper.skip(req).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

// === impl PrivilegedIdentitySkipper ===

impl PrivilegedIdentitySkipper {
    pub fn new(privileged: Arc<PrivilegedIdentities>, bindings: Arc<dyn RoleBindingIndex>) -> Self {
        Self {
            privileged,
            bindings,
        }
    }

    async fn holds_privileged_cluster_role(&self, user: &UserInfo) -> Result<bool> {
        if self.privileged.cluster_roles.is_empty() {
            return Ok(false);
        }
        let crbs = self.bindings.cluster_role_bindings().await?;
        Ok(crbs.iter().any(|crb| {
            binds(crb.subjects.as_deref(), user)
                && self.privileged.cluster_roles.matches(&crb.role_ref.name)
        }))
    }

    async fn holds_privileged_role(&self, user: &UserInfo, namespace: &str) -> Result<bool> {
        if self.privileged.roles.is_empty() {
            return Ok(false);
        }
        let namespace = (!namespace.is_empty()).then_some(namespace);
        let rbs = self.bindings.role_bindings(namespace).await?;
        Ok(rbs.iter().any(|rb| {
            let ns = rb.metadata.namespace.as_deref().unwrap_or_default();
            binds(rb.subjects.as_deref(), user)
                && self
                    .privileged
                    .roles
                    .matches(&format!("{ns}:{}", rb.role_ref.name))
        }))
    }
}

#[async_trait::async_trait]
impl Skipper for PrivilegedIdentitySkipper {
    async fn skip(&self, req: &RequestDescriptor) -> Result<bool> {
        let user = &req.user;
        if user.groups.iter().any(|g| self.privileged.groups.matches(g)) {
            debug!(%user, "Privileged group");
            return Ok(true);
        }
        if self.privileged.users.matches(&user.username) {
            debug!(%user, "Privileged user");
            return Ok(true);
        }
        if self.holds_privileged_cluster_role(user).await? {
            debug!(%user, "Privileged cluster role");
            return Ok(true);
        }
        if self.holds_privileged_role(user, &req.namespace).await? {
            debug!(%user, ns = %req.namespace, "Privileged role");
            return Ok(true);
        }
        Ok(false)
    }
}

/// Whether any subject refers to the caller, either by username, by group
/// membership or as the service account encoded in the username.
fn binds(subjects: Option<&[Subject]>, user: &UserInfo) -> bool {
    let service_account = user
        .username
        .strip_prefix(SERVICE_ACCOUNT_PREFIX)
        .and_then(|sa| sa.split_once(':'));

    subjects.into_iter().flatten().any(|s| match s.kind.as_str() {
        "User" => s.name == user.username,
        "Group" => user.is_member_of(&s.name),
        "ServiceAccount" => service_account
            .map_or(false, |(ns, name)| s.namespace.as_deref() == Some(ns) && s.name == name),
        _ => false,
    })
}

// === impl NonOrganizationNamespaceSkipper ===

impl NonOrganizationNamespaceSkipper {
    pub fn new(reader: Arc<dyn ObjectReader>, organization_label: impl Into<String>) -> Self {
        Self {
            reader,
            organization_label: organization_label.into(),
        }
    }
}

#[async_trait::async_trait]
impl Skipper for NonOrganizationNamespaceSkipper {
    async fn skip(&self, req: &RequestDescriptor) -> Result<bool> {
        // A missing namespace is unexpected here and must not be skipped.
        let ns = store::require::<Namespace>(&*self.reader, None, &req.namespace).await?;
        let org = ns
            .metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(&self.organization_label))
            .map_or("", String::as_str);
        Ok(org.is_empty())
    }
}
