use crate::core::{
    allow_list::{AllowListError, AllowListMatcher},
    pipeline::Handler,
    policy::{
        FairUseRatio, LoadBalancerAnnotations, NamespaceMetadata, NamespaceQuota, NodeSelector,
        NodeSelectors, Organization, ReservedNames,
    },
    quantity::{self, QuantityError},
    skip::{
        MultiSkipper, NonOrganizationNamespaceSkipper, PrivilegedIdentities,
        PrivilegedIdentitySkipper, Skipper,
    },
    store::{ObjectReader, RoleBindingIndex},
    wildcard::{WildcardError, WildcardList},
    QuotaOverrideResolver,
};
use serde::Deserialize;
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;

/// The policy configuration file.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct Config {
    pub organization_label: String,
    pub default_organization_annotation: String,

    pub privileged_groups: Vec<String>,
    pub privileged_users: Vec<String>,
    /// Globs over `<namespace>:<role>`.
    pub privileged_roles: Vec<String>,
    pub privileged_cluster_roles: Vec<String>,

    pub allowed_namespace_labels: Vec<String>,
    pub allowed_namespace_annotations: Vec<String>,
    pub namespace_label_value_rules: Vec<LabelValueRule>,
    pub quota_override_prefix: Option<String>,

    pub default_node_selector: BTreeMap<String, String>,
    pub node_class_label: Option<String>,
    pub node_selectors_by_class: BTreeMap<String, BTreeMap<String, String>>,

    pub default_namespace_quota: usize,
    pub namespace_quota_override_namespace: Option<String>,

    pub memory_per_core_limit: String,

    pub reserved_names: Vec<ReservedNamesRule>,

    pub protected_load_balancer_annotations: Vec<String>,
}

/// A pair of regular expressions a changed namespace label must match.
#[derive(Clone, Debug, Deserialize)]
pub struct LabelValueRule {
    pub key: String,
    pub value: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ReservedNamesRule {
    pub kind: String,
    pub names: Vec<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid {field}: {source}")]
    Wildcard {
        field: &'static str,
        #[source]
        source: WildcardError,
    },

    #[error("invalid namespaceLabelValueRules: {0}")]
    LabelValue(#[from] AllowListError),

    #[error("invalid memoryPerCoreLimit: {0}")]
    Quantity(#[from] QuantityError),
}

// === impl Config ===

impl Default for Config {
    fn default() -> Self {
        Self {
            organization_label: "appuio.io/organization".to_string(),
            default_organization_annotation: "appuio.io/default-organization".to_string(),
            privileged_groups: Vec::new(),
            privileged_users: Vec::new(),
            privileged_roles: Vec::new(),
            privileged_cluster_roles: Vec::new(),
            allowed_namespace_labels: Vec::new(),
            allowed_namespace_annotations: Vec::new(),
            namespace_label_value_rules: Vec::new(),
            quota_override_prefix: None,
            default_node_selector: BTreeMap::new(),
            node_class_label: None,
            node_selectors_by_class: BTreeMap::new(),
            default_namespace_quota: 25,
            namespace_quota_override_namespace: None,
            memory_per_core_limit: "4Gi".to_string(),
            reserved_names: Vec::new(),
            protected_load_balancer_annotations: Vec::new(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let yaml = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&yaml)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Compiles every policy. Fails on the first invalid pattern or quantity.
    pub fn policies(
        &self,
        reader: Arc<dyn ObjectReader>,
        bindings: Arc<dyn RoleBindingIndex>,
    ) -> Result<Vec<Arc<dyn Handler>>, ConfigError> {
        let privileged: Arc<dyn Skipper> = Arc::new(PrivilegedIdentitySkipper::new(
            Arc::new(PrivilegedIdentities {
                groups: globs("privilegedGroups", &self.privileged_groups)?,
                users: globs("privilegedUsers", &self.privileged_users)?,
                roles: globs("privilegedRoles", &self.privileged_roles)?,
                cluster_roles: globs("privilegedClusterRoles", &self.privileged_cluster_roles)?,
            }),
            bindings,
        ));
        let privileged_or_non_org: Arc<dyn Skipper> = Arc::new(MultiSkipper::new(vec![
            privileged.clone(),
            Arc::new(NonOrganizationNamespaceSkipper::new(
                reader.clone(),
                &self.organization_label,
            )) as Arc<dyn Skipper>,
        ]));

        let mut metadata = NamespaceMetadata::new(
            privileged.clone(),
            globs("allowedNamespaceLabels", &self.allowed_namespace_labels)?,
            globs(
                "allowedNamespaceAnnotations",
                &self.allowed_namespace_annotations,
            )?,
        );
        if !self.namespace_label_value_rules.is_empty() {
            let mut matcher = AllowListMatcher::default();
            for LabelValueRule { key, value } in &self.namespace_label_value_rules {
                matcher.add(key, value)?;
            }
            metadata = metadata.with_label_values(matcher);
        }
        if let Some(prefix) = &self.quota_override_prefix {
            metadata = metadata.with_quota_overrides(QuotaOverrideResolver::new(prefix.as_str()));
        }

        let mut quota = NamespaceQuota::new(
            privileged.clone(),
            reader.clone(),
            &self.organization_label,
            self.default_namespace_quota,
        );
        if let Some(ns) = &self.namespace_quota_override_namespace {
            quota = quota.with_overrides(ns.as_str());
        }

        let reserved = self
            .reserved_names
            .iter()
            .map(|ReservedNamesRule { kind, names }| {
                globs("reservedNames", names).map(|globs| (kind.clone(), globs))
            })
            .collect::<Result<BTreeMap<_, _>, _>>()?;

        let policies: Vec<Arc<dyn Handler>> = vec![
            Arc::new(metadata),
            Arc::new(Organization::new(
                privileged.clone(),
                reader.clone(),
                &self.organization_label,
                &self.default_organization_annotation,
            )),
            Arc::new(NodeSelector::new(
                privileged_or_non_org.clone(),
                reader.clone(),
                NodeSelectors {
                    default: self.default_node_selector.clone(),
                    class_label: self.node_class_label.clone(),
                    by_class: self.node_selectors_by_class.clone(),
                },
            )),
            Arc::new(quota),
            Arc::new(FairUseRatio::new(
                privileged_or_non_org,
                reader,
                quantity::parse(&self.memory_per_core_limit)?,
            )),
            Arc::new(ReservedNames::new(privileged.clone(), reserved)),
            Arc::new(LoadBalancerAnnotations::new(
                privileged,
                globs(
                    "protectedLoadBalancerAnnotations",
                    &self.protected_load_balancer_annotations,
                )?,
            )),
        ];
        Ok(policies)
    }
}

fn globs(field: &'static str, patterns: &[String]) -> Result<WildcardList, ConfigError> {
    WildcardList::new(patterns.iter().map(String::as_str))
        .map_err(|source| ConfigError::Wildcard { field, source })
}
