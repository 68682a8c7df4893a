use crate::{
    aggregate::{AggregateError, Errors},
    quantity,
};
use anyhow::anyhow;
use k8s_openapi::{
    api::core::v1::{ResourceQuota, ResourceQuotaSpec},
    apimachinery::pkg::api::resource::Quantity,
};
use kube::ResourceExt;
use std::collections::BTreeMap;

const STORAGE_CLASSES_KEY: &str = "storageclasses";
const STORAGE_CLASS_RESOURCE: &str = "storageclass.storage.k8s.io";

/// Reads quota overrides from annotations of the form
/// `<prefix>/<quota-name>.<field>`.
///
/// Underscores in `<field>` stand in for slashes, e.g.
/// `<prefix>/compute.requests.nvidia.com_gpu`. The reserved field
/// `storageclasses` holds a JSON object of storage-class scoped limits.
#[derive(Clone, Debug)]
pub struct QuotaOverrideResolver {
    prefix: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldOverride {
    pub resource: String,
    pub value: String,
}

/// Overrides grouped by the name of the quota they apply to.
pub type Overrides = BTreeMap<String, Vec<FieldOverride>>;

// === impl QuotaOverrideResolver ===

impl QuotaOverrideResolver {
    pub fn new(prefix: impl Into<String>) -> Self {
        let mut prefix = prefix.into();
        if !prefix.ends_with('/') {
            prefix.push('/');
        }
        Self { prefix }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Resolves all overrides in `annotations`.
    ///
    /// Malformed annotations are skipped and reported in the returned error;
    /// they never prevent other annotations from resolving.
    pub fn resolve(
        &self,
        annotations: &BTreeMap<String, String>,
    ) -> (Overrides, Result<(), AggregateError>) {
        let mut overrides = Overrides::new();
        let mut errors = Errors::default();

        for (key, value) in annotations {
            let Some(stripped) = key.strip_prefix(&self.prefix) else {
                continue;
            };
            let Some((object, field)) = stripped.split_once('.') else {
                errors.push(anyhow!(
                    "invalid quota override key {key:?}: expected <name>.<resource>"
                ));
                continue;
            };

            if field == STORAGE_CLASSES_KEY {
                let classes = match serde_json::from_str::<BTreeMap<String, String>>(value) {
                    Ok(classes) => classes,
                    Err(error) => {
                        errors.push(anyhow!(
                            "invalid storage class quota override {key:?}: {error}"
                        ));
                        continue;
                    }
                };
                let fields = overrides.entry(object.to_string()).or_default();
                fields.extend(
                    classes
                        .into_iter()
                        .filter(|(resource, _)| resource.contains(STORAGE_CLASS_RESOURCE))
                        .map(|(resource, value)| FieldOverride { resource, value }),
                );
                continue;
            }

            overrides
                .entry(object.to_string())
                .or_default()
                .push(FieldOverride {
                    resource: field.replace('_', "/"),
                    value: value.clone(),
                });
        }

        overrides.retain(|_, fields| !fields.is_empty());
        (overrides, errors.finish())
    }
}

/// Applies overrides to a quota's hard limits.
///
/// Values that are not valid quantities are reported but do not stop the
/// remaining overrides from applying. Resources without an override keep
/// their current limit.
pub fn apply(
    hard: &mut BTreeMap<String, Quantity>,
    fields: &[FieldOverride],
) -> Result<(), AggregateError> {
    let mut errors = Errors::default();
    for FieldOverride { resource, value } in fields {
        match quantity::parse(value) {
            Ok(_) => {
                hard.insert(resource.clone(), Quantity(value.clone()));
            }
            Err(error) => errors.push(anyhow!("failed to override {resource}: {error}")),
        }
    }
    errors.finish()
}

/// Applies resolved overrides to every quota they name. Quotas without
/// overrides are left untouched.
pub fn apply_to_quotas(
    quotas: &mut [ResourceQuota],
    overrides: &Overrides,
) -> Result<(), AggregateError> {
    let mut errors = Errors::default();
    for quota in quotas.iter_mut() {
        let Some(fields) = overrides.get(&quota.name_any()) else {
            continue;
        };
        let spec = quota.spec.get_or_insert_with(ResourceQuotaSpec::default);
        let hard = spec.hard.get_or_insert_with(BTreeMap::new);
        errors.extend(apply(hard, fields));
    }
    errors.finish()
}
