use super::{annotations, labels};
use crate::{
    aggregate::Errors,
    allow_list::AllowListMatcher,
    decision::Verdict,
    pipeline::{Objects, Policy},
    quota_override::{self, QuotaOverrideResolver},
    request::{Operation, RequestDescriptor},
    skip::Skipper,
    wildcard::{self, WildcardList},
};
use anyhow::{anyhow, Result};
use k8s_openapi::api::core::v1::Namespace;
use std::{collections::BTreeMap, sync::Arc};

/// Restricts which namespace labels and annotations callers may change.
pub struct NamespaceMetadata {
    skipper: Arc<dyn Skipper>,
    allowed_labels: WildcardList,
    allowed_annotations: WildcardList,
    label_values: Option<AllowListMatcher>,
    quota_overrides: Option<QuotaOverrideResolver>,
}

impl NamespaceMetadata {
    pub fn new(
        skipper: Arc<dyn Skipper>,
        allowed_labels: WildcardList,
        allowed_annotations: WildcardList,
    ) -> Self {
        Self {
            skipper,
            allowed_labels,
            allowed_annotations,
            label_values: None,
            quota_overrides: None,
        }
    }

    /// Additionally requires every changed label to match a key/value rule.
    pub fn with_label_values(mut self, matcher: AllowListMatcher) -> Self {
        self.label_values = Some(matcher);
        self
    }

    /// Additionally requires changed quota override annotations to resolve
    /// to valid quantities.
    pub fn with_quota_overrides(mut self, resolver: QuotaOverrideResolver) -> Self {
        self.quota_overrides = Some(resolver);
        self
    }
}

#[async_trait::async_trait]
impl Policy for NamespaceMetadata {
    type Object = Namespace;

    fn name(&self) -> &'static str {
        "namespace-metadata"
    }

    fn skipper(&self) -> &dyn Skipper {
        &*self.skipper
    }

    async fn decide(
        &self,
        req: &RequestDescriptor,
        objects: Objects<Namespace>,
    ) -> Result<Verdict> {
        if req.operation == Operation::Delete {
            return Ok(Verdict::allow("deletion does not change metadata"));
        }

        let old_labels = labels(objects.old.as_ref());
        let new_labels = labels(objects.new.as_ref());
        let old_annotations = annotations(objects.old.as_ref());
        let new_annotations = annotations(objects.new.as_ref());

        let mut errors = Errors::default();
        errors.collect(
            self.allowed_labels
                .validate_changed_keys(&old_labels, &new_labels)
                .map_err(|e| anyhow!("invalid label change: {e}")),
        );
        errors.collect(
            self.allowed_annotations
                .validate_changed_keys(&old_annotations, &new_annotations)
                .map_err(|e| anyhow!("invalid annotation change: {e}")),
        );

        if let Some(matcher) = &self.label_values {
            errors.extend(matcher.validate_all(&changed(&old_labels, &new_labels)));
        }

        if let Some(resolver) = &self.quota_overrides {
            let (overrides, res) = resolver.resolve(&changed(&old_annotations, &new_annotations));
            errors.extend(res);
            for fields in overrides.values() {
                errors.extend(quota_override::apply(&mut BTreeMap::new(), fields));
            }
        }

        match errors.finish() {
            Ok(()) => Ok(Verdict::allow("namespace metadata changes are allowed")),
            Err(error) => Ok(Verdict::deny(error)),
        }
    }
}

/// Returns the added or modified entries of `new`.
fn changed(
    old: &BTreeMap<String, String>,
    new: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    wildcard::changed_keys(old, new)
        .into_iter()
        .filter_map(|k| new.get_key_value(k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        decision::Decision,
        pipeline::handle,
        policy::test_util::{namespace, request},
        skip::StaticSkipper,
    };
    use maplit::btreemap;

    fn policy() -> NamespaceMetadata {
        NamespaceMetadata::new(
            Arc::new(StaticSkipper(false)),
            WildcardList::new(["appuio.io/organization", "custom/*"]).unwrap(),
            WildcardList::new(["openshift.io/description"]).unwrap(),
        )
    }

    fn ns(labels: BTreeMap<String, String>, annotations: BTreeMap<String, String>) -> Namespace {
        let mut ns = namespace("ns", labels);
        if !annotations.is_empty() {
            ns.metadata.annotations = Some(annotations);
        }
        ns
    }

    #[tokio::test]
    async fn allows_allowed_changes_on_create() {
        let new = ns(
            btreemap! {
                "appuio.io/organization".to_string() => "acme".to_string(),
                "custom/team".to_string() => "a".to_string(),
            },
            btreemap! { "openshift.io/description".to_string() => "hi".to_string() },
        );
        let decision = handle(&policy(), &request(Operation::Create, None, Some(&new))).await;
        assert!(matches!(decision, Decision::Allow { .. }), "{decision}");
    }

    #[tokio::test]
    async fn unchanged_disallowed_keys_are_fine() {
        let labels = btreemap! { "kubernetes.io/metadata.name".to_string() => "ns".to_string() };
        let old = ns(labels.clone(), BTreeMap::new());
        let mut new_labels = labels;
        new_labels.insert("custom/x".to_string(), "y".to_string());
        let new = ns(new_labels, BTreeMap::new());
        let decision = handle(&policy(), &request(Operation::Update, Some(&old), Some(&new))).await;
        assert!(matches!(decision, Decision::Allow { .. }), "{decision}");
    }

    #[tokio::test]
    async fn reports_every_disallowed_change() {
        let old = ns(
            btreemap! { "owner".to_string() => "a".to_string() },
            BTreeMap::new(),
        );
        let new = ns(
            btreemap! { "owner".to_string() => "b".to_string() },
            btreemap! { "secret".to_string() => "x".to_string() },
        );
        let decision = handle(&policy(), &request(Operation::Update, Some(&old), Some(&new))).await;
        match decision {
            Decision::Deny { reason } => {
                assert!(reason.contains("invalid label change"), "{reason}");
                assert!(reason.contains("owner"), "{reason}");
                assert!(reason.contains("invalid annotation change"), "{reason}");
                assert!(reason.contains("secret"), "{reason}");
                assert!(!reason.contains('\n'));
            }
            decision => panic!("unexpected decision: {decision}"),
        }
    }

    #[tokio::test]
    async fn removing_a_key_is_a_change() {
        let old = ns(
            btreemap! { "owner".to_string() => "a".to_string() },
            BTreeMap::new(),
        );
        let new = ns(BTreeMap::new(), BTreeMap::new());
        let decision = handle(&policy(), &request(Operation::Update, Some(&old), Some(&new))).await;
        assert!(matches!(decision, Decision::Deny { .. }), "{decision}");
    }

    #[tokio::test]
    async fn label_values_are_checked() {
        let mut matcher = AllowListMatcher::default();
        matcher.add("custom/.*", "[a-z]+").unwrap();
        matcher.add("appuio.io/organization", ".+").unwrap();
        let policy = policy().with_label_values(matcher);

        let ok = ns(
            btreemap! { "custom/team".to_string() => "blue".to_string() },
            BTreeMap::new(),
        );
        let decision = handle(&policy, &request(Operation::Create, None, Some(&ok))).await;
        assert!(matches!(decision, Decision::Allow { .. }), "{decision}");

        let bad = ns(
            btreemap! { "custom/team".to_string() => "Blue42".to_string() },
            BTreeMap::new(),
        );
        let decision = handle(&policy, &request(Operation::Create, None, Some(&bad))).await;
        assert!(
            matches!(decision, Decision::Deny { ref reason } if reason.contains("Blue42")),
            "{decision}"
        );
    }

    #[tokio::test]
    async fn quota_overrides_must_resolve() {
        let policy = NamespaceMetadata::new(
            Arc::new(StaticSkipper(false)),
            WildcardList::default(),
            WildcardList::new(["resourcequota.appuio.io/*"]).unwrap(),
        )
        .with_quota_overrides(QuotaOverrideResolver::new("resourcequota.appuio.io"));

        let ok = ns(
            BTreeMap::new(),
            btreemap! {
                "resourcequota.appuio.io/compute.limits.cpu".to_string() => "8".to_string(),
            },
        );
        let decision = handle(&policy, &request(Operation::Create, None, Some(&ok))).await;
        assert!(matches!(decision, Decision::Allow { .. }), "{decision}");

        let bad = ns(
            BTreeMap::new(),
            btreemap! {
                "resourcequota.appuio.io/compute.limits.cpu".to_string() => "lots".to_string(),
                "resourcequota.appuio.io/storage".to_string() => "1".to_string(),
            },
        );
        let decision = handle(&policy, &request(Operation::Create, None, Some(&bad))).await;
        match decision {
            Decision::Deny { reason } => {
                assert!(reason.contains("limits.cpu"), "{reason}");
                assert!(reason.contains("resourcequota.appuio.io/storage"), "{reason}");
            }
            decision => panic!("unexpected decision: {decision}"),
        }
    }
}
