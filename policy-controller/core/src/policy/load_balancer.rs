use super::annotations;
use crate::{
    aggregate::Errors,
    decision::Verdict,
    pipeline::{Objects, Policy},
    request::{Operation, RequestDescriptor},
    skip::Skipper,
    wildcard::{self, WildcardList},
};
use anyhow::{anyhow, Result};
use k8s_openapi::api::core::v1::Service;
use std::sync::Arc;

const LOAD_BALANCER: &str = "LoadBalancer";

/// Protects annotations of load balancer services that only the platform may
/// manage.
pub struct LoadBalancerAnnotations {
    skipper: Arc<dyn Skipper>,
    protected: WildcardList,
}

impl LoadBalancerAnnotations {
    pub fn new(skipper: Arc<dyn Skipper>, protected: WildcardList) -> Self {
        Self { skipper, protected }
    }
}

fn is_load_balancer(svc: Option<&Service>) -> bool {
    svc.and_then(|s| s.spec.as_ref())
        .and_then(|s| s.type_.as_deref())
        == Some(LOAD_BALANCER)
}

#[async_trait::async_trait]
impl Policy for LoadBalancerAnnotations {
    type Object = Service;

    fn name(&self) -> &'static str {
        "load-balancer-annotations"
    }

    fn skipper(&self) -> &dyn Skipper {
        &*self.skipper
    }

    async fn decide(&self, req: &RequestDescriptor, objects: Objects<Service>) -> Result<Verdict> {
        if req.operation == Operation::Delete {
            return Ok(Verdict::allow("deletion"));
        }
        if !is_load_balancer(objects.new.as_ref()) && !is_load_balancer(objects.old.as_ref()) {
            return Ok(Verdict::allow("not a load balancer"));
        }

        let old = annotations(objects.old.as_ref());
        let new = annotations(objects.new.as_ref());
        let mut errors = Errors::default();
        for key in wildcard::changed_keys(&old, &new) {
            if self.protected.matches(key) {
                errors.push(anyhow!("annotation {key:?} may not be changed"));
            }
        }

        match errors.finish() {
            Ok(()) => Ok(Verdict::allow("no protected annotation changed")),
            Err(error) => Ok(Verdict::deny(error)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        decision::Decision, pipeline::handle, policy::test_util::request, skip::StaticSkipper,
    };
    use k8s_openapi::{api::core::v1::ServiceSpec, apimachinery::pkg::apis::meta::v1::ObjectMeta};
    use maplit::btreemap;
    use std::collections::BTreeMap;

    fn policy() -> LoadBalancerAnnotations {
        LoadBalancerAnnotations::new(
            Arc::new(StaticSkipper(false)),
            WildcardList::new(["lb.appuio.io/*", "metallb.universe.tf/address-pool"]).unwrap(),
        )
    }

    fn svc(type_: &str, annotations: BTreeMap<String, String>) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some("web".to_string()),
                namespace: Some("ns".to_string()),
                annotations: Some(annotations),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                type_: Some(type_.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn denies_every_protected_change() {
        let old = svc(
            LOAD_BALANCER,
            btreemap! {
                "lb.appuio.io/ip".to_string() => "1.2.3.4".to_string(),
                "metallb.universe.tf/address-pool".to_string() => "public".to_string(),
            },
        );
        let new = svc(
            LOAD_BALANCER,
            btreemap! {
                "lb.appuio.io/ip".to_string() => "5.6.7.8".to_string(),
                "lb.appuio.io/owner".to_string() => "me".to_string(),
                "description".to_string() => "web".to_string(),
            },
        );
        let decision = handle(&policy(), &request(Operation::Update, Some(&old), Some(&new))).await;
        match decision {
            Decision::Deny { reason } => {
                assert!(reason.contains("lb.appuio.io/ip"), "{reason}");
                assert!(reason.contains("lb.appuio.io/owner"), "{reason}");
                assert!(reason.contains("metallb.universe.tf/address-pool"), "{reason}");
                assert!(!reason.contains("description"), "{reason}");
            }
            decision => panic!("unexpected decision: {decision}"),
        }
    }

    #[tokio::test]
    async fn unprotected_changes_are_allowed() {
        let old = svc(
            LOAD_BALANCER,
            btreemap! { "lb.appuio.io/ip".to_string() => "1.2.3.4".to_string() },
        );
        let mut new = old.clone();
        new.metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert("description".to_string(), "web".to_string());
        let decision = handle(&policy(), &request(Operation::Update, Some(&old), Some(&new))).await;
        assert!(matches!(decision, Decision::Allow { .. }), "{decision}");
    }

    #[tokio::test]
    async fn other_service_types_are_ignored() {
        let new = svc(
            "ClusterIP",
            btreemap! { "lb.appuio.io/ip".to_string() => "1.2.3.4".to_string() },
        );
        let decision = handle(&policy(), &request(Operation::Create, None, Some(&new))).await;
        assert!(matches!(decision, Decision::Allow { .. }), "{decision}");
    }

    #[tokio::test]
    async fn protected_annotations_on_new_load_balancers_are_denied() {
        let new = svc(
            LOAD_BALANCER,
            btreemap! { "lb.appuio.io/ip".to_string() => "1.2.3.4".to_string() },
        );
        let decision = handle(&policy(), &request(Operation::Create, None, Some(&new))).await;
        assert!(matches!(decision, Decision::Deny { .. }), "{decision}");
    }
}
