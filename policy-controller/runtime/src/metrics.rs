use crate::core::Decision;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};

#[derive(Clone, Debug, Default)]
pub struct DecisionMetrics {
    decisions: Family<Labels, Counter>,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct Labels {
    policy: &'static str,
    verdict: &'static str,
}

// === impl DecisionMetrics ===

impl DecisionMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let decisions = Family::<Labels, Counter>::default();
        reg.register(
            "admission_decisions",
            "Total number of admission decisions by policy and verdict",
            decisions.clone(),
        );
        Self { decisions }
    }

    pub fn record(&self, policy: &'static str, decision: &Decision) {
        self.decisions
            .get_or_create(&Labels {
                policy,
                verdict: decision.verdict(),
            })
            .inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus_client::encoding::text::encode;

    #[test]
    fn counts_decisions_by_policy_and_verdict() {
        let mut prom = Registry::default();
        let metrics = DecisionMetrics::register(prom.sub_registry_with_prefix("tenancy_policy"));

        let deny = Decision::Deny {
            reason: "no".to_string(),
        };
        metrics.record("organization", &deny);
        metrics.record("organization", &deny);
        metrics.record("organization", &Decision::skipped());

        let mut text = String::new();
        encode(&mut text, &prom).unwrap();
        assert!(
            text.contains(
                r#"tenancy_policy_admission_decisions_total{policy="organization",verdict="deny"} 2"#
            ),
            "{text}"
        );
        assert!(
            text.contains(
                r#"tenancy_policy_admission_decisions_total{policy="organization",verdict="allow"} 1"#
            ),
            "{text}"
        );
    }
}
