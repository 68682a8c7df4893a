use crate::quantity::{self, QuantityError, MIB};
use bigdecimal::{BigDecimal, RoundingMode, Zero};
use k8s_openapi::api::{
    apps::v1::{Deployment, StatefulSet},
    core::v1::{Container, Pod, PodSpec},
};
use std::fmt;

pub const FAIR_USE_URL: &str = "https://docs.appuio.cloud/user/references/fair-use-policy.html";

const RUNNING: &str = "Running";

/// Accumulates CPU and memory requests to compute a memory-per-core ratio.
///
/// Totals only ever grow; negative requests contribute nothing. An accumulator
/// belongs to a single evaluation and is dropped afterwards.
#[derive(Clone, Debug, Default)]
pub struct Ratio {
    /// Requested CPU in cores.
    cpu: BigDecimal,
    /// Requested memory in bytes.
    memory: BigDecimal,
}

/// The requests of a single container.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Requests {
    pub cpu: BigDecimal,
    pub memory: BigDecimal,
}

// === impl Requests ===

impl Requests {
    pub fn new(cpu: BigDecimal, memory: BigDecimal) -> Self {
        Self { cpu, memory }
    }

    pub fn from_container(container: &Container) -> Result<Self, QuantityError> {
        let requests = container
            .resources
            .as_ref()
            .and_then(|r| r.requests.as_ref());
        Ok(Self {
            cpu: quantity::parse_or_zero(requests.and_then(|r| r.get("cpu")))?,
            memory: quantity::parse_or_zero(requests.and_then(|r| r.get("memory")))?,
        })
    }

    fn from_pod_spec(spec: &PodSpec) -> Result<Vec<Self>, QuantityError> {
        spec.containers.iter().map(Self::from_container).collect()
    }
}

// === impl Ratio ===

impl Ratio {
    pub fn cpu(&self) -> &BigDecimal {
        &self.cpu
    }

    pub fn memory(&self) -> &BigDecimal {
        &self.memory
    }

    /// Adds `replicas` times the sum of all container requests.
    pub fn record_workload(&mut self, replicas: u32, containers: &[Requests]) {
        let replicas = BigDecimal::from(replicas);
        for Requests { cpu, memory } in containers {
            if *cpu > BigDecimal::zero() {
                self.cpu += cpu * &replicas;
            }
            if *memory > BigDecimal::zero() {
                self.memory += memory * &replicas;
            }
        }
    }

    /// Records a pod that already exists. Only running pods count.
    pub fn record_pod(&mut self, pod: &Pod) -> Result<(), QuantityError> {
        let running = pod
            .status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .map_or(false, |phase| phase == RUNNING);
        if !running {
            return Ok(());
        }
        match pod.spec.as_ref() {
            Some(spec) => self.record_pod_spec(1, spec),
            None => Ok(()),
        }
    }

    /// Records a pod template regardless of any observed phase.
    pub fn record_pod_spec(&mut self, replicas: u32, spec: &PodSpec) -> Result<(), QuantityError> {
        let containers = Requests::from_pod_spec(spec)?;
        self.record_workload(replicas, &containers);
        Ok(())
    }

    pub fn record_deployment(&mut self, deploy: &Deployment) -> Result<(), QuantityError> {
        let Some(spec) = deploy.spec.as_ref() else {
            return Ok(());
        };
        let replicas = replicas(spec.replicas);
        match spec.template.spec.as_ref() {
            Some(pod) => self.record_pod_spec(replicas, pod),
            None => Ok(()),
        }
    }

    pub fn record_stateful_set(&mut self, sts: &StatefulSet) -> Result<(), QuantityError> {
        let Some(spec) = sts.spec.as_ref() else {
            return Ok(());
        };
        let replicas = replicas(spec.replicas);
        match spec.template.spec.as_ref() {
            Some(pod) => self.record_pod_spec(replicas, pod),
            None => Ok(()),
        }
    }

    /// Memory bytes per CPU core, rounded up to a whole mebibyte.
    ///
    /// Returns `None` when no CPU was requested.
    pub fn ratio(&self) -> Option<BigDecimal> {
        if self.cpu <= BigDecimal::zero() {
            return None;
        }

        let exact = (&self.memory / &self.cpu).with_scale_round(0, RoundingMode::HalfEven);
        let mib = BigDecimal::from(MIB);
        let mibs = (exact / &mib).with_scale_round(0, RoundingMode::Ceiling);
        Some(mibs * mib)
    }

    /// Whether the ratio is below `limit`. Never true without CPU requests.
    pub fn is_below(&self, limit: &BigDecimal) -> bool {
        self.ratio().map_or(false, |r| r < *limit)
    }

    /// Renders a single-line warning; admission warnings may not contain
    /// newlines.
    pub fn render_warning(&self, limit: Option<&BigDecimal>) -> String {
        match limit {
            Some(limit) => format!(
                "Current memory to CPU ratio of {self} in this namespace is below the fair use ratio of {}/core. \
                 This can lead to additional costs, see {FAIR_USE_URL}",
                quantity::format_binary(limit),
            ),
            None => format!("Current memory to CPU ratio of {self} in this namespace"),
        }
    }
}

impl fmt::Display for Ratio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ratio() {
            Some(r) => write!(f, "{}/core", quantity::format_binary(&r)),
            None => f.write_str("n/a (no CPU requested)"),
        }
    }
}

fn replicas(replicas: Option<i32>) -> u32 {
    replicas.map_or(1, |r| u32::try_from(r).unwrap_or(0))
}
