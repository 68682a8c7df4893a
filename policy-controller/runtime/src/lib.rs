#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use tenancy_policy_controller_core as core;

mod admission;
mod args;
mod config;
mod metrics;
mod store;

pub use self::{
    admission::Admission,
    args::Args,
    config::{Config, ConfigError},
    metrics::DecisionMetrics,
    store::KubeStore,
};
