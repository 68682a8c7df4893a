#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod aggregate;
pub mod allow_list;
pub mod decision;
pub mod patch;
pub mod pipeline;
pub mod policy;
pub mod quantity;
pub mod quota_override;
pub mod ratio;
pub mod request;
pub mod skip;
pub mod store;
pub mod wildcard;

pub use self::{
    aggregate::AggregateError,
    allow_list::AllowListMatcher,
    decision::{Decision, Verdict},
    pipeline::{handle, Handler, Objects, Policy},
    quota_override::QuotaOverrideResolver,
    ratio::Ratio,
    request::{Operation, RequestDescriptor, UserInfo},
    wildcard::{Wildcard, WildcardList},
};
