//! The control flow shared by every policy: skip check, decode, decide,
//! respond.

use crate::{
    decision::{Decision, Verdict},
    request::{DecodeError, RequestDescriptor},
    skip::Skipper,
};
use anyhow::Result;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

/// A policy check, evaluated through [`handle`].
#[async_trait::async_trait]
pub trait Policy: Send + Sync {
    /// The typed form of the objects under review.
    type Object: DeserializeOwned + Send + Sync;

    fn name(&self) -> &'static str;

    fn skipper(&self) -> &dyn Skipper;

    /// Decides on the decoded objects. A [`DecodeError`] means the caller's
    /// object is unusable; any other error is an internal failure.
    async fn decide(
        &self,
        req: &RequestDescriptor,
        objects: Objects<Self::Object>,
    ) -> Result<Verdict>;
}

/// The decoded old and new states of the object under review.
#[derive(Clone, Debug)]
pub struct Objects<T> {
    pub old: Option<T>,
    pub new: Option<T>,
}

/// Object-safe form of a [`Policy`], so that heterogeneous policies can be
/// served side by side.
#[async_trait::async_trait]
pub trait Handler: Send + Sync {
    fn name(&self) -> &'static str;

    async fn handle(&self, req: &RequestDescriptor) -> Decision;
}

// === impl Objects ===

impl<T> Objects<T> {
    pub fn decode(req: &RequestDescriptor) -> Result<Self, DecodeError>
    where
        T: DeserializeOwned,
    {
        let new = req.decode_object()?;
        let old = req.decode_old_object()?;
        if new.is_none() && old.is_none() {
            return Err(DecodeError::MissingObject);
        }
        Ok(Self { old, new })
    }

    /// The new state, or the old one for deletions.
    pub fn current(&self) -> Option<&T> {
        self.new.as_ref().or(self.old.as_ref())
    }
}

#[async_trait::async_trait]
impl<P: Policy> Handler for P {
    fn name(&self) -> &'static str {
        Policy::name(self)
    }

    async fn handle(&self, req: &RequestDescriptor) -> Decision {
        handle(self, req).await
    }
}

/// Evaluates `policy` for `req`.
pub async fn handle<P: Policy + ?Sized>(policy: &P, req: &RequestDescriptor) -> Decision {
    let decision = evaluate(policy, req).await;
    log(policy.name(), req, &decision);
    decision
}

async fn evaluate<P: Policy + ?Sized>(policy: &P, req: &RequestDescriptor) -> Decision {
    match policy.skipper().skip(req).await {
        Ok(true) => return Decision::skipped(),
        Ok(false) => {}
        Err(error) => return Decision::internal(error.context("failed to evaluate skip")),
    }

    let objects = match Objects::<P::Object>::decode(req) {
        Ok(objects) => objects,
        Err(error) => return Decision::bad_request(error),
    };

    match policy.decide(req, objects).await {
        Ok(verdict) => verdict.into(),
        Err(error) => match error.downcast::<DecodeError>() {
            Ok(error) => Decision::bad_request(error),
            Err(error) => Decision::internal(error),
        },
    }
}

fn log(policy: &'static str, req: &RequestDescriptor, decision: &Decision) {
    let RequestDescriptor {
        user,
        namespace,
        name,
        kind,
        operation,
        ..
    } = req;
    match decision {
        Decision::Allow { reason, warnings } => debug!(
            policy,
            %user,
            ns = %namespace,
            %name,
            %kind,
            %operation,
            verdict = decision.verdict(),
            %reason,
            warnings = warnings.len(),
        ),
        Decision::Deny { reason } | Decision::Patch { reason, .. } => info!(
            policy,
            %user,
            ns = %namespace,
            %name,
            %kind,
            %operation,
            verdict = decision.verdict(),
            %reason,
        ),
        Decision::Error { code, cause } => warn!(
            policy,
            %user,
            ns = %namespace,
            %name,
            %kind,
            %operation,
            verdict = decision.verdict(),
            code,
            error = %format_args!("{cause:#}"),
        ),
    }
}
