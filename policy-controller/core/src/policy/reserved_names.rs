use crate::{
    decision::Verdict,
    pipeline::{Objects, Policy},
    request::{Operation, RequestDescriptor},
    skip::Skipper,
    wildcard::WildcardList,
};
use anyhow::Result;
use kube::core::DynamicObject;
use std::{collections::BTreeMap, sync::Arc};

/// Denies creating, updating or deleting objects whose names are reserved for
/// their kind.
pub struct ReservedNames {
    skipper: Arc<dyn Skipper>,
    by_kind: BTreeMap<String, WildcardList>,
}

impl ReservedNames {
    pub fn new(skipper: Arc<dyn Skipper>, by_kind: BTreeMap<String, WildcardList>) -> Self {
        Self { skipper, by_kind }
    }
}

#[async_trait::async_trait]
impl Policy for ReservedNames {
    type Object = DynamicObject;

    fn name(&self) -> &'static str {
        "reserved-names"
    }

    fn skipper(&self) -> &dyn Skipper {
        &*self.skipper
    }

    async fn decide(
        &self,
        req: &RequestDescriptor,
        objects: Objects<DynamicObject>,
    ) -> Result<Verdict> {
        let Some(reserved) = self.by_kind.get(&req.kind) else {
            return Ok(Verdict::allow(format!("no reserved {} names", req.kind)));
        };
        let name = objects
            .current()
            .and_then(|o| o.metadata.name.as_deref())
            .unwrap_or(&req.name);

        if reserved.matches(name) {
            return Ok(Verdict::deny(format!(
                "{} {name:?} uses a reserved name and may not be {}",
                req.kind,
                past_tense(req.operation),
            )));
        }
        Ok(Verdict::allow("name is not reserved"))
    }
}

fn past_tense(op: Operation) -> &'static str {
    match op {
        Operation::Create => "created",
        Operation::Update => "updated",
        Operation::Delete => "deleted",
    }
}
