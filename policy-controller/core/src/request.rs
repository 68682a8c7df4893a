use crate::quantity::QuantityError;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::{collections::BTreeSet, fmt};
use thiserror::Error;

/// Describes an intercepted request. Never mutated while it is evaluated.
#[derive(Clone, Debug)]
pub struct RequestDescriptor {
    pub user: UserInfo,
    /// The namespace the object lives in; for namespaces, the namespace itself.
    pub namespace: String,
    pub name: String,
    pub kind: String,
    pub operation: Operation,
    pub old_object: Option<Value>,
    pub object: Option<Value>,
}

/// The already authenticated caller.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UserInfo {
    pub username: String,
    pub groups: BTreeSet<String>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("request is missing both object and oldObject")]
    MissingObject,

    #[error("failed to decode {field}: {source}")]
    Json {
        field: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid resource requests in {field}: {source}")]
    Quantity {
        field: &'static str,
        #[source]
        source: QuantityError,
    },
}

// === impl RequestDescriptor ===

impl RequestDescriptor {
    pub fn decode_object<T: DeserializeOwned>(&self) -> Result<Option<T>, DecodeError> {
        decode("object", self.object.as_ref())
    }

    pub fn decode_old_object<T: DeserializeOwned>(&self) -> Result<Option<T>, DecodeError> {
        decode("oldObject", self.old_object.as_ref())
    }
}

fn decode<T: DeserializeOwned>(
    field: &'static str,
    value: Option<&Value>,
) -> Result<Option<T>, DecodeError> {
    value
        .map(|v| T::deserialize(v).map_err(|source| DecodeError::Json { field, source }))
        .transpose()
}

// === impl UserInfo ===

impl UserInfo {
    pub fn new<I, S>(username: impl Into<String>, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            username: username.into(),
            groups: groups.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_member_of(&self, group: &str) -> bool {
        self.groups.contains(group)
    }
}

impl fmt::Display for UserInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.username.fmt(f)
    }
}

// === impl Operation ===

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => "CREATE".fmt(f),
            Self::Update => "UPDATE".fmt(f),
            Self::Delete => "DELETE".fmt(f),
        }
    }
}
