use crate::patch::PatchOperation;
use std::fmt;

/// The terminal outcome of a policy evaluation.
#[derive(Debug)]
pub enum Decision {
    Allow {
        reason: String,
        warnings: Vec<String>,
    },
    Deny {
        reason: String,
    },
    Patch {
        reason: String,
        ops: Vec<PatchOperation>,
    },
    Error {
        code: u16,
        cause: anyhow::Error,
    },
}

/// What a policy's decision function concluded.
#[derive(Clone, Debug, PartialEq)]
pub enum Verdict {
    Allow {
        reason: String,
        warnings: Vec<String>,
    },
    Deny(String),
    Patch {
        reason: String,
        ops: Vec<PatchOperation>,
    },
}

// === impl Decision ===

impl Decision {
    pub fn skipped() -> Self {
        Self::Allow {
            reason: "skipped".to_string(),
            warnings: Vec::new(),
        }
    }

    pub fn bad_request(cause: impl Into<anyhow::Error>) -> Self {
        Self::Error {
            code: 400,
            cause: cause.into(),
        }
    }

    pub fn internal(cause: impl Into<anyhow::Error>) -> Self {
        Self::Error {
            code: 500,
            cause: cause.into(),
        }
    }

    pub fn verdict(&self) -> &'static str {
        match self {
            Self::Allow { .. } => "allow",
            Self::Deny { .. } => "deny",
            Self::Patch { .. } => "patch",
            Self::Error { .. } => "error",
        }
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow { .. } | Self::Patch { .. })
    }
}

impl From<Verdict> for Decision {
    fn from(verdict: Verdict) -> Self {
        match verdict {
            Verdict::Allow { reason, warnings } => Self::Allow { reason, warnings },
            Verdict::Deny(reason) => Self::Deny { reason },
            Verdict::Patch { reason, ops } => Self::Patch { reason, ops },
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Allow { reason, .. } => write!(f, "allowed: {reason}"),
            Self::Deny { reason } => write!(f, "denied: {reason}"),
            Self::Patch { reason, ops } => write!(f, "patched ({} ops): {reason}", ops.len()),
            Self::Error { code, cause } => write!(f, "error {code}: {cause}"),
        }
    }
}

// === impl Verdict ===

impl Verdict {
    pub fn allow(reason: impl Into<String>) -> Self {
        Self::Allow {
            reason: reason.into(),
            warnings: Vec::new(),
        }
    }

    pub fn warn(reason: impl Into<String>, warning: impl Into<String>) -> Self {
        Self::Allow {
            reason: reason.into(),
            warnings: vec![warning.into()],
        }
    }

    pub fn deny(reason: impl fmt::Display) -> Self {
        Self::Deny(reason.to_string())
    }

    /// Patches the object, or allows it unchanged if there is nothing to do.
    pub fn patch(reason: impl Into<String>, ops: Vec<PatchOperation>) -> Self {
        if ops.is_empty() {
            return Self::allow(reason);
        }
        Self::Patch {
            reason: reason.into(),
            ops,
        }
    }
}
