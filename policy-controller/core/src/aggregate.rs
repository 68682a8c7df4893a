use std::fmt;

/// Collects independent failures so that every failing unit is reported
/// together instead of stopping at the first one.
#[derive(Debug, Default)]
pub struct Errors(Vec<anyhow::Error>);

/// A compound error that preserves every individual cause.
#[derive(Debug)]
pub struct AggregateError(Vec<anyhow::Error>);

// === impl Errors ===

impl Errors {
    pub fn push(&mut self, error: impl Into<anyhow::Error>) {
        self.0.push(error.into());
    }

    /// Records the error of `res`, if any, and returns its success value.
    pub fn collect<T, E>(&mut self, res: Result<T, E>) -> Option<T>
    where
        E: Into<anyhow::Error>,
    {
        match res {
            Ok(v) => Some(v),
            Err(error) => {
                self.push(error);
                None
            }
        }
    }

    /// Merges a previously finished aggregate into this one, flattening it.
    pub fn extend(&mut self, res: Result<(), AggregateError>) {
        if let Err(AggregateError(errors)) = res {
            self.0.extend(errors);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn finish(self) -> Result<(), AggregateError> {
        if self.0.is_empty() {
            return Ok(());
        }
        Err(AggregateError(self.0))
    }
}

// === impl AggregateError ===

impl AggregateError {
    pub fn errors(&self) -> &[anyhow::Error] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.as_slice() {
            [] => Ok(()),
            [one] => write!(f, "{one}"),
            many => {
                f.write_str("[")?;
                for (i, error) in many.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{error}")?;
                }
                f.write_str("]")
            }
        }
    }
}

impl std::error::Error for AggregateError {}
