//! Error types for the Navigator pilot

use thiserror::Error;

/// Main error type for pilot operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Validation error for derived state (node-status invariants, specs)
    #[error("validation error: {0}")]
    Validation(String),

    /// Version string could not be parsed in any attempted form
    #[error("version parse error: {0}")]
    VersionParse(String),

    /// Administrative-interface transport or payload error
    #[error("admin interface error: {0}")]
    Admin(String),

    /// Process supervision error (spawn failure, contract violation)
    #[error("process error: {0}")]
    Process(String),

    /// A lifecycle hook failed during a phase transition
    #[error("hook error: phase {phase}, hook {hook}: {message}")]
    Hook {
        /// Phase during which the hook failed
        phase: String,
        /// Name of the failing hook
        hook: String,
        /// Underlying failure description
        message: String,
    },

    /// The Pilot resource this process manages could not be found
    #[error("pilot not found: {0}")]
    PilotNotFound(String),

    /// This pilot has no controlling owner reference - it has no valid
    /// cluster membership, which is an invariant violation
    #[error("owner reference error: {0}")]
    MissingOwner(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Multiple independent failures, all of which must be reported
    #[error("{0}")]
    Aggregate(AggregateError),
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a version parse error with the given message
    pub fn version_parse(msg: impl Into<String>) -> Self {
        Self::VersionParse(msg.into())
    }

    /// Create an admin-interface error with the given message
    pub fn admin(msg: impl Into<String>) -> Self {
        Self::Admin(msg.into())
    }

    /// Create a process supervision error with the given message
    pub fn process(msg: impl Into<String>) -> Self {
        Self::Process(msg.into())
    }

    /// Create a hook error for the given phase and hook name
    pub fn hook(
        phase: impl Into<String>,
        hook: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Hook {
            phase: phase.into(),
            hook: hook.into(),
            message: message.into(),
        }
    }

    /// Create a missing-owner error with the given message
    pub fn missing_owner(msg: impl Into<String>) -> Self {
        Self::MissingOwner(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Combine independent failures into a single error.
    ///
    /// Returns `Ok(())` when no error is present, the error itself when
    /// exactly one is present, and an [`AggregateError`] otherwise. Nested
    /// aggregates are flattened so iteration always yields leaf errors.
    pub fn aggregate(errors: Vec<Error>) -> crate::Result<()> {
        let mut flat = Vec::new();
        for err in errors {
            match err {
                Error::Aggregate(agg) => flat.extend(agg.0),
                other => flat.push(other),
            }
        }
        match flat.len() {
            0 => Ok(()),
            1 => Err(flat.into_iter().next().expect("length checked")),
            _ => Err(Error::Aggregate(AggregateError(flat))),
        }
    }
}

/// A collection of errors that must all be reported.
///
/// Used wherever multiple independent failure sources exist, e.g. a failed
/// domain sync followed by a failed status update: neither may mask the
/// other.
#[derive(Debug)]
pub struct AggregateError(Vec<Error>);

impl AggregateError {
    /// Iterate over the contained errors
    pub fn iter(&self) -> impl Iterator<Item = &Error> {
        self.0.iter()
    }

    /// Number of contained errors
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True if no errors are contained (never the case for aggregates built
    /// through [`Error::aggregate`])
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for AggregateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for err in &self.0 {
            if !first {
                write!(f, "; ")?;
            }
            write!(f, "{err}")?;
            first = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_of_nothing_is_ok() {
        assert!(Error::aggregate(vec![]).is_ok());
    }

    #[test]
    fn aggregate_of_one_returns_the_error_itself() {
        let result = Error::aggregate(vec![Error::validation("bad spec")]);
        match result {
            Err(Error::Validation(msg)) => assert_eq!(msg, "bad spec"),
            other => panic!("expected Validation, got {other:?}"),
        }
    }

    #[test]
    fn aggregate_reports_all_errors() {
        let result = Error::aggregate(vec![
            Error::admin("connection refused"),
            Error::Kube(kube::Error::Api(kube::error::ErrorResponse {
                status: "Failure".to_string(),
                message: "conflict".to_string(),
                reason: "Conflict".to_string(),
                code: 409,
            })),
        ]);
        let err = result.unwrap_err();
        let text = err.to_string();
        assert!(text.contains("connection refused"));
        assert!(text.contains("conflict"));
        match err {
            Error::Aggregate(agg) => assert_eq!(agg.len(), 2),
            other => panic!("expected Aggregate, got {other:?}"),
        }
    }

    #[test]
    fn aggregate_flattens_nested_aggregates() {
        let inner = Error::aggregate(vec![
            Error::validation("one"),
            Error::validation("two"),
        ])
        .unwrap_err();
        let outer = Error::aggregate(vec![inner, Error::validation("three")]).unwrap_err();
        match outer {
            Error::Aggregate(agg) => {
                assert_eq!(agg.len(), 3);
                assert!(agg.iter().all(|e| matches!(e, Error::Validation(_))));
            }
            other => panic!("expected Aggregate, got {other:?}"),
        }
    }

    #[test]
    fn hook_errors_identify_phase_and_hook() {
        let err = Error::hook("PreStart", "write-config", "disk full");
        let text = err.to_string();
        assert!(text.contains("PreStart"));
        assert!(text.contains("write-config"));
        assert!(text.contains("disk full"));
    }
}
