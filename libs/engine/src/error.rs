//! Engine error taxonomy
//!
//! One uniform error shape across the engine: a kind, a message, optional
//! instance/step coordinates, a retryability classification, and an optional
//! source. Executors wrap foreign failures into the Execution kind preserving
//! the cause.

use thiserror::Error;

use conflux_domain::InstanceId;
use conflux_store::StoreError;

// =============================================================================
// Error Kind
// =============================================================================

/// Classification of engine errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad workflow/step/branch configuration
    Configuration,
    /// Transient step failure
    Execution,
    /// Illegal status transition or wrong-state operation
    State,
    /// Caller not authorized for the operation or task
    Permission,
    /// Missing or inconsistent data
    Data,
    /// Step or branch deadline exceeded
    Timeout,
    /// Pool or handle exhaustion
    Resource,
    /// Upstream I/O failure
    Network,
    /// Unexpected internal fault
    System,
    /// Domain-level reject raised by user code
    Business,
}

impl ErrorKind {
    /// Default retryability per kind
    #[must_use]
    pub fn default_retryable(&self) -> bool {
        matches!(
            self,
            Self::Execution | Self::Timeout | Self::Resource | Self::Network | Self::System
        )
    }
}

// =============================================================================
// WorkflowError
// =============================================================================

/// Uniform engine error
#[derive(Debug, Error)]
#[error("{kind:?} error: {message}")]
pub struct WorkflowError {
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
    pub instance_id: Option<InstanceId>,
    pub step_id: Option<String>,
    pub error_code: Option<String>,
    #[source]
    pub cause: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl WorkflowError {
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: kind.default_retryable(),
            instance_id: None,
            step_id: None,
            error_code: None,
            cause: None,
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Configuration, message)
    }

    pub fn execution(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Execution, message)
    }

    pub fn state(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::State, message).with_code("STATE_ERROR")
    }

    pub fn permission(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Permission, message).with_code("PERMISSION_ERROR")
    }

    pub fn data(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Data, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn resource(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Resource, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
    }

    pub fn system(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::System, message)
    }

    pub fn business(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Business, message)
    }

    // =========================================================================
    // Named lookups
    // =========================================================================

    pub fn workflow_not_found(id: impl std::fmt::Display) -> Self {
        Self::data(format!("workflow not found: {id}")).with_code("WORKFLOW_NOT_FOUND")
    }

    pub fn instance_not_found(id: InstanceId) -> Self {
        Self::data(format!("instance not found: {id}"))
            .with_code("INSTANCE_NOT_FOUND")
            .with_instance(id)
    }

    pub fn step_not_found(step_id: impl std::fmt::Display) -> Self {
        Self::data(format!("step not found: {step_id}")).with_code("STEP_NOT_FOUND")
    }

    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::State, message).with_code("INVALID_OPERATION")
    }

    // =========================================================================
    // Builders
    // =========================================================================

    #[must_use]
    pub fn with_instance(mut self, id: InstanceId) -> Self {
        self.instance_id = Some(id);
        self
    }

    #[must_use]
    pub fn with_step(mut self, step_id: impl Into<String>) -> Self {
        self.step_id = Some(step_id.into());
        self
    }

    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.error_code = Some(code.into());
        self
    }

    #[must_use]
    pub fn with_cause(mut self, cause: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    #[must_use]
    pub fn non_retryable(mut self) -> Self {
        self.retryable = false;
        self
    }

    #[must_use]
    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }
}

impl From<StoreError> for WorkflowError {
    /// Persistence failures surface as transient execution errors
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => Self::data(format!("missing data: {what}")),
            other => Self::execution(format!("persistence failure: {other}")).with_cause(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_retryability() {
        assert!(WorkflowError::execution("x").retryable);
        assert!(WorkflowError::timeout("x").retryable);
        assert!(WorkflowError::network("x").retryable);
        assert!(!WorkflowError::configuration("x").retryable);
        assert!(!WorkflowError::permission("x").retryable);
        assert!(!WorkflowError::business("x").retryable);
    }

    #[test]
    fn test_named_errors_carry_codes() {
        let err = WorkflowError::workflow_not_found("wf:missing");
        assert_eq!(err.error_code.as_deref(), Some("WORKFLOW_NOT_FOUND"));
        assert_eq!(err.kind, ErrorKind::Data);

        let err = WorkflowError::invalid_operation("skip on required step");
        assert_eq!(err.error_code.as_deref(), Some("INVALID_OPERATION"));
        assert_eq!(err.kind, ErrorKind::State);
    }

    #[test]
    fn test_store_error_maps_to_execution() {
        let err: WorkflowError = StoreError::Storage("connection reset".to_string()).into();
        assert_eq!(err.kind, ErrorKind::Execution);
        assert!(err.retryable);
        assert!(err.cause.is_some());
    }

    #[test]
    fn test_builder_fields() {
        let id = InstanceId::new();
        let err = WorkflowError::execution("boom")
            .with_instance(id)
            .with_step("s1")
            .non_retryable();

        assert_eq!(err.instance_id, Some(id));
        assert_eq!(err.step_id.as_deref(), Some("s1"));
        assert!(!err.retryable);
    }
}
