//! Operation authority matrix
//!
//! Every mutating engine operation is gated on the instance's current
//! status. A denied operation yields STATE_ERROR with no side effects.

use conflux_domain::{InstanceStatus, WorkflowOperation};

/// Operations permitted for an instance in the given status
#[must_use]
pub fn allowed_operations(status: InstanceStatus) -> &'static [WorkflowOperation] {
    use WorkflowOperation::{
        Cancel, Continue, Resume, RetryStep, Rollback, SkipStep, Start, Suspend, Terminate,
        UpdateContext,
    };

    match status {
        InstanceStatus::Created => &[Start, Terminate, Cancel, UpdateContext],
        InstanceStatus::Running => &[
            Continue,
            Suspend,
            Terminate,
            Cancel,
            SkipStep,
            Rollback,
            UpdateContext,
        ],
        InstanceStatus::Waiting => &[
            Continue,
            Terminate,
            Cancel,
            SkipStep,
            Rollback,
            UpdateContext,
        ],
        InstanceStatus::Suspended => &[Resume, Terminate, Cancel, Rollback, UpdateContext],
        InstanceStatus::Failed => &[RetryStep, SkipStep, Rollback, UpdateContext],
        InstanceStatus::Completed | InstanceStatus::Terminated | InstanceStatus::Cancelled => &[],
    }
}

/// Whether the operation is permitted in the given status
#[must_use]
pub fn is_allowed(status: InstanceStatus, operation: WorkflowOperation) -> bool {
    allowed_operations(status).contains(&operation)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matrix_rows() {
        use InstanceStatus as S;
        use WorkflowOperation as Op;

        // Created
        assert!(is_allowed(S::Created, Op::Start));
        assert!(is_allowed(S::Created, Op::Cancel));
        assert!(!is_allowed(S::Created, Op::Continue));
        assert!(!is_allowed(S::Created, Op::Suspend));

        // Running
        assert!(is_allowed(S::Running, Op::Continue));
        assert!(is_allowed(S::Running, Op::Suspend));
        assert!(is_allowed(S::Running, Op::SkipStep));
        assert!(is_allowed(S::Running, Op::Rollback));
        assert!(!is_allowed(S::Running, Op::Resume));
        assert!(!is_allowed(S::Running, Op::RetryStep));
        assert!(!is_allowed(S::Running, Op::Start));

        // Waiting
        assert!(is_allowed(S::Waiting, Op::Continue));
        assert!(!is_allowed(S::Waiting, Op::Suspend));

        // Suspended
        assert!(is_allowed(S::Suspended, Op::Resume));
        assert!(is_allowed(S::Suspended, Op::Rollback));
        assert!(!is_allowed(S::Suspended, Op::Continue));

        // Failed
        assert!(is_allowed(S::Failed, Op::RetryStep));
        assert!(is_allowed(S::Failed, Op::SkipStep));
        assert!(!is_allowed(S::Failed, Op::Terminate));
        assert!(!is_allowed(S::Failed, Op::Cancel));
    }

    #[test]
    fn test_terminal_rows_deny_everything() {
        for status in [
            InstanceStatus::Completed,
            InstanceStatus::Terminated,
            InstanceStatus::Cancelled,
        ] {
            for op in WorkflowOperation::ALL {
                assert!(!is_allowed(status, op), "{status:?} should deny {op:?}");
            }
        }
    }

    #[test]
    fn test_update_context_everywhere_non_terminal() {
        for status in [
            InstanceStatus::Created,
            InstanceStatus::Running,
            InstanceStatus::Waiting,
            InstanceStatus::Suspended,
            InstanceStatus::Failed,
        ] {
            assert!(is_allowed(status, WorkflowOperation::UpdateContext));
        }
    }
}
