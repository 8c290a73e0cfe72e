//! Tests for error types

use extraction_scheduler::core::{OperationFault, SchedulerError};

#[test]
fn test_duplicate_name_error() {
    let err = SchedulerError::DuplicateName("crm-sync".to_string());
    assert_eq!(format!("{}", err), "a task named `crm-sync` is already active");
    assert!(err.is_invalid_argument());
}

#[test]
fn test_cancelled_error() {
    let err = SchedulerError::Cancelled;
    assert_eq!(format!("{}", err), "operation cancelled");
    assert!(err.is_cancelled());
    assert!(err.faults().is_empty());
}

#[test]
fn test_contract_violation_error() {
    let err = SchedulerError::ContractViolation("chunk size mismatch".to_string());
    assert_eq!(format!("{}", err), "contract violation: chunk size mismatch");
    assert!(!err.is_invalid_argument());
}

#[test]
fn test_operation_fault_is_transparent() {
    let fault = OperationFault::new("operation #4", anyhow::anyhow!("timed out"));
    let err: SchedulerError = fault.into();
    assert_eq!(format!("{}", err), "operation #4 faulted: timed out");
    assert_eq!(err.faults()[0].origin(), "operation #4");
}

#[test]
fn test_fault_keeps_context_chain() {
    let inner = anyhow::anyhow!("connection reset").context("listing page 7");
    let fault = OperationFault::new("chunk #2", inner);
    assert_eq!(
        fault.to_string(),
        "chunk #2 faulted: listing page 7: connection reset"
    );
}
