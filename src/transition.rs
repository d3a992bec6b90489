//! Legal-transition table for operation updates.
//!
//! Every update is validated here before it mutates history, both on the
//! engine side and inside the in-memory backend. Rejections carry the name
//! of the rule that fired so a bad update is diagnosable from the error
//! alone.

use crate::error::EngineError;
use crate::operation::{
    Operation, OperationAction, OperationStatus, OperationType, OperationUpdate,
};

pub mod rules {
    //! Rule names carried by validation errors.

    pub const TYPE_MISMATCH: &str = "TYPE_MISMATCH";
    pub const TERMINAL_OPERATION: &str = "TERMINAL_OPERATION";
    pub const START_REQUIRES_NEW: &str = "START_REQUIRES_NEW";
    pub const STEP_START: &str = "STEP_START";
    pub const STEP_COMPLETE_REQUIRES_ACTIVE: &str = "STEP_COMPLETE_REQUIRES_ACTIVE";
    pub const SUCCEED_FORBIDS_ERROR: &str = "SUCCEED_FORBIDS_ERROR";
    pub const FAIL_FORBIDS_PAYLOAD: &str = "FAIL_FORBIDS_PAYLOAD";
    pub const FAIL_REQUIRES_ERROR: &str = "FAIL_REQUIRES_ERROR";
    pub const RETRY_REQUIRES_OPTIONS: &str = "RETRY_REQUIRES_OPTIONS";
    pub const RETRY_PAYLOAD_AND_ERROR: &str = "RETRY_PAYLOAD_AND_ERROR";
    pub const RETRY_FROM_READY_FORBIDS_DATA: &str = "RETRY_FROM_READY_FORBIDS_DATA";
    pub const RETRY_FROM_STARTED_REQUIRES_DATA: &str = "RETRY_FROM_STARTED_REQUIRES_DATA";
    pub const RETRY_REQUIRES_PRIOR: &str = "RETRY_REQUIRES_PRIOR";
    pub const CANCEL_REQUIRES_STARTED: &str = "CANCEL_REQUIRES_STARTED";
    pub const CANCEL_UNSUPPORTED_TYPE: &str = "CANCEL_UNSUPPORTED_TYPE";
    pub const CONTEXT_ACTION: &str = "CONTEXT_ACTION";
    pub const CONTEXT_COMPLETE_REQUIRES_STARTED: &str = "CONTEXT_COMPLETE_REQUIRES_STARTED";
    pub const EXECUTION_ACTION: &str = "EXECUTION_ACTION";
    pub const EXECUTION_REQUIRES_PRIOR: &str = "EXECUTION_REQUIRES_PRIOR";
}

/// Validates `update` against the prior recorded state of the operation.
///
/// `prior` is None when no history row exists for the operation id yet.
pub fn validate(prior: Option<&Operation>, update: &OperationUpdate) -> Result<(), EngineError> {
    if let Some(op) = prior {
        if op.operation_type != update.operation_type {
            return Err(EngineError::validation(
                rules::TYPE_MISMATCH,
                format!(
                    "operation {} is {:?}, update targets {:?}",
                    op.operation_id, op.operation_type, update.operation_type
                ),
            ));
        }
        if op.status.is_terminal() {
            return Err(EngineError::validation(
                rules::TERMINAL_OPERATION,
                format!(
                    "operation {} is already {:?}",
                    op.operation_id, op.status
                ),
            ));
        }
    }

    match update.action {
        OperationAction::Succeed if update.error.is_some() => {
            return Err(EngineError::validation(
                rules::SUCCEED_FORBIDS_ERROR,
                "SUCCEED must not carry error details",
            ));
        }
        OperationAction::Fail if update.payload.is_some() => {
            return Err(EngineError::validation(
                rules::FAIL_FORBIDS_PAYLOAD,
                "FAIL must not carry a payload",
            ));
        }
        OperationAction::Fail if update.error.is_none() => {
            return Err(EngineError::validation(
                rules::FAIL_REQUIRES_ERROR,
                "FAIL must carry error details",
            ));
        }
        _ => {}
    }

    match update.operation_type {
        OperationType::Step => validate_step(prior, update),
        OperationType::Context => validate_context(prior, update),
        OperationType::Wait | OperationType::Callback | OperationType::ChainedInvoke => {
            validate_external(prior, update)
        }
        OperationType::Execution => validate_execution(prior, update),
    }
}

fn validate_step(prior: Option<&Operation>, update: &OperationUpdate) -> Result<(), EngineError> {
    match update.action {
        OperationAction::Start => match prior {
            None => Ok(()),
            Some(op) if op.status == OperationStatus::Ready => Ok(()),
            Some(op) => Err(EngineError::validation(
                rules::STEP_START,
                format!(
                    "step {} cannot START from {:?}",
                    op.operation_id, op.status
                ),
            )),
        },
        OperationAction::Succeed | OperationAction::Fail => match prior {
            Some(op)
                if matches!(
                    op.status,
                    OperationStatus::Started | OperationStatus::Ready
                ) =>
            {
                Ok(())
            }
            Some(op) => Err(EngineError::validation(
                rules::STEP_COMPLETE_REQUIRES_ACTIVE,
                format!(
                    "step {} cannot complete from {:?}",
                    op.operation_id, op.status
                ),
            )),
            None => Err(EngineError::validation(
                rules::STEP_COMPLETE_REQUIRES_ACTIVE,
                format!("step {} has not started", update.operation_id),
            )),
        },
        OperationAction::Retry => validate_retry(prior, update),
        OperationAction::Cancel => Err(EngineError::validation(
            rules::CANCEL_UNSUPPORTED_TYPE,
            "steps are not cancellable",
        )),
    }
}

fn validate_retry(prior: Option<&Operation>, update: &OperationUpdate) -> Result<(), EngineError> {
    if update.retry_options.is_none() {
        return Err(EngineError::validation(
            rules::RETRY_REQUIRES_OPTIONS,
            "RETRY must carry a next-attempt delay",
        ));
    }
    // Rejected regardless of prior state.
    if update.payload.is_some() && update.error.is_some() {
        return Err(EngineError::validation(
            rules::RETRY_PAYLOAD_AND_ERROR,
            "RETRY cannot carry both a payload and error details",
        ));
    }
    match prior {
        None => Err(EngineError::validation(
            rules::RETRY_REQUIRES_PRIOR,
            format!("step {} has no recorded attempt", update.operation_id),
        )),
        Some(op) if op.status == OperationStatus::Ready => {
            if update.payload.is_some() || update.error.is_some() {
                Err(EngineError::validation(
                    rules::RETRY_FROM_READY_FORBIDS_DATA,
                    "RETRY of a not-yet-started attempt carries no payload or error",
                ))
            } else {
                Ok(())
            }
        }
        Some(op) if op.status == OperationStatus::Started => {
            if update.payload.is_some() || update.error.is_some() {
                Ok(())
            } else {
                Err(EngineError::validation(
                    rules::RETRY_FROM_STARTED_REQUIRES_DATA,
                    "RETRY of a started attempt must record a payload or error details",
                ))
            }
        }
        Some(op) => Err(EngineError::validation(
            rules::TERMINAL_OPERATION,
            format!("step {} cannot RETRY from {:?}", op.operation_id, op.status),
        )),
    }
}

fn validate_context(
    prior: Option<&Operation>,
    update: &OperationUpdate,
) -> Result<(), EngineError> {
    match update.action {
        OperationAction::Start => match prior {
            None => Ok(()),
            Some(op) => Err(EngineError::validation(
                rules::START_REQUIRES_NEW,
                format!("context {} already exists", op.operation_id),
            )),
        },
        OperationAction::Succeed | OperationAction::Fail => match prior {
            Some(op) if op.status == OperationStatus::Started => Ok(()),
            Some(op) => Err(EngineError::validation(
                rules::CONTEXT_COMPLETE_REQUIRES_STARTED,
                format!(
                    "context {} cannot complete from {:?}",
                    op.operation_id, op.status
                ),
            )),
            None => Err(EngineError::validation(
                rules::CONTEXT_COMPLETE_REQUIRES_STARTED,
                format!("context {} has not started", update.operation_id),
            )),
        },
        OperationAction::Cancel | OperationAction::Retry => Err(EngineError::validation(
            rules::CONTEXT_ACTION,
            "contexts support only START, SUCCEED, and FAIL",
        )),
    }
}

/// WAIT, CALLBACK, and CHAINED_INVOKE are resolved by the backend; the
/// engine only ever starts or cancels them.
fn validate_external(
    prior: Option<&Operation>,
    update: &OperationUpdate,
) -> Result<(), EngineError> {
    match update.action {
        OperationAction::Start => match prior {
            None => Ok(()),
            Some(op) => Err(EngineError::validation(
                rules::START_REQUIRES_NEW,
                format!("operation {} already exists", op.operation_id),
            )),
        },
        OperationAction::Cancel => match prior {
            Some(op) if op.status == OperationStatus::Started => Ok(()),
            Some(op) => Err(EngineError::validation(
                rules::CANCEL_REQUIRES_STARTED,
                format!(
                    "operation {} cannot CANCEL from {:?}",
                    op.operation_id, op.status
                ),
            )),
            None => Err(EngineError::validation(
                rules::CANCEL_REQUIRES_STARTED,
                format!("operation {} has not started", update.operation_id),
            )),
        },
        OperationAction::Succeed | OperationAction::Fail | OperationAction::Retry => {
            Err(EngineError::validation(
                rules::CANCEL_UNSUPPORTED_TYPE,
                format!(
                    "{:?} operations are resolved by the backend, not by {:?}",
                    update.operation_type, update.action
                ),
            ))
        }
    }
}

fn validate_execution(
    prior: Option<&Operation>,
    update: &OperationUpdate,
) -> Result<(), EngineError> {
    match update.action {
        OperationAction::Succeed | OperationAction::Fail => match prior {
            Some(_) => Ok(()),
            None => Err(EngineError::validation(
                rules::EXECUTION_REQUIRES_PRIOR,
                "execution record does not exist",
            )),
        },
        _ => Err(EngineError::validation(
            rules::EXECUTION_ACTION,
            "executions support only SUCCEED and FAIL",
        )),
    }
}

/// Applies a validated update, producing the new history row.
pub fn apply(
    prior: Option<&Operation>,
    update: &OperationUpdate,
    now: f64,
) -> Result<Operation, EngineError> {
    validate(prior, update)?;

    let op = match update.action {
        OperationAction::Start => {
            let mut op = prior.cloned().unwrap_or_else(|| {
                Operation::new(
                    update.operation_id.clone(),
                    update.operation_type,
                    OperationStatus::Started,
                )
            });
            op.status = OperationStatus::Started;
            op.start_timestamp = Some(now);
            if op.parent_id.is_none() {
                op.parent_id = update.parent_id.clone();
            }
            if op.name.is_none() {
                op.name = update.name.clone();
            }
            if op.sub_type.is_none() {
                op.sub_type = update.sub_type.clone();
            }
            if let Some(wait) = &update.wait_options {
                let end = match (wait.wait_seconds, wait.until_timestamp) {
                    (_, Some(until)) => until,
                    (Some(seconds), None) => now + seconds as f64,
                    (None, None) => now,
                };
                op.scheduled_end_timestamp = Some(end);
            }
            if let Some(cb) = &update.callback_options {
                if let Some(timeout) = cb.timeout_seconds {
                    op.scheduled_end_timestamp = Some(now + timeout as f64);
                }
            }
            op
        }
        OperationAction::Succeed => {
            let mut op = prior.cloned().unwrap_or_else(|| {
                Operation::new(
                    update.operation_id.clone(),
                    update.operation_type,
                    OperationStatus::Succeeded,
                )
            });
            op.status = OperationStatus::Succeeded;
            op.result = update.payload.clone();
            op.end_timestamp = Some(now);
            op
        }
        OperationAction::Fail => {
            let mut op = prior.cloned().unwrap_or_else(|| {
                Operation::new(
                    update.operation_id.clone(),
                    update.operation_type,
                    OperationStatus::Failed,
                )
            });
            op.status = OperationStatus::Failed;
            op.error = update.error.clone();
            op.end_timestamp = Some(now);
            op
        }
        OperationAction::Cancel => {
            // validate() guarantees prior exists for CANCEL
            let mut op = prior
                .cloned()
                .ok_or_else(|| EngineError::validation(rules::CANCEL_REQUIRES_STARTED, "no prior"))?;
            op.status = OperationStatus::Cancelled;
            op.end_timestamp = Some(now);
            op
        }
        OperationAction::Retry => {
            let mut op = prior
                .cloned()
                .ok_or_else(|| EngineError::validation(rules::RETRY_REQUIRES_PRIOR, "no prior"))?;
            let delay = update
                .retry_options
                .as_ref()
                .map(|r| r.next_attempt_delay_seconds)
                .unwrap_or(0);
            op.status = OperationStatus::Ready;
            op.attempt += 1;
            op.scheduled_end_timestamp = Some(now + delay as f64);
            if update.payload.is_some() {
                op.result = update.payload.clone();
            }
            if update.error.is_some() {
                op.error = update.error.clone();
            }
            op
        }
    };

    Ok(op)
}
