//! Operation model: the unit of checkpointed history.
//!
//! Every durable primitive records one or more operations. An operation's
//! identity is a deterministic id derived from call order, so the same code
//! path on every invocation observes the same history rows.

use crate::error::ErrorObject;
use serde::{Deserialize, Serialize};

/// The kind of durable operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationType {
    /// The root execution record
    #[serde(rename = "EXECUTION")]
    Execution,
    /// A checkpointed unit of work
    #[serde(rename = "STEP")]
    Step,
    /// A durable timer
    #[serde(rename = "WAIT")]
    Wait,
    /// An externally-completed callback
    #[serde(rename = "CALLBACK")]
    Callback,
    /// An invocation of another durable function
    #[serde(rename = "CHAINED_INVOKE")]
    ChainedInvoke,
    /// A child context grouping nested operations
    #[serde(rename = "CONTEXT")]
    Context,
}

/// Lifecycle status of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationStatus {
    /// Scheduled but not yet running (retry backoff)
    #[serde(rename = "READY")]
    Ready,
    /// Currently running or awaiting an external event
    #[serde(rename = "STARTED")]
    Started,
    /// Completed successfully
    #[serde(rename = "SUCCEEDED")]
    Succeeded,
    /// Completed with an error
    #[serde(rename = "FAILED")]
    Failed,
    /// Cancelled before completion
    #[serde(rename = "CANCELLED")]
    Cancelled,
    /// Stopped by an external actor
    #[serde(rename = "STOPPED")]
    Stopped,
    /// Exceeded its timeout or heartbeat deadline
    #[serde(rename = "TIMED_OUT")]
    TimedOut,
}

impl OperationStatus {
    /// Returns true if the operation can make no further transitions.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Ready | Self::Started)
    }

    /// Returns true for the successful terminal status.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }

    /// Returns true for any unsuccessful terminal status.
    pub fn is_failure(&self) -> bool {
        self.is_terminal() && !self.is_success()
    }
}

/// Action carried by an operation update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationAction {
    /// Begin the operation
    #[serde(rename = "START")]
    Start,
    /// Record successful completion
    #[serde(rename = "SUCCEED")]
    Succeed,
    /// Record failed completion
    #[serde(rename = "FAIL")]
    Fail,
    /// Cancel a started operation
    #[serde(rename = "CANCEL")]
    Cancel,
    /// Schedule a re-run after a backoff delay
    #[serde(rename = "RETRY")]
    Retry,
}

/// A single row of checkpointed history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Deterministic operation id ("1", "2", "2-1", ...)
    #[serde(rename = "OperationId")]
    pub operation_id: String,
    /// The operation kind
    #[serde(rename = "OperationType")]
    pub operation_type: OperationType,
    /// Optional engine-internal subtype (combinator kind, submitter marker)
    #[serde(rename = "SubType", skip_serializing_if = "Option::is_none")]
    pub sub_type: Option<String>,
    /// Current lifecycle status
    #[serde(rename = "Status")]
    pub status: OperationStatus,
    /// Author-supplied name, if any
    #[serde(rename = "Name", skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Id of the enclosing CONTEXT operation, None for root-level operations
    #[serde(rename = "ParentId", skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// Serialized success payload
    #[serde(rename = "Result", skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    /// Failure details
    #[serde(rename = "Error", skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
    /// When the operation was started (epoch seconds)
    #[serde(rename = "StartTimestamp", skip_serializing_if = "Option::is_none")]
    pub start_timestamp: Option<f64>,
    /// When the operation reached a terminal status (epoch seconds)
    #[serde(rename = "EndTimestamp", skip_serializing_if = "Option::is_none")]
    pub end_timestamp: Option<f64>,
    /// When a wait matures, a callback times out, or a retry becomes runnable
    #[serde(
        rename = "ScheduledEndTimestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub scheduled_end_timestamp: Option<f64>,
    /// Backend-issued callback identifier for CALLBACK operations
    #[serde(rename = "CallbackId", skip_serializing_if = "Option::is_none")]
    pub callback_id: Option<String>,
    /// Attempt counter, incremented by RETRY
    #[serde(rename = "Attempt", default)]
    pub attempt: u32,
}

impl Operation {
    /// Creates a new operation in STARTED status.
    pub fn new(
        operation_id: impl Into<String>,
        operation_type: OperationType,
        status: OperationStatus,
    ) -> Self {
        Self {
            operation_id: operation_id.into(),
            operation_type,
            sub_type: None,
            status,
            name: None,
            parent_id: None,
            result: None,
            error: None,
            start_timestamp: None,
            end_timestamp: None,
            scheduled_end_timestamp: None,
            callback_id: None,
            attempt: 0,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_parent_id(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn with_result(mut self, result: impl Into<String>) -> Self {
        self.result = Some(result.into());
        self
    }

    pub fn with_error(mut self, error: ErrorObject) -> Self {
        self.error = Some(error);
        self
    }

    pub fn with_sub_type(mut self, sub_type: impl Into<String>) -> Self {
        self.sub_type = Some(sub_type.into());
        self
    }

    pub fn with_scheduled_end(mut self, timestamp: f64) -> Self {
        self.scheduled_end_timestamp = Some(timestamp);
        self
    }

    /// Returns true if a READY operation's backoff has elapsed at `now`.
    pub fn is_runnable_at(&self, now: f64) -> bool {
        match self.scheduled_end_timestamp {
            Some(end) => now >= end,
            None => true,
        }
    }
}

/// Options attached to a WAIT start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitOptions {
    /// Relative wait in seconds
    #[serde(rename = "WaitSeconds", skip_serializing_if = "Option::is_none")]
    pub wait_seconds: Option<u64>,
    /// Absolute deadline (epoch seconds)
    #[serde(rename = "UntilTimestamp", skip_serializing_if = "Option::is_none")]
    pub until_timestamp: Option<f64>,
}

/// Options attached to a RETRY update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryOptions {
    /// Backoff before the next attempt becomes runnable
    #[serde(rename = "NextAttemptDelaySeconds")]
    pub next_attempt_delay_seconds: u64,
}

/// Options attached to a CALLBACK start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackOptions {
    /// Overall timeout; the callback times out if not completed in time
    #[serde(rename = "TimeoutSeconds", skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    /// Heartbeat deadline, refreshed by out-of-band heartbeats
    #[serde(
        rename = "HeartbeatTimeoutSeconds",
        skip_serializing_if = "Option::is_none"
    )]
    pub heartbeat_timeout_seconds: Option<u64>,
}

/// Options attached to a CHAINED_INVOKE start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvokeOptions {
    /// Name of the durable function to invoke
    #[serde(rename = "FunctionName")]
    pub function_name: String,
}

/// A requested state change, validated against the transition table before
/// it is applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationUpdate {
    /// Target operation id
    #[serde(rename = "OperationId")]
    pub operation_id: String,
    /// The requested action
    #[serde(rename = "Action")]
    pub action: OperationAction,
    /// The operation kind the caller believes it is updating
    #[serde(rename = "OperationType")]
    pub operation_type: OperationType,
    /// Serialized payload for SUCCEED (and RETRY of a resumable step)
    #[serde(rename = "Payload", skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
    /// Failure details for FAIL (and RETRY after a failed attempt)
    #[serde(rename = "Error", skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
    /// Enclosing context id, recorded on START
    #[serde(rename = "ParentId", skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// Author-supplied name, recorded on START
    #[serde(rename = "Name", skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Engine-internal subtype, recorded on START
    #[serde(rename = "SubType", skip_serializing_if = "Option::is_none")]
    pub sub_type: Option<String>,
    /// WAIT scheduling details
    #[serde(rename = "WaitOptions", skip_serializing_if = "Option::is_none")]
    pub wait_options: Option<WaitOptions>,
    /// RETRY backoff details
    #[serde(rename = "RetryOptions", skip_serializing_if = "Option::is_none")]
    pub retry_options: Option<RetryOptions>,
    /// CALLBACK timeout details
    #[serde(rename = "CallbackOptions", skip_serializing_if = "Option::is_none")]
    pub callback_options: Option<CallbackOptions>,
    /// CHAINED_INVOKE target details
    #[serde(rename = "InvokeOptions", skip_serializing_if = "Option::is_none")]
    pub invoke_options: Option<InvokeOptions>,
}

impl OperationUpdate {
    fn new(
        operation_id: impl Into<String>,
        action: OperationAction,
        operation_type: OperationType,
    ) -> Self {
        Self {
            operation_id: operation_id.into(),
            action,
            operation_type,
            payload: None,
            error: None,
            parent_id: None,
            name: None,
            sub_type: None,
            wait_options: None,
            retry_options: None,
            callback_options: None,
            invoke_options: None,
        }
    }

    /// Creates a START update.
    pub fn start(operation_id: impl Into<String>, operation_type: OperationType) -> Self {
        Self::new(operation_id, OperationAction::Start, operation_type)
    }

    /// Creates a SUCCEED update with an optional payload.
    pub fn succeed(
        operation_id: impl Into<String>,
        operation_type: OperationType,
        payload: Option<String>,
    ) -> Self {
        let mut update = Self::new(operation_id, OperationAction::Succeed, operation_type);
        update.payload = payload;
        update
    }

    /// Creates a FAIL update carrying error details.
    pub fn fail(
        operation_id: impl Into<String>,
        operation_type: OperationType,
        error: ErrorObject,
    ) -> Self {
        let mut update = Self::new(operation_id, OperationAction::Fail, operation_type);
        update.error = Some(error);
        update
    }

    /// Creates a CANCEL update.
    pub fn cancel(operation_id: impl Into<String>, operation_type: OperationType) -> Self {
        Self::new(operation_id, OperationAction::Cancel, operation_type)
    }

    /// Creates a RETRY update scheduling the next attempt after `delay_seconds`.
    pub fn retry(
        operation_id: impl Into<String>,
        operation_type: OperationType,
        delay_seconds: u64,
    ) -> Self {
        let mut update = Self::new(operation_id, OperationAction::Retry, operation_type);
        update.retry_options = Some(RetryOptions {
            next_attempt_delay_seconds: delay_seconds,
        });
        update
    }

    pub fn with_parent_id(mut self, parent_id: Option<String>) -> Self {
        self.parent_id = parent_id;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_sub_type(mut self, sub_type: impl Into<String>) -> Self {
        self.sub_type = Some(sub_type.into());
        self
    }

    pub fn with_error(mut self, error: ErrorObject) -> Self {
        self.error = Some(error);
        self
    }

    pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    pub fn with_wait_options(mut self, options: WaitOptions) -> Self {
        self.wait_options = Some(options);
        self
    }

    pub fn with_callback_options(mut self, options: CallbackOptions) -> Self {
        self.callback_options = Some(options);
        self
    }

    pub fn with_invoke_options(mut self, options: InvokeOptions) -> Self {
        self.invoke_options = Some(options);
        self
    }
}
