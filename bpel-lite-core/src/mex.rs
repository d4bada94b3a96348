//! Message-exchange lifecycle: one object per request/response interaction,
//! persisted so it survives instance suspension.
//!
//! Legal status transitions:
//!
//! ```text
//! NEW → REQUEST → {ONE_WAY, ASYNC}
//! REQUEST → {RESPONSE, FAULT, FAILURE}   (reply produced in-thread)
//! ASYNC   → {RESPONSE, FAULT, FAILURE}   (reply produced out of band)
//! ```
//!
//! `ONE_WAY`, `RESPONSE`, `FAULT` and `FAILURE` are terminal for the
//! interaction; the exchange may still be read for audit until collected.

use crate::error::EngineError;
use crate::types::{now_ms, MexPattern, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ─── Status enums ─────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MexStatus {
    /// Created, not yet invoked.
    New,
    /// The request is being processed.
    Request,
    /// The reply will arrive out of band — the original caller's thread is
    /// gone, so any later reply schedules a continuation job.
    Async,
    /// One-way request delivered; nothing further expected.
    OneWay,
    Response,
    Fault,
    Failure,
}

impl MexStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MexStatus::OneWay | MexStatus::Response | MexStatus::Fault | MexStatus::Failure
        )
    }
}

/// Coarse classification of *why* an inbound exchange ended up where it
/// did. Observability only — never drives routing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CorrelationStatus {
    Unknown,
    /// No process implements the targeted service.
    UnknownEndpoint,
    /// A new instance was spawned for this message.
    CreateInstance,
    /// An existing waiting route consumed it.
    Matched,
    /// No match yet; message persisted for later.
    Queued,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureType {
    UnknownEndpoint,
    UnknownOperation,
    /// Request message was malformed (e.g. correlation properties could not
    /// be evaluated).
    FormatError,
    /// Queued message expired without ever finding a route.
    NoMatch,
    /// Instance-creation rejected because the process version is retired.
    ProcessRetired,
    /// Exchange abandoned (instance terminated before replying).
    Aborted,
    Other,
}

// ─── Message exchange ─────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MexFailure {
    pub failure_type: FailureType,
    pub reason: String,
}

/// One message interaction between the engine and a partner.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MessageExchange {
    pub mex_id: Uuid,
    pub pattern: MexPattern,
    pub status: MexStatus,
    pub correlation_status: CorrelationStatus,
    /// Service the transport addressed; kept so a deferred delivery can
    /// re-enter routing from the persisted exchange alone.
    pub service: String,
    pub partner_link: String,
    pub operation: String,
    /// Session/conversation identifier from the endpoint reference, when
    /// the binding carries one (opaque correlation).
    pub session_id: Option<String>,
    pub request: Option<Value>,
    pub response: Option<Value>,
    /// Fault name, when the reply is a declared fault.
    pub fault: Option<String>,
    pub failure: Option<MexFailure>,
    /// Target instance, once routing has decided one.
    pub instance_id: Option<Uuid>,
    /// Resumption coordinates on MATCHED: `"<group>&<index>"`.
    pub channel: Option<String>,
    pub created_at: Timestamp,
}

impl MessageExchange {
    /// New inbound (myRole) exchange carrying a request payload. The
    /// pattern stays `Unknown` until the target operation is resolved.
    pub fn inbound(
        service: &str,
        partner_link: &str,
        operation: &str,
        request: Value,
        session_id: Option<&str>,
    ) -> Self {
        Self {
            mex_id: Uuid::now_v7(),
            pattern: MexPattern::Unknown,
            status: MexStatus::New,
            correlation_status: CorrelationStatus::Unknown,
            service: service.to_string(),
            partner_link: partner_link.to_string(),
            operation: operation.to_string(),
            session_id: session_id.map(str::to_string),
            request: Some(request),
            response: None,
            fault: None,
            failure: None,
            instance_id: None,
            channel: None,
            created_at: now_ms(),
        }
    }

    /// NEW → REQUEST. Anything else is an engine bug.
    pub fn mark_request(&mut self) -> Result<(), EngineError> {
        if self.status != MexStatus::New {
            return Err(EngineError::Consistency(format!(
                "mex {}: mark_request in status {:?}",
                self.mex_id, self.status
            )));
        }
        self.status = MexStatus::Request;
        Ok(())
    }

    /// Settle a REQUEST exchange that produced no in-thread reply, per the
    /// operation's declared pattern: one-way operations complete as
    /// `ONE_WAY`; request-response operations go `ASYNC` and will be
    /// answered by a continuation job.
    pub fn settle_pattern(&mut self, pattern: MexPattern) -> Result<(), EngineError> {
        if self.status != MexStatus::Request {
            return Err(EngineError::Consistency(format!(
                "mex {}: settle_pattern in status {:?}",
                self.mex_id, self.status
            )));
        }
        self.pattern = pattern;
        self.status = match pattern {
            MexPattern::OneWay => MexStatus::OneWay,
            MexPattern::RequestResponse | MexPattern::Unknown => MexStatus::Async,
        };
        Ok(())
    }

    /// Record the response payload. Legal only in REQUEST or ASYNC — a
    /// reply in any other status means the engine routed a reply to the
    /// wrong exchange or replayed one, and must fail loudly.
    ///
    /// Returns `true` if the exchange was ASYNC, i.e. the caller must
    /// schedule a continuation job to push the response out of band.
    pub fn set_response(&mut self, payload: Value) -> Result<bool, EngineError> {
        let was_async = self.guard_reply("set_response")?;
        self.status = MexStatus::Response;
        self.fault = None;
        self.response = Some(payload);
        Ok(was_async)
    }

    /// Record a declared fault as the reply. Same REQUEST/ASYNC guard as
    /// [`set_response`](Self::set_response).
    pub fn set_fault(&mut self, fault_name: &str, payload: Option<Value>) -> Result<bool, EngineError> {
        let was_async = self.guard_reply("set_fault")?;
        self.status = MexStatus::Fault;
        self.fault = Some(fault_name.to_string());
        self.response = payload;
        Ok(was_async)
    }

    /// Record a failure. Unlike replies, failures may strike an exchange in
    /// any status (e.g. a queued message expiring long after settling).
    pub fn set_failure(&mut self, failure_type: FailureType, reason: &str) {
        self.status = MexStatus::Failure;
        self.failure = Some(MexFailure {
            failure_type,
            reason: reason.to_string(),
        });
    }

    fn guard_reply(&self, what: &str) -> Result<bool, EngineError> {
        match self.status {
            MexStatus::Request => Ok(false),
            MexStatus::Async => Ok(true),
            other => Err(EngineError::Consistency(format!(
                "mex {}: {what} in status {other:?} (expected REQUEST or ASYNC)",
                self.mex_id
            ))),
        }
    }
}
