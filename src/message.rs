//! Wire types for calls, returns, and response-queue messages
//!
//! The wire format is JSON with camelCase field names. A `CallId` message
//! attribute duplicates the payload's `callId` on transport so queue
//! consumers can route before parsing the body.

use crate::error::{Result, UserError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Transport attribute that duplicates the payload call id
pub const CALL_ID_ATTRIBUTE: &str = "CallId";

/// Maximum argument nesting depth accepted by the round-trip validator.
/// Deeper structures almost always indicate an accidental back-reference in
/// the caller's data.
const MAX_ARG_DEPTH: usize = 64;

/// Largest integer a JSON double can hold exactly
const MAX_SAFE_INTEGER: u64 = (1 << 53) - 1;

/// One logical invocation, as published to the provider
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Call {
    /// Client-chosen unique identifier; the correlation key on the queue
    pub call_id: String,
    /// Function symbol to invoke
    pub name: String,
    /// Serialized argument list
    pub args: Value,
    /// Response queue to publish the result to (queued mode only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_queue_id: Option<String>,
    /// Local send time, epoch milliseconds
    pub start: f64,
    /// Retry counter, engine-local
    #[serde(skip)]
    pub attempt: u32,
}

/// Terminal outcome tag of a [`ReturnPayload`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReturnKind {
    /// The function returned a value
    Returned,
    /// The function (or its runtime) raised
    Error,
}

/// The remote side's terminal response for one call
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReturnPayload {
    /// Outcome tag
    pub kind: ReturnKind,
    /// The call this responds to
    pub call_id: String,
    /// Returned value, present iff `kind == Returned`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    /// Error detail, present iff `kind == Error`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<UserError>,
    /// Remote execution start, epoch ms on the remote clock
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_execution_start: Option<f64>,
    /// Remote execution end, epoch ms on the remote clock
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_execution_end: Option<f64>,
    /// When the remote side published this response
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_response_sent: Option<f64>,
    /// Provider log URL for this execution
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_url: Option<String>,
    /// Provider execution instance identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    /// Provider execution identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    /// Peak memory in bytes, when the remote runtime reported it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_usage: Option<f64>,
}

impl ReturnPayload {
    /// Build a successful return
    pub fn returned(call_id: impl Into<String>, value: Value) -> Self {
        Self {
            kind: ReturnKind::Returned,
            call_id: call_id.into(),
            value: Some(value),
            error: None,
            remote_execution_start: None,
            remote_execution_end: None,
            remote_response_sent: None,
            log_url: None,
            instance_id: None,
            execution_id: None,
            memory_usage: None,
        }
    }

    /// Build a failed return
    pub fn failed(call_id: impl Into<String>, error: UserError) -> Self {
        let mut payload = Self::returned(call_id, Value::Null);
        payload.kind = ReturnKind::Error;
        payload.value = None;
        payload.error = Some(error);
        payload
    }

    /// Attach remote execution timestamps
    pub fn with_timings(mut self, start: f64, end: f64) -> Self {
        self.remote_execution_start = Some(start);
        self.remote_execution_end = Some(end);
        self
    }
}

/// CPU and memory usage sample reported by the remote runtime
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CpuMetricsSample {
    /// User CPU time, milliseconds
    pub utime: f64,
    /// System CPU time, milliseconds
    pub stime: f64,
    /// Resident memory, bytes
    pub memory: f64,
    /// Wall time since execution start, milliseconds
    pub elapsed: f64,
}

/// A message pulled off the response queue, decoded by the reconciler
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum QueueMessage {
    /// Terminal response; `body` is a serialized [`ReturnPayload`]
    Response {
        /// Correlation key
        call_id: String,
        /// Serialized [`ReturnPayload`]
        body: String,
    },
    /// The function began executing
    FunctionStarted {
        /// Correlation key
        call_id: String,
        /// Remote start time, epoch ms on the remote clock
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<f64>,
    },
    /// The provider gave up delivering the request
    DeadLetter {
        /// Correlation key
        call_id: String,
        /// Provider-supplied failure detail
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// Usage sample for an in-flight call
    CpuMetrics {
        /// Correlation key
        call_id: String,
        /// The sample
        metrics: CpuMetricsSample,
    },
    /// Client-authored sentinel that unblocks pollers at shutdown
    StopQueue,
}

impl QueueMessage {
    /// The correlation key, if this kind carries one
    pub fn call_id(&self) -> Option<&str> {
        match self {
            QueueMessage::Response { call_id, .. }
            | QueueMessage::FunctionStarted { call_id, .. }
            | QueueMessage::DeadLetter { call_id, .. }
            | QueueMessage::CpuMetrics { call_id, .. } => Some(call_id),
            QueueMessage::StopQueue => None,
        }
    }

    /// Serialize to the wire, with the `CallId` attribute duplicated for
    /// pre-payload routing.
    pub fn encode(&self) -> Result<RawQueueMessage> {
        let mut attributes = HashMap::new();
        if let Some(call_id) = self.call_id() {
            attributes.insert(CALL_ID_ATTRIBUTE.to_string(), call_id.to_string());
        }
        Ok(RawQueueMessage {
            body: serde_json::to_string(self)?,
            attributes,
        })
    }
}

/// An undecoded queue message as handed over by the provider driver
#[derive(Debug, Clone)]
pub struct RawQueueMessage {
    /// JSON body
    pub body: String,
    /// Transport attributes
    pub attributes: HashMap<String, String>,
}

impl RawQueueMessage {
    /// Decode the body into a [`QueueMessage`]
    pub fn decode(&self) -> Result<QueueMessage> {
        Ok(serde_json::from_str(&self.body)?)
    }
}

/// One long-poll batch from the response queue
#[derive(Debug, Default)]
pub struct PollResult {
    /// Messages in the batch, possibly empty
    pub messages: Vec<RawQueueMessage>,
    /// True when the provider reported the batch was truncated, so another
    /// poll should follow immediately
    pub is_full: bool,
}

/// Check that `args` survives a serialize/deserialize round trip without
/// structural loss, and flag values that a JSON-double consumer would
/// silently mangle. Returns human-readable warnings; never fails the call.
pub fn round_trip_warnings(args: &Value) -> Vec<String> {
    let mut warnings = Vec::new();

    match serde_json::to_string(args).map(|s| serde_json::from_str::<Value>(&s)) {
        Ok(Ok(round_tripped)) => {
            diff_values(args, &round_tripped, "$", 0, &mut warnings);
        }
        Ok(Err(e)) => warnings.push(format!("arguments do not re-parse: {}", e)),
        Err(e) => warnings.push(format!("arguments do not serialize: {}", e)),
    }

    check_precision(args, "$", 0, &mut warnings);
    warnings
}

fn diff_values(a: &Value, b: &Value, path: &str, depth: usize, warnings: &mut Vec<String>) {
    if depth > MAX_ARG_DEPTH {
        warnings.push(format!("{}: nesting exceeds {} levels", path, MAX_ARG_DEPTH));
        return;
    }
    match (a, b) {
        (Value::Object(ma), Value::Object(mb)) => {
            for (key, va) in ma {
                match mb.get(key) {
                    Some(vb) => {
                        diff_values(va, vb, &format!("{}.{}", path, key), depth + 1, warnings)
                    }
                    None => warnings.push(format!("{}.{}: lost in round trip", path, key)),
                }
            }
        }
        (Value::Array(la), Value::Array(lb)) => {
            if la.len() != lb.len() {
                warnings.push(format!(
                    "{}: length changed from {} to {}",
                    path,
                    la.len(),
                    lb.len()
                ));
                return;
            }
            for (i, (va, vb)) in la.iter().zip(lb).enumerate() {
                diff_values(va, vb, &format!("{}[{}]", path, i), depth + 1, warnings);
            }
        }
        _ => {
            if a != b {
                warnings.push(format!("{}: value changed in round trip", path));
            }
        }
    }
}

fn check_precision(value: &Value, path: &str, depth: usize, warnings: &mut Vec<String>) {
    if depth > MAX_ARG_DEPTH {
        return;
    }
    match value {
        Value::Number(n) => {
            let unsafe_int = n
                .as_u64()
                .map(|v| v > MAX_SAFE_INTEGER)
                .or_else(|| n.as_i64().map(|v| v.unsigned_abs() > MAX_SAFE_INTEGER))
                .unwrap_or(false);
            if unsafe_int {
                warnings.push(format!(
                    "{}: integer {} exceeds 2^53-1 and loses precision in a JSON double",
                    path, n
                ));
            }
        }
        Value::Object(map) => {
            for (key, v) in map {
                check_precision(v, &format!("{}.{}", path, key), depth + 1, warnings);
            }
        }
        Value::Array(list) => {
            for (i, v) in list.iter().enumerate() {
                check_precision(v, &format!("{}[{}]", path, i), depth + 1, warnings);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_call_wire_shape() {
        let call = Call {
            call_id: "c-1".into(),
            name: "hello".into(),
            args: json!(["world"]),
            response_queue_id: Some("rq-1".into()),
            start: 1700000000000.0,
            attempt: 3,
        };
        let wire = serde_json::to_value(&call).unwrap();
        assert_eq!(wire["callId"], "c-1");
        assert_eq!(wire["name"], "hello");
        assert_eq!(wire["args"], json!(["world"]));
        assert_eq!(wire["responseQueueId"], "rq-1");
        // attempt is engine-local and never hits the wire
        assert!(wire.get("attempt").is_none());

        let back: Call = serde_json::from_value(wire).unwrap();
        assert_eq!(back.attempt, 0);
        assert_eq!(back.call_id, "c-1");
    }

    #[test]
    fn test_sync_call_omits_queue_id() {
        let call = Call {
            call_id: "c-2".into(),
            name: "f".into(),
            args: json!([]),
            response_queue_id: None,
            start: 0.0,
            attempt: 0,
        };
        let wire = serde_json::to_value(&call).unwrap();
        assert!(wire.get("responseQueueId").is_none());
    }

    #[test]
    fn test_return_payload_wire_shape() {
        let payload = ReturnPayload::returned("c-1", json!(42)).with_timings(100.0, 150.0);
        let wire = serde_json::to_value(&payload).unwrap();
        assert_eq!(wire["kind"], "returned");
        assert_eq!(wire["callId"], "c-1");
        assert_eq!(wire["value"], 42);
        assert_eq!(wire["remoteExecutionStart"], 100.0);
        assert!(wire.get("error").is_none());

        let failed = ReturnPayload::failed("c-2", UserError::new("TypeError", "boom"));
        let wire = serde_json::to_value(&failed).unwrap();
        assert_eq!(wire["kind"], "error");
        assert_eq!(wire["error"]["name"], "TypeError");
    }

    #[test]
    fn test_queue_message_kinds_on_wire() {
        let started = QueueMessage::FunctionStarted {
            call_id: "c-1".into(),
            timestamp: Some(123.0),
        };
        let wire = serde_json::to_value(&started).unwrap();
        assert_eq!(wire["kind"], "functionstarted");
        assert_eq!(wire["callId"], "c-1");

        let stop = serde_json::to_value(QueueMessage::StopQueue).unwrap();
        assert_eq!(stop["kind"], "stopqueue");

        let dead: QueueMessage =
            serde_json::from_value(json!({"kind": "deadletter", "callId": "c-9"})).unwrap();
        assert!(matches!(dead, QueueMessage::DeadLetter { .. }));
        assert_eq!(dead.call_id(), Some("c-9"));
    }

    #[test]
    fn test_encode_duplicates_call_id_attribute() {
        let msg = QueueMessage::Response {
            call_id: "c-7".into(),
            body: "{}".into(),
        };
        let raw = msg.encode().unwrap();
        assert_eq!(raw.attributes.get(CALL_ID_ATTRIBUTE).unwrap(), "c-7");
        assert!(matches!(
            raw.decode().unwrap(),
            QueueMessage::Response { .. }
        ));

        let stop = QueueMessage::StopQueue.encode().unwrap();
        assert!(stop.attributes.is_empty());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let raw = RawQueueMessage {
            body: "not json".into(),
            attributes: HashMap::new(),
        };
        assert!(raw.decode().is_err());
    }

    #[test]
    fn test_round_trip_clean_args() {
        let warnings = round_trip_warnings(&json!(["world", 1, {"nested": [true, null]}]));
        assert!(warnings.is_empty(), "unexpected: {:?}", warnings);
    }

    #[test]
    fn test_round_trip_flags_unsafe_integers() {
        let warnings = round_trip_warnings(&json!([9007199254740993u64]));
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("2^53"));

        let warnings = round_trip_warnings(&json!({"big": -9007199254740993i64}));
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn test_round_trip_flags_excessive_depth() {
        let mut value = json!(1);
        for _ in 0..80 {
            value = json!([value]);
        }
        let warnings = round_trip_warnings(&value);
        assert!(warnings.iter().any(|w| w.contains("nesting")));
    }
}
