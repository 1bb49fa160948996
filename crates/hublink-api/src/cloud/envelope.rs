// ── Cloud event-socket envelope ──
//
// Every text frame is a JSON object:
//   event:            {"event": name, "data": payload}
//   acknowledged:     {"event": name, "data": payload, "ack": n}
//   acknowledgement:  {"ack": n, "data": response}

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    event: Option<String>,
    #[serde(default)]
    data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ack: Option<u64>,
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Frame {
    Event {
        name: String,
        data: Value,
        ack: Option<u64>,
    },
    Ack {
        id: u64,
        data: Value,
    },
}

pub(crate) fn decode(text: &str) -> Result<Frame, Error> {
    let envelope: Envelope = serde_json::from_str(text).map_err(|e| Error::Deserialization {
        message: e.to_string(),
        body: text.to_owned(),
    })?;

    match (envelope.event, envelope.ack) {
        (Some(name), ack) => Ok(Frame::Event {
            name,
            data: envelope.data,
            ack,
        }),
        (None, Some(id)) => Ok(Frame::Ack {
            id,
            data: envelope.data,
        }),
        (None, None) => Err(Error::Deserialization {
            message: "frame has neither `event` nor `ack`".into(),
            body: text.to_owned(),
        }),
    }
}

pub(crate) fn encode_event(name: &str, data: Value, ack: Option<u64>) -> Result<String, Error> {
    let envelope = Envelope {
        event: Some(name.to_owned()),
        data,
        ack,
    };
    Ok(serde_json::to_string(&envelope)?)
}

pub(crate) fn encode_ack(id: u64, data: Value) -> Result<String, Error> {
    let envelope = Envelope {
        event: None,
        data,
        ack: Some(id),
    };
    Ok(serde_json::to_string(&envelope)?)
}

/// Interpret an acknowledgement payload. An object with `success: false`
/// is a remote-reported failure; anything else is the response.
pub(crate) fn ack_outcome(data: Value) -> Result<Value, Error> {
    if data.get("success").and_then(Value::as_bool) != Some(false) {
        return Ok(data);
    }

    let message = data
        .get("error")
        .and_then(|error| {
            error
                .get("message")
                .and_then(Value::as_str)
                .or_else(|| error.as_str())
        })
        .or_else(|| data.get("message").and_then(Value::as_str))
        .unwrap_or("remote reported failure")
        .to_owned();

    Err(Error::Remote { message })
}
