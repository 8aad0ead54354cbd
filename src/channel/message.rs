use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::ChannelError;

/// Categories broadcast by the POS backend.
///
/// Dispatch is keyed by plain strings, so categories missing here can be
/// subscribed to as well.
pub mod categories {
    pub const NEW_ORDER: &str = "new_order";
    pub const UPDATE_ORDER: &str = "update_order";
    pub const MENU_UPDATE: &str = "menu_update";
}

/// Connection state reported by [`EventChannel`](crate::EventChannel).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChannelState {
    Connecting,
    Open,
    Closed,
}

/// A push frame `{"type": <category>, ...payload}`.
#[derive(Clone, Debug, PartialEq)]
pub struct InboundMessage {
    pub category: String,
    /// Remaining fields of the frame object, without `type`.
    pub payload: JsonValue,
}

impl InboundMessage {
    /// Parses a text frame. Anything other than a JSON object with a string
    /// `type` field is a [`ChannelError::Protocol`].
    pub fn parse(text: &str) -> Result<Self, ChannelError> {
        let value: JsonValue = serde_json::from_str(text)
            .map_err(|err| ChannelError::Protocol(format!("frame is not JSON: {err}")))?;
        let JsonValue::Object(mut fields) = value else {
            return Err(ChannelError::Protocol("frame is not a JSON object".to_owned()));
        };
        let category = match fields.remove("type") {
            Some(JsonValue::String(category)) => category,
            Some(_) => {
                return Err(ChannelError::Protocol(
                    "frame `type` is not a string".to_owned(),
                ))
            }
            None => return Err(ChannelError::Protocol("frame has no `type`".to_owned())),
        };
        Ok(Self {
            category,
            payload: JsonValue::Object(fields),
        })
    }

    /// Deserializes the payload into a typed event.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }
}

/// Payload of `new_order` and `update_order`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderEvent {
    pub order_id: i64,
    pub status: String,
}
