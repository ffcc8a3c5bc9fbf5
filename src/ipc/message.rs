use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use super::{IpcError, HOST_TO_JS};

/// Wire unit exchanged between host and page.
///
/// A request carries `channel` (and `id` when it expects an answer); a
/// response carries only `reply_id` plus `result` or `error`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IpcMessage {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub reply_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub channel: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<Value>,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub result: Value,
    #[serde(
        skip_serializing_if = "String::is_empty",
        deserialize_with = "lenient_error"
    )]
    pub error: String,
}

impl IpcMessage {
    pub fn request(id: impl Into<String>, channel: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            id: id.into(),
            channel: channel.into(),
            args,
            ..Self::default()
        }
    }

    /// A request nobody answers.
    pub fn notification(channel: impl Into<String>, args: Vec<Value>) -> Self {
        Self::request(String::new(), channel, args)
    }

    pub fn reply(reply_id: impl Into<String>, outcome: Result<Value, IpcError>) -> Self {
        let (result, error) = match outcome {
            Ok(value) => (value, String::new()),
            Err(err) => (Value::Null, err.to_string()),
        };
        Self {
            reply_id: reply_id.into(),
            result,
            error,
            ..Self::default()
        }
    }

    pub fn parse(payload: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(payload)
    }

    pub fn is_reply(&self) -> bool {
        !self.reply_id.is_empty()
    }

    pub fn expects_reply(&self) -> bool {
        !self.id.is_empty()
    }

    /// Outcome carried by a response.
    pub fn outcome(self) -> Result<Value, IpcError> {
        if self.error.is_empty() {
            Ok(self.result)
        } else {
            Err(IpcError::Remote(self.error))
        }
    }

    /// Script statement delivering this message to the page relay.
    pub fn to_script(&self) -> Result<String, serde_json::Error> {
        let text = serde_json::to_string(self)?;
        // A JSON string literal is also a valid script string literal.
        let literal = serde_json::to_string(&text)?;
        Ok(format!("window.top['{HOST_TO_JS}']({literal})"))
    }
}

/// Pages sometimes post an `Error` object or `null` instead of a string.
fn lenient_error<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Null => String::new(),
        Value::String(text) => text,
        Value::Object(map) if map.is_empty() => "script error".to_string(),
        Value::Object(map) => match map.get("message") {
            Some(Value::String(message)) => message.clone(),
            _ => Value::Object(map).to_string(),
        },
        other => other.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_and_reply_shapes_do_not_overlap() {
        let request = IpcMessage::request("abc", "ping", vec![json!(42)]);
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({"id": "abc", "channel": "ping", "args": [42]})
        );

        let reply = IpcMessage::reply("abc", Err(IpcError::ChannelNotFound("nope".into())));
        let encoded = serde_json::to_value(&reply).unwrap();
        assert_eq!(encoded["replyId"], "abc");
        assert!(encoded.get("result").is_none());
        assert!(encoded.get("channel").is_none());
        assert!(!encoded["error"].as_str().unwrap().is_empty());
    }

    #[test]
    fn parses_page_messages_with_empty_fields() {
        let message = IpcMessage::parse(
            r#"{"id":"","replyId":"k1","channel":"","args":[],"result":7,"error":""}"#,
        )
        .unwrap();
        assert!(message.is_reply());
        assert!(!message.expects_reply());
        assert_eq!(message.outcome().unwrap(), json!(7));
    }

    #[test]
    fn error_objects_become_text() {
        let message =
            IpcMessage::parse(r#"{"replyId":"k2","error":{"message":"boom"}}"#).unwrap();
        assert!(matches!(message.outcome(), Err(IpcError::Remote(text)) if text == "boom"));
    }

    #[test]
    fn script_wraps_message_in_string_literal() {
        let script = IpcMessage::request("x", "say", vec![json!("it's \"quoted\"")])
            .to_script()
            .unwrap();
        assert!(script.starts_with("window.top['__go2js'](\""));
        assert!(script.ends_with("\")"));
        let literal = &script["window.top['__go2js']".len() + 1..script.len() - 1];
        let text: String = serde_json::from_str(literal).unwrap();
        let decoded = IpcMessage::parse(&text).unwrap();
        assert_eq!(decoded.channel, "say");
    }
}
