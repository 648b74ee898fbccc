use fe2o3_amqp_types::messaging::annotations::OwnedKey;
use fe2o3_amqp_types::messaging::{Batch, Body, Data, Message, MessageAnnotations, MessageId, Properties};
use fe2o3_amqp_types::primitives::{Symbol, Value};

/// The opaque wire message this crate transports. Bodies are modeled as a
/// single AMQP `Value`, which covers both the twin layer's data sections and
/// any application payload handed to `send_async`.
pub type AmqpMessage = Message<Body<Value>>;

/// One-byte sentinel body used for twin GET/PUT/DELETE requests, which carry
/// no meaningful payload (§4.2.2).
pub const EMPTY_BODY_SENTINEL: &[u8] = b" ";

pub fn data_body(bytes: impl Into<Vec<u8>>) -> AmqpMessage {
    Message {
        header: None,
        delivery_annotations: None,
        message_annotations: None,
        properties: None,
        application_properties: None,
        body: Body::Data(Batch::from(vec![Data::from(bytes.into())])),
        footer: None,
    }
}

/// Returns the single data-section payload of this message's body, the way
/// the twin layer parses inbound messages (§4.2.5): zero bodies is "no
/// report", more than one data section or any other body kind is a parse
/// failure.
pub fn single_data_body(message: &AmqpMessage) -> Result<Option<&[u8]>, &'static str> {
    match &message.body {
        Body::Empty => Ok(None),
        Body::Data(batch) => {
            let sections: Vec<_> = batch.iter().collect();
            match sections.as_slice() {
                [] => Ok(None),
                [single] => Ok(Some(single.0.as_ref())),
                _ => Err("message body contains more than one data section"),
            }
        }
        _ => Err("message body is not a data section"),
    }
}

pub fn set_correlation_id(message: &mut AmqpMessage, correlation_id: &str) {
    let properties = message.properties.get_or_insert_with(Properties::default);
    properties.correlation_id = Some(MessageId::String(correlation_id.to_string()));
}

pub fn correlation_id(message: &AmqpMessage) -> Option<String> {
    message
        .properties
        .as_ref()
        .and_then(|p| p.correlation_id.as_ref())
        .map(|id| match id {
            MessageId::String(s) => s.clone(),
            MessageId::Uuid(u) => format!("{u:x}"),
            MessageId::ULong(n) => n.to_string(),
            MessageId::Binary(b) => String::from_utf8_lossy(b.as_ref()).into_owned(),
        })
}

pub fn set_message_annotation(message: &mut AmqpMessage, key: &str, value: Value) {
    let annotations = message
        .message_annotations
        .get_or_insert_with(MessageAnnotations::default);
    annotations.0.insert(OwnedKey::from(Symbol::from(key)), value);
}

pub fn message_annotation_str(message: &AmqpMessage, key: &str) -> Option<String> {
    message.message_annotations.as_ref().and_then(|a| {
        a.0.get(&OwnedKey::from(Symbol::from(key))).and_then(|v| match v {
            Value::String(s) => Some(s.clone()),
            Value::Symbol(s) => Some(s.as_str().to_string()),
            _ => None,
        })
    })
}

pub fn message_annotation_int(message: &AmqpMessage, key: &str) -> Option<i64> {
    message.message_annotations.as_ref().and_then(|a| {
        a.0.get(&OwnedKey::from(Symbol::from(key))).and_then(|v| match v {
            Value::Int(i) => Some(*i as i64),
            Value::Long(l) => Some(*l),
            Value::UInt(u) => Some(*u as i64),
            Value::ULong(u) => Some(*u as i64),
            _ => None,
        })
    })
}
