//! Twin request/response wire encoding (§4.2.1, §4.2.2).

use fe2o3_amqp_types::primitives::Value;

use crate::amqp::message::{
    correlation_id, data_body, message_annotation_int, set_correlation_id,
    set_message_annotation, single_data_body, AmqpMessage, EMPTY_BODY_SENTINEL,
};

pub(crate) const API_VERSION: &str = "2016-11-14";
pub(crate) const DESIRED_PROPERTIES_RESOURCE: &str = "/notifications/twin/properties/desired";
pub(crate) const REPORTED_PROPERTIES_RESOURCE: &str = "/properties/reported";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TwinOperation {
    Patch,
    Get,
    Put,
    Delete,
}

impl TwinOperation {
    fn as_str(self) -> &'static str {
        match self {
            TwinOperation::Patch => "PATCH",
            TwinOperation::Get => "GET",
            TwinOperation::Put => "PUT",
            TwinOperation::Delete => "DELETE",
        }
    }

    fn resource(self) -> Option<&'static str> {
        match self {
            TwinOperation::Patch => Some(REPORTED_PROPERTIES_RESOURCE),
            TwinOperation::Put | TwinOperation::Delete => Some(DESIRED_PROPERTIES_RESOURCE),
            TwinOperation::Get => None,
        }
    }
}

/// Builds a request message for `operation` with `correlation_id`. `patch_body`
/// is the user's JSON buffer for PATCH; every other operation carries the
/// one-byte sentinel body (§4.2.2).
pub(crate) fn build_request(
    operation: TwinOperation,
    correlation_id_value: &str,
    patch_body: Option<&[u8]>,
) -> AmqpMessage {
    let body = match operation {
        TwinOperation::Patch => patch_body.unwrap_or(EMPTY_BODY_SENTINEL),
        _ => EMPTY_BODY_SENTINEL,
    };
    let mut message = data_body(body.to_vec());
    set_correlation_id(&mut message, correlation_id_value);
    set_message_annotation(&mut message, "operation", Value::String(operation.as_str().to_string()));
    if let Some(resource) = operation.resource() {
        set_message_annotation(&mut message, "resource", Value::String(resource.to_string()));
    }
    message
}

/// A parsed twin response (§4.2.5).
pub(crate) struct TwinResponse<'a> {
    pub correlation_id: Option<String>,
    pub status: Option<i64>,
    pub version: Option<i64>,
    pub body: Result<Option<&'a [u8]>, &'static str>,
}

pub(crate) fn parse_response(message: &AmqpMessage) -> TwinResponse<'_> {
    TwinResponse {
        correlation_id: correlation_id(message),
        status: message_annotation_int(message, "status"),
        version: message_annotation_int(message, "version"),
        body: single_data_body(message),
    }
}

pub(crate) fn is_success_status(status: i64) -> bool {
    (200..300).contains(&status)
}
