use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{Operation, OperationArgs, OperationId, OperationStatus};

/// Topic the daemon listens on for requests.
pub const REQUEST_TOPIC: &str = "daemon";
/// Topic carrying every operation's status updates.
pub const STATUS_TOPIC: &str = "status";

/// Topic carrying the status updates of a single operation.
pub fn status_topic(id: OperationId) -> String {
    format!("{STATUS_TOPIC}/{id}")
}

/// Correlation id of a request; the reply is published on its string form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn topic(&self) -> String {
        self.0.to_string()
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ResponseResult {
    Ok,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RequestCreate {
    pub id: RequestId,
    pub args: OperationArgs,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ResponseCreate {
    pub result: ResponseResult,
    pub operation: Option<Operation>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RequestAbort {
    pub id: RequestId,
    pub operation_id: OperationId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ResponseAbort {
    pub result: ResponseResult,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RequestList {
    pub id: RequestId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ResponseList {
    pub operations: Vec<Operation>,
}

/// Progress broadcast for one operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct StatusUpdate {
    pub operation_id: OperationId,
    pub status: OperationStatus,
}

/// Every message that travels over the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    RequestCreate(RequestCreate),
    ResponseCreate(ResponseCreate),
    RequestAbort(RequestAbort),
    ResponseAbort(ResponseAbort),
    RequestList(RequestList),
    ResponseList(ResponseList),
    StatusUpdate(StatusUpdate),
}

impl Message {
    pub fn request_create(args: OperationArgs) -> (RequestId, Self) {
        let id = RequestId::new();
        (id, Message::RequestCreate(RequestCreate { id, args }))
    }

    pub fn request_abort(operation_id: OperationId) -> (RequestId, Self) {
        let id = RequestId::new();
        (id, Message::RequestAbort(RequestAbort { id, operation_id }))
    }

    pub fn request_list() -> (RequestId, Self) {
        let id = RequestId::new();
        (id, Message::RequestList(RequestList { id }))
    }

    pub fn create_ok(operation: Operation) -> Self {
        Message::ResponseCreate(ResponseCreate {
            result: ResponseResult::Ok,
            operation: Some(operation),
            message: None,
        })
    }

    pub fn create_error(message: impl Into<String>) -> Self {
        Message::ResponseCreate(ResponseCreate {
            result: ResponseResult::Error,
            operation: None,
            message: Some(message.into()),
        })
    }

    pub fn abort_ok() -> Self {
        Message::ResponseAbort(ResponseAbort {
            result: ResponseResult::Ok,
            message: None,
        })
    }

    pub fn abort_error(message: impl Into<String>) -> Self {
        Message::ResponseAbort(ResponseAbort {
            result: ResponseResult::Error,
            message: Some(message.into()),
        })
    }

    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Message::RequestCreate(_) => "request_create",
            Message::ResponseCreate(_) => "response_create",
            Message::RequestAbort(_) => "request_abort",
            Message::ResponseAbort(_) => "response_abort",
            Message::RequestList(_) => "request_list",
            Message::ResponseList(_) => "response_list",
            Message::StatusUpdate(_) => "status_update",
        }
    }
}

/// Generate the JSON Schema of the bus message family.
pub fn generate_schema() -> String {
    let schema = schemars::schema_for!(Message);
    serde_json::to_string_pretty(&schema).unwrap_or_else(|e| format!("{{\"error\": \"{e}\"}}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_are_tagged_by_type() {
        let (id, message) = Message::request_create(OperationArgs::Dummy { iterations: 2 });
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["type"], "request_create");
        assert_eq!(value["id"], id.to_string());
        assert_eq!(value["args"]["type"], "dummy");

        let decoded: Message = serde_json::from_value(value).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn each_request_gets_a_fresh_correlation_id() {
        let (a, _) = Message::request_list();
        let (b, _) = Message::request_list();
        assert_ne!(a, b);
        assert_eq!(a.topic(), a.to_string());
    }

    #[test]
    fn status_topic_is_scoped_by_operation() {
        let id = OperationId::new();
        assert_eq!(status_topic(id), format!("status/{id}"));
    }

    #[test]
    fn schema_names_the_message_family() {
        let schema = generate_schema();
        assert!(schema.contains("$schema"));
        assert!(schema.contains("request_create"));
        assert!(schema.contains("status_update"));
    }
}
