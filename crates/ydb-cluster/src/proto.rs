//! Protocol messages for the discovery service and the shared operation
//! envelope.
//!
//! Hand-written prost messages carrying only the fields this client reads.
//! Unknown fields sent by the server are skipped by the decoder.

use prost::Message;

use ydb_core::{Error, Issue, OperationError, StatusCode};

pub const LIST_ENDPOINTS: &str = "/Ydb.Discovery.V1.DiscoveryService/ListEndpoints";
pub const WHO_AM_I: &str = "/Ydb.Discovery.V1.DiscoveryService/WhoAmI";

#[derive(Clone, PartialEq, Message)]
pub struct Any {
    #[prost(string, tag = "1")]
    pub type_url: String,
    #[prost(bytes = "vec", tag = "2")]
    pub value: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct IssueMessage {
    #[prost(string, tag = "2")]
    pub message: String,
    #[prost(uint32, tag = "4")]
    pub issue_code: u32,
    #[prost(uint32, tag = "5")]
    pub severity: u32,
    #[prost(message, repeated, tag = "6")]
    pub issues: Vec<IssueMessage>,
}

impl From<&IssueMessage> for Issue {
    fn from(m: &IssueMessage) -> Self {
        Issue {
            message: m.message.clone(),
            code: m.issue_code,
            severity: m.severity,
            issues: m.issues.iter().map(Issue::from).collect(),
        }
    }
}

/// Outcome envelope returned by most server methods.
#[derive(Clone, PartialEq, Message)]
pub struct Operation {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(bool, tag = "2")]
    pub ready: bool,
    #[prost(int32, tag = "3")]
    pub status: i32,
    #[prost(message, repeated, tag = "4")]
    pub issues: Vec<IssueMessage>,
    #[prost(message, optional, tag = "5")]
    pub result: Option<Any>,
}

impl Operation {
    /// A completed, successful operation wrapping `result`.
    pub fn success<M: Message>(type_url: &str, result: &M) -> Self {
        Self {
            id: String::new(),
            ready: true,
            status: StatusCode::Success.code(),
            issues: Vec::new(),
            result: Some(Any {
                type_url: type_url.to_string(),
                value: result.encode_to_vec(),
            }),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        StatusCode::from_code(self.status)
    }

    pub fn issues(&self) -> Vec<Issue> {
        self.issues.iter().map(Issue::from).collect()
    }

    /// `NotReady` for a pending operation, an operation error for a
    /// non-success status, `None` otherwise.
    pub fn to_error(&self) -> Option<Error> {
        if !self.ready {
            return Some(Error::NotReady {
                operation_id: self.id.clone(),
            });
        }
        match self.status_code() {
            StatusCode::Success => None,
            status => Some(
                OperationError::new(status, self.issues())
                    .with_operation_id(self.id.clone())
                    .into(),
            ),
        }
    }

    /// Decode the result payload. A missing payload decodes as the empty
    /// message.
    pub fn decode_result<M: Message + Default>(&self, what: &'static str) -> Result<M, Error> {
        let Some(any) = &self.result else {
            return Ok(M::default());
        };
        M::decode(any.value.as_slice()).map_err(|e| Error::Decode {
            what,
            message: e.to_string(),
        })
    }
}

/// Responses that carry an [`Operation`] envelope.
///
/// The invocation layer inspects it to turn server-side outcomes into
/// errors. Responses without an envelope keep the default.
pub trait OperationResponse {
    fn operation(&self) -> Option<&Operation> {
        None
    }
}

// ── Discovery ──────────────────────────────────────────────────

#[derive(Clone, PartialEq, Message)]
pub struct ListEndpointsRequest {
    #[prost(string, tag = "1")]
    pub database: String,
    #[prost(string, repeated, tag = "2")]
    pub service: Vec<String>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ListEndpointsResponse {
    #[prost(message, optional, tag = "1")]
    pub operation: Option<Operation>,
}

#[derive(Clone, PartialEq, Message)]
pub struct EndpointInfo {
    #[prost(string, tag = "1")]
    pub address: String,
    #[prost(uint32, tag = "2")]
    pub port: u32,
    #[prost(float, tag = "3")]
    pub load_factor: f32,
    #[prost(bool, tag = "4")]
    pub ssl: bool,
    #[prost(string, repeated, tag = "5")]
    pub service: Vec<String>,
    #[prost(string, tag = "6")]
    pub location: String,
    #[prost(uint32, tag = "7")]
    pub node_id: u32,
}

#[derive(Clone, PartialEq, Message)]
pub struct ListEndpointsResult {
    #[prost(message, repeated, tag = "1")]
    pub endpoints: Vec<EndpointInfo>,
    #[prost(string, tag = "2")]
    pub self_location: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct WhoAmIRequest {
    #[prost(bool, tag = "1")]
    pub include_groups: bool,
}

#[derive(Clone, PartialEq, Message)]
pub struct WhoAmIResponse {
    #[prost(message, optional, tag = "1")]
    pub operation: Option<Operation>,
}

#[derive(Clone, PartialEq, Message)]
pub struct WhoAmIResult {
    #[prost(string, tag = "1")]
    pub user: String,
    #[prost(string, repeated, tag = "2")]
    pub groups: Vec<String>,
}

impl OperationResponse for ListEndpointsResponse {
    fn operation(&self) -> Option<&Operation> {
        self.operation.as_ref()
    }
}

impl OperationResponse for WhoAmIResponse {
    fn operation(&self) -> Option<&Operation> {
        self.operation.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_operation_is_not_ready() {
        let op = Operation {
            id: "op-1".into(),
            ready: false,
            ..Operation::default()
        };
        match op.to_error() {
            Some(Error::NotReady { operation_id }) => assert_eq!(operation_id, "op-1"),
            other => panic!("expected NotReady, got {other:?}"),
        }
    }

    #[test]
    fn failed_operation_carries_issues() {
        let op = Operation {
            id: "op-2".into(),
            ready: true,
            status: StatusCode::Overloaded.code(),
            issues: vec![IssueMessage {
                message: "too many sessions".into(),
                issue_code: 1060,
                severity: 1,
                issues: vec![],
            }],
            result: None,
        };
        let err = op.to_error().unwrap();
        assert_eq!(err.operation_status(), Some(StatusCode::Overloaded));
        match err {
            Error::Operation(e) => {
                assert_eq!(e.operation_id(), "op-2");
                assert_eq!(e.issues()[0].code, 1060);
            }
            other => panic!("expected operation error, got {other:?}"),
        }
    }

    #[test]
    fn success_decodes_payload() {
        let result = WhoAmIResult {
            user: "root".into(),
            groups: vec!["admins".into()],
        };
        let op = Operation::success("type.googleapis.com/Ydb.Discovery.WhoAmIResult", &result);
        assert!(op.to_error().is_none());

        let decoded: WhoAmIResult = op.decode_result("who am i").unwrap();
        assert_eq!(decoded, result);
    }

    #[test]
    fn garbage_payload_is_decode_error() {
        let op = Operation {
            ready: true,
            status: StatusCode::Success.code(),
            result: Some(Any {
                type_url: String::new(),
                value: vec![0xff, 0xff, 0xff],
            }),
            ..Operation::default()
        };
        let err = op.decode_result::<ListEndpointsResult>("list endpoints").unwrap_err();
        assert!(matches!(err, Error::Decode { what: "list endpoints", .. }));
    }
}
