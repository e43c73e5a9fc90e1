use thiserror::Error;

use crate::codec::{self, CodecError, Map, Value};

/// DNS-SD type that directory records are announced under
pub const DIRECTORY_SERVICE_TYPE: &str = "_meshdir._tcp.local.";

/// DNS-SD meta query used to enumerate service types on the mesh
pub const META_QUERY_TYPE: &str = "_services._dns-sd._udp.local.";

/// Current service record format version
pub const RECORD_VERSION: &str = "1.1";

/// Message kind discriminator for client requests
pub const REQUEST_TYPE: u8 = 0;

/// Byte bounds for a single control-socket message in each direction
pub const REQUEST_MAX: usize = 1024;
pub const RESPONSE_MAX: usize = 1024;

/// TXT record keys used when announcing a service record
pub const TXT_NAME: &str = "name";
pub const TXT_DESCRIPTION: &str = "description";
pub const TXT_URI: &str = "uri";
pub const TXT_ICON: &str = "icon";
pub const TXT_VERSION: &str = "version";
pub const TXT_TTL: &str = "ttl";
pub const TXT_LIFETIME: &str = "lifetime";
pub const TXT_KEY: &str = "key";
pub const TXT_SIGNATURE: &str = "signature";
/// Categories are announced as `cat.0`, `cat.1`, ...
pub const TXT_CATEGORY_PREFIX: &str = "cat.";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("not a request (message type {0})")]
    WrongMessageType(u8),

    #[error("invalid envelope: {0}")]
    InvalidEnvelope(&'static str),
}

/// One client request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub id: u32,
    pub command: String,
    pub params: Vec<Value>,
}

impl Request {
    pub fn new(id: u32, command: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            id,
            command: command.into(),
            params,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        codec::encode_bounded(
            &[
                Value::U8(REQUEST_TYPE),
                Value::U32(self.id),
                Value::from(self.command.as_str()),
                Value::List(self.params.clone()),
            ],
            REQUEST_MAX,
        )
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (values, _) = codec::decode(bytes)?;
        let [kind, id, command, params]: [Value; 4] = values
            .try_into()
            .map_err(|_| ProtocolError::InvalidEnvelope("expected four request fields"))?;

        match kind {
            Value::U8(REQUEST_TYPE) => {}
            Value::U8(other) => return Err(ProtocolError::WrongMessageType(other)),
            _ => return Err(ProtocolError::InvalidEnvelope("message type is not a byte")),
        }
        let Value::U32(id) = id else {
            return Err(ProtocolError::InvalidEnvelope("request id is not a u32"));
        };
        let Some(command) = command.as_str().map(str::to_string) else {
            return Err(ProtocolError::InvalidEnvelope("command is not a string"));
        };
        let Value::List(params) = params else {
            return Err(ProtocolError::InvalidEnvelope("params is not a list"));
        };

        Ok(Self {
            id,
            command,
            params,
        })
    }
}

/// Reply to a [`Request`]: a result map on success, an error map on failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub id: u32,
    pub outcome: Result<Map, Map>,
}

impl Response {
    pub fn success(id: u32, result: Map) -> Self {
        Self {
            id,
            outcome: Ok(result),
        }
    }

    pub fn failure(id: u32, message: impl Into<String>) -> Self {
        Self {
            id,
            outcome: Err(error_map(message)),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let (error, result) = match &self.outcome {
            Ok(result) => (Value::Nil, Value::Map(result.clone())),
            Err(error) => (Value::Map(error.clone()), Value::Nil),
        };
        codec::encode_bounded(&[Value::U32(self.id), error, result], RESPONSE_MAX)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (values, _) = codec::decode(bytes)?;
        let [id, error, result]: [Value; 3] = values
            .try_into()
            .map_err(|_| ProtocolError::InvalidEnvelope("expected three response fields"))?;

        let Value::U32(id) = id else {
            return Err(ProtocolError::InvalidEnvelope("response id is not a u32"));
        };
        let outcome = match (error, result) {
            (Value::Nil, Value::Map(result)) => Ok(result),
            (Value::Map(error), Value::Nil) => Err(error),
            _ => {
                return Err(ProtocolError::InvalidEnvelope(
                    "exactly one of error and result must be set",
                ))
            }
        };
        Ok(Self { id, outcome })
    }
}

/// Builds the `{"error": message}` map carried by failure responses.
pub fn error_map(message: impl Into<String>) -> Map {
    let mut map = Map::new();
    map.insert("error", message.into());
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    fn commit_request() -> Request {
        let mut service = Map::new();
        service.insert("name", "Mesh Chat");
        service.insert("description", "chat app");
        service.insert("uri", "http://10.0.0.1:8080");
        service.insert("icon", "chat.png");
        Request::new(42, "commit_service", vec![Value::Map(service)])
    }

    #[test]
    fn test_request_round_trip_keeps_id_command_and_params() {
        let request = commit_request();
        let decoded = Request::decode(&request.encode().unwrap()).unwrap();
        assert_eq!(decoded.id, 42);
        assert_eq!(decoded.command, "commit_service");
        assert_eq!(decoded.params, request.params);
    }

    #[test]
    fn test_truncated_request_never_decodes() {
        let bytes = commit_request().encode().unwrap();
        for len in 0..bytes.len() {
            assert!(
                Request::decode(&bytes[..len]).is_err(),
                "prefix of {len} bytes decoded"
            );
        }
    }

    #[test]
    fn test_non_request_type_is_rejected() {
        let bytes = codec::encode(&[
            Value::U8(1),
            Value::U32(7),
            Value::from("help"),
            Value::List(vec![]),
        ])
        .unwrap();
        assert_eq!(
            Request::decode(&bytes).unwrap_err(),
            ProtocolError::WrongMessageType(1)
        );
    }

    #[test]
    fn test_short_correlation_id_is_rejected() {
        let bytes = codec::encode(&[
            Value::U8(REQUEST_TYPE),
            Value::U16(7),
            Value::from("help"),
            Value::List(vec![]),
        ])
        .unwrap();
        assert!(matches!(
            Request::decode(&bytes),
            Err(ProtocolError::InvalidEnvelope(_))
        ));
    }

    #[test]
    fn test_failure_response_carries_error_map_and_nil_result() {
        let response = Response::failure(9, "unknown command: frob");
        let bytes = response.encode().unwrap();
        let (values, _) = codec::decode(&bytes).unwrap();
        assert_eq!(values[0], Value::U32(9));
        assert_eq!(
            values[1].as_map().and_then(|m| m.get("error")).and_then(Value::as_str),
            Some("unknown command: frob")
        );
        assert!(values[2].is_nil());
        assert_eq!(Response::decode(&bytes).unwrap(), response);
    }

    #[test]
    fn test_oversized_response_fails_to_encode() {
        let mut result = Map::new();
        result.insert("blob", "z".repeat(RESPONSE_MAX));
        let err = Response::success(1, result).encode().unwrap_err();
        assert!(matches!(err, CodecError::TooLarge { limit: RESPONSE_MAX, .. }));
    }
}
