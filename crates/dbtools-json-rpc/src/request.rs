use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{JsonRpcVersion, RequestId};

/// A JSON-RPC request
///
/// `params` is kept as an opaque JSON value; handlers decode it into their
/// own parameter type with [`JsonRpcRequest::params_as`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    #[serde(rename = "jsonrpc")]
    pub version: JsonRpcVersion,
    pub id: RequestId,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: RequestId, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            version: JsonRpcVersion::V2_0,
            id,
            method: method.into(),
            params,
        }
    }

    /// Create a new request with no parameters
    pub fn new_no_params(id: RequestId, method: impl Into<String>) -> Self {
        Self::new(id, method, None)
    }

    /// Decode the parameters into `T`. Absent params decode from `null`.
    pub fn params_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.params.clone().unwrap_or(Value::Null))
    }

    /// Get a parameter by name (if params are an object)
    pub fn get_param(&self, name: &str) -> Option<&Value> {
        self.params.as_ref()?.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{from_str, json, to_string};

    #[derive(Debug, Deserialize, PartialEq)]
    struct ConnectParams {
        owner_uri: String,
    }

    #[test]
    fn test_request_serialization() {
        let request = JsonRpcRequest::new_no_params(RequestId::Number(1), "version");

        let json = to_string(&request).unwrap();
        let parsed: JsonRpcRequest = from_str(&json).unwrap();

        assert_eq!(parsed.id, RequestId::Number(1));
        assert_eq!(parsed.method, "version");
        assert!(parsed.params.is_none());
        assert!(!json.contains("params"));
    }

    #[test]
    fn test_params_as() {
        let request = JsonRpcRequest::new(
            RequestId::from("c-1"),
            "connection/connect",
            Some(json!({"owner_uri": "file:///a.sql"})),
        );

        let params: ConnectParams = request.params_as().unwrap();
        assert_eq!(params.owner_uri, "file:///a.sql");
        assert_eq!(request.get_param("owner_uri"), Some(&json!("file:///a.sql")));
    }

    #[test]
    fn test_params_as_rejects_wrong_shape() {
        let request = JsonRpcRequest::new(RequestId::Number(2), "m", Some(json!([1, 2])));
        assert!(request.params_as::<ConnectParams>().is_err());
    }
}
