//! JSON-RPC 2.0 envelope shared by the node and wallet clients.
//! See: https://www.jsonrpc.org/specification

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub static JSONRPC_VERSION: &str = "2.0";

/// Error member of a failed call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorData {
    /// A Number that indicates the error type that occurred.
    pub code: i32,

    /// A short description of the error.
    pub message: String,
}

impl std::fmt::Display for ErrorData {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "({}: {})", self.code, self.message)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Request {
    pub jsonrpc: String,
    pub method: String,
    pub params: Vec<Value>,
    pub id: Value,
}

impl Request {
    pub fn new(method: &str, params: Vec<Value>) -> Self {
        Request {
            jsonrpc: JSONRPC_VERSION.into(),
            method: method.to_owned(),
            params,
            id: json!(1),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct Response {
    #[serde(default)]
    pub result: Value,
    pub error: Option<ErrorData>,
    #[allow(dead_code)]
    pub id: Value,
}

impl Response {
    /// Splits the envelope into either the typed result or the error
    /// member.
    pub fn into_result<T: DeserializeOwned>(self) -> Result<T, RpcFailure> {
        if let Some(e) = self.error {
            return Err(RpcFailure::Server(e));
        }
        serde_json::from_value(self.result).map_err(|e| RpcFailure::Decode(e.to_string()))
    }
}

#[derive(Debug)]
pub enum RpcFailure {
    /// The server answered with an error member.
    Server(ErrorData),
    /// The result member did not decode as the expected type.
    Decode(String),
}

impl std::fmt::Display for RpcFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            RpcFailure::Server(e) => write!(f, "{}", e),
            RpcFailure::Decode(e) => write!(f, "cannot decode result: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_and_error_split() {
        let resp: Response =
            serde_json::from_str(r#"{"result":7,"error":null,"id":1}"#).unwrap();
        let n: u32 = resp.into_result().unwrap();
        assert_eq!(n, 7);

        let resp: Response = serde_json::from_str(
            r#"{"result":null,"error":{"code":-5,"message":"no tx info"},"id":1}"#,
        )
        .unwrap();
        match resp.into_result::<u32>() {
            Err(RpcFailure::Server(e)) => {
                assert_eq!(e.code, -5);
                assert_eq!(e.message, "no tx info");
            }
            other => panic!("unexpected {:?}", other),
        }

        let resp: Response =
            serde_json::from_str(r#"{"result":"text","error":null,"id":1}"#).unwrap();
        assert!(matches!(resp.into_result::<u32>(), Err(RpcFailure::Decode(_))));
    }
}
