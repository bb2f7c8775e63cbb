//! Request/response envelope spoken between the front door and entities

use std::collections::HashMap;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::Error;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl FromStr for Method {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Self::Get),
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "PATCH" => Ok(Self::Patch),
            "DELETE" => Ok(Self::Delete),
            _ => Err(Error::MethodNotAllowed),
        }
    }
}

/// A request forwarded to an entity instance. `path` is the subpath below
/// the entity prefix, e.g. `/claims` for `POST /coordinator/claims`.
#[derive(Debug, Clone)]
pub struct EntityRequest {
    pub method: Method,
    pub path: String,
    pub query: HashMap<String, String>,
    pub body: Option<Value>,
}

impl EntityRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: HashMap::new(),
            body: None,
        }
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(key.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Path split into non-empty segments.
    pub fn segments(&self) -> Vec<&str> {
        self.path.split('/').filter(|s| !s.is_empty()).collect()
    }

    /// Deserialize the JSON body into a typed request record. A missing
    /// body parses as an empty object so fully-optional records work.
    pub fn parse_body<T: DeserializeOwned>(&self) -> Result<T> {
        let body = self
            .body
            .clone()
            .unwrap_or_else(|| Value::Object(Default::default()));
        serde_json::from_value(body)
            .map_err(|err| Error::Validation(format!("Invalid request body: {}", err)))
    }

    pub fn query_param(&self, key: &str) -> Option<&str> {
        self.query.get(key).map(String::as_str)
    }

    pub fn query_usize(&self, key: &str) -> Option<usize> {
        self.query_param(key).and_then(|v| v.parse().ok())
    }

    pub fn query_i64(&self, key: &str) -> Option<i64> {
        self.query_param(key).and_then(|v| v.parse().ok())
    }

    pub fn query_flag(&self, key: &str) -> bool {
        matches!(self.query_param(key), Some("true") | Some("1"))
    }
}

/// Response produced by an entity handler.
#[derive(Debug, Clone)]
pub struct EntityResponse {
    pub status: u16,
    pub body: Value,
}

impl EntityResponse {
    pub fn ok(body: Value) -> Self {
        Self { status: 200, body }
    }

    pub fn created(body: Value) -> Self {
        Self { status: 201, body }
    }

    pub fn json(status: u16, body: Value) -> Self {
        Self { status, body }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Deserialize the body, used on the internal peer-call path.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.body.clone())?)
    }
}

impl From<Error> for EntityResponse {
    fn from(err: Error) -> Self {
        Self {
            status: err.status(),
            body: err.body(),
        }
    }
}
