//! Structured view of a forwarded request

use cluster_common::error::{ClusterError, Result};
use cluster_proto::ForwardedRequest;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::fmt;

/// Read-only arguments of one request, handed to an endpoint handler.
///
/// Individual arguments are read with [`Payload::get_as`] and friends; an
/// endpoint with a fixed parameter schema can [`Payload::parse`] the whole map
/// into its own `Deserialize` type instead.
#[derive(Clone, PartialEq)]
pub struct Payload {
    endpoint: String,
    correlation_id: String,
    data: Map<String, Value>,
}

impl Payload {
    pub fn new(
        endpoint: impl Into<String>,
        correlation_id: impl Into<String>,
        data: Map<String, Value>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            correlation_id: correlation_id.into(),
            data,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.data.iter()
    }

    /// The raw argument map
    pub fn raw(&self) -> &Map<String, Value> {
        &self.data
    }

    /// Deserialize one argument, failing if it is missing or mistyped
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let value = self
            .data
            .get(key)
            .ok_or_else(|| ClusterError::invalid_input(format!("missing argument '{}'", key)))?;

        T::deserialize(value).map_err(|e| {
            ClusterError::invalid_input(format!("argument '{}' has the wrong type: {}", key, e))
        })
    }

    /// Deserialize an optional argument; `null` counts as absent
    pub fn get_opt<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.data.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(_) => self.get_as(key).map(Some),
        }
    }

    pub fn str(&self, key: &str) -> Result<&str> {
        self.data
            .get(key)
            .and_then(Value::as_str)
            .ok_or_else(|| ClusterError::invalid_input(format!("argument '{}' is not a string", key)))
    }

    pub fn i64(&self, key: &str) -> Result<i64> {
        self.data
            .get(key)
            .and_then(Value::as_i64)
            .ok_or_else(|| ClusterError::invalid_input(format!("argument '{}' is not an integer", key)))
    }

    pub fn bool(&self, key: &str) -> Result<bool> {
        self.data
            .get(key)
            .and_then(Value::as_bool)
            .ok_or_else(|| ClusterError::invalid_input(format!("argument '{}' is not a boolean", key)))
    }

    /// Deserialize the whole argument map into an endpoint's parameter type
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T> {
        T::deserialize(Value::Object(self.data.clone())).map_err(|e| {
            ClusterError::invalid_input(format!(
                "arguments for '{}' do not match: {}",
                self.endpoint, e
            ))
        })
    }
}

impl From<ForwardedRequest> for Payload {
    fn from(request: ForwardedRequest) -> Self {
        Self::new(request.endpoint, request.uuid, request.data)
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Payload")
            .field("endpoint", &self.endpoint)
            .field("len", &self.data.len())
            .finish()
    }
}
