//! Traced HTTP client capability.
//!
//! Scripts reach the network only through [`TracedClient`]. Every request
//! appends a request-direction [`NetEvent`] to the execution's [`NetTrace`]
//! before the request is sent, and a response-direction event after the
//! response arrives. A failed send leaves the request event behind, so the
//! trace still shows the attempt.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use reqwest::{Client, Method};
use serde::{Deserialize, Serialize};

/// Error type for the HTTP capability.
#[derive(Debug, thiserror::Error)]
pub enum HttpError {
  /// The method string was not a recognized HTTP method.
  #[error("unsupported HTTP method: {method}")]
  InvalidMethod { method: String },

  /// The underlying request failed.
  #[error("request failed: {0}")]
  Request(#[from] reqwest::Error),
}

/// Direction of a traced network event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetDirection {
  Request,
  Response,
}

/// The request a traced event belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestDescriptor {
  pub method: String,
  pub url: String,
}

/// One entry in an execution's network trace.
///
/// Request events carry no body; response events carry the response payload
/// handed back to the script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetEvent {
  pub timestamp: DateTime<Utc>,
  pub direction: NetDirection,
  pub request: RequestDescriptor,
  pub body: Option<serde_json::Value>,
}

/// Collects network events for one execution. Clones share the same buffer.
#[derive(Debug, Clone, Default)]
pub struct NetTrace {
  inner: Arc<Mutex<Vec<NetEvent>>>,
}

impl NetTrace {
  pub fn new() -> Self {
    Self::default()
  }

  /// Record that a request is about to be sent.
  pub fn push_request(&self, request: RequestDescriptor) {
    let mut events = self.inner.lock().unwrap();
    events.push(NetEvent {
      timestamp: Utc::now(),
      direction: NetDirection::Request,
      request,
      body: None,
    });
  }

  /// Record the response handed back to the script.
  pub fn push_response(&self, request: RequestDescriptor, body: serde_json::Value) {
    let mut events = self.inner.lock().unwrap();
    events.push(NetEvent {
      timestamp: Utc::now(),
      direction: NetDirection::Response,
      request,
      body: Some(body),
    });
  }

  /// Take all events out of the trace, leaving it empty.
  pub fn drain(&self) -> Vec<NetEvent> {
    let mut events = self.inner.lock().unwrap();
    std::mem::take(&mut *events)
  }

  /// Snapshot of the events recorded so far.
  pub fn events(&self) -> Vec<NetEvent> {
    self.inner.lock().unwrap().clone()
  }
}

/// HTTP client that records every exchange into a [`NetTrace`].
#[derive(Debug, Clone)]
pub struct TracedClient {
  client: Client,
  trace: NetTrace,
}

impl TracedClient {
  pub fn new(trace: NetTrace) -> Self {
    Self {
      client: Client::new(),
      trace,
    }
  }

  /// Send a request and return `{ status, headers, body }` as JSON.
  ///
  /// The response body is parsed as JSON when possible and falls back to a
  /// plain string otherwise.
  pub async fn request(
    &self,
    method: &str,
    url: &str,
    headers: Option<HashMap<String, String>>,
    body: Option<serde_json::Value>,
  ) -> Result<serde_json::Value, HttpError> {
    let method = parse_method(method)?;

    let descriptor = RequestDescriptor {
      method: method.to_string(),
      url: url.to_string(),
    };
    self.trace.push_request(descriptor.clone());

    let mut request = self.client.request(method, url);

    if let Some(headers) = &headers {
      for (key, value) in headers {
        request = request.header(key, value);
      }
    }

    if let Some(body) = &body {
      request = request.json(body);
    }

    let response = request.send().await?;

    let status = response.status().as_u16();
    let response_headers: HashMap<String, String> = response
      .headers()
      .iter()
      .filter_map(|(k, v)| {
        v.to_str()
          .ok()
          .map(|val| (k.as_str().to_string(), val.to_string()))
      })
      .collect();

    let text = response.text().await?;
    let body_value = serde_json::from_str(&text).unwrap_or(serde_json::Value::String(text));

    let output = serde_json::json!({
        "status": status,
        "headers": response_headers,
        "body": body_value,
    });

    self.trace.push_response(descriptor, output.clone());

    Ok(output)
  }
}

fn parse_method(method: &str) -> Result<Method, HttpError> {
  match method.to_uppercase().as_str() {
    "GET" => Ok(Method::GET),
    "POST" => Ok(Method::POST),
    "PUT" => Ok(Method::PUT),
    "DELETE" => Ok(Method::DELETE),
    "PATCH" => Ok(Method::PATCH),
    "HEAD" => Ok(Method::HEAD),
    "OPTIONS" => Ok(Method::OPTIONS),
    _ => Err(HttpError::InvalidMethod {
      method: method.to_string(),
    }),
  }
}
