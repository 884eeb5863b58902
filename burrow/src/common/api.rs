// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Wire messages for the tunnel RPC plane and their HTTP conversions.
//!
//! Requests and responses cross the tunnel as protobuf-shaped messages with
//! flat `(name, value)` pair lists for headers and query parameters, so
//! multi-valued entries round-trip losslessly: order within a single name is
//! preserved, order across names is not guaranteed.

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode as HttpStatus};

/// Largest inbound HTTP body accepted on the public side.
pub const MAX_REQUEST_SIZE: usize = 1024 * 1024;
/// Largest response body a client may return before it is replaced with a
/// synthesized 413.
pub const MAX_BODY_SIZE: usize = 500 * 1024 * 1024;
/// Largest frame either side of the RPC stream will accept; leaves room for
/// headers alongside a maximal body.
pub const MAX_MESSAGE: usize = 600 * 1024 * 1024;

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Pair {
  #[prost(string, tag = "1")]
  pub name: ::prost::alloc::string::String,
  #[prost(string, tag = "2")]
  pub value: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ApiRequest {
  #[prost(string, tag = "1")]
  pub method: ::prost::alloc::string::String,
  /// Path component only; the query string travels in `parameters`.
  #[prost(string, tag = "2")]
  pub url: ::prost::alloc::string::String,
  #[prost(message, repeated, tag = "3")]
  pub headers: ::prost::alloc::vec::Vec<Pair>,
  #[prost(message, repeated, tag = "4")]
  pub parameters: ::prost::alloc::vec::Vec<Pair>,
  #[prost(bytes = "bytes", tag = "5")]
  pub body: ::prost::bytes::Bytes,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ApiResponse {
  #[prost(int64, tag = "1")]
  pub status: i64,
  #[prost(message, repeated, tag = "2")]
  pub headers: ::prost::alloc::vec::Vec<Pair>,
  #[prost(bytes = "bytes", tag = "3")]
  pub body: ::prost::bytes::Bytes,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Empty {}

/// First frame on every RPC connection; selects the stream's method.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StreamHeader {
  #[prost(enumeration = "RpcMethod", tag = "1")]
  pub method: i32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ::prost::Enumeration)]
#[repr(i32)]
pub enum RpcMethod {
  ReverseServe = 0,
  Heartbeat = 1,
}

/// Server's answer to a [StreamHeader], using gRPC status numbering.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RpcStatus {
  #[prost(enumeration = "StatusCode", tag = "1")]
  pub code: i32,
  #[prost(string, tag = "2")]
  pub message: ::prost::alloc::string::String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ::prost::Enumeration)]
#[repr(i32)]
pub enum StatusCode {
  Ok = 0,
  NotFound = 5,
  Internal = 13,
  Unauthenticated = 16,
}

impl RpcStatus {
  pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
    Self {
      code: code as i32,
      message: message.into(),
    }
  }

  pub fn ok() -> Self {
    Self::new(StatusCode::Ok, "")
  }

  pub fn status_code(&self) -> Option<StatusCode> {
    StatusCode::try_from(self.code).ok()
  }
}

#[derive(thiserror::Error, Debug)]
pub enum RequestEncodeError {
  #[error("request body exceeds the {MAX_REQUEST_SIZE}-byte limit")]
  TooLarge,
  #[error("failure reading request body: {0}")]
  Body(#[from] hyper::Error),
}

#[derive(thiserror::Error, Debug)]
pub enum ConvertError {
  #[error("invalid HTTP method {0:?}")]
  Method(String),
  #[error("invalid HTTP status {0}")]
  Status(i64),
  #[error("failure assembling HTTP message: {0}")]
  Http(#[from] http::Error),
}

/// Buffers an inbound HTTP request into an [ApiRequest], failing with
/// [RequestEncodeError::TooLarge] once the body passes [MAX_REQUEST_SIZE].
pub async fn request_to_proto(
  request: http::Request<hyper::Body>,
) -> Result<ApiRequest, RequestEncodeError> {
  use hyper::body::HttpBody as _;
  let (parts, mut body) = request.into_parts();
  let mut buffer: Vec<u8> = Vec::new();
  while let Some(chunk) = body.data().await {
    let chunk = chunk?;
    if buffer.len() + chunk.len() > MAX_REQUEST_SIZE {
      return Err(RequestEncodeError::TooLarge);
    }
    buffer.extend_from_slice(&chunk);
  }
  Ok(ApiRequest {
    method: parts.method.as_str().to_string(),
    url: parts.uri.path().to_string(),
    headers: headers_to_pairs(&parts.headers),
    parameters: query_to_pairs(parts.uri.query()),
    body: Bytes::from(buffer),
  })
}

/// Rebuilds the client-side HTTP request handed to the tunnel's handler.
pub fn proto_to_request(request: ApiRequest) -> Result<http::Request<Bytes>, ConvertError> {
  let method = Method::from_bytes(request.method.as_bytes())
    .map_err(|_| ConvertError::Method(request.method.clone()))?;
  let path = if request.url.is_empty() {
    "/"
  } else {
    request.url.as_str()
  };
  let uri = if request.parameters.is_empty() {
    path.to_string()
  } else {
    format!("{}?{}", path, pairs_to_query(&request.parameters))
  };
  let mut builder = http::Request::builder().method(method).uri(uri);
  for pair in &request.headers {
    builder = builder.header(pair.name.as_str(), pair.value.as_str());
  }
  Ok(builder.body(request.body)?)
}

/// Captures a handler's buffered response; an over-limit body is replaced
/// wholesale with a 413 and a short diagnostic payload.
pub fn response_to_proto(response: http::Response<Bytes>) -> ApiResponse {
  response_to_proto_with_limit(response, MAX_BODY_SIZE)
}

fn response_to_proto_with_limit(response: http::Response<Bytes>, limit: usize) -> ApiResponse {
  let (parts, body) = response.into_parts();
  if body.len() > limit {
    return ApiResponse {
      status: HttpStatus::PAYLOAD_TOO_LARGE.as_u16() as i64,
      headers: Vec::new(),
      body: Bytes::from_static(b"response too large"),
    };
  }
  ApiResponse {
    status: parts.status.as_u16() as i64,
    headers: headers_to_pairs(&parts.headers),
    body,
  }
}

/// Converts a tunneled response back into the HTTP response written to the
/// public-side caller.
pub fn proto_to_response(response: ApiResponse) -> Result<http::Response<hyper::Body>, ConvertError> {
  let status = u16::try_from(response.status)
    .ok()
    .and_then(|status| HttpStatus::from_u16(status).ok())
    .ok_or(ConvertError::Status(response.status))?;
  let mut builder = http::Response::builder().status(status);
  for pair in &response.headers {
    builder = builder.header(pair.name.as_str(), pair.value.as_str());
  }
  Ok(builder.body(hyper::Body::from(response.body))?)
}

fn headers_to_pairs(headers: &HeaderMap) -> Vec<Pair> {
  headers
    .iter()
    .map(|(name, value)| Pair {
      name: name.as_str().to_string(),
      value: String::from_utf8_lossy(value.as_bytes()).into_owned(),
    })
    .collect()
}

fn query_to_pairs(query: Option<&str>) -> Vec<Pair> {
  let Some(query) = query else {
    return Vec::new();
  };
  form_urlencoded::parse(query.as_bytes())
    .map(|(name, value)| Pair {
      name: name.into_owned(),
      value: value.into_owned(),
    })
    .collect()
}

fn pairs_to_query(pairs: &[Pair]) -> String {
  let mut serializer = form_urlencoded::Serializer::new(String::new());
  for pair in pairs {
    serializer.append_pair(&pair.name, &pair.value);
  }
  serializer.finish()
}

/// Body of `POST /connect`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ConnectRequest {
  pub id: String,
}

/// Successful `/connect` response: where to dial and what to dial with.
/// The PEM fields travel base64-encoded in JSON.
#[derive(Clone, serde::Serialize, serde::Deserialize)]
pub struct ConnectResponse {
  pub port: u16,
  #[serde(with = "base64_pem")]
  pub ca: Vec<u8>,
  #[serde(rename = "privateKey", with = "base64_pem")]
  pub private_key: Vec<u8>,
  #[serde(with = "base64_pem")]
  pub certificate: Vec<u8>,
}

impl std::fmt::Debug for ConnectResponse {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    // Key material stays out of logs
    f.debug_struct("ConnectResponse")
      .field("port", &self.port)
      .finish_non_exhaustive()
  }
}

mod base64_pem {
  use base64::engine::general_purpose::STANDARD;
  use base64::Engine as _;
  use serde::{Deserialize, Deserializer, Serializer};

  pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&STANDARD.encode(bytes))
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
    let encoded = String::deserialize(deserializer)?;
    STANDARD
      .decode(encoded.as_bytes())
      .map_err(serde::de::Error::custom)
  }
}
