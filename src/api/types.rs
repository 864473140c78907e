use std::{collections::BTreeMap, fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::api::util;

///////////////
// ErrorCode //
///////////////

/// Outcome of a traced operation. Serialized as its integer code.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum ErrorCode {
    #[default]
    Ok,
    Error,
    Exception,
    Timeout,
}

impl ErrorCode {
    pub fn is_ok(&self) -> bool {
        *self == ErrorCode::Ok
    }
}

impl From<ErrorCode> for u8 {
    fn from(code: ErrorCode) -> Self {
        match code {
            ErrorCode::Ok => 0,
            ErrorCode::Error => 1,
            ErrorCode::Exception => 2,
            ErrorCode::Timeout => 3,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Unknown error code {0}")]
pub struct UnknownErrorCode(pub u8);

impl TryFrom<u8> for ErrorCode {
    type Error = UnknownErrorCode;

    fn try_from(code: u8) -> Result<Self, UnknownErrorCode> {
        match code {
            0 => Ok(ErrorCode::Ok),
            1 => Ok(ErrorCode::Error),
            2 => Ok(ErrorCode::Exception),
            3 => Ok(ErrorCode::Timeout),
            other => Err(UnknownErrorCode(other)),
        }
    }
}

////////////
// Origin //
////////////

/// Where an event came from. Runner and trigger events are protected from trimming.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Origin {
    /// The invocation itself.
    Runner,
    /// The external stimulus that started the invocation.
    Trigger,
    /// Any other adapter-defined origin, e.g. `"http"`.
    Other(String),
}

impl Origin {
    pub fn as_str(&self) -> &str {
        match self {
            Origin::Runner => "runner",
            Origin::Trigger => "trigger",
            Origin::Other(s) => s.as_str(),
        }
    }

    pub fn is_runner(&self) -> bool {
        matches!(self, Origin::Runner)
    }

    /// Runner and trigger events always survive trimming.
    pub fn is_protected(&self) -> bool {
        matches!(self, Origin::Runner | Origin::Trigger)
    }
}

impl From<&str> for Origin {
    fn from(s: &str) -> Self {
        match s {
            "runner" => Origin::Runner,
            "trigger" => Origin::Trigger,
            other => Origin::Other(other.to_owned()),
        }
    }
}

impl From<String> for Origin {
    fn from(s: String) -> Self {
        match s.as_str() {
            "runner" => Origin::Runner,
            "trigger" => Origin::Trigger,
            _ => Origin::Other(s),
        }
    }
}

impl From<Origin> for String {
    fn from(o: Origin) -> Self {
        match o {
            Origin::Other(s) => s,
            o => o.as_str().to_owned(),
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

///////////////////
// MetadataValue //
///////////////////

/// A metadata value: either plain text, or structured data the filtering walk can recurse into.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Text(String),
    Structured(serde_json::Value),
}

/// Event metadata, ordered by key. Keys are unique by construction.
pub type Metadata = BTreeMap<String, MetadataValue>;

impl MetadataValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            MetadataValue::Text(s) => Some(s.as_str()),
            MetadataValue::Structured(serde_json::Value::String(s)) => Some(s.as_str()),
            MetadataValue::Structured(_) => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            MetadataValue::Text(s) => serde_json::Value::String(s.clone()),
            MetadataValue::Structured(v) => v.clone(),
        }
    }
}

impl From<&str> for MetadataValue {
    fn from(s: &str) -> Self {
        MetadataValue::Text(s.to_owned())
    }
}

impl From<String> for MetadataValue {
    fn from(s: String) -> Self {
        MetadataValue::Text(s)
    }
}

impl From<serde_json::Value> for MetadataValue {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::String(s) => MetadataValue::Text(s),
            v => MetadataValue::Structured(v),
        }
    }
}

macro_rules! impl_from_scalar {
    ($ty:ty) => {
        impl From<$ty> for MetadataValue {
            fn from(v: $ty) -> Self {
                MetadataValue::Structured(serde_json::Value::from(v))
            }
        }
    };
}

impl_from_scalar!(bool);
impl_from_scalar!(i32);
impl_from_scalar!(i64);
impl_from_scalar!(u32);
impl_from_scalar!(u64);
impl_from_scalar!(f64);

//////////////
// Resource //
//////////////

/// What an event acted upon, and how.
#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct Resource {
    pub name: String,
    #[serde(rename = "type")]
    pub resource_type: String,
    pub operation: String,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Resource {
    pub fn new(
        resource_type: impl Into<String>,
        name: impl Into<String>,
        operation: impl Into<String>,
    ) -> Self {
        Resource {
            name: name.into(),
            resource_type: resource_type.into(),
            operation: operation.into(),
            metadata: Metadata::new(),
        }
    }
}

///////////////
// ErrorInfo //
///////////////

/// The type, message and stack of an error being recorded.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct ErrorInfo {
    pub kind: String,
    pub message: String,
    pub traceback: String,
}

impl ErrorInfo {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        ErrorInfo {
            kind: kind.into(),
            message: message.into(),
            traceback: String::new(),
        }
    }

    pub fn with_traceback(mut self, traceback: impl Into<String>) -> Self {
        self.traceback = traceback.into();
        self
    }

    /// Capture an error value. The kind is the concrete Rust type name and the traceback is the
    /// chain of `source()` errors, one per line.
    pub fn from_error<E: std::error::Error + ?Sized>(err: &E) -> Self {
        let mut traceback = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            traceback.push(format!("caused by: {cause}"));
            source = cause.source();
        }

        ErrorInfo {
            kind: short_type_name(std::any::type_name::<E>()).to_owned(),
            message: err.to_string(),
            traceback: traceback.join("\n"),
        }
    }
}

impl From<&anyhow::Error> for ErrorInfo {
    fn from(err: &anyhow::Error) -> Self {
        let traceback = err
            .chain()
            .skip(1)
            .map(|cause| format!("caused by: {cause}"))
            .collect::<Vec<_>>()
            .join("\n");
        ErrorInfo {
            kind: "anyhow::Error".to_owned(),
            message: err.to_string(),
            traceback,
        }
    }
}

fn short_type_name(full: &str) -> &str {
    // `type_name` of a trait object is "dyn path::Error", keep it as is
    if full.starts_with("dyn ") {
        return full;
    }
    match full.find('<') {
        Some(generic_start) => {
            let head = &full[..generic_start];
            let name_start = head.rfind("::").map(|i| i + 2).unwrap_or(0);
            &full[name_start..]
        }
        None => full.rsplit("::").next().unwrap_or(full),
    }
}

///////////////
// Exception //
///////////////

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Exception {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    pub traceback: String,
    pub time: f64,
    #[serde(default)]
    pub additional_data: BTreeMap<String, String>,
}

impl Exception {
    pub fn new(info: ErrorInfo) -> Self {
        Exception {
            kind: info.kind,
            message: info.message,
            traceback: info.traceback,
            time: util::now(),
            additional_data: BTreeMap::new(),
        }
    }

    pub fn with_data<K, V, I>(mut self, data: I) -> Self
    where
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        self.additional_data
            .extend(data.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn is_handled(&self) -> Option<bool> {
        self.additional_data
            .get("handled")
            .and_then(|h| bool::from_str(h).ok())
    }
}

///////////
// Event //
///////////

/// One traced operation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub start_time: f64,
    pub resource: Resource,
    pub origin: Origin,
    pub duration: f64,
    pub error_code: ErrorCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception: Option<Exception>,
}

impl Event {
    pub fn new(resource: Resource, origin: impl Into<Origin>) -> Self {
        Event {
            id: util::new_event_id(),
            start_time: util::now(),
            resource,
            origin: origin.into(),
            duration: 0.0,
            error_code: ErrorCode::Ok,
            exception: None,
        }
    }

    pub fn metadata(&self) -> &Metadata {
        &self.resource.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.resource.metadata
    }
}

///////////
// Trace //
///////////

/// The complete record of one invocation, in the shape handed to a sender.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    pub app_name: String,
    pub token: String,
    pub events: Vec<Event>,
    pub exceptions: Vec<Exception>,
    pub version: String,
    pub platform: String,
}

impl Trace {
    pub fn runner(&self) -> Option<&Event> {
        self.events.iter().find(|e| e.origin.is_runner())
    }

    pub fn has_errors(&self) -> bool {
        self.events.iter().any(|e| !e.error_code.is_ok())
    }
}
