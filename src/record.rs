//! Resource records as read from the buffer file.
//!
//! A record keeps the exact JSON text it was parsed from. Only `resourceType`
//! and `id` are extracted; the body is forwarded to the server untouched.

use serde::Deserialize;

/// Errors raised when a line cannot be turned into a record.
#[derive(Debug)]
pub enum RecordError {
    /// Line is not valid JSON
    Json(serde_json::Error),

    /// Line is valid JSON but not an object
    NotAnObject,

    /// `resourceType` is missing or empty
    MissingResourceType,
}

impl std::fmt::Display for RecordError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordError::Json(e) => write!(f, "Invalid resource JSON: {}", e),
            RecordError::NotAnObject => write!(f, "Resource is not a JSON object"),
            RecordError::MissingResourceType => write!(f, "Resource has no resourceType"),
        }
    }
}

impl std::error::Error for RecordError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RecordError::Json(e) => Some(e),
            RecordError::NotAnObject | RecordError::MissingResourceType => None,
        }
    }
}

impl From<serde_json::Error> for RecordError {
    fn from(err: serde_json::Error) -> Self {
        RecordError::Json(err)
    }
}

/// The fields the loader needs to route a resource.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecordHeader {
    #[serde(default)]
    resource_type: Option<String>,

    #[serde(default)]
    id: Option<String>,
}

/// One FHIR resource to upsert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRecord {
    resource_type: String,
    id: Option<String>,
    body: String,
}

impl ResourceRecord {
    /// Parse a record from its serialized JSON object.
    ///
    /// An empty `id` is treated as absent.
    pub fn parse(body: impl Into<String>) -> Result<Self, RecordError> {
        let body = body.into();
        let header: RecordHeader = serde_json::from_str(&body)?;

        // Derived struct deserializers also accept sequences
        if !body.trim_start().starts_with('{') {
            return Err(RecordError::NotAnObject);
        }

        let resource_type = header
            .resource_type
            .filter(|t| !t.is_empty())
            .ok_or(RecordError::MissingResourceType)?;
        let id = header.id.filter(|id| !id.is_empty());

        Ok(Self {
            resource_type,
            id,
            body,
        })
    }

    pub fn resource_type(&self) -> &str {
        &self.resource_type
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// The exact JSON text of the resource.
    pub fn body(&self) -> &str {
        &self.body
    }

    /// `Type/id` or just `Type` for logging.
    pub fn reference(&self) -> String {
        match &self.id {
            Some(id) => format!("{}/{}", self.resource_type, id),
            None => self.resource_type.clone(),
        }
    }
}
