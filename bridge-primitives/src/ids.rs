//! Identifier types.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Error;

const MAX_TOOL_ID_LEN: usize = 64;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Generates a fresh random identifier.
            #[must_use]
            pub fn random() -> Self {
                Self(Uuid::new_v4())
            }

            /// Creates an identifier from an existing UUID.
            #[must_use]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Returns the underlying UUID.
            #[must_use]
            pub const fn as_uuid(self) -> Uuid {
                self.0
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
                Display::fmt(&self.0, f)
            }
        }

        impl From<Uuid> for $name {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let uuid = Uuid::parse_str(s).map_err(Error::from)?;
                Ok(Self::from_uuid(uuid))
            }
        }
    };
}

uuid_id!(
    /// Identifier of one running embedding of a tool. Unique per load.
    InstanceId
);

uuid_id!(
    /// Correlation token linking a request envelope to its response.
    MessageId
);

/// Identifier of a tool descriptor in the external catalog.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ToolId(String);

impl ToolId {
    /// Creates a new tool identifier after validating its format.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidToolId`] if the identifier is empty, too long, or
    /// contains characters outside `[a-z0-9._-]`.
    pub fn new(id: impl Into<String>) -> crate::Result<Self> {
        let id = id.into();
        validate_tool_id(&id)?;
        Ok(Self(id))
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ToolId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ToolId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for ToolId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ToolId> for String {
    fn from(value: ToolId) -> Self {
        value.0
    }
}

fn validate_tool_id(id: &str) -> crate::Result<()> {
    if id.is_empty() {
        return Err(Error::InvalidToolId {
            id: String::new(),
            reason: "identifier cannot be empty".into(),
        });
    }

    if id.len() > MAX_TOOL_ID_LEN {
        return Err(Error::InvalidToolId {
            id: id.into(),
            reason: format!("identifier length must be <= {MAX_TOOL_ID_LEN}"),
        });
    }

    if !id
        .chars()
        .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '-' | '_' | '.'))
    {
        return Err(Error::InvalidToolId {
            id: id.into(),
            reason: "identifier must contain lowercase alphanumeric, dash, underscore, or dot"
                .into(),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_instance_id() {
        let id = InstanceId::random();
        let parsed = id.to_string().parse::<InstanceId>().expect("parse");
        assert_eq!(id, parsed);
    }

    #[test]
    fn message_ids_are_unique() {
        assert_ne!(MessageId::random(), MessageId::random());
    }

    #[test]
    fn tool_id_rejects_uppercase() {
        let err = ToolId::new("Image-Editor").expect_err("uppercase must fail");
        assert!(matches!(err, Error::InvalidToolId { .. }));
    }

    #[test]
    fn tool_id_deserializes_with_validation() {
        let ok: ToolId = serde_json::from_str("\"pdf.viewer\"").expect("valid id");
        assert_eq!(ok.as_str(), "pdf.viewer");
        assert!(serde_json::from_str::<ToolId>("\"\"").is_err());
    }
}
