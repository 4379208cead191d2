use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Shared lookup records owned by this service and referenced by id from peer services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextEntityType {
    Category,
    Supplier,
    Manufacturer,
    Depreciation,
    Status,
    Location,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unsupported entity type '{0}'")]
pub struct UnknownEntityType(pub String);

impl ContextEntityType {
    pub const ALL: [ContextEntityType; 6] = [
        ContextEntityType::Category,
        ContextEntityType::Supplier,
        ContextEntityType::Manufacturer,
        ContextEntityType::Depreciation,
        ContextEntityType::Status,
        ContextEntityType::Location,
    ];

    /// Singular name, also used as the filter parameter on peer list endpoints.
    pub fn as_str(&self) -> &'static str {
        match self {
            ContextEntityType::Category => "category",
            ContextEntityType::Supplier => "supplier",
            ContextEntityType::Manufacturer => "manufacturer",
            ContextEntityType::Depreciation => "depreciation",
            ContextEntityType::Status => "status",
            ContextEntityType::Location => "location",
        }
    }

    /// Local storage table.
    pub fn table(&self) -> &'static str {
        match self {
            ContextEntityType::Category => "categories",
            ContextEntityType::Supplier => "suppliers",
            ContextEntityType::Manufacturer => "manufacturers",
            ContextEntityType::Depreciation => "depreciations",
            ContextEntityType::Status => "statuses",
            ContextEntityType::Location => "locations",
        }
    }

    /// Column holding the human-facing label of a row.
    pub fn display_column(&self) -> &'static str {
        match self {
            ContextEntityType::Location => "city",
            ContextEntityType::Depreciation => "title",
            _ => "name",
        }
    }
}

impl fmt::Display for ContextEntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContextEntityType {
    type Err = UnknownEntityType;

    /// Accepts the singular name or the table name, case-insensitively.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_ascii_lowercase();
        ContextEntityType::ALL
            .into_iter()
            .find(|t| t.as_str() == needle || t.table() == needle)
            .ok_or_else(|| UnknownEntityType(s.to_string()))
    }
}

/// How accepted ids are removed from local storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteMode {
    /// Set `is_deleted`; the row stays for auditing.
    #[default]
    Soft,
    /// Physically remove the row.
    Hard,
}

impl FromStr for DeleteMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "soft" => Ok(DeleteMode::Soft),
            "hard" => Ok(DeleteMode::Hard),
            other => Err(format!("unknown delete mode '{other}'")),
        }
    }
}

/// A live (not soft-deleted) context entity row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityRecord {
    pub id: i64,
    pub display: String,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_entity_type_accepts_singular_and_table_names() {
        assert_eq!(
            "category".parse::<ContextEntityType>().unwrap(),
            ContextEntityType::Category
        );
        assert_eq!(
            "Statuses".parse::<ContextEntityType>().unwrap(),
            ContextEntityType::Status
        );
        assert_eq!(
            " location ".parse::<ContextEntityType>().unwrap(),
            ContextEntityType::Location
        );
    }

    #[test]
    fn test_parse_entity_type_rejects_unknown() {
        let err = "asset".parse::<ContextEntityType>().unwrap_err();
        assert_eq!(err.to_string(), "unsupported entity type 'asset'");
    }

    #[test]
    fn test_display_columns() {
        assert_eq!(ContextEntityType::Location.display_column(), "city");
        assert_eq!(ContextEntityType::Depreciation.display_column(), "title");
        assert_eq!(ContextEntityType::Supplier.display_column(), "name");
    }

    #[test]
    fn test_delete_mode_parse() {
        assert_eq!("HARD".parse::<DeleteMode>().unwrap(), DeleteMode::Hard);
        assert_eq!(DeleteMode::default(), DeleteMode::Soft);
        assert!("purge".parse::<DeleteMode>().is_err());
    }
}
