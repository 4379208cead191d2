use std::collections::HashSet;

use common::model::{ContextEntityType, UnknownEntityType};
use serde_json::Value;
use thiserror::Error;

/// Request-shape rejections. Raised before any probing or storage access.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error(transparent)]
    UnsupportedEntityType(#[from] UnknownEntityType),

    #[error("request body must contain an `ids` field")]
    IdsMissing,

    #[error("`ids` must be a list")]
    IdsNotAList,

    #[error("`ids[{index}]` is not an integer")]
    NonIntegerId { index: usize },

    #[error("too many ids: {count} distinct ids exceed the limit of {max}")]
    TooManyIds { count: usize, max: usize },
}

impl RequestError {
    /// Rejected for size rather than shape.
    pub fn is_too_large(&self) -> bool {
        matches!(self, RequestError::TooManyIds { .. })
    }
}

/// A validated bulk delete: known entity type, unique ids in first-occurrence order,
/// at most the configured ceiling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkDeleteRequest {
    entity_type: ContextEntityType,
    ids: Vec<i64>,
}

impl BulkDeleteRequest {
    pub fn new(
        entity_type: ContextEntityType,
        ids: Vec<i64>,
        max_ids: usize,
    ) -> Result<Self, RequestError> {
        let ids = dedup_preserving_order(ids);
        if ids.len() > max_ids {
            return Err(RequestError::TooManyIds {
                count: ids.len(),
                max: max_ids,
            });
        }
        Ok(Self { entity_type, ids })
    }

    /// One-element request, always within any non-zero ceiling.
    pub fn single(entity_type: ContextEntityType, id: i64) -> Self {
        Self {
            entity_type,
            ids: vec![id],
        }
    }

    /// Validate a raw `{ids: [...]}` body for the entity type named in the path.
    pub fn from_json(
        entity_type: &str,
        body: &Value,
        max_ids: usize,
    ) -> Result<Self, RequestError> {
        let entity_type: ContextEntityType = entity_type.parse()?;
        let ids = match body.get("ids") {
            None => return Err(RequestError::IdsMissing),
            Some(ids) => parse_ids(ids)?,
        };
        Self::new(entity_type, ids, max_ids)
    }

    pub fn entity_type(&self) -> ContextEntityType {
        self.entity_type
    }

    pub fn ids(&self) -> &[i64] {
        &self.ids
    }
}

/// Integers, or strings holding an integer. Floats and anything else are rejected.
fn parse_ids(value: &Value) -> Result<Vec<i64>, RequestError> {
    let Value::Array(items) = value else {
        return Err(RequestError::IdsNotAList);
    };

    items
        .iter()
        .enumerate()
        .map(|(index, item)| {
            let id = match item {
                Value::Number(n) => n.as_i64(),
                Value::String(s) => s.trim().parse().ok(),
                _ => None,
            };
            id.ok_or(RequestError::NonIntegerId { index })
        })
        .collect()
}

fn dedup_preserving_order(ids: Vec<i64>) -> Vec<i64> {
    let mut seen = HashSet::with_capacity(ids.len());
    ids.into_iter().filter(|id| seen.insert(*id)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_dedup_keeps_first_occurrence_order() {
        let request =
            BulkDeleteRequest::from_json("category", &json!({"ids": [5, 3, 5, 3, 7]}), 500)
                .unwrap();
        assert_eq!(request.ids(), &[5, 3, 7]);
        assert_eq!(request.entity_type(), ContextEntityType::Category);
    }

    #[test]
    fn test_ceiling_rejects_whole_request() {
        let ids: Vec<i64> = (1..=501).collect();
        let err = BulkDeleteRequest::from_json("supplier", &json!({"ids": ids}), 500).unwrap_err();
        assert_eq!(err, RequestError::TooManyIds { count: 501, max: 500 });
        assert!(err.is_too_large());
    }

    #[test]
    fn test_ceiling_counts_distinct_ids() {
        let mut ids: Vec<i64> = (1..=500).collect();
        ids.extend(1..=100);
        let request = BulkDeleteRequest::from_json("status", &json!({"ids": ids}), 500).unwrap();
        assert_eq!(request.ids().len(), 500);
    }

    #[test]
    fn test_shape_errors_are_distinct() {
        assert_eq!(
            BulkDeleteRequest::from_json("category", &json!({}), 500).unwrap_err(),
            RequestError::IdsMissing
        );
        assert_eq!(
            BulkDeleteRequest::from_json("category", &json!({"ids": 5}), 500).unwrap_err(),
            RequestError::IdsNotAList
        );
        assert_eq!(
            BulkDeleteRequest::from_json("category", &json!({"ids": [1, "x", 3]}), 500)
                .unwrap_err(),
            RequestError::NonIntegerId { index: 1 }
        );
        assert_eq!(
            BulkDeleteRequest::from_json("category", &json!({"ids": [1, 2.5]}), 500).unwrap_err(),
            RequestError::NonIntegerId { index: 1 }
        );
        assert!(!RequestError::IdsNotAList.is_too_large());
    }

    #[test]
    fn test_numeric_strings_are_accepted() {
        let request =
            BulkDeleteRequest::from_json("location", &json!({"ids": ["12", 12, " 4 "]}), 500)
                .unwrap();
        assert_eq!(request.ids(), &[12, 4]);
    }

    #[test]
    fn test_unknown_entity_type_is_rejected_first() {
        let err = BulkDeleteRequest::from_json("asset", &json!({"ids": "nope"}), 500).unwrap_err();
        assert_eq!(err.to_string(), "unsupported entity type 'asset'");
    }

    #[test]
    fn test_empty_list_is_valid() {
        let request = BulkDeleteRequest::from_json("category", &json!({"ids": []}), 500).unwrap();
        assert!(request.ids().is_empty());
    }
}
