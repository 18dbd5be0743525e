use serde::{Deserialize, Serialize};

use crate::model::item::Item;

/// Default and maximum page size served by the list endpoints.
pub const MAX_PAGE_LIMIT: u32 = 200;

/// One limit/offset page returned by a list endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page {
    pub items: Vec<Item>,
    #[serde(default)]
    pub total: Option<u64>,
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default)]
    pub offset: u64,
}

const fn default_limit() -> u32 {
    MAX_PAGE_LIMIT
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ListBody {
    Page(Page),
    Items(Vec<Item>),
}

impl Page {
    pub fn new(items: Vec<Item>) -> Self {
        let total = items.len() as u64;
        Self {
            items,
            total: Some(total),
            limit: MAX_PAGE_LIMIT,
            offset: 0,
        }
    }

    /// Decode a list response body.
    ///
    /// Accepts the paginated envelope or a bare array; a bare array reports
    /// its own length as `total`.
    ///
    /// # Errors
    ///
    /// Returns the serde error when the body matches neither shape.
    pub fn from_body(body: serde_json::Value) -> Result<Self, serde_json::Error> {
        Ok(match serde_json::from_value(body)? {
            ListBody::Page(page) => page,
            ListBody::Items(items) => Self::new(items),
        })
    }
}

/// Clamp a requested page size into what the backend accepts.
#[must_use]
pub fn clamp_limit(requested: u32) -> u32 {
    requested.clamp(1, MAX_PAGE_LIMIT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_body_decodes() {
        let page = Page::from_body(json!({
            "items": [{"id": "a"}, {"id": "b"}],
            "total": 57,
            "limit": 2,
            "offset": 10,
        }))
        .unwrap();
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.total, Some(57));
        assert_eq!(page.offset, 10);
    }

    #[test]
    fn bare_array_counts_itself() {
        let page = Page::from_body(json!([{"id": 1}, {"id": 2}, {"id": 3}])).unwrap();
        assert_eq!(page.total, Some(3));
        assert_eq!(page.limit, MAX_PAGE_LIMIT);
    }

    #[test]
    fn backend_page_with_naive_timestamps_decodes() {
        let page = Page::from_body(json!({
            "items": [{"id": "e-1", "created_at": "2026-03-01T10:00:00", "message": "moved"}],
            "total": 1,
            "limit": 200,
            "offset": 0,
        }))
        .unwrap();
        assert!(page.items[0].created_at.is_some());
    }

    #[test]
    fn garbage_body_is_an_error() {
        assert!(Page::from_body(json!({"detail": "nope"})).is_err());
    }

    #[test]
    fn limit_is_clamped() {
        assert_eq!(clamp_limit(0), 1);
        assert_eq!(clamp_limit(50), 50);
        assert_eq!(clamp_limit(5000), 200);
    }
}
