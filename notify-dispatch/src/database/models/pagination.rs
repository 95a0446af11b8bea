//! Pagination request/response shapes for list queries.

use serde::{Deserialize, Serialize};

/// Largest page a caller may request.
pub const MAX_PAGE_LIMIT: u32 = 100;

/// Pagination query parameters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PaginationParams {
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default)]
    pub offset: u32,
}

fn default_limit() -> u32 {
    20
}

impl Default for PaginationParams {
    fn default() -> Self {
        Self {
            limit: default_limit(),
            offset: 0,
        }
    }
}

impl PaginationParams {
    pub fn new(limit: u32, offset: u32) -> Self {
        Self { limit, offset }
    }

    /// Limit clamped to `1..=MAX_PAGE_LIMIT`.
    pub fn effective_limit(&self) -> u32 {
        self.limit.clamp(1, MAX_PAGE_LIMIT)
    }
}

/// Paginated response wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaginatedResponse<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub limit: u32,
    pub offset: u32,
}

impl<T> PaginatedResponse<T> {
    pub fn new(items: Vec<T>, total: u64, limit: u32, offset: u32) -> Self {
        Self {
            items,
            total,
            limit,
            offset,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pagination_defaults() {
        let params: PaginationParams = serde_json::from_str("{}").unwrap();
        assert_eq!(params.limit, 20);
        assert_eq!(params.offset, 0);
    }

    #[test]
    fn test_effective_limit_is_clamped() {
        assert_eq!(PaginationParams::new(0, 0).effective_limit(), 1);
        assert_eq!(PaginationParams::new(500, 0).effective_limit(), MAX_PAGE_LIMIT);
        assert_eq!(PaginationParams::new(50, 0).effective_limit(), 50);
    }
}
