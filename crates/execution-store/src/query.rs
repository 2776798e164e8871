use serde::{Deserialize, Serialize};

/// Zero-based page request for listing executions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    /// Page number, starting at 0.
    pub page: usize,

    /// Number of items per page.
    pub size: usize,
}

impl PageRequest {
    /// Largest page size a caller may request.
    pub const MAX_SIZE: usize = 500;

    /// Creates a page request, clamping the size to `1..=MAX_SIZE`.
    pub fn new(page: usize, size: usize) -> Self {
        Self {
            page,
            size: size.clamp(1, Self::MAX_SIZE),
        }
    }

    /// Number of items to skip.
    pub fn offset(&self) -> usize {
        self.page.saturating_mul(self.size)
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self { page: 0, size: 20 }
    }
}

/// One page of results plus the total match count.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: usize,
    pub size: usize,
    pub total: u64,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, request: PageRequest, total: u64) -> Self {
        Self {
            items,
            page: request.page,
            size: request.size,
            total,
        }
    }

    /// Returns true if more items exist after this page.
    pub fn has_next(&self) -> bool {
        ((self.page + 1) * self.size) < self.total as usize
    }
}
