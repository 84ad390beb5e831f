//! List windows
//!
//! Queries over unbounded result sets take a [`PageRequest`] and return a
//! [`Listing`]: the requested window plus the cursor for the next one.
//! Callers chase `next_offset` until it comes back `None`.

use serde::{Deserialize, Serialize};

/// Hard cap on window size
pub const MAX_PAGE_SIZE: u64 = 100;

/// A bounded window over a list query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    offset: u64,
    limit: u64,
}

impl PageRequest {
    /// Window starting at `offset`; the limit is clamped to 1..=100
    #[must_use]
    pub fn new(offset: u64, limit: u64) -> Self {
        Self {
            offset,
            limit: limit.clamp(1, MAX_PAGE_SIZE),
        }
    }

    /// The opening window
    #[must_use]
    pub fn first(limit: u64) -> Self {
        Self::new(0, limit)
    }

    /// Page-number addressing, zero-based
    #[must_use]
    pub fn of_page(page: u64, size: u64) -> Self {
        let size = size.clamp(1, MAX_PAGE_SIZE);
        Self {
            offset: page.saturating_mul(size),
            limit: size,
        }
    }

    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    #[must_use]
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// The window immediately after this one
    #[must_use]
    pub fn next(&self) -> Self {
        Self {
            offset: self.offset.saturating_add(self.limit),
            limit: self.limit,
        }
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::first(20)
    }
}

/// One window of results plus the cursor to the rest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Listing<T> {
    pub items: Vec<T>,
    /// Matching rows across all windows
    pub total: u64,
    /// Offset of the following window; `None` on the last one
    pub next_offset: Option<u64>,
}

impl<T> Listing<T> {
    /// Cut the requested window out of a fully materialized result set
    #[must_use]
    pub fn window(mut all: Vec<T>, request: PageRequest) -> Self {
        let total = all.len() as u64;
        let start = request.offset().min(total);
        let end = start.saturating_add(request.limit()).min(total);

        let items: Vec<T> = all.drain(start as usize..end as usize).collect();
        Self {
            items,
            total,
            next_offset: (end < total).then_some(end),
        }
    }

    /// Whether this window exhausts the result set
    #[must_use]
    pub fn is_last(&self) -> bool {
        self.next_offset.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_in_the_middle() {
        let listing = Listing::window(vec![10, 20, 30, 40, 50], PageRequest::new(1, 2));
        assert_eq!(listing.items, vec![20, 30]);
        assert_eq!(listing.total, 5);
        assert_eq!(listing.next_offset, Some(3));
        assert!(!listing.is_last());
    }

    #[test]
    fn test_window_covering_the_tail() {
        let listing = Listing::window(vec![1, 2, 3], PageRequest::new(1, 10));
        assert_eq!(listing.items, vec![2, 3]);
        assert!(listing.is_last());
    }

    #[test]
    fn test_window_past_the_end() {
        let listing = Listing::window(vec![1, 2], PageRequest::new(9, 5));
        assert!(listing.items.is_empty());
        assert_eq!(listing.total, 2);
        assert!(listing.is_last());
    }

    #[test]
    fn test_limit_clamped() {
        assert_eq!(PageRequest::new(0, 0).limit(), 1);
        assert_eq!(PageRequest::new(0, 5_000).limit(), MAX_PAGE_SIZE);
    }

    #[test]
    fn test_page_addressing_and_next() {
        let request = PageRequest::of_page(2, 25);
        assert_eq!(request.offset(), 50);
        assert_eq!(request.limit(), 25);

        let following = request.next();
        assert_eq!(following.offset(), 75);
    }
}
