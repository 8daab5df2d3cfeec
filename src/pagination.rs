use serde::{Deserialize, Serialize};

pub const DEFAULT_LIMIT: i64 = 10;
pub const MAX_LIMIT: i64 = 100;

/// `page` / `limit` query parameters shared by every list endpoint.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct PageQuery {
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub page: i64,
    pub limit: i64,
}

impl PageQuery {
    pub fn resolve(&self) -> Page {
        Page {
            page: self.page.unwrap_or(1).max(1),
            limit: self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT),
        }
    }
}

impl Page {
    /// Saturates so an absurd `page` reads past the end instead of overflowing.
    pub fn offset(&self) -> i64 {
        (self.page - 1).saturating_mul(self.limit)
    }

    pub fn meta(&self, total: i64) -> PaginationMeta {
        PaginationMeta {
            page: self.page,
            limit: self.limit,
            total,
            total_pages: total_pages(total, self.limit),
        }
    }
}

pub fn total_pages(total: i64, limit: i64) -> i64 {
    if total <= 0 || limit <= 0 {
        return 0;
    }
    (total + limit - 1) / limit
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct PaginationMeta {
    pub page: i64,
    pub limit: i64,
    pub total: i64,
    pub total_pages: i64,
}

#[derive(Debug, Serialize)]
pub struct Paginated<T> {
    pub success: bool,
    pub data: Vec<T>,
    pub pagination: PaginationMeta,
}

impl<T> Paginated<T> {
    pub fn new(data: Vec<T>, page: Page, total: i64) -> Self {
        Self {
            success: true,
            data,
            pagination: page.meta(total),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_page_of_25() {
        let page = PageQuery { page: Some(2), limit: Some(10) }.resolve();
        assert_eq!(page.offset(), 10);

        // rows 11..=20 of 25
        let rows: Vec<i64> = (1..=25).collect();
        let window: Vec<i64> = rows
            .iter()
            .copied()
            .skip(page.offset() as usize)
            .take(page.limit as usize)
            .collect();
        assert_eq!(window, (11..=20).collect::<Vec<_>>());

        let meta = page.meta(25);
        assert_eq!(meta.total_pages, 3);
        assert_eq!(meta.total, 25);
    }

    #[test]
    fn test_defaults_and_clamping() {
        let page = PageQuery::default().resolve();
        assert_eq!(page, Page { page: 1, limit: DEFAULT_LIMIT });

        let page = PageQuery { page: Some(-4), limit: Some(10_000) }.resolve();
        assert_eq!(page, Page { page: 1, limit: MAX_LIMIT });

        let page = PageQuery { page: Some(3), limit: Some(0) }.resolve();
        assert_eq!(page.limit, 1);
        assert_eq!(page.offset(), 2);
    }

    #[test]
    fn test_huge_page_does_not_overflow() {
        let page = PageQuery { page: Some(i64::MAX), limit: Some(10) }.resolve();
        assert_eq!(page.offset(), i64::MAX);
        assert!(page.offset() >= 0);
        assert_eq!(page.meta(25).total_pages, 3);
    }

    #[test]
    fn test_total_pages() {
        assert_eq!(total_pages(0, 10), 0);
        assert_eq!(total_pages(10, 10), 1);
        assert_eq!(total_pages(11, 10), 2);
        assert_eq!(total_pages(1, 100), 1);
    }
}
