use crate::key::{CacheKey, FilterParams, FilterValue};
use serde::{Deserialize, Serialize};
use std::{fmt::Display, time::Duration};

pub const DEFAULT_PAGE_SIZE: u32 = 12;
pub const DEFAULT_STALE_TIME: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_GC_TIME: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_GC_INTERVAL: Duration = Duration::from_secs(60);

// Parameters with a meaning of their own. They are taken out of the filters before a request reaches the data source.
pub const PARAM_PAGE: &str = "page";
pub const PARAM_PAGE_SIZE: &str = "page_size";
pub const PARAM_SORT_BY: &str = "sort_by";
pub const PARAM_SORT_ORDER: &str = "sort_order";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    Desc,
}

impl SortOrder {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Asc => "asc",
            Self::Desc => "desc",
        }
    }

    pub fn from_param(value: &str) -> Option<Self> {
        match value {
            "asc" => Some(Self::Asc),
            "desc" => Some(Self::Desc),
            _ => None,
        }
    }
}

impl Display for SortOrder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sort {
    pub field: String,
    pub order: SortOrder,
}

/// 1-based page window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    pub page:      u32,
    pub page_size: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            page:      1,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl Pagination {
    /// Inclusive row range covered by the page.
    pub fn range(&self) -> (u64, u64) {
        let from = (self.page.max(1) as u64 - 1) * self.page_size as u64;
        (from, from + self.page_size.max(1) as u64 - 1)
    }

    pub fn total_pages(&self, total_count: u64) -> u64 {
        if self.page_size == 0 {
            return 0;
        }
        total_count.div_ceil(self.page_size as u64)
    }
}

/// What the cache asks a data source for.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRequest {
    pub resource:   String,
    pub filters:    FilterParams,
    pub pagination: Option<Pagination>,
    pub sort:       Option<Sort>,
}

impl QueryRequest {
    pub fn from_key(key: &CacheKey) -> Self {
        let mut filters = key.params().clone();

        let page = filters.remove(PARAM_PAGE).as_ref().and_then(FilterValue::as_int);
        let page_size = filters.remove(PARAM_PAGE_SIZE).as_ref().and_then(FilterValue::as_int);
        let pagination = if page.is_some() || page_size.is_some() {
            let default = Pagination::default();
            Some(Pagination {
                page:      page.map_or(default.page, |p| p.clamp(1, u32::MAX as i64) as u32),
                page_size: page_size.map_or(default.page_size, |s| s.clamp(1, u32::MAX as i64) as u32),
            })
        }
        else {
            None
        };

        let sort_by = filters.remove(PARAM_SORT_BY);
        let sort_order = filters.remove(PARAM_SORT_ORDER);
        let sort = sort_by.as_ref().and_then(FilterValue::as_text).map(|field| Sort {
            field: field.to_string(),
            order: sort_order
                .as_ref()
                .and_then(FilterValue::as_text)
                .and_then(SortOrder::from_param)
                .unwrap_or(SortOrder::Desc),
        });

        Self {
            resource: key.resource().to_string(),
            filters,
            pagination,
            sort,
        }
    }
}

/// Raw answer of a data source: one page of items and the number of rows matching the filters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryPage<I> {
    pub items:       Vec<I>,
    pub total_count: u64,
}

impl<I> QueryPage<I> {
    pub fn new(items: Vec<I>, total_count: u64) -> Self {
        Self { items, total_count }
    }
}

/// Cached result payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<I> {
    pub items:        Vec<I>,
    pub total_count:  u64,
    pub total_pages:  u64,
    pub current_page: u32,
}

impl<I> Page<I> {
    pub fn from_query_page(page: QueryPage<I>, pagination: Option<Pagination>) -> Self {
        let QueryPage { items, total_count } = page;
        match pagination {
            Some(p) => Self {
                items,
                total_count,
                total_pages: p.total_pages(total_count),
                current_page: p.page,
            },
            // Unpaged result: everything fits one page.
            None => Self {
                items,
                total_count,
                total_pages: if total_count > 0 { 1 } else { 0 },
                current_page: 1,
            },
        }
    }
}

/// Per-call freshness and retention windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryOptions {
    pub stale_time: Duration,
    pub gc_time:    Duration,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            stale_time: DEFAULT_STALE_TIME,
            gc_time:    DEFAULT_GC_TIME,
        }
    }
}

impl QueryOptions {
    pub fn new(stale_time: Duration, gc_time: Duration) -> Self {
        Self { stale_time, gc_time }
    }

    /// GC horizon can't be shorter than the freshness window; a shorter one is stretched.
    pub(crate) fn normalized(self) -> Self {
        Self {
            stale_time: self.stale_time,
            gc_time:    self.gc_time.max(self.stale_time),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Insert,
    Update,
    Delete,
}

/// Data mutation notice delivered by a change feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub resource:    String,
    pub change_type: ChangeType,
    pub entity_id:   String,
}

impl ChangeEvent {
    pub fn new<R: ToString, E: ToString>(resource: R, change_type: ChangeType, entity_id: E) -> Self {
        Self {
            resource: resource.to_string(),
            change_type,
            entity_id: entity_id.to_string(),
        }
    }

    /// Event standing for an unknown number of lost changes.
    pub fn resync<R: ToString>(resource: R) -> Self {
        Self::new(resource, ChangeType::Update, "")
    }
}
