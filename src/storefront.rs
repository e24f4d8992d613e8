//! Typed queries of a storefront catalog.
//!
//! Every query is validated and normalized before it becomes a [`CacheKey`], so that filter combinations meaning the
//! same thing share one cache entry:
//!
//! - category filters have a precedence: `category_ids` over `subcategory_id` over `category_id`; only the winner is
//!   keyed;
//! - empty strings and empty lists are the same as no filter, and so are `in_stock_only = false` and the `"all"` store
//!   category;
//! - page, page size and sorting defaults are applied before keying.

use crate::{
    error::CacheError,
    key::{CacheKey, FilterParams, FilterValue},
    types::{QueryOptions, SortOrder, DEFAULT_PAGE_SIZE, PARAM_PAGE, PARAM_PAGE_SIZE, PARAM_SORT_BY, PARAM_SORT_ORDER},
};
use garde::Validate;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const RESOURCE_PRODUCTS: &str = "products";
pub const RESOURCE_STORES: &str = "stores";
pub const RESOURCE_CATEGORIES: &str = "categories";
pub const RESOURCE_SITE_SETTINGS: &str = "site_settings";
pub const RESOURCE_PAGE_BACKGROUNDS: &str = "page_backgrounds";
pub const RESOURCE_ORDERS: &str = "orders";

/// Store category value standing for "any category".
pub const ALL_CATEGORIES: &str = "all";

const MINUTE: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductSortField {
    Name,
    Price,
    #[default]
    CreatedAt,
    ViewCount,
    AverageRating,
}

impl ProductSortField {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Name => "name",
            Self::Price => "price",
            Self::CreatedAt => "created_at",
            Self::ViewCount => "view_count",
            Self::AverageRating => "average_rating",
        }
    }
}

fn default_page() -> u32 {
    1
}

fn default_page_size() -> u32 {
    DEFAULT_PAGE_SIZE
}

fn default_sort_order() -> SortOrder {
    SortOrder::Desc
}

fn non_empty(value: &Option<String>) -> Option<&String> {
    value.as_ref().filter(|v| !v.is_empty())
}

fn set_of(values: &[String]) -> Option<FilterValue> {
    let values = values.iter().filter(|v| !v.is_empty()).collect::<Vec<_>>();
    if values.is_empty() {
        None
    }
    else {
        Some(FilterValue::set(values))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ProductFilters {
    #[garde(range(min = 1))]
    pub page:                u32,
    #[garde(range(min = 1))]
    pub page_size:           u32,
    #[garde(skip)]
    pub category_id:         Option<String>,
    #[garde(skip)]
    pub subcategory_id:      Option<String>,
    #[garde(skip)]
    pub store_id:            Option<String>,
    #[garde(skip)]
    pub search:              Option<String>,
    #[garde(range(min = 0.0))]
    pub min_price:           Option<f64>,
    #[garde(range(min = 0.0), custom(Self::not_below_min_price(&self.min_price)))]
    pub max_price:           Option<f64>,
    #[garde(skip)]
    pub colors:              Vec<String>,
    #[garde(skip)]
    pub sizes:               Vec<String>,
    #[garde(skip)]
    pub category_ids:        Vec<String>,
    #[garde(skip)]
    pub is_free_delivery:    Option<bool>,
    #[garde(skip)]
    pub is_home_delivery:    Option<bool>,
    #[garde(skip)]
    pub is_desktop_delivery: Option<bool>,
    #[garde(skip)]
    pub in_stock_only:       bool,
    #[garde(range(min = 0.0, max = 5.0))]
    pub min_rating:          Option<f64>,
    #[garde(skip)]
    pub sort_by:             ProductSortField,
    #[garde(skip)]
    pub sort_order:          SortOrder,
}

impl Default for ProductFilters {
    fn default() -> Self {
        Self {
            page:                default_page(),
            page_size:           default_page_size(),
            category_id:         None,
            subcategory_id:      None,
            store_id:            None,
            search:              None,
            min_price:           None,
            max_price:           None,
            colors:              Vec::new(),
            sizes:               Vec::new(),
            category_ids:        Vec::new(),
            is_free_delivery:    None,
            is_home_delivery:    None,
            is_desktop_delivery: None,
            in_stock_only:       false,
            min_rating:          None,
            sort_by:             ProductSortField::default(),
            sort_order:          default_sort_order(),
        }
    }
}

impl ProductFilters {
    fn not_below_min_price<'a>(min_price: &'a Option<f64>) -> impl FnOnce(&'a Option<f64>, &()) -> garde::Result {
        move |value, _| match (value, min_price) {
            (Some(max), Some(min)) if max < min => Err(garde::Error::new(format!(
                "{max} is less than min_price ({min})"
            ))),
            _ => Ok(()),
        }
    }

    pub fn page(mut self, page: u32) -> Self {
        self.page = page;
        self
    }

    pub fn search<S: ToString>(mut self, search: S) -> Self {
        self.search = Some(search.to_string());
        self
    }

    pub fn category<S: ToString>(mut self, category_id: S) -> Self {
        self.category_id = Some(category_id.to_string());
        self
    }

    pub fn store<S: ToString>(mut self, store_id: S) -> Self {
        self.store_id = Some(store_id.to_string());
        self
    }

    pub fn sorted_by(mut self, field: ProductSortField, order: SortOrder) -> Self {
        self.sort_by = field;
        self.sort_order = order;
        self
    }

    pub fn params(&self) -> FilterParams {
        let mut params = FilterParams::new()
            .with(PARAM_PAGE, self.page)
            .with(PARAM_PAGE_SIZE, self.page_size)
            .with(PARAM_SORT_BY, self.sort_by.as_str())
            .with(PARAM_SORT_ORDER, self.sort_order.as_str())
            .with_opt("store_id", non_empty(&self.store_id))
            .with_opt("search", non_empty(&self.search))
            .with_opt("min_price", self.min_price)
            .with_opt("max_price", self.max_price)
            .with_opt("colors", set_of(&self.colors))
            .with_opt("sizes", set_of(&self.sizes))
            .with_opt("is_free_delivery", self.is_free_delivery)
            .with_opt("is_home_delivery", self.is_home_delivery)
            .with_opt("is_desktop_delivery", self.is_desktop_delivery)
            .with_opt("min_rating", self.min_rating);

        if let Some(category_ids) = set_of(&self.category_ids) {
            params.insert("category_ids", category_ids);
        }
        else if let Some(subcategory_id) = non_empty(&self.subcategory_id) {
            params.insert("subcategory_id", subcategory_id);
        }
        else if let Some(category_id) = non_empty(&self.category_id) {
            params.insert("category_id", category_id);
        }

        if self.in_stock_only {
            params.insert("in_stock_only", true);
        }

        params
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct StoreFilters {
    #[garde(range(min = 1))]
    pub page:        u32,
    #[garde(range(min = 1))]
    pub page_size:   u32,
    #[garde(skip)]
    pub category_id: Option<String>,
    #[garde(skip)]
    pub search:      Option<String>,
}

impl Default for StoreFilters {
    fn default() -> Self {
        Self {
            page:        default_page(),
            page_size:   default_page_size(),
            category_id: None,
            search:      None,
        }
    }
}

impl StoreFilters {
    pub fn params(&self) -> FilterParams {
        FilterParams::new()
            .with(PARAM_PAGE, self.page)
            .with(PARAM_PAGE_SIZE, self.page_size)
            // Stores are always listed alphabetically.
            .with(PARAM_SORT_BY, "name")
            .with(PARAM_SORT_ORDER, SortOrder::Asc.as_str())
            .with_opt(
                "category_id",
                non_empty(&self.category_id).filter(|c| c.as_str() != ALL_CATEGORIES),
            )
            .with_opt("search", non_empty(&self.search))
    }
}

/// A query the storefront issues, with the freshness windows it is cached with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "query", rename_all = "snake_case")]
pub enum ResourceQuery {
    Products(ProductFilters),
    Stores(StoreFilters),
    /// A single store by id.
    Store {
        store_id: String,
    },
    Categories,
    SiteSettings,
    PageBackgrounds,
}

impl ResourceQuery {
    pub fn resource(&self) -> &'static str {
        match self {
            Self::Products(_) => RESOURCE_PRODUCTS,
            // Single store lookups are keyed under the same resource so that store changes reach them too.
            Self::Stores(_) | Self::Store { .. } => RESOURCE_STORES,
            Self::Categories => RESOURCE_CATEGORIES,
            Self::SiteSettings => RESOURCE_SITE_SETTINGS,
            Self::PageBackgrounds => RESOURCE_PAGE_BACKGROUNDS,
        }
    }

    pub fn validate_filters(&self) -> Result<(), CacheError> {
        match self {
            Self::Products(filters) => filters.validate()?,
            Self::Stores(filters) => filters.validate()?,
            Self::Store { store_id } => {
                if store_id.trim().is_empty() {
                    return Err(CacheError::InvalidQuery("store id must not be empty".into()));
                }
            }
            Self::Categories | Self::SiteSettings | Self::PageBackgrounds => (),
        }
        Ok(())
    }

    pub fn params(&self) -> FilterParams {
        match self {
            Self::Products(filters) => filters.params(),
            Self::Stores(filters) => filters.params(),
            Self::Store { store_id } => FilterParams::new().with("id", store_id),
            Self::Categories => FilterParams::new()
                .with(PARAM_SORT_BY, "name")
                .with(PARAM_SORT_ORDER, SortOrder::Asc.as_str()),
            Self::SiteSettings | Self::PageBackgrounds => FilterParams::new(),
        }
    }

    /// Validates the filters and derives the key of the query.
    pub fn cache_key(&self) -> Result<CacheKey, CacheError> {
        self.validate_filters()?;
        CacheKey::derive(self.resource(), &self.params())
    }

    pub fn options(&self) -> QueryOptions {
        match self {
            Self::Products(_) | Self::Stores(_) | Self::Store { .. } => QueryOptions::new(5 * MINUTE, 10 * MINUTE),
            Self::Categories => QueryOptions::new(10 * MINUTE, 30 * MINUTE),
            Self::SiteSettings => QueryOptions::new(30 * MINUTE, 30 * MINUTE),
            Self::PageBackgrounds => QueryOptions::new(60 * MINUTE, 60 * MINUTE),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::QueryRequest;

    #[test]
    fn defaults_are_keyed_explicitly() {
        let implicit = ResourceQuery::Products(ProductFilters::default()).cache_key().unwrap();
        let explicit = ResourceQuery::Products(ProductFilters {
            page: 1,
            page_size: 12,
            sort_by: ProductSortField::CreatedAt,
            sort_order: SortOrder::Desc,
            ..Default::default()
        })
        .cache_key()
        .unwrap();
        assert_eq!(implicit, explicit);

        let request = QueryRequest::from_key(&implicit);
        assert_eq!(request.pagination.unwrap().page_size, 12);
        assert_eq!(request.sort.unwrap().field, "created_at");
    }

    #[test]
    fn category_precedence() {
        let filters = ProductFilters {
            category_id: Some("c1".into()),
            subcategory_id: Some("s1".into()),
            category_ids: vec!["c2".into(), "c3".into()],
            ..Default::default()
        };
        let params = filters.params();
        assert!(params.contains("category_ids"));
        assert!(!params.contains("subcategory_id"));
        assert!(!params.contains("category_id"));

        let filters = ProductFilters {
            category_id: Some("c1".into()),
            subcategory_id: Some("s1".into()),
            ..Default::default()
        };
        let params = filters.params();
        assert!(params.contains("subcategory_id"));
        assert!(!params.contains("category_id"));
    }

    #[test]
    fn equivalent_filters_share_a_key() {
        let a = ProductFilters {
            colors: vec!["red".into(), "blue".into()],
            in_stock_only: false,
            search: Some(String::new()),
            ..Default::default()
        };
        let b = ProductFilters {
            colors: vec!["blue".into(), "red".into(), "red".into()],
            ..Default::default()
        };
        assert_eq!(
            ResourceQuery::Products(a).cache_key().unwrap(),
            ResourceQuery::Products(b).cache_key().unwrap()
        );
    }

    #[test]
    fn all_store_categories_means_no_filter() {
        let all = StoreFilters {
            category_id: Some(ALL_CATEGORIES.into()),
            ..Default::default()
        };
        assert_eq!(all.params(), StoreFilters::default().params());
    }

    #[test]
    fn invalid_filters_are_rejected() {
        let zero_page = ResourceQuery::Products(ProductFilters::default().page(0));
        assert!(matches!(zero_page.cache_key(), Err(CacheError::Validation(_))));

        let inverted_prices = ResourceQuery::Products(ProductFilters {
            min_price: Some(100.0),
            max_price: Some(10.0),
            ..Default::default()
        });
        assert!(matches!(inverted_prices.cache_key(), Err(CacheError::Validation(_))));

        let no_store = ResourceQuery::Store { store_id: "  ".into() };
        assert!(matches!(no_store.cache_key(), Err(CacheError::InvalidQuery(_))));
    }

    #[test]
    fn store_lookup_shares_the_stores_resource() {
        let key = ResourceQuery::Store { store_id: "s-1".into() }.cache_key().unwrap();
        assert_eq!(key.resource(), RESOURCE_STORES);
    }
}
