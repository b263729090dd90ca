//! Sorting and paging requests, and the page/slice result types.

use std::vec;

use datarepo_core::{Error, Result};
use serde::{Deserialize, Serialize};

/// Sort direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

/// One ordering term over a property path such as `username` or `team.name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub property: String,
    pub direction: Direction,
}

impl Order {
    pub fn asc(property: impl Into<String>) -> Self {
        Self {
            property: property.into(),
            direction: Direction::Asc,
        }
    }

    pub fn desc(property: impl Into<String>) -> Self {
        Self {
            property: property.into(),
            direction: Direction::Desc,
        }
    }
}

/// Ordered list of [`Order`] terms.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sort {
    orders: Vec<Order>,
}

impl Sort {
    /// No ordering.
    pub fn unsorted() -> Self {
        Self::default()
    }

    /// Sort by `properties` in one direction.
    pub fn by(direction: Direction, properties: &[&str]) -> Self {
        Self {
            orders: properties
                .iter()
                .map(|p| Order {
                    property: (*p).to_string(),
                    direction,
                })
                .collect(),
        }
    }

    pub fn asc(property: &str) -> Self {
        Self::by(Direction::Asc, &[property])
    }

    pub fn desc(property: &str) -> Self {
        Self::by(Direction::Desc, &[property])
    }

    /// Append the orders of `other`.
    #[must_use]
    pub fn and(mut self, other: Sort) -> Self {
        self.orders.extend(other.orders);
        self
    }

    pub fn orders(&self) -> &[Order] {
        &self.orders
    }

    pub fn is_unsorted(&self) -> bool {
        self.orders.is_empty()
    }
}

impl From<Vec<Order>> for Sort {
    fn from(orders: Vec<Order>) -> Self {
        Self { orders }
    }
}

/// A request for one page: `page >= 0`, `size >= 1`, optional sort.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    page: u64,
    size: u64,
    sort: Sort,
}

impl PageRequest {
    /// Page `page` (zero-based) of `size` elements.
    pub fn of(page: i64, size: i64) -> Result<Self> {
        Self::of_sorted(page, size, Sort::unsorted())
    }

    /// Sorted page request.
    pub fn of_sorted(page: i64, size: i64, sort: Sort) -> Result<Self> {
        let page = u64::try_from(page).map_err(|_| {
            Error::invocation("PageRequest::of", format!("page index must be >= 0, got {page}"))
        })?;
        let size = u64::try_from(size)
            .ok()
            .filter(|s| *s >= 1)
            .ok_or_else(|| {
                Error::invocation("PageRequest::of", format!("page size must be >= 1, got {size}"))
            })?;
        Ok(Self { page, size, sort })
    }

    pub fn page(&self) -> u64 {
        self.page
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn sort(&self) -> &Sort {
        &self.sort
    }

    /// Rows skipped before this page.
    pub fn offset(&self) -> u64 {
        self.page.saturating_mul(self.size)
    }

    /// Request for the following page.
    #[must_use]
    pub fn next(&self) -> Self {
        Self {
            page: self.page + 1,
            size: self.size,
            sort: self.sort.clone(),
        }
    }
}

/// Metadata of a [`Page`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageMeta {
    pub number: u64,
    pub size: u64,
    pub total_elements: u64,
}

impl PageMeta {
    /// `ceil(total / size)`.
    pub fn total_pages(&self) -> u64 {
        self.total_elements.div_ceil(self.size.max(1))
    }

    pub fn is_first(&self) -> bool {
        self.number == 0
    }

    pub fn has_next(&self) -> bool {
        (self.number + 1).saturating_mul(self.size) < self.total_elements
    }

    pub fn is_last(&self) -> bool {
        !self.has_next()
    }

    pub fn has_previous(&self) -> bool {
        self.number > 0
    }
}

/// A bounded page with a total count.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page<T> {
    content: Vec<T>,
    #[serde(flatten)]
    meta: PageMeta,
}

impl<T> Page<T> {
    pub fn new(content: Vec<T>, request: &PageRequest, total_elements: u64) -> Self {
        Self {
            content,
            meta: PageMeta {
                number: request.page(),
                size: request.size(),
                total_elements,
            },
        }
    }

    pub fn meta(&self) -> &PageMeta {
        &self.meta
    }

    pub fn content(&self) -> &[T] {
        &self.content
    }

    pub fn into_content(self) -> Vec<T> {
        self.content
    }

    pub fn number(&self) -> u64 {
        self.meta.number
    }

    pub fn size(&self) -> u64 {
        self.meta.size
    }

    pub fn number_of_elements(&self) -> usize {
        self.content.len()
    }

    pub fn total_elements(&self) -> u64 {
        self.meta.total_elements
    }

    pub fn total_pages(&self) -> u64 {
        self.meta.total_pages()
    }

    pub fn is_first(&self) -> bool {
        self.meta.is_first()
    }

    pub fn is_last(&self) -> bool {
        self.meta.is_last()
    }

    pub fn has_next(&self) -> bool {
        self.meta.has_next()
    }

    /// Transform the content lazily, keeping the metadata.
    pub fn map<U, F: FnMut(T) -> U>(self, f: F) -> Mapped<PageMeta, T, F> {
        Mapped {
            meta: self.meta,
            content: self.content.into_iter(),
            f,
        }
    }
}

/// Metadata of a [`Slice`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SliceMeta {
    pub number: u64,
    pub size: u64,
    pub has_next: bool,
}

/// A page-like result that only knows whether more rows exist.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Slice<T> {
    content: Vec<T>,
    #[serde(flatten)]
    meta: SliceMeta,
}

impl<T> Slice<T> {
    /// Build from up to `size + 1` fetched rows; the extra row is trimmed.
    pub fn from_overfetch(mut content: Vec<T>, request: &PageRequest) -> Self {
        let size = usize::try_from(request.size()).unwrap_or(usize::MAX);
        let has_next = content.len() > size;
        content.truncate(size);
        Self {
            content,
            meta: SliceMeta {
                number: request.page(),
                size: request.size(),
                has_next,
            },
        }
    }

    pub fn meta(&self) -> &SliceMeta {
        &self.meta
    }

    pub fn content(&self) -> &[T] {
        &self.content
    }

    pub fn into_content(self) -> Vec<T> {
        self.content
    }

    pub fn number(&self) -> u64 {
        self.meta.number
    }

    pub fn size(&self) -> u64 {
        self.meta.size
    }

    pub fn number_of_elements(&self) -> usize {
        self.content.len()
    }

    pub fn is_first(&self) -> bool {
        self.meta.number == 0
    }

    pub fn has_next(&self) -> bool {
        self.meta.has_next
    }

    /// Transform the content lazily, keeping the metadata.
    pub fn map<U, F: FnMut(T) -> U>(self, f: F) -> Mapped<SliceMeta, T, F> {
        Mapped {
            meta: self.meta,
            content: self.content.into_iter(),
            f,
        }
    }
}

/// Content of a page or slice with a pending transform.
///
/// Elements are transformed one at a time as the iterator is consumed.
pub struct Mapped<M, T, F> {
    meta: M,
    content: vec::IntoIter<T>,
    f: F,
}

impl<M, T, F> Mapped<M, T, F> {
    pub fn meta(&self) -> &M {
        &self.meta
    }
}

impl<M, T, U, F: FnMut(T) -> U> Iterator for Mapped<M, T, F> {
    type Item = U;

    fn next(&mut self) -> Option<U> {
        self.content.next().map(&mut self.f)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.content.size_hint()
    }
}

impl<M, T, U, F: FnMut(T) -> U> ExactSizeIterator for Mapped<M, T, F> {}

impl<T, U, F: FnMut(T) -> U> Mapped<PageMeta, T, F> {
    /// Apply the transform to every element.
    pub fn into_page(self) -> Page<U> {
        let meta = self.meta;
        Page {
            content: self.collect(),
            meta,
        }
    }
}

impl<T, U, F: FnMut(T) -> U> Mapped<SliceMeta, T, F> {
    /// Apply the transform to every element.
    pub fn into_slice(self) -> Slice<U> {
        let meta = self.meta;
        Slice {
            content: self.collect(),
            meta,
        }
    }
}
