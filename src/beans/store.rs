//! The record-store seam.
//!
//! "Not found" is `Ok(None)`; any transport or command failure is an `Err`.

use crate::beans::types::{Bean, BeanStatus, BeanType, NewBean, Priority};
use crate::Result;

/// Criteria for [`BeanStore::list`]. Empty vectors match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BeanFilter {
    pub statuses: Vec<BeanStatus>,
    pub types: Vec<BeanType>,
    pub priorities: Vec<Priority>,
    /// Bean must carry every one of these tags.
    pub tags: Vec<String>,
    /// Bean must carry none of these tags.
    pub exclude_tags: Vec<String>,
    /// `Some(true)` keeps only beans with blockers, `Some(false)` only beans without.
    pub has_blockers: Option<bool>,
}

impl BeanFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_status(status: BeanStatus) -> Self {
        Self {
            statuses: vec![status],
            ..Self::default()
        }
    }

    pub fn matches(&self, bean: &Bean) -> bool {
        (self.statuses.is_empty() || self.statuses.contains(&bean.status))
            && (self.types.is_empty() || self.types.contains(&bean.bean_type))
            && (self.priorities.is_empty() || self.priorities.contains(&bean.priority))
            && self.tags.iter().all(|t| bean.has_tag(t))
            && !self.exclude_tags.iter().any(|t| bean.has_tag(t))
            && self
                .has_blockers
                .map_or(true, |want| want == !bean.blocking_ids.is_empty())
    }
}

/// Operations roaster issues against the record store.
pub trait BeanStore: Send + Sync {
    fn list(&self, filter: &BeanFilter) -> Result<Vec<Bean>>;

    fn get(&self, id: &str) -> Result<Option<Bean>>;

    /// Direct children of a bean.
    fn children(&self, id: &str) -> Result<Vec<Bean>>;

    fn create(&self, bean: &NewBean) -> Result<Bean>;

    fn set_status(&self, id: &str, status: BeanStatus) -> Result<()>;

    fn update_tags(&self, id: &str, add: &[&str], remove: &[&str]) -> Result<()>;

    fn set_body(&self, id: &str, body: &str) -> Result<()>;

    fn set_parent(&self, id: &str, parent_id: Option<&str>) -> Result<()>;

    /// Record that `blocker_id` must finish before `id` is workable.
    fn add_blocker(&self, id: &str, blocker_id: &str) -> Result<()>;

    fn remove_blocker(&self, id: &str, blocker_id: &str) -> Result<()>;
}

/// Resolve the parent chain of `bean`, ordered root first.
///
/// Stops at a missing parent and refuses to loop on a cyclic chain.
pub fn ancestors<F>(bean: &Bean, mut fetch: F) -> Result<Vec<Bean>>
where
    F: FnMut(&str) -> Result<Option<Bean>>,
{
    let mut chain = Vec::new();
    let mut seen = std::collections::HashSet::new();
    seen.insert(bean.id.clone());
    let mut next = bean.parent_id.clone();

    while let Some(parent_id) = next {
        if !seen.insert(parent_id.clone()) {
            return Err(crate::Error::Validation(format!(
                "parent cycle detected at bean {}",
                parent_id
            )));
        }
        match fetch(&parent_id)? {
            Some(parent) => {
                next = parent.parent_id.clone();
                chain.push(parent);
            }
            None => break,
        }
    }

    chain.reverse();
    Ok(chain)
}
