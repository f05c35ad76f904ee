//! In-memory bean store.
//!
//! Backs tests that must not touch the real record store.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::beans::store::{BeanFilter, BeanStore};
use crate::beans::types::{slugify, Bean, BeanStatus, NewBean};
use crate::{Error, Result};

#[derive(Debug, Default)]
pub struct MemoryStore {
    beans: Mutex<BTreeMap<String, Bean>>,
    next_id: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_beans(beans: impl IntoIterator<Item = Bean>) -> Self {
        let store = Self::new();
        for bean in beans {
            store.insert(bean);
        }
        store
    }

    /// Insert or replace a bean as-is.
    pub fn insert(&self, bean: Bean) {
        self.lock().insert(bean.id.clone(), bean);
    }

    pub fn remove(&self, id: &str) -> Option<Bean> {
        self.lock().remove(id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Bean>> {
        // A poisoned map is still structurally valid.
        self.beans.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn modify<F>(&self, id: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut Bean),
    {
        let mut beans = self.lock();
        let bean = beans
            .get_mut(id)
            .ok_or_else(|| Error::BeanNotFound(id.to_string()))?;
        f(bean);
        Ok(())
    }
}

impl BeanStore for MemoryStore {
    fn list(&self, filter: &BeanFilter) -> Result<Vec<Bean>> {
        Ok(self
            .lock()
            .values()
            .filter(|b| filter.matches(b))
            .cloned()
            .collect())
    }

    fn get(&self, id: &str) -> Result<Option<Bean>> {
        Ok(self.lock().get(id).cloned())
    }

    fn children(&self, id: &str) -> Result<Vec<Bean>> {
        Ok(self
            .lock()
            .values()
            .filter(|b| b.parent_id.as_deref() == Some(id))
            .cloned()
            .collect())
    }

    fn create(&self, new: &NewBean) -> Result<Bean> {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let bean = Bean {
            id: format!("mem-{:04}", n),
            slug: slugify(&new.title),
            title: new.title.clone(),
            status: new.status,
            bean_type: new.bean_type,
            priority: new.priority,
            tags: new.tags.iter().cloned().collect(),
            body: new.body.clone(),
            parent_id: new.parent_id.clone(),
            blocking_ids: Vec::new(),
        };
        self.insert(bean.clone());
        Ok(bean)
    }

    fn set_status(&self, id: &str, status: BeanStatus) -> Result<()> {
        self.modify(id, |b| b.status = status)
    }

    fn update_tags(&self, id: &str, add: &[&str], remove: &[&str]) -> Result<()> {
        self.modify(id, |b| {
            for tag in remove {
                b.tags.remove(*tag);
            }
            for tag in add {
                b.tags.insert((*tag).to_string());
            }
        })
    }

    fn set_body(&self, id: &str, body: &str) -> Result<()> {
        self.modify(id, |b| b.body = body.to_string())
    }

    fn set_parent(&self, id: &str, parent_id: Option<&str>) -> Result<()> {
        self.modify(id, |b| b.parent_id = parent_id.map(String::from))
    }

    fn add_blocker(&self, id: &str, blocker_id: &str) -> Result<()> {
        self.modify(id, |b| {
            if !b.blocking_ids.iter().any(|x| x == blocker_id) {
                b.blocking_ids.push(blocker_id.to_string());
            }
        })
    }

    fn remove_blocker(&self, id: &str, blocker_id: &str) -> Result<()> {
        self.modify(id, |b| b.blocking_ids.retain(|x| x != blocker_id))
    }
}
