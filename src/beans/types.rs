//! Bean data model.
//!
//! Beans are owned by the external record store; roaster only caches a
//! read view of them and issues mutation requests.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::Error;

/// Tag an agent sets on its own bean when it cannot proceed.
pub const TAG_BLOCKED: &str = "blocked";
/// Tag roaster sets when an agent run crashed.
pub const TAG_FAILED: &str = "failed";
/// Tags that take a bean out of scheduling until retried.
pub const STUCK_TAGS: [&str; 2] = [TAG_BLOCKED, TAG_FAILED];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BeanStatus {
    Draft,
    Todo,
    InProgress,
    Completed,
    Scrapped,
}

impl BeanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BeanStatus::Draft => "draft",
            BeanStatus::Todo => "todo",
            BeanStatus::InProgress => "in-progress",
            BeanStatus::Completed => "completed",
            BeanStatus::Scrapped => "scrapped",
        }
    }

    /// Completed and scrapped beans no longer hold anything back.
    pub fn is_terminal(&self) -> bool {
        matches!(self, BeanStatus::Completed | BeanStatus::Scrapped)
    }

    /// Statuses the scheduler is allowed to pick up.
    pub fn is_workable(&self) -> bool {
        matches!(self, BeanStatus::Todo | BeanStatus::InProgress)
    }
}

impl fmt::Display for BeanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BeanStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(BeanStatus::Draft),
            "todo" => Ok(BeanStatus::Todo),
            "in-progress" => Ok(BeanStatus::InProgress),
            "completed" => Ok(BeanStatus::Completed),
            "scrapped" => Ok(BeanStatus::Scrapped),
            other => Err(Error::Validation(format!("unknown bean status '{}'", other))),
        }
    }
}

/// Bean type, declared from coarsest to finest granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BeanType {
    Milestone,
    Epic,
    Feature,
    Bug,
    Task,
}

impl BeanType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BeanType::Milestone => "milestone",
            BeanType::Epic => "epic",
            BeanType::Feature => "feature",
            BeanType::Bug => "bug",
            BeanType::Task => "task",
        }
    }

    /// Epics and milestones get an audit prompt instead of an implementation prompt.
    pub fn is_review(&self) -> bool {
        matches!(self, BeanType::Milestone | BeanType::Epic)
    }

    /// Conventional-commit type for work of this kind.
    pub fn commit_type(&self) -> &'static str {
        match self {
            BeanType::Feature => "feat",
            BeanType::Bug => "fix",
            BeanType::Task | BeanType::Epic | BeanType::Milestone => "chore",
        }
    }
}

impl fmt::Display for BeanType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BeanType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "milestone" => Ok(BeanType::Milestone),
            "epic" => Ok(BeanType::Epic),
            "feature" => Ok(BeanType::Feature),
            "bug" => Ok(BeanType::Bug),
            "task" => Ok(BeanType::Task),
            other => Err(Error::Validation(format!("unknown bean type '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
    Deferred,
}

impl Priority {
    /// Numeric rank, lower runs first.
    pub fn rank(&self) -> u8 {
        match self {
            Priority::Critical => 0,
            Priority::High => 1,
            Priority::Normal => 2,
            Priority::Low => 3,
            Priority::Deferred => 4,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
            Priority::Deferred => "deferred",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of work tracked in the record store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bean {
    pub id: String,
    #[serde(default)]
    pub slug: String,
    #[serde(default)]
    pub title: String,
    pub status: BeanStatus,
    #[serde(rename = "type")]
    pub bean_type: BeanType,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    /// Beans that must reach a terminal status before this one is workable.
    #[serde(default)]
    pub blocking_ids: Vec<String>,
}

impl Bean {
    pub fn new(id: &str, title: &str, bean_type: BeanType) -> Self {
        Self {
            id: id.to_string(),
            slug: slugify(title),
            title: title.to_string(),
            status: BeanStatus::Todo,
            bean_type,
            priority: Priority::Normal,
            tags: BTreeSet::new(),
            body: String::new(),
            parent_id: None,
            blocking_ids: Vec::new(),
        }
    }

    pub fn with_status(mut self, status: BeanStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_parent(mut self, parent_id: &str) -> Self {
        self.parent_id = Some(parent_id.to_string());
        self
    }

    pub fn with_body(mut self, body: &str) -> Self {
        self.body = body.to_string();
        self
    }

    pub fn with_tag(mut self, tag: &str) -> Self {
        self.tags.insert(tag.to_string());
        self
    }

    pub fn with_blocker(mut self, blocker_id: &str) -> Self {
        self.blocking_ids.push(blocker_id.to_string());
        self
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    /// Tagged `blocked` or `failed`.
    pub fn is_stuck(&self) -> bool {
        STUCK_TAGS.iter().any(|t| self.has_tag(t))
    }

    /// Git branch holding this bean's work.
    pub fn branch_name(&self) -> String {
        branch_name_for(&self.id)
    }
}

pub fn branch_name_for(id: &str) -> String {
    format!("bean/{}", id)
}

/// Fields for a bean the store should create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBean {
    pub title: String,
    pub bean_type: BeanType,
    pub status: BeanStatus,
    pub priority: Priority,
    pub body: String,
    pub parent_id: Option<String>,
    pub tags: Vec<String>,
}

impl NewBean {
    pub fn new(title: &str, bean_type: BeanType) -> Self {
        Self {
            title: title.to_string(),
            bean_type,
            status: BeanStatus::Todo,
            priority: Priority::Normal,
            body: String::new(),
            parent_id: None,
            tags: Vec::new(),
        }
    }
}

/// Lowercase, hyphen-separated form of a title.
pub fn slugify(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    let mut last_hyphen = true;
    for c in title.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_hyphen = false;
        } else if !last_hyphen {
            slug.push('-');
            last_hyphen = true;
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}
