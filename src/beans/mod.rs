//! Bean records and the stores that hold them.

pub mod cli;
pub mod memory;
pub mod store;
pub mod types;

pub use cli::BeansCli;
pub use memory::MemoryStore;
pub use store::{ancestors, BeanFilter, BeanStore};
pub use types::{
    branch_name_for, slugify, Bean, BeanStatus, BeanType, NewBean, Priority, STUCK_TAGS,
    TAG_BLOCKED, TAG_FAILED,
};
