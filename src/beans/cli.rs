//! Bean store backed by the `beans` command line tool.
//!
//! Every call runs `beans query --json <document>` in an explicit working
//! directory. Arguments are passed straight to the process, never through
//! a shell, and string values are embedded as escaped GraphQL literals.

use std::path::{Path, PathBuf};
use std::process::Command;

use serde::Deserialize;
use serde_json::Value;

use crate::beans::store::{BeanFilter, BeanStore};
use crate::beans::types::{Bean, BeanStatus, NewBean};
use crate::{rlog_debug, rlog_trace, Error, Result};

const BEAN_FIELDS: &str = "id slug title status type priority tags body parentId blockingIds";

#[derive(Debug, Clone)]
pub struct BeansCli {
    binary: PathBuf,
    workdir: PathBuf,
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    data: Option<Value>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

impl BeansCli {
    pub fn new(binary: impl Into<PathBuf>, workdir: &Path) -> Self {
        Self {
            binary: binary.into(),
            workdir: workdir.to_path_buf(),
        }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Run a GraphQL document and return its `data` object.
    pub fn query(&self, document: &str) -> Result<Value> {
        rlog_debug!("beans query in {}: {}", self.workdir.display(), first_line(document));
        let output = Command::new(&self.binary)
            .args(["query", "--json", document])
            .current_dir(&self.workdir)
            .output()
            .map_err(|e| Error::Store(format!("failed to run {}: {}", self.binary.display(), e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Store(format!(
                "{} exited with {}: {}",
                self.binary.display(),
                output.status,
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        rlog_trace!("beans query output: {}", stdout.trim());
        parse_response(&stdout)
    }

    fn mutate(&self, document: String) -> Result<()> {
        self.query(&document).map(|_| ())
    }
}

/// Extract `data` from a query response, turning GraphQL errors into store errors.
pub(crate) fn parse_response(stdout: &str) -> Result<Value> {
    let value: Value = serde_json::from_str(stdout.trim())
        .map_err(|e| Error::Store(format!("unparseable beans output: {}", e)))?;

    if value.get("data").is_none() && value.get("errors").is_none() {
        return Ok(value);
    }

    let envelope: Envelope = serde_json::from_value(value)?;
    if !envelope.errors.is_empty() {
        let messages: Vec<_> = envelope.errors.into_iter().map(|e| e.message).collect();
        return Err(Error::Store(messages.join("; ")));
    }
    Ok(envelope.data.unwrap_or(Value::Null))
}

fn first_line(s: &str) -> &str {
    s.lines().next().unwrap_or("")
}

/// Quote a string as a GraphQL literal.
fn lit(s: &str) -> String {
    // JSON string escaping is a subset of what GraphQL accepts.
    serde_json::to_string(s).unwrap_or_else(|_| "\"\"".to_string())
}

fn list_lit<I, S>(items: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let quoted: Vec<String> = items.into_iter().map(|s| lit(s.as_ref())).collect();
    format!("[{}]", quoted.join(", "))
}

pub(crate) fn filter_literal(filter: &BeanFilter) -> String {
    let mut parts = Vec::new();
    if !filter.statuses.is_empty() {
        parts.push(format!("status: {}", list_lit(filter.statuses.iter().map(|s| s.as_str()))));
    }
    if !filter.types.is_empty() {
        parts.push(format!("type: {}", list_lit(filter.types.iter().map(|t| t.as_str()))));
    }
    if !filter.priorities.is_empty() {
        parts.push(format!(
            "priority: {}",
            list_lit(filter.priorities.iter().map(|p| p.as_str()))
        ));
    }
    if !filter.tags.is_empty() {
        parts.push(format!("tags: {}", list_lit(&filter.tags)));
    }
    if !filter.exclude_tags.is_empty() {
        parts.push(format!("excludeTags: {}", list_lit(&filter.exclude_tags)));
    }
    if let Some(has) = filter.has_blockers {
        parts.push(format!("isBlocked: {}", has));
    }
    format!("{{{}}}", parts.join(", "))
}

fn take<T: serde::de::DeserializeOwned>(mut data: Value, key: &str) -> Result<T> {
    let value = data.get_mut(key).map(Value::take).unwrap_or(Value::Null);
    Ok(serde_json::from_value(value)?)
}

fn update_doc(id: &str, input: &str) -> String {
    format!(
        "mutation {{ updateBean(id: {}, input: {{{}}}) {{ id }} }}",
        lit(id),
        input
    )
}

impl BeanStore for BeansCli {
    fn list(&self, filter: &BeanFilter) -> Result<Vec<Bean>> {
        let doc = format!(
            "{{ beans(filter: {}) {{ {} }} }}",
            filter_literal(filter),
            BEAN_FIELDS
        );
        let data = self.query(&doc)?;
        Ok(take::<Option<Vec<Bean>>>(data, "beans")?.unwrap_or_default())
    }

    fn get(&self, id: &str) -> Result<Option<Bean>> {
        let doc = format!("{{ bean(id: {}) {{ {} }} }}", lit(id), BEAN_FIELDS);
        take(self.query(&doc)?, "bean")
    }

    fn children(&self, id: &str) -> Result<Vec<Bean>> {
        #[derive(Deserialize)]
        struct WithChildren {
            #[serde(default)]
            children: Vec<Bean>,
        }

        let doc = format!(
            "{{ bean(id: {}) {{ children {{ {} }} }} }}",
            lit(id),
            BEAN_FIELDS
        );
        let bean: Option<WithChildren> = take(self.query(&doc)?, "bean")?;
        Ok(bean.map(|b| b.children).unwrap_or_default())
    }

    fn create(&self, new: &NewBean) -> Result<Bean> {
        let mut input = vec![
            format!("title: {}", lit(&new.title)),
            format!("type: {}", lit(new.bean_type.as_str())),
            format!("status: {}", lit(new.status.as_str())),
            format!("priority: {}", lit(new.priority.as_str())),
            format!("body: {}", lit(&new.body)),
        ];
        if let Some(parent) = &new.parent_id {
            input.push(format!("parent: {}", lit(parent)));
        }
        if !new.tags.is_empty() {
            input.push(format!("tags: {}", list_lit(&new.tags)));
        }
        let doc = format!(
            "mutation {{ createBean(input: {{{}}}) {{ {} }} }}",
            input.join(", "),
            BEAN_FIELDS
        );
        let created: Option<Bean> = take(self.query(&doc)?, "createBean")?;
        created.ok_or_else(|| Error::Store(format!("createBean returned nothing for '{}'", new.title)))
    }

    fn set_status(&self, id: &str, status: BeanStatus) -> Result<()> {
        self.mutate(update_doc(id, &format!("status: {}", lit(status.as_str()))))
    }

    fn update_tags(&self, id: &str, add: &[&str], remove: &[&str]) -> Result<()> {
        let mut input = Vec::new();
        if !add.is_empty() {
            input.push(format!("addTags: {}", list_lit(add)));
        }
        if !remove.is_empty() {
            input.push(format!("removeTags: {}", list_lit(remove)));
        }
        if input.is_empty() {
            return Ok(());
        }
        self.mutate(update_doc(id, &input.join(", ")))
    }

    fn set_body(&self, id: &str, body: &str) -> Result<()> {
        self.mutate(update_doc(id, &format!("body: {}", lit(body))))
    }

    fn set_parent(&self, id: &str, parent_id: Option<&str>) -> Result<()> {
        let value = parent_id.map(lit).unwrap_or_else(|| "null".to_string());
        self.mutate(update_doc(id, &format!("parent: {}", value)))
    }

    fn add_blocker(&self, id: &str, blocker_id: &str) -> Result<()> {
        self.mutate(update_doc(id, &format!("addBlockedBy: {}", list_lit([blocker_id]))))
    }

    fn remove_blocker(&self, id: &str, blocker_id: &str) -> Result<()> {
        self.mutate(update_doc(id, &format!("removeBlockedBy: {}", list_lit([blocker_id]))))
    }
}
