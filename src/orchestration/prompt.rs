//! Agent prompt assembly.
//!
//! Implementation beans get a "do the work" prompt built from their body.
//! Epics and milestones get a review prompt listing their children, asking
//! the agent to audit what was done rather than write new code.

use std::sync::LazyLock;

use regex::Regex;

use crate::beans::{Bean, BeanStatus, TAG_BLOCKED};

/// Backtick-quoted tokens that look like file paths: `src/lib.rs`, `Cargo.toml`.
static QUOTED_PATH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"`([A-Za-z0-9_./-]+\.[A-Za-z0-9]{1,8})`").unwrap());

/// Bare relative paths with at least one directory: src/orchestration/mod.rs.
static BARE_PATH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|[\s(\[])((?:\.{0,2}/)?(?:[A-Za-z0-9_.-]+/)+[A-Za-z0-9_-]+\.[A-Za-z0-9]{1,8})\b")
        .unwrap()
});

/// Best-effort scan of free text for file paths.
///
/// Advisory only: it will miss paths and occasionally pick up things that
/// merely look like paths (URLs are filtered out). Order of first mention
/// is preserved and duplicates are dropped.
pub fn extract_file_paths(text: &str) -> Vec<String> {
    let mut found: Vec<(usize, String)> = Vec::new();
    for re in [&*QUOTED_PATH_RE, &*BARE_PATH_RE] {
        for caps in re.captures_iter(text) {
            if let Some(m) = caps.get(1) {
                found.push((m.start(), m.as_str().to_string()));
            }
        }
    }
    found.sort_by_key(|(pos, _)| *pos);

    let mut paths: Vec<String> = Vec::new();
    for (pos, path) in found {
        if is_url_fragment(text, pos) || path.chars().all(|c| c.is_ascii_digit() || c == '.') {
            continue;
        }
        let path = path.trim_start_matches("./").to_string();
        if !paths.contains(&path) {
            paths.push(path);
        }
    }
    paths
}

fn is_url_fragment(text: &str, pos: usize) -> bool {
    let start = text[..pos]
        .char_indices()
        .rev()
        .find(|(_, c)| c.is_whitespace())
        .map_or(0, |(i, c)| i + c.len_utf8());
    text[start..pos].contains("://")
}

/// Pick the prompt variant for the bean's type.
pub fn build_prompt(bean: &Bean, children: &[Bean]) -> String {
    if bean.bean_type.is_review() {
        review_prompt(bean, children)
    } else {
        work_prompt(bean)
    }
}

fn header(bean: &Bean) -> String {
    format!(
        "Bean {id} ({kind}, priority {priority}): {title}",
        id = bean.id,
        kind = bean.bean_type,
        priority = bean.priority,
        title = bean.title
    )
}

fn blocked_instructions(bean: &Bean) -> String {
    format!(
        "If you cannot finish because something outside this bean must happen first, \
         add the `{tag}` tag to bean {id} (`beans update {id} --tag {tag}`), explain why \
         in the bean body, and stop. Do not set the bean's status yourself.",
        tag = TAG_BLOCKED,
        id = bean.id
    )
}

fn work_prompt(bean: &Bean) -> String {
    let body = if bean.body.trim().is_empty() {
        "(no description)".to_string()
    } else {
        bean.body.trim().to_string()
    };
    format!(
        "You are working on a single bean in this repository.\n\n\
         {header}\n\n\
         DESCRIPTION:\n{body}\n\n\
         INSTRUCTIONS:\n\
         - Implement what the description asks for, keeping changes focused on this bean.\n\
         - Tick off checklist items in the bean body as you complete them.\n\
         - Leave your changes uncommitted; they are committed for you when you exit.\n\
         - {blocked}\n",
        header = header(bean),
        body = body,
        blocked = blocked_instructions(bean)
    )
}

fn review_prompt(bean: &Bean, children: &[Bean]) -> String {
    let mut listing = String::new();
    if children.is_empty() {
        listing.push_str("(no child beans)\n");
    }
    for child in children {
        let marker = match child.status {
            BeanStatus::Completed => "x",
            BeanStatus::Scrapped => "-",
            _ => " ",
        };
        listing.push_str(&format!(
            "- [{}] {} {} ({}, {})\n",
            marker, child.id, child.title, child.bean_type, child.status
        ));
        let paths = extract_file_paths(&child.body);
        if !paths.is_empty() {
            listing.push_str(&format!("    files mentioned: {}\n", paths.join(", ")));
        }
    }

    format!(
        "You are reviewing a {kind} whose child beans have been worked on. \
         Audit the work; do not implement new features.\n\n\
         {header}\n\n\
         GOAL:\n{body}\n\n\
         CHILD BEANS:\n{listing}\n\
         INSTRUCTIONS:\n\
         - Check that the completed children together satisfy the goal above.\n\
         - Inspect the files mentioned (the list is a hint, not exhaustive) for gaps, \
           inconsistencies and missing tests.\n\
         - Fix small issues directly. For anything larger, create a new child bean \
           describing the follow-up instead of doing it here.\n\
         - {blocked}\n",
        kind = bean.bean_type,
        header = header(bean),
        body = bean.body.trim(),
        listing = listing,
        blocked = blocked_instructions(bean)
    )
}
