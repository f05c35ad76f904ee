//! Priority queue with readiness gating.
//!
//! Beans are ordered by priority tier, then by arrival. On each tick the
//! scheduler hands out as many ready beans as there is free capacity. A bean
//! is ready when it is not stuck and none of its blockers is still open.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::beans::{Bean, BeanStatus};
use crate::{rlog_debug, rlog_trace};

/// A queued bean with its ordering keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub bean: Bean,
    /// Priority tier, lower runs first.
    pub rank: u8,
    /// Arrival order within the tier. Retries get negative values.
    pub sequence: i64,
    pub enqueued_at: DateTime<Utc>,
}

impl QueueEntry {
    fn sort_key(&self) -> (u8, i64) {
        (self.rank, self.sequence)
    }
}

/// Events emitted by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerEvent {
    /// The bean was taken off the queue and counts against capacity until
    /// [`Scheduler::mark_complete`] is called for it.
    Ready(Bean),
}

pub struct Scheduler {
    max_parallel: usize,
    queue: Vec<QueueEntry>,
    running: HashSet<String>,
    /// Stuck bean id to reason.
    stuck: HashMap<String, String>,
    paused: bool,
    next_sequence: i64,
    next_front_sequence: i64,
    event_tx: mpsc::UnboundedSender<SchedulerEvent>,
}

impl Scheduler {
    pub fn new(max_parallel: usize, event_tx: mpsc::UnboundedSender<SchedulerEvent>) -> Self {
        Self {
            max_parallel: max_parallel.max(1),
            queue: Vec::new(),
            running: HashSet::new(),
            stuck: HashMap::new(),
            paused: false,
            next_sequence: 0,
            next_front_sequence: -1,
            event_tx,
        }
    }

    pub fn max_parallel(&self) -> usize {
        self.max_parallel
    }

    pub fn active_count(&self) -> usize {
        self.running.len()
    }

    pub fn has_capacity(&self) -> bool {
        self.running.len() < self.max_parallel
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.running.contains(id)
    }

    pub fn is_queued(&self, id: &str) -> bool {
        self.position(id).is_some()
    }

    pub fn is_stuck(&self, id: &str) -> bool {
        self.stuck.contains_key(id)
    }

    pub fn stuck_reason(&self, id: &str) -> Option<&str> {
        self.stuck.get(id).map(String::as_str)
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Queue contents in the order they would be handed out, ignoring blockers.
    pub fn queue(&self) -> &[QueueEntry] {
        &self.queue
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.queue.iter().position(|e| e.bean.id == id)
    }

    fn admissible(&self, bean: &Bean) -> bool {
        if self.running.contains(&bean.id) {
            rlog_trace!("not queueing {}: running", bean.id);
            return false;
        }
        if bean.is_stuck() || self.stuck.contains_key(&bean.id) {
            rlog_trace!("not queueing {}: stuck", bean.id);
            return false;
        }
        if !bean.status.is_workable() {
            rlog_trace!("not queueing {}: status {}", bean.id, bean.status);
            return false;
        }
        true
    }

    fn sort(&mut self) {
        self.queue.sort_by_key(QueueEntry::sort_key);
    }

    /// Add a bean to the back of its priority tier.
    ///
    /// Returns true only if the bean was newly queued. A bean that is already
    /// queued has its snapshot refreshed and keeps its place within its tier.
    /// A bean that is no longer admissible is dropped from the queue.
    pub fn enqueue(&mut self, bean: Bean) -> bool {
        if !self.admissible(&bean) {
            self.dequeue(&bean.id);
            return false;
        }
        if let Some(idx) = self.position(&bean.id) {
            let entry = &mut self.queue[idx];
            entry.rank = bean.priority.rank();
            entry.bean = bean;
            self.sort();
            return false;
        }

        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.push(bean, sequence);
        true
    }

    /// Add a bean ahead of everything else in its priority tier.
    pub fn enqueue_front(&mut self, bean: Bean) -> bool {
        if !self.admissible(&bean) {
            return false;
        }
        let sequence = self.next_front_sequence;
        self.next_front_sequence -= 1;

        if let Some(idx) = self.position(&bean.id) {
            let entry = &mut self.queue[idx];
            entry.rank = bean.priority.rank();
            entry.sequence = sequence;
            entry.bean = bean;
            self.sort();
            return false;
        }
        self.push(bean, sequence);
        true
    }

    fn push(&mut self, bean: Bean, sequence: i64) {
        rlog_debug!("queued {} ({}, seq {})", bean.id, bean.priority, sequence);
        self.queue.push(QueueEntry {
            rank: bean.priority.rank(),
            bean,
            sequence,
            enqueued_at: Utc::now(),
        });
        self.sort();
    }

    /// Remove a bean from the queue. Running beans are unaffected.
    pub fn dequeue(&mut self, id: &str) -> Option<QueueEntry> {
        self.position(id).map(|idx| self.queue.remove(idx))
    }

    /// Keep a bean out of scheduling until [`Scheduler::clear_stuck`].
    pub fn mark_stuck(&mut self, id: &str, reason: &str) {
        rlog_debug!("{} stuck: {}", id, reason);
        self.dequeue(id);
        self.stuck.insert(id.to_string(), reason.to_string());
    }

    pub fn clear_stuck(&mut self, id: &str) -> bool {
        self.stuck.remove(id).is_some()
    }

    /// Release the capacity slot held by a bean. Returns false if it was not running.
    pub fn mark_complete(&mut self, id: &str) -> bool {
        self.running.remove(id)
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    /// Emit ready beans while capacity remains.
    ///
    /// `status_of` reports the current status of a blocker; blockers it does
    /// not know about are not waited on. Returns how many beans were emitted.
    pub fn tick<F>(&mut self, status_of: F) -> usize
    where
        F: Fn(&str) -> Option<BeanStatus>,
    {
        if self.paused {
            return 0;
        }

        let mut emitted = 0;
        while self.has_capacity() {
            let Some(idx) = self.queue.iter().position(|entry| {
                !self.stuck.contains_key(&entry.bean.id)
                    && !entry
                        .bean
                        .blocking_ids
                        .iter()
                        .any(|b| status_of(b).is_some_and(|s| !s.is_terminal()))
            }) else {
                break;
            };

            let entry = self.queue.remove(idx);
            rlog_debug!("ready: {}", entry.bean.id);
            self.running.insert(entry.bean.id.clone());
            emitted += 1;
            if self.event_tx.send(SchedulerEvent::Ready(entry.bean)).is_err() {
                rlog_debug!("scheduler event receiver dropped");
            }
        }
        emitted
    }
}
