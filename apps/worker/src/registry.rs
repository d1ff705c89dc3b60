//! Static metadata for every job category the worker knows how to run
//!
//! The registry is built once at startup from explicit registrations; filters
//! and the scheduler query it for dependency tags, concurrency groups and
//! default priorities.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{WorkerError, WorkerResult};
use crate::job::JobHandler;

/// Registered type of a unit of work, e.g. `anidb_get_file`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobCategory(String);

impl JobCategory {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobCategory {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for JobCategory {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// External signal a job category cannot run without
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dependency {
    /// Local storage must be online and unblocked
    Storage,
    /// At least one connectivity monitor must report a connection
    Network,
    /// The AniDB UDP session must be usable
    SessionProtocol,
    /// The AniDB HTTP API must not be banned
    StatelessProtocol,
}

/// Dispatch priority; higher values are attempted first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Priority(pub i16);

impl Priority {
    pub const LOW: Self = Self(-10);
    pub const NORMAL: Self = Self(0);
    pub const HIGH: Self = Self(10);
}

impl Default for Priority {
    fn default() -> Self {
        Self::NORMAL
    }
}

/// Named pool with a cap on simultaneous executions, shared by categories
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConcurrencyGroup {
    pub name: String,
    pub cap: usize,
}

impl ConcurrencyGroup {
    pub fn new(name: impl Into<String>, cap: usize) -> Self {
        Self {
            name: name.into(),
            cap,
        }
    }
}

/// Static description of one job category
#[derive(Debug, Clone)]
pub struct JobTypeInfo {
    pub category: JobCategory,
    pub dependencies: HashSet<Dependency>,
    pub group: Option<ConcurrencyGroup>,
    /// Per-category cap, enforced in addition to the group cap
    pub max_concurrent: Option<usize>,
    pub default_priority: Priority,
}

impl JobTypeInfo {
    pub fn new(category: impl Into<JobCategory>) -> Self {
        Self {
            category: category.into(),
            dependencies: HashSet::new(),
            group: None,
            max_concurrent: None,
            default_priority: Priority::NORMAL,
        }
    }

    pub fn requires(mut self, dependency: Dependency) -> Self {
        self.dependencies.insert(dependency);
        self
    }

    pub fn in_group(mut self, group: ConcurrencyGroup) -> Self {
        self.group = Some(group);
        self
    }

    pub fn max_concurrent(mut self, cap: usize) -> Self {
        self.max_concurrent = Some(cap);
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.default_priority = priority;
        self
    }

    pub fn requires_dependency(&self, dependency: Dependency) -> bool {
        self.dependencies.contains(&dependency)
    }
}

#[derive(Clone)]
pub(crate) struct RegisteredJob {
    pub(crate) info: JobTypeInfo,
    pub(crate) handler: Arc<dyn JobHandler>,
}

/// Mapping from job category to its metadata and handler
#[derive(Default, Clone)]
pub struct JobTypeRegistry {
    jobs: HashMap<JobCategory, RegisteredJob>,
    group_caps: BTreeMap<String, usize>,
}

impl fmt::Debug for JobTypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobTypeRegistry")
            .field("categories", &self.categories())
            .field("groups", &self.group_caps)
            .finish()
    }
}

impl JobTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under the category its [`JobTypeInfo`] names
    ///
    /// # Errors
    /// Returns `WorkerError::Registration` for a duplicate category, a zero
    /// cap, or a group registered earlier with a different cap
    pub fn register(&mut self, handler: Arc<dyn JobHandler>) -> WorkerResult<()> {
        let info = handler.job_type();

        if self.jobs.contains_key(&info.category) {
            return Err(WorkerError::Registration(format!(
                "job type '{}' is already registered",
                info.category
            )));
        }
        if info.max_concurrent == Some(0) {
            return Err(WorkerError::Registration(format!(
                "job type '{}' has a concurrency cap of 0",
                info.category
            )));
        }
        if let Some(group) = &info.group {
            if group.cap == 0 {
                return Err(WorkerError::Registration(format!(
                    "concurrency group '{}' has a cap of 0",
                    group.name
                )));
            }
            match self.group_caps.get(&group.name) {
                Some(&cap) if cap != group.cap => {
                    return Err(WorkerError::Registration(format!(
                        "concurrency group '{}' registered with cap {} and {}",
                        group.name, cap, group.cap
                    )));
                }
                _ => {
                    self.group_caps.insert(group.name.clone(), group.cap);
                }
            }
        }

        tracing::debug!(
            category = %info.category,
            group = info.group.as_ref().map(|g| g.name.as_str()),
            "Registered job type"
        );
        self.jobs
            .insert(info.category.clone(), RegisteredJob { info, handler });
        Ok(())
    }

    pub fn get(&self, category: &JobCategory) -> Option<&JobTypeInfo> {
        self.jobs.get(category).map(|job| &job.info)
    }

    pub(crate) fn entry(&self, category: &JobCategory) -> Option<&RegisteredJob> {
        self.jobs.get(category)
    }

    pub fn contains(&self, category: &JobCategory) -> bool {
        self.jobs.contains_key(category)
    }

    /// Registered categories in name order
    pub fn categories(&self) -> Vec<JobCategory> {
        let mut categories: Vec<_> = self.jobs.keys().cloned().collect();
        categories.sort();
        categories
    }

    /// Categories that declare `dependency`
    pub fn categories_requiring(&self, dependency: Dependency) -> HashSet<JobCategory> {
        self.jobs
            .values()
            .filter(|job| job.info.requires_dependency(dependency))
            .map(|job| job.info.category.clone())
            .collect()
    }

    /// Cap of a concurrency group, if any category registered it
    pub fn group_cap(&self, group: &str) -> Option<usize> {
        self.group_caps.get(group).copied()
    }

    /// Categories sharing a concurrency group
    pub fn group_members(&self, group: &str) -> Vec<JobCategory> {
        let mut members: Vec<_> = self
            .jobs
            .values()
            .filter(|job| job.info.group.as_ref().is_some_and(|g| g.name == group))
            .map(|job| job.info.category.clone())
            .collect();
        members.sort();
        members
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
