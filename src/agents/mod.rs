// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 stagehand contributors

//! Agent matching
//!
//! An agent is a named set of capability tags. A stage runs on any idle agent
//! whose tags cover the stage's requirements; every agent also carries the
//! implicit tag `name:<agent name>`. A requirement `name~<text>` matches any
//! agent whose name contains `text`.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::errors::{StagehandError, StagehandResult};

/// An execution agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Agent {
    pub name: String,

    /// Capability tags, e.g. `macos`, `xcode`, `docker`
    #[serde(default)]
    pub capabilities: Vec<String>,

    /// Variables exported to every step run on this agent
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl Agent {
    pub fn new(name: impl Into<String>, capabilities: &[&str]) -> Self {
        Self {
            name: name.into(),
            capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
            env: HashMap::new(),
        }
    }

    /// Declared tags plus `name:<name>`
    pub fn capability_set(&self) -> BTreeSet<String> {
        let mut set: BTreeSet<String> = self.capabilities.iter().cloned().collect();
        set.insert(format!("name:{}", self.name));
        set
    }

    pub fn satisfies(&self, required: &[String]) -> bool {
        let set = self.capability_set();
        required.iter().all(|tag| match tag.strip_prefix("name~") {
            Some(part) => self.name.contains(part),
            None => set.contains(tag),
        })
    }
}

/// Fixed pool of agents with exclusive leases
#[derive(Debug)]
pub struct AgentPool {
    agents: Vec<Agent>,
    busy: Mutex<Vec<bool>>,
    released: Notify,
}

impl AgentPool {
    pub fn new(agents: Vec<Agent>) -> Self {
        let busy = Mutex::new(vec![false; agents.len()]);
        Self {
            agents,
            busy,
            released: Notify::new(),
        }
    }

    /// A single agent describing this machine
    pub fn local() -> Self {
        let mut capabilities = vec![
            std::env::consts::OS.to_string(),
            std::env::consts::ARCH.to_string(),
        ];
        if which::which("docker").is_ok() {
            capabilities.push("docker".to_string());
        }

        Self::new(vec![Agent {
            name: "local".to_string(),
            capabilities,
            env: HashMap::new(),
        }])
    }

    /// Pool for a pipeline: its declared agents, or the local machine
    pub fn for_agents(agents: &[Agent]) -> Self {
        if agents.is_empty() {
            Self::local()
        } else {
            Self::new(agents.to_vec())
        }
    }

    fn busy(&self) -> MutexGuard<'_, Vec<bool>> {
        self.busy.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether any agent, busy or not, could ever run this stage
    pub fn could_satisfy(&self, required: &[String]) -> bool {
        self.agents.iter().any(|a| a.satisfies(required))
    }

    /// Any idle agent covering `required`, without reserving it
    pub fn match_agent(&self, stage: &str, required: &[String]) -> StagehandResult<&Agent> {
        let busy = self.busy();
        self.agents
            .iter()
            .zip(busy.iter())
            .find(|(agent, busy)| !**busy && agent.satisfies(required))
            .map(|(agent, _)| agent)
            .ok_or_else(|| no_agent(stage, required))
    }

    fn try_reserve(&self, required: &[String]) -> Option<usize> {
        let mut busy = self.busy();
        let index = self
            .agents
            .iter()
            .enumerate()
            .find(|(i, agent)| !busy[*i] && agent.satisfies(required))
            .map(|(i, _)| i)?;
        busy[index] = true;
        Some(index)
    }

    /// Reserve a matching agent, queueing up to `timeout` for one to be released
    ///
    /// Fails at once when no agent in the pool could ever qualify.
    pub async fn acquire(
        self: &Arc<Self>,
        stage: &str,
        required: &[String],
        timeout: Duration,
    ) -> StagehandResult<AgentLease> {
        if !self.could_satisfy(required) {
            return Err(no_agent(stage, required));
        }

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(index) = self.try_reserve(required) {
                info!(stage, agent = %self.agents[index].name, "agent assigned");
                return Ok(AgentLease {
                    pool: Arc::clone(self),
                    index,
                });
            }

            debug!(stage, ?required, "waiting for an agent");
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(no_agent(stage, required));
            }
        }
    }

    fn release(&self, index: usize) {
        if let Some(slot) = self.busy().get_mut(index) {
            *slot = false;
        }
        self.released.notify_waiters();
    }
}

fn no_agent(stage: &str, required: &[String]) -> StagehandError {
    StagehandError::NoAgentAvailable {
        stage: stage.to_string(),
        requirements: required.join(", "),
    }
}

/// Exclusive use of an agent; released on drop
#[derive(Debug)]
pub struct AgentLease {
    pool: Arc<AgentPool>,
    index: usize,
}

impl AgentLease {
    pub fn agent(&self) -> &Agent {
        &self.pool.agents[self.index]
    }
}

impl Drop for AgentLease {
    fn drop(&mut self) {
        debug!(agent = %self.agent().name, "agent released");
        self.pool.release(self.index);
    }
}
