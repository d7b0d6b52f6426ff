// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Scripted driver and host agent.
//!
//! Back the sandbox binary and the test suites. Every call is recorded, and
//! remote state advances along scripted status walks: each `get` consumes
//! one step of the walk and the last step sticks.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::debug;

use cloudtask_core::TaskError;

use crate::agent::{AgentReply, Forward, HostAgent};
use crate::driver::{CloudDriver, CreateOptions, RemoteResource};

/// Status a remote create starts in.
pub const REMOTE_CREATING: &str = "CREATING";

struct CreateScript {
    external_id: String,
    walk: Vec<String>,
}

struct RemoteState {
    resource: RemoteResource,
    walk: VecDeque<String>,
}

/// In-process driver with scripted behaviour.
pub struct MockDriver {
    provider: String,
    next_id: AtomicUsize,
    create_scripts: DashMap<String, CreateScript>,
    remotes: DashMap<(String, String), RemoteState>,
    failures: DashMap<(String, String), TaskError>,
    change_walks: DashMap<String, Vec<String>>,
    rules: DashMap<String, Vec<Value>>,
    tags_supported: AtomicBool,
    calls: Mutex<Vec<String>>,
}

impl std::fmt::Debug for MockDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockDriver")
            .field("provider", &self.provider)
            .field("remotes", &self.remotes.len())
            .finish()
    }
}

impl MockDriver {
    /// Driver answering for `provider`.
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            next_id: AtomicUsize::new(1),
            create_scripts: DashMap::new(),
            remotes: DashMap::new(),
            failures: DashMap::new(),
            change_walks: DashMap::new(),
            rules: DashMap::new(),
            tags_supported: AtomicBool::new(true),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Next create of `name` returns `external_id` and walks through `walk`.
    ///
    /// Unscripted creates get a generated id and become available on the
    /// first poll.
    pub fn script_create(&self, name: &str, external_id: &str, walk: &[&str]) {
        self.create_scripts.insert(
            name.to_string(),
            CreateScript {
                external_id: external_id.to_string(),
                walk: walk.iter().map(|s| s.to_string()).collect(),
            },
        );
    }

    /// Status walk started by a config change of `external_id`.
    pub fn script_change(&self, external_id: &str, walk: &[&str]) {
        self.change_walks.insert(
            external_id.to_string(),
            walk.iter().map(|s| s.to_string()).collect(),
        );
    }

    /// Make `op` fail for `key` (the name for `create`, the external id
    /// otherwise) until cleared.
    pub fn fail_on(&self, op: &str, key: &str, err: TaskError) {
        self.failures.insert((op.to_string(), key.to_string()), err);
    }

    /// Remove a failure set by [`MockDriver::fail_on`].
    pub fn clear_failure(&self, op: &str, key: &str) {
        self.failures.remove(&(op.to_string(), key.to_string()));
    }

    /// Rules reported for a remote security group.
    pub fn set_rules(&self, external_id: &str, rules: Vec<Value>) {
        self.rules.insert(external_id.to_string(), rules);
    }

    /// Whether `set_tags` is supported.
    pub fn set_tags_supported(&self, supported: bool) {
        self.tags_supported.store(supported, Ordering::SeqCst);
    }

    /// Seed a remote resource with a fixed status.
    pub fn insert_remote(&self, kind: &str, resource: RemoteResource) {
        self.remotes.insert(
            (kind.to_string(), resource.external_id.clone()),
            RemoteState {
                resource,
                walk: VecDeque::new(),
            },
        );
    }

    /// Current remote state, without consuming a walk step.
    pub fn remote(&self, kind: &str, external_id: &str) -> Option<RemoteResource> {
        self.remotes
            .get(&(kind.to_string(), external_id.to_string()))
            .map(|s| s.resource.clone())
    }

    /// Every call so far as `op:key`.
    pub async fn calls(&self) -> Vec<String> {
        self.calls.lock().await.clone()
    }

    /// Number of calls of `op`.
    pub async fn call_count(&self, op: &str) -> usize {
        let prefix = format!("{}:", op);
        self.calls
            .lock()
            .await
            .iter()
            .filter(|c| c.starts_with(&prefix))
            .count()
    }

    async fn record(&self, op: &str, key: &str) -> Result<(), TaskError> {
        self.calls.lock().await.push(format!("{}:{}", op, key));
        debug!(provider = %self.provider, op, key, "Mock driver call");
        match self.failures.get(&(op.to_string(), key.to_string())) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn with_remote<T>(
        &self,
        kind: &str,
        external_id: &str,
        f: impl FnOnce(&mut RemoteState) -> T,
    ) -> Result<T, TaskError> {
        let mut state = self
            .remotes
            .get_mut(&(kind.to_string(), external_id.to_string()))
            .ok_or_else(|| not_found(kind, external_id))?;
        Ok(f(&mut state))
    }
}

fn not_found(kind: &str, external_id: &str) -> TaskError {
    TaskError::not_found(format!("{} {} not found", kind, external_id))
}

#[async_trait]
impl CloudDriver for MockDriver {
    fn provider(&self) -> &str {
        &self.provider
    }

    async fn create(&self, options: &CreateOptions) -> Result<RemoteResource, TaskError> {
        self.record("create", &options.name).await?;
        let script = match self.create_scripts.remove(&options.name) {
            Some((_, script)) => script,
            None => CreateScript {
                external_id: format!(
                    "{}-{}",
                    self.provider,
                    self.next_id.fetch_add(1, Ordering::SeqCst)
                ),
                walk: vec![cloudtask_core::ports::status::AVAILABLE.to_string()],
            },
        };

        let resource = RemoteResource {
            external_id: script.external_id,
            status: REMOTE_CREATING.to_string(),
            attributes: options.attributes.clone(),
        };
        self.remotes.insert(
            (options.kind.clone(), resource.external_id.clone()),
            RemoteState {
                resource: resource.clone(),
                walk: script.walk.into(),
            },
        );
        Ok(resource)
    }

    async fn get(&self, kind: &str, external_id: &str) -> Result<RemoteResource, TaskError> {
        self.record("get", external_id).await?;
        self.with_remote(kind, external_id, |state| {
            if let Some(next) = state.walk.pop_front() {
                state.resource.status = next;
            }
            state.resource.clone()
        })
    }

    async fn delete(&self, kind: &str, external_id: &str) -> Result<(), TaskError> {
        self.record("delete", external_id).await?;
        self.remotes
            .remove(&(kind.to_string(), external_id.to_string()))
            .map(|_| ())
            .ok_or_else(|| not_found(kind, external_id))
    }

    async fn set_tags(
        &self,
        kind: &str,
        external_id: &str,
        tags: &Map<String, Value>,
    ) -> Result<(), TaskError> {
        self.record("set_tags", external_id).await?;
        if !self.tags_supported.load(Ordering::SeqCst) {
            return Err(TaskError::not_supported(format!(
                "{} does not support tags on {}",
                self.provider, kind
            )));
        }
        self.with_remote(kind, external_id, |state| {
            state
                .resource
                .attributes
                .insert("tags".to_string(), Value::Object(tags.clone()));
        })
    }

    async fn change_config(
        &self,
        kind: &str,
        external_id: &str,
        config: &Map<String, Value>,
    ) -> Result<(), TaskError> {
        self.record("change_config", external_id).await?;
        let walk = self
            .change_walks
            .get(external_id)
            .map(|w| w.clone())
            .unwrap_or_else(|| vec![cloudtask_core::ports::status::AVAILABLE.to_string()]);
        self.with_remote(kind, external_id, |state| {
            for (k, v) in config {
                state.resource.attributes.insert(k.clone(), v.clone());
            }
            state.walk = walk.into();
        })
    }

    async fn renew(&self, kind: &str, external_id: &str, duration: &str) -> Result<(), TaskError> {
        self.record("renew", external_id).await?;
        self.with_remote(kind, external_id, |state| {
            state
                .resource
                .attributes
                .insert("renewed_for".to_string(), Value::from(duration));
        })
    }

    async fn set_auto_renew(
        &self,
        kind: &str,
        external_id: &str,
        enabled: bool,
    ) -> Result<(), TaskError> {
        self.record("set_auto_renew", external_id).await?;
        self.with_remote(kind, external_id, |state| {
            state
                .resource
                .attributes
                .insert("auto_renew".to_string(), Value::Bool(enabled));
        })
    }

    async fn list_security_rules(&self, external_id: &str) -> Result<Vec<Value>, TaskError> {
        self.record("list_security_rules", external_id).await?;
        Ok(self
            .rules
            .get(external_id)
            .map(|r| r.clone())
            .unwrap_or_default())
    }

    async fn associate_eip(
        &self,
        eip_external_id: &str,
        _instance_kind: &str,
        instance_external_id: &str,
    ) -> Result<(), TaskError> {
        self.record("associate_eip", eip_external_id).await?;
        if let Some(mut state) = self
            .remotes
            .get_mut(&("eip".to_string(), eip_external_id.to_string()))
        {
            state.resource.attributes.insert(
                "associate_id".to_string(),
                Value::from(instance_external_id),
            );
        }
        Ok(())
    }
}

/// One request seen by [`MockHostAgent`].
#[derive(Debug, Clone, PartialEq)]
pub struct AgentPost {
    /// Target URL.
    pub url: String,
    /// Task request header.
    pub header: BTreeMap<String, String>,
    /// Request body.
    pub body: Value,
}

/// In-process host agent with scripted replies.
pub struct MockHostAgent {
    replies: DashMap<String, Result<AgentReply, TaskError>>,
    failures: DashMap<String, TaskError>,
    posts: Mutex<Vec<AgentPost>>,
    playbook_walk: Mutex<VecDeque<String>>,
    playbooks: Mutex<Vec<String>>,
    next_id: AtomicUsize,
    forwards_opened: AtomicUsize,
    forwards_closed: AtomicUsize,
}

impl Default for MockHostAgent {
    fn default() -> Self {
        Self {
            replies: DashMap::new(),
            failures: DashMap::new(),
            posts: Mutex::new(Vec::new()),
            playbook_walk: Mutex::new(VecDeque::from([
                "running".to_string(),
                "succeeded".to_string(),
            ])),
            playbooks: Mutex::new(Vec::new()),
            next_id: AtomicUsize::new(1),
            forwards_opened: AtomicUsize::new(0),
            forwards_closed: AtomicUsize::new(0),
        }
    }
}

impl std::fmt::Debug for MockHostAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockHostAgent")
            .field("replies", &self.replies.len())
            .field("open_forwards", &self.open_forwards())
            .finish()
    }
}

impl MockHostAgent {
    /// Agent accepting every request.
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer posts whose URL contains `fragment` with `reply`.
    pub fn reply_on(&self, fragment: &str, reply: AgentReply) {
        self.replies.insert(fragment.to_string(), Ok(reply));
    }

    /// Fail posts whose URL contains `fragment`.
    pub fn fail_post(&self, fragment: &str, err: TaskError) {
        self.replies.insert(fragment.to_string(), Err(err));
    }

    /// Fail `open_forward`, `close_forward` or `run_playbook`.
    pub fn fail_on(&self, op: &str, err: TaskError) {
        self.failures.insert(op.to_string(), err);
    }

    /// Status walk reported for the next playbooks; the last step sticks.
    pub async fn script_playbook(&self, walk: &[&str]) {
        *self.playbook_walk.lock().await = walk.iter().map(|s| s.to_string()).collect();
    }

    /// Requests seen so far.
    pub async fn posts(&self) -> Vec<AgentPost> {
        self.posts.lock().await.clone()
    }

    /// Playbook names started so far.
    pub async fn playbooks(&self) -> Vec<String> {
        self.playbooks.lock().await.clone()
    }

    /// Forwards opened and not closed.
    pub fn open_forwards(&self) -> usize {
        self.forwards_opened.load(Ordering::SeqCst) - self.forwards_closed.load(Ordering::SeqCst)
    }

    /// Forwards opened in total.
    pub fn forwards_opened(&self) -> usize {
        self.forwards_opened.load(Ordering::SeqCst)
    }

    fn failure(&self, op: &str) -> Result<(), TaskError> {
        match self.failures.get(op) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl HostAgent for MockHostAgent {
    async fn post(
        &self,
        url: &str,
        header: &BTreeMap<String, String>,
        body: &Value,
    ) -> Result<AgentReply, TaskError> {
        self.posts.lock().await.push(AgentPost {
            url: url.to_string(),
            header: header.clone(),
            body: body.clone(),
        });
        let reply = self
            .replies
            .iter()
            .find(|entry| url.contains(entry.key().as_str()))
            .map(|entry| entry.value().clone());
        debug!(url, scripted = reply.is_some(), "Mock agent post");
        reply.unwrap_or(Ok(AgentReply::Accepted))
    }

    async fn open_forward(
        &self,
        manager_url: &str,
        guest_id: &str,
        port: u16,
    ) -> Result<Forward, TaskError> {
        self.failure("open_forward")?;
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.forwards_opened.fetch_add(1, Ordering::SeqCst);
        debug!(manager_url, guest_id, port, "Mock agent opened forward");
        Ok(Forward {
            id: format!("fwd-{}", n),
            address: "127.0.0.1".to_string(),
            port: 40000 + n as u16,
        })
    }

    async fn close_forward(&self, _manager_url: &str, _forward: &Forward) -> Result<(), TaskError> {
        self.failure("close_forward")?;
        self.forwards_closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn run_playbook(&self, _forward: &Forward, playbook: &str) -> Result<String, TaskError> {
        self.failure("run_playbook")?;
        self.playbooks.lock().await.push(playbook.to_string());
        Ok(format!("pb-{}", self.next_id.fetch_add(1, Ordering::SeqCst)))
    }

    async fn playbook_status(&self, _playbook_id: &str) -> Result<String, TaskError> {
        let mut walk = self.playbook_walk.lock().await;
        let status = if walk.len() > 1 {
            walk.pop_front()
        } else {
            walk.front().cloned()
        };
        Ok(status.unwrap_or_else(|| "unknown".to_string()))
    }
}
