//! Host, rule and task directories.
//!
//! These are the configuration seams of the engine: who the peers are and
//! how to reach them, what each transfer rule allows and where its files
//! live, and which hooks run around a transfer. The engine consumes them
//! through lookup traits; the static implementations here are backed by the
//! TOML configuration.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::record::{GlobalStep, TransferMode, TransferRecord};

/// Authentication and addressing entry for one peer host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostAuth {
    /// Host identifier
    pub host_id: String,
    /// Reachable address (name or IP)
    pub address: String,
    /// TCP port
    pub port: u16,
    /// Whether the connection must be wrapped by the secure transport
    #[serde(default)]
    pub ssl: bool,
    /// Shared-secret proof exchanged in the Authent handshake
    #[serde(default)]
    pub key: String,
}

impl HostAuth {
    /// `address:port` form used by connection providers.
    #[must_use]
    pub fn socket_address(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// Resolve a host id to its authentication entry.
pub trait HostAuthLookup: Send + Sync {
    /// The entry for `host_id`, or `None` when unknown.
    fn resolve(&self, host_id: &str) -> Option<HostAuth>;
}

/// One pre/post/error task to run around a transfer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Task name, resolved by the hook implementation
    pub name: String,
    /// Free-form argument
    #[serde(default)]
    pub argument: String,
}

/// Transfer rule: direction, paths and hooks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    /// Rule identifier
    pub rule_id: String,
    /// Transfer mode this rule mandates
    pub mode: TransferMode,
    /// Where received files land
    pub recv_path: PathBuf,
    /// Where files to send are read from
    pub send_path: PathBuf,
    /// Where finished files are archived
    #[serde(default)]
    pub archive_path: Option<PathBuf>,
    /// Where in-flight files are written before the final rename
    pub work_path: PathBuf,
    /// Tasks before the data phase
    #[serde(default)]
    pub pre_tasks: Vec<TaskSpec>,
    /// Tasks after a successful data phase
    #[serde(default)]
    pub post_tasks: Vec<TaskSpec>,
    /// Tasks after a failure
    #[serde(default)]
    pub error_tasks: Vec<TaskSpec>,
    /// Hosts allowed to use the rule; empty admits every authenticated host
    #[serde(default)]
    pub allowed_hosts: Vec<String>,
}

impl RuleConfig {
    /// Whether `host_id` may use this rule.
    #[must_use]
    pub fn admits(&self, host_id: &str) -> bool {
        self.allowed_hosts.is_empty() || self.allowed_hosts.iter().any(|h| h == host_id)
    }
}

/// Resolve a rule id to its configuration.
pub trait RuleLookup: Send + Sync {
    /// The rule for `rule_id`, or `None` when unknown.
    fn resolve(&self, rule_id: &str) -> Option<RuleConfig>;
}

/// Host directory backed by a fixed map.
#[derive(Debug, Default)]
pub struct StaticHostLookup {
    hosts: HashMap<String, HostAuth>,
}

impl StaticHostLookup {
    /// Build from host entries.
    #[must_use]
    pub fn new(hosts: impl IntoIterator<Item = HostAuth>) -> Self {
        Self {
            hosts: hosts
                .into_iter()
                .map(|h| (h.host_id.clone(), h))
                .collect(),
        }
    }
}

impl HostAuthLookup for StaticHostLookup {
    fn resolve(&self, host_id: &str) -> Option<HostAuth> {
        self.hosts.get(host_id).cloned()
    }
}

/// Rule directory backed by a fixed map.
#[derive(Debug, Default)]
pub struct StaticRuleLookup {
    rules: HashMap<String, RuleConfig>,
}

impl StaticRuleLookup {
    /// Build from rule entries.
    #[must_use]
    pub fn new(rules: impl IntoIterator<Item = RuleConfig>) -> Self {
        Self {
            rules: rules
                .into_iter()
                .map(|r| (r.rule_id.clone(), r))
                .collect(),
        }
    }
}

impl RuleLookup for StaticRuleLookup {
    fn resolve(&self, rule_id: &str) -> Option<RuleConfig> {
        self.rules.get(rule_id).cloned()
    }
}

/// Context handed to task hooks.
#[derive(Debug, Clone)]
pub struct TaskContext {
    /// The record the tasks run for
    pub record: TransferRecord,
    /// Phase the tasks belong to
    pub step: GlobalStep,
    /// Current path of the transferred file
    pub file_path: Option<PathBuf>,
}

/// Execution seam for pre/post/error tasks.
#[async_trait]
pub trait TaskHook: Send + Sync {
    /// Run `tasks` in order; the first failure aborts the list.
    async fn run(&self, tasks: &[TaskSpec], ctx: &TaskContext) -> Result<()>;
}

/// Default hook: records task execution in the log and treats every task as
/// succeeding. Deployments plug their own hook for real side effects.
#[derive(Debug, Default)]
pub struct LogTaskHook;

#[async_trait]
impl TaskHook for LogTaskHook {
    async fn run(&self, tasks: &[TaskSpec], ctx: &TaskContext) -> Result<()> {
        for task in tasks {
            tracing::info!(
                task = %task.name,
                argument = %task.argument,
                step = ?ctx.step,
                transfer = %ctx.record.transfer_id_label(),
                "Running task"
            );
        }
        Ok(())
    }
}

/// Run the task list of a phase through the hook, converting failures into
/// the transfer error carrying the triggering step.
pub async fn run_step_tasks(
    hook: &Arc<dyn TaskHook>,
    tasks: &[TaskSpec],
    ctx: &TaskContext,
) -> Result<()> {
    if tasks.is_empty() {
        return Ok(());
    }
    hook.run(tasks, ctx).await.map_err(|e| match e {
        already @ Error::Task { .. } => already,
        other => Error::Task {
            step: ctx.step,
            reason: other.to_string(),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(allowed: &[&str]) -> RuleConfig {
        RuleConfig {
            rule_id: "backup".into(),
            mode: TransferMode::Send,
            recv_path: PathBuf::from("/tmp/in"),
            send_path: PathBuf::from("/tmp/out"),
            archive_path: None,
            work_path: PathBuf::from("/tmp/work"),
            pre_tasks: Vec::new(),
            post_tasks: Vec::new(),
            error_tasks: Vec::new(),
            allowed_hosts: allowed.iter().map(ToString::to_string).collect(),
        }
    }

    #[test]
    fn test_empty_allowed_hosts_admits_everyone() {
        assert!(rule(&[]).admits("anyone"));
        assert!(rule(&["alpha"]).admits("alpha"));
        assert!(!rule(&["alpha"]).admits("beta"));
    }

    #[test]
    fn test_static_lookups() {
        let hosts = StaticHostLookup::new([HostAuth {
            host_id: "alpha".into(),
            address: "127.0.0.1".into(),
            port: 6566,
            ssl: false,
            key: "secret".into(),
        }]);
        assert_eq!(hosts.resolve("alpha").unwrap().socket_address(), "127.0.0.1:6566");
        assert!(hosts.resolve("missing").is_none());

        let rules = StaticRuleLookup::new([rule(&[])]);
        assert!(rules.resolve("backup").is_some());
        assert!(rules.resolve("missing").is_none());
    }

    #[tokio::test]
    async fn test_task_failures_carry_their_step() {
        struct FailingHook;

        #[async_trait]
        impl TaskHook for FailingHook {
            async fn run(&self, _tasks: &[TaskSpec], _ctx: &TaskContext) -> Result<()> {
                Err(Error::Internal("hook exploded".into()))
            }
        }

        let hook: Arc<dyn TaskHook> = Arc::new(FailingHook);
        let ctx = TaskContext {
            record: TransferRecord::new(
                "backup",
                "a",
                "b",
                TransferMode::Send,
                "f.bin",
                4096,
            ),
            step: GlobalStep::PostTask,
            file_path: None,
        };
        let err = run_step_tasks(
            &hook,
            &[TaskSpec {
                name: "move".into(),
                argument: String::new(),
            }],
            &ctx,
        )
        .await
        .unwrap_err();
        match err {
            Error::Task { step, .. } => assert_eq!(step, GlobalStep::PostTask),
            other => panic!("expected Task error, got {other:?}"),
        }
    }
}
