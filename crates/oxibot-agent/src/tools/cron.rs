//! Cron tool — lets the agent manage its own scheduled jobs.
//!
//! Wraps `oxibot_cron::CronService`. Registered only in the main agent's
//! registry — sub-agents run with an isolated registry and never see it.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use oxibot_cron::types::{CronJob, CronPayload, CronSchedule, PayloadKind, ScheduleKind};
use oxibot_cron::CronService;

use super::base::{optional_bool, optional_i64, optional_string, require_string, Tool};
use super::message::{DEFAULT_CHANNEL_KEY, DEFAULT_CHAT_ID_KEY};

/// Manage scheduled jobs: add, list, remove.
///
/// Receives the conversation's default channel/chat_id as explicit reserved
/// parameters on every call (see `message::default_context_params`), used
/// as the delivery target for a new job when the call omits them.
pub struct CronTool {
    service: Arc<CronService>,
}

impl CronTool {
    pub fn new(service: Arc<CronService>) -> Self {
        Self { service }
    }

    async fn do_add(&self, params: &HashMap<String, Value>) -> anyhow::Result<String> {
        let name = require_string(params, "name")?;
        let message = require_string(params, "message")?;

        let every_seconds = optional_i64(params, "every_seconds");
        let cron_expr = optional_string(params, "cron_expr");
        let at_ms = optional_i64(params, "at_ms");

        let schedule = if let Some(secs) = every_seconds {
            CronSchedule::every(secs * 1000)
        } else if let Some(expr) = cron_expr {
            CronSchedule::cron(expr)
        } else if let Some(ms) = at_ms {
            CronSchedule::at(ms)
        } else {
            anyhow::bail!(
                "Must specify one of: every_seconds, cron_expr, or at_ms"
            );
        };

        let deliver = optional_bool(params, "deliver");
        let channel = optional_string(params, "channel")
            .or_else(|| optional_string(params, DEFAULT_CHANNEL_KEY));
        let chat_id = optional_string(params, "chat_id")
            .or_else(|| optional_string(params, DEFAULT_CHAT_ID_KEY));
        let system_event = optional_bool(params, "system_event");

        let payload = CronPayload {
            message,
            deliver,
            channel,
            to: chat_id.clone(),
            chat_id,
            kind: if system_event {
                PayloadKind::SystemEvent
            } else {
                PayloadKind::AgentTurn
            },
        };

        let job = CronJob::new(name, schedule, payload);
        let id = self.service.add_job(job).await?;
        Ok(format!("Added job {id}."))
    }

    async fn do_list(&self, params: &HashMap<String, Value>) -> String {
        let include_disabled = optional_bool(params, "include_disabled");
        let jobs = self.service.list_jobs(include_disabled).await;
        if jobs.is_empty() {
            return "No scheduled jobs.".into();
        }
        let lines: Vec<String> = jobs.iter().map(describe_job).collect();
        lines.join("\n")
    }

    async fn do_remove(&self, params: &HashMap<String, Value>) -> anyhow::Result<String> {
        let job_id = require_string(params, "job_id")?;
        let removed = self.service.remove_job(&job_id).await?;
        if removed {
            Ok(format!("Removed job {job_id}."))
        } else {
            Ok(format!("No job found with id {job_id}."))
        }
    }
}

fn describe_job(job: &CronJob) -> String {
    let schedule = match job.schedule.kind {
        ScheduleKind::At => format!("at {}", job.schedule.at_ms.unwrap_or_default()),
        ScheduleKind::Every => format!("every {}ms", job.schedule.every_ms.unwrap_or_default()),
        ScheduleKind::Cron => format!("cron '{}'", job.schedule.expr.as_deref().unwrap_or("")),
    };
    let status = if job.enabled { "enabled" } else { "disabled" };
    format!(
        "{} ({}) — {} — {} — \"{}\"",
        job.name, job.id, status, schedule, job.payload.message
    )
}

#[async_trait]
impl Tool for CronTool {
    fn name(&self) -> &str {
        "cron"
    }

    fn description(&self) -> &str {
        "Manage scheduled jobs that send a prompt to the agent on a timer. \
         Actions: 'add' (create a job), 'list' (show jobs), 'remove' (delete a job by id)."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "action": {
                    "type": "string",
                    "enum": ["add", "list", "remove"],
                    "description": "Which operation to perform"
                },
                "name": {
                    "type": "string",
                    "description": "Job name (required for 'add')"
                },
                "message": {
                    "type": "string",
                    "description": "Prompt sent to the agent when the job fires (required for 'add')"
                },
                "every_seconds": {
                    "type": "integer",
                    "description": "Interval schedule: fire every N seconds"
                },
                "cron_expr": {
                    "type": "string",
                    "description": "Cron-expression schedule, e.g. '0 9 * * *'"
                },
                "at_ms": {
                    "type": "integer",
                    "description": "One-shot schedule: fire at this Unix epoch millisecond timestamp"
                },
                "deliver": {
                    "type": "boolean",
                    "description": "Deliver the agent's response to a channel"
                },
                "channel": {
                    "type": "string",
                    "description": "Target channel name for delivery"
                },
                "chat_id": {
                    "type": "string",
                    "description": "Target chat id for delivery"
                },
                "system_event": {
                    "type": "boolean",
                    "description": "Deliver as a system event instead of a normal agent turn"
                },
                "job_id": {
                    "type": "string",
                    "description": "Job id (required for 'remove')"
                },
                "include_disabled": {
                    "type": "boolean",
                    "description": "Include disabled jobs in 'list' output"
                }
            },
            "required": ["action"]
        })
    }

    async fn execute(&self, params: HashMap<String, Value>) -> anyhow::Result<String> {
        let action = require_string(&params, "action")?;
        match action.as_str() {
            "add" => self.do_add(&params).await,
            "list" => Ok(self.do_list(&params).await),
            "remove" => self.do_remove(&params).await,
            other => Ok(format!("Error: unknown action '{other}'. Use add, list, or remove.")),
        }
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::message::default_context_params;
    use oxibot_core::bus::queue::MessageBus;

    fn make_tool() -> CronTool {
        let bus = Arc::new(MessageBus::new(10));
        let service = Arc::new(CronService::new(bus, None));
        CronTool::new(service)
    }

    fn params(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[tokio::test]
    async fn test_add_requires_schedule() {
        let tool = make_tool();
        let result = tool
            .execute(params(&[
                ("action", json!("add")),
                ("name", json!("reminder")),
                ("message", json!("hi")),
            ]))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_add_list_remove_roundtrip() {
        let tool = make_tool();
        let added = tool
            .execute(params(&[
                ("action", json!("add")),
                ("name", json!("reminder")),
                ("message", json!("hi")),
                ("every_seconds", json!(60)),
            ]))
            .await
            .unwrap();
        assert!(added.starts_with("Added job "));
        let id = added.trim_start_matches("Added job ").trim_end_matches('.').to_string();

        let listed = tool
            .execute(params(&[("action", json!("list"))]))
            .await
            .unwrap();
        assert!(listed.contains("reminder"));
        assert!(listed.contains(&id));

        let removed = tool
            .execute(params(&[("action", json!("remove")), ("job_id", json!(id.clone()))]))
            .await
            .unwrap();
        assert!(removed.contains("Removed job"));

        let listed_again = tool
            .execute(params(&[("action", json!("list"))]))
            .await
            .unwrap();
        assert_eq!(listed_again, "No scheduled jobs.");
    }

    #[tokio::test]
    async fn test_list_empty() {
        let tool = make_tool();
        let result = tool.execute(params(&[("action", json!("list"))])).await.unwrap();
        assert_eq!(result, "No scheduled jobs.");
    }

    #[tokio::test]
    async fn test_remove_missing_job() {
        let tool = make_tool();
        let result = tool
            .execute(params(&[("action", json!("remove")), ("job_id", json!("doesnotexist"))]))
            .await
            .unwrap();
        assert!(result.contains("No job found"));
    }

    #[tokio::test]
    async fn test_unknown_action() {
        let tool = make_tool();
        let result = tool
            .execute(params(&[("action", json!("bogus"))]))
            .await
            .unwrap();
        assert!(result.contains("unknown action"));
    }

    #[tokio::test]
    async fn test_default_context_sets_delivery_target() {
        let tool = make_tool();
        let mut call = default_context_params("telegram", "chat_42");
        call.extend(params(&[
            ("action", json!("add")),
            ("name", json!("reminder")),
            ("message", json!("hi")),
            ("every_seconds", json!(60)),
            ("deliver", json!(true)),
        ]));
        let added = tool.execute(call).await.unwrap();
        assert!(added.starts_with("Added job "));
    }

    #[test]
    fn test_definition() {
        let tool = make_tool();
        let def = tool.to_definition();
        assert_eq!(def.function.name, "cron");
    }
}
