//! Task commands, through the control-plane API.

use anyhow::Result;
use clap::{Args, Subcommand};
use cloudagent_control_plane::{
    scheduler::{CancelOutcome, ScheduleOutcome},
    store::{NewTask, Priority, TaskRecord, TaskStatus},
};
use cloudagent_id::{AgentId, TaskId};
use cloudagent_wire::{options::DEFAULT_MAX_TURNS, options::DEFAULT_TIMEOUT_MS, AllowedTool, RunOptions};
use serde::{Deserialize, Serialize};
use tabled::Tabled;

use crate::error::CliError;
use crate::output::{
    display_option, print_info, print_output, print_single, print_success, print_warning,
    OutputFormat,
};

use super::CommandContext;

#[derive(Debug, Args)]
pub struct TaskCommand {
    #[command(subcommand)]
    command: TaskSubcommand,
}

#[derive(Debug, Subcommand)]
enum TaskSubcommand {
    /// Submit a task and wait until it is placed on a machine or fails.
    Submit(NewTaskArgs),

    /// Queue a task for the dispatch worker.
    Enqueue(NewTaskArgs),

    /// Show a task.
    Status(TaskIdArgs),

    /// List tasks in queue order.
    List(ListTasksArgs),

    /// Cancel a queued or running task.
    Cancel(TaskIdArgs),
}

#[derive(Debug, Args)]
struct NewTaskArgs {
    /// What the task should do.
    instructions: String,

    /// Maximum agent turns (1-20).
    #[arg(long)]
    max_turns: Option<u32>,

    /// Execution timeout in milliseconds (60000-1200000).
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Tool the engine may use. Repeat for several.
    #[arg(long = "tool")]
    tools: Vec<AllowedTool>,

    /// low, normal, high or urgent.
    #[arg(long)]
    priority: Option<Priority>,

    /// Agent to run the task under.
    #[arg(long)]
    agent: Option<AgentId>,
}

impl NewTaskArgs {
    fn into_new_task(self) -> NewTask {
        let options = (self.max_turns.is_some()
            || self.timeout_ms.is_some()
            || !self.tools.is_empty())
        .then(|| RunOptions {
            max_turns: self.max_turns.unwrap_or(DEFAULT_MAX_TURNS),
            timeout_ms: self.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS),
            allowed_tools: if self.tools.is_empty() {
                RunOptions::default().allowed_tools
            } else {
                self.tools
            },
        });

        NewTask {
            instructions: self.instructions,
            options,
            priority: self.priority.unwrap_or_default(),
            agent_id: self.agent,
            max_retries: None,
        }
    }
}

#[derive(Debug, Args)]
struct TaskIdArgs {
    /// Task ID (tsk_...).
    task: TaskId,
}

#[derive(Debug, Args)]
struct ListTasksArgs {
    /// queued, running, completed, failed or cancelled.
    #[arg(long)]
    status: Option<TaskStatus>,

    #[arg(long, default_value = "50")]
    limit: usize,

    #[arg(long, default_value = "0")]
    offset: usize,
}

impl TaskCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        match self.command {
            TaskSubcommand::Submit(args) => submit(ctx, args).await,
            TaskSubcommand::Enqueue(args) => enqueue(ctx, args).await,
            TaskSubcommand::Status(args) => status(ctx, args).await,
            TaskSubcommand::List(args) => list(ctx, args).await,
            TaskSubcommand::Cancel(args) => cancel(ctx, args).await,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SubmitTaskResponse {
    task: TaskRecord,
    outcome: ScheduleOutcome,
}

#[derive(Debug, Serialize, Deserialize)]
struct ListTasksResponse {
    tasks: Vec<TaskRecord>,
    total: usize,
    limit: usize,
    offset: usize,
}

#[derive(Debug, Clone, Serialize, Tabled)]
struct TaskRow {
    #[tabled(rename = "ID")]
    id: String,

    #[tabled(rename = "Status")]
    status: String,

    #[tabled(rename = "Priority")]
    priority: String,

    #[tabled(rename = "Machine", display = "display_option")]
    machine: Option<String>,

    #[tabled(rename = "Created")]
    created_at: String,

    #[tabled(rename = "Error", display = "display_option")]
    error: Option<String>,
}

impl From<&TaskRecord> for TaskRow {
    fn from(t: &TaskRecord) -> Self {
        Self {
            id: t.id.to_string(),
            status: t.status.to_string(),
            priority: t.priority.to_string(),
            machine: t.machine_id.clone(),
            created_at: t.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            error: t.error.clone(),
        }
    }
}

fn describe(outcome: &ScheduleOutcome) -> String {
    match outcome {
        ScheduleOutcome::Placed {
            machine_name,
            attempts,
            ..
        } => format!("placed on {machine_name} after {attempts} attempt(s)"),
        ScheduleOutcome::NoMachines => "no schedulable machines".to_string(),
        ScheduleOutcome::Exhausted {
            attempts,
            elapsed_secs,
        } => format!("gave up after {attempts} attempts over {elapsed_secs}s"),
        ScheduleOutcome::Cancelled => "cancelled during scheduling".to_string(),
        ScheduleOutcome::AlreadyClaimed => "already being scheduled".to_string(),
        ScheduleOutcome::NotQueued { status } => format!("not queued ({status})"),
    }
}

fn task_not_found(id: &TaskId) -> impl FnOnce(CliError) -> CliError + '_ {
    move |e| match e {
        CliError::Api { status: 404, .. } => CliError::NotFound(format!("Task '{id}' not found")),
        other => other,
    }
}

async fn submit(ctx: CommandContext, args: NewTaskArgs) -> Result<()> {
    let client = ctx.client()?;
    let response: SubmitTaskResponse = client.post("/v1/tasks", &args.into_new_task()).await?;

    match ctx.format {
        OutputFormat::Table => {
            let message = format!("Task {} {}", response.task.id, describe(&response.outcome));
            if response.outcome.is_placed() {
                print_success(&message);
                print_info(&format!("Follow it with `ca task status {}`", response.task.id));
            } else {
                print_warning(&message);
            }
        }
        OutputFormat::Json => print_single(&response),
    }
    Ok(())
}

async fn enqueue(ctx: CommandContext, args: NewTaskArgs) -> Result<()> {
    let client = ctx.client()?;
    let task: TaskRecord = client
        .post("/v1/tasks/enqueue", &args.into_new_task())
        .await?;

    match ctx.format {
        OutputFormat::Table => print_success(&format!("Task {} queued ({})", task.id, task.priority)),
        OutputFormat::Json => print_single(&task),
    }
    Ok(())
}

async fn status(ctx: CommandContext, args: TaskIdArgs) -> Result<()> {
    let client = ctx.client()?;
    let task: TaskRecord = client
        .get(&format!("/v1/tasks/{}", args.task))
        .await
        .map_err(task_not_found(&args.task))?;

    match ctx.format {
        OutputFormat::Table => print_output(&[TaskRow::from(&task)], ctx.format),
        OutputFormat::Json => print_single(&task),
    }
    Ok(())
}

async fn list(ctx: CommandContext, args: ListTasksArgs) -> Result<()> {
    let client = ctx.client()?;

    let mut path = format!("/v1/tasks?limit={}&offset={}", args.limit, args.offset);
    if let Some(status) = args.status {
        path.push_str(&format!("&status={status}"));
    }
    let response: ListTasksResponse = client.get(&path).await?;

    match ctx.format {
        OutputFormat::Table => {
            let rows: Vec<TaskRow> = response.tasks.iter().map(TaskRow::from).collect();
            print_output(&rows, ctx.format);
            if response.offset + response.tasks.len() < response.total {
                print_info(&format!(
                    "Showing {} of {} tasks. Use --offset to page.",
                    response.tasks.len(),
                    response.total
                ));
            }
        }
        OutputFormat::Json => print_single(&response),
    }
    Ok(())
}

async fn cancel(ctx: CommandContext, args: TaskIdArgs) -> Result<()> {
    let client = ctx.client()?;
    let outcome: CancelOutcome = client
        .post(
            &format!("/v1/tasks/{}/cancel", args.task),
            &serde_json::json!({}),
        )
        .await
        .map_err(task_not_found(&args.task))?;

    match ctx.format {
        OutputFormat::Table if outcome.previous_status == outcome.current_status => {
            print_info(&format!("Task {} was already cancelled", outcome.task_id))
        }
        OutputFormat::Table => print_success(&format!(
            "Task {} cancelled (was {})",
            outcome.task_id, outcome.previous_status
        )),
        OutputFormat::Json => print_single(&outcome),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(instructions: &str) -> NewTaskArgs {
        NewTaskArgs {
            instructions: instructions.to_string(),
            max_turns: None,
            timeout_ms: None,
            tools: Vec::new(),
            priority: None,
            agent: None,
        }
    }

    #[test]
    fn test_no_flags_means_server_defaults() {
        let task = args("hello").into_new_task();
        assert_eq!(task.options, None);
        assert_eq!(task.priority, Priority::Normal);
    }

    #[test]
    fn test_flags_fill_remaining_defaults() {
        let task = NewTaskArgs {
            max_turns: Some(7),
            tools: vec![AllowedTool::Edit],
            priority: Some(Priority::Urgent),
            ..args("edit it")
        }
        .into_new_task();

        let options = task.options.unwrap();
        assert_eq!(options.max_turns, 7);
        assert_eq!(options.timeout_ms, DEFAULT_TIMEOUT_MS);
        assert_eq!(options.allowed_tools, vec![AllowedTool::Edit]);
        assert_eq!(task.priority, Priority::Urgent);
    }

    #[test]
    fn test_describe_outcomes() {
        let placed = ScheduleOutcome::Placed {
            machine_id: "1".to_string(),
            machine_name: "worker-1".to_string(),
            attempts: 2,
        };
        assert_eq!(describe(&placed), "placed on worker-1 after 2 attempt(s)");
        assert_eq!(
            describe(&ScheduleOutcome::Exhausted {
                attempts: 61,
                elapsed_secs: 300
            }),
            "gave up after 61 attempts over 300s"
        );
    }

    #[test]
    fn test_not_found_mapping() {
        let id = TaskId::new();
        let mapped = task_not_found(&id)(CliError::api(404, "task_not_found", "gone"));
        assert!(matches!(mapped, CliError::NotFound(_)));
        let kept = task_not_found(&id)(CliError::api(409, "invalid_transition", "done"));
        assert!(matches!(kept, CliError::Api { status: 409, .. }));
    }
}
