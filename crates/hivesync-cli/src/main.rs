//! HiveSync CLI - operator tooling that works directly on a shared store.

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use hivesync_core::{NewTask, Recipient, Snapshot, Task, TaskId, Worker, WorkerId};
use hivesync_engine::config::StoreArgs;
use hivesync_engine::{Coordinator, Reconciler};

/// HiveSync CLI - fleet management tool
#[derive(Parser)]
#[command(name = "hivesync")]
#[command(about = "CLI for a HiveSync store", long_about = None)]
struct Cli {
    #[command(flatten)]
    store: StoreArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new task
    #[command(name = "create-task")]
    CreateTask {
        /// Task title
        title: String,

        #[arg(short, long, default_value = "")]
        description: String,

        /// Lower is more urgent
        #[arg(short, long, default_value = "5")]
        priority: u32,

        /// Explicit task ID
        #[arg(long)]
        id: Option<String>,

        /// Task that must complete first (repeatable)
        #[arg(long = "depends-on")]
        dependencies: Vec<String>,

        /// Resource key to lock while running (repeatable)
        #[arg(long = "resource", short = 'r')]
        resources: Vec<String>,

        /// Capability tag wanted of the worker (repeatable)
        #[arg(long = "capability")]
        capabilities: Vec<String>,
    },

    /// Show one task
    #[command(name = "get-task")]
    GetTask {
        /// Task ID
        id: String,
    },

    /// List all tasks
    #[command(name = "list-tasks")]
    ListTasks,

    /// List registered workers
    #[command(name = "list-workers")]
    ListWorkers,

    /// List held resource locks
    #[command(name = "list-locks")]
    ListLocks,

    /// Print the full fleet snapshot as JSON
    Snapshot,

    /// Send a message to a worker or to "broadcast"
    Send {
        /// Recipient worker ID or "broadcast"
        to: String,

        /// Message type
        #[arg(short = 't', long = "type")]
        kind: String,

        /// JSON payload
        #[arg(long, default_value = "null")]
        payload: String,

        #[arg(long, default_value = "operator")]
        from: String,

        #[arg(long)]
        priority: Option<u32>,
    },

    /// Show recent messages, delivered or not
    Messages {
        /// Number of messages to show
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: usize,
    },

    /// Put a FAILED or stuck task back in the queue
    #[command(name = "retry-task")]
    RetryTask {
        /// Task ID
        id: String,
    },

    /// Run one reconciliation pass
    Tick,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("hivesync=warn".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let config = cli.store.load()?;
    let coord = Coordinator::builder().config(config).build()?;

    match cli.command {
        Commands::CreateTask {
            title,
            description,
            priority,
            id,
            dependencies,
            resources,
            capabilities,
        } => {
            let mut req = NewTask::new(title)
                .with_description(description)
                .with_priority(priority)
                .created_by("cli");
            if let Some(id) = id {
                req = req.with_id(id);
            }
            for dep in dependencies {
                req = req.with_dependency(dep);
            }
            for resource in resources {
                req = req.with_resource(resource);
            }
            for cap in &capabilities {
                req = req.with_capability(cap);
            }
            let task = coord.create_task_with(req).await?;
            println!("Task created:");
            print_task(&task);
        }
        Commands::GetTask { id } => {
            let id = TaskId::new(id);
            match coord.tasks().get(&id).await? {
                Some(task) => print_task(&task),
                None => return Err(format!("unknown task: {id}").into()),
            }
        }
        Commands::ListTasks => {
            let mut tasks = coord.tasks().list().await?;
            tasks.sort_by(|a, b| {
                a.priority
                    .cmp(&b.priority)
                    .then_with(|| a.created_at.cmp(&b.created_at))
            });
            print_tasks(&tasks);
        }
        Commands::ListWorkers => {
            let workers = coord.registry().list().await?;
            print_workers(&workers);
        }
        Commands::ListLocks => {
            let locks = coord.locks().list().await?;
            println!("Locks ({}):", locks.len());
            println!("{:<32}  {:<24}  {}", "RESOURCE", "HOLDER", "LOCKED AT");
            println!("{}", "-".repeat(80));
            for lock in locks {
                println!(
                    "{:<32}  {:<24}  {}",
                    lock.resource_key,
                    lock.holder,
                    format_timestamp(&lock.locked_at)
                );
            }
        }
        Commands::Snapshot => {
            let snapshot: Snapshot = coord.get_snapshot().await?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
        Commands::Send {
            to,
            kind,
            payload,
            from,
            priority,
        } => {
            let payload: serde_json::Value = serde_json::from_str(&payload)?;
            let id = coord
                .send_message(&from, Recipient::from(to), &kind, payload, priority)
                .await?;
            println!("Message sent: {id}");
        }
        Commands::Messages { limit } => {
            let messages = coord.message_history(limit).await?;
            println!("Messages ({}):", messages.len());
            println!(
                "{:<20}  {:<16}  {:<16}  {:<16}  {}",
                "CREATED", "FROM", "TO", "TYPE", "DELIVERED"
            );
            println!("{}", "-".repeat(90));
            for m in messages {
                println!(
                    "{:<20}  {:<16}  {:<16}  {:<16}  {}",
                    format_timestamp(&m.created_at),
                    m.from,
                    m.to.to_string(),
                    m.kind,
                    m.delivered_to.len()
                );
            }
        }
        Commands::RetryTask { id } => {
            if coord.retry_task(&TaskId::new(&id)).await? {
                println!("Task {id} requeued");
            } else {
                println!("Task {id} is already queued");
            }
        }
        Commands::Tick => {
            let report = Reconciler::new(std::sync::Arc::new(coord)).tick().await;
            println!("Offline workers:  {}", join_ids(report.offline.iter().map(WorkerId::as_str)));
            println!("Unblocked tasks:  {}", join_ids(report.unblocked.iter().map(TaskId::as_str)));
            println!("Requeued tasks:   {}", join_ids(report.requeued.iter().map(TaskId::as_str)));
            println!("Assignments:      {}", report.assigned.len());
            for a in &report.assigned {
                println!("  - {} -> {} (score {:.1})", a.task_id, a.worker_id, a.score);
            }
            println!("Locks collected:  {}", report.locks_collected);
            for failure in &report.failures {
                println!("Step {} failed: {}", failure.step, failure.error);
            }
        }
    }

    Ok(())
}

fn print_task(task: &Task) {
    println!("  ID:         {}", task.id);
    println!("  Title:      {}", task.title);
    println!("  Status:     {}", task.status);
    println!("  Priority:   {}", task.priority);
    println!("  Progress:   {}%", task.progress);
    println!("  Created:    {}", format_timestamp(&task.created_at));
    if let Some(owner) = &task.assigned_to {
        println!("  Assigned:   {owner}");
    }
    if !task.dependencies.is_empty() {
        println!(
            "  Depends on: {}",
            join_ids(task.dependencies.iter().map(TaskId::as_str))
        );
    }
    if !task.resources.is_empty() {
        println!(
            "  Resources:  {}",
            join_ids(task.resources.iter().map(String::as_str))
        );
    }
    if task.retries > 0 {
        println!("  Retries:    {}", task.retries);
    }
    if let Some(err) = &task.last_error {
        println!("  Last error: {err}");
    }
}

fn print_tasks(tasks: &[Task]) {
    println!("Tasks ({}):", tasks.len());
    println!(
        "{:<36}  {:<12}  {:<4}  {:<16}  {}",
        "ID", "STATUS", "PRI", "ASSIGNED", "TITLE"
    );
    println!("{}", "-".repeat(96));
    for task in tasks {
        let owner = task.assigned_to.as_ref().map(WorkerId::as_str).unwrap_or("-");
        println!(
            "{:<36}  {:<12}  {:<4}  {:<16}  {}",
            task.id, task.status, task.priority, owner, task.title
        );
    }
}

fn print_workers(workers: &[Worker]) {
    println!("Workers ({}):", workers.len());
    println!(
        "{:<24}  {:<8}  {:<7}  {:<20}  {}",
        "ID", "STATUS", "SCORE", "LAST HEARTBEAT", "CAPABILITIES"
    );
    println!("{}", "-".repeat(96));
    for worker in workers {
        let caps = join_ids(worker.capabilities.iter().map(|c| c.as_str()));
        println!(
            "{:<24}  {:<8}  {:<7.1}  {:<20}  {}",
            worker.id,
            worker.status,
            worker.performance_score,
            format_timestamp(&worker.last_heartbeat),
            caps
        );
    }
}

fn join_ids<'a>(ids: impl Iterator<Item = &'a str>) -> String {
    let joined: Vec<&str> = ids.collect();
    if joined.is_empty() {
        "-".to_string()
    } else {
        joined.join(", ")
    }
}

fn format_timestamp(at: &chrono::DateTime<chrono::Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S").to_string()
}
