//! HTTP request handlers.

mod events;
mod health;
mod locks;
mod messages;
mod tasks;
mod workers;

pub use events::events;
pub use health::{health_check, metrics_handler, snapshot};
pub use locks::{claim_resources, release_resources};
pub use messages::{message_history, send_message};
pub use tasks::{create_task, get_task, list_tasks, retry_task, update_progress};
pub use workers::{
    assigned_tasks, claim_next_task, deregister_worker, get_messages, heartbeat, list_workers,
    register_worker,
};
