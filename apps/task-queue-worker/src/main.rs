//! Task Queue Worker Service - Entry Point
//!
//! Standalone process serving the distributed task queue over Redis.

#[tokio::main]
async fn main() -> eyre::Result<()> {
    task_queue_worker::run().await
}
