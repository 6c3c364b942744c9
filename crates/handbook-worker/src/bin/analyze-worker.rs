//! Worker process for `analyze` jobs.

use handbook_core::JobKind;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    handbook_worker::run_worker(JobKind::Analyze).await
}
