//! Worker process for `ocr` jobs.

use handbook_core::JobKind;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    handbook_worker::run_worker(JobKind::Ocr).await
}
