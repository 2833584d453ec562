use anyhow::Result;
use clap::Parser;

mod args;
mod ingest;
mod pipeline;
mod policy;
mod rbac;
mod report;
mod sources;
mod util;

use args::Args;

#[tokio::main]
async fn main() -> Result<()> {
    leastpriv_common::init();

    let args = Args::parse();
    let shutdown = leastpriv_common::shutdown::cancel_on_shutdown();
    util::metrics::maybe_spawn_metrics_server(&shutdown);

    let client = kube::Client::try_default().await?;
    sources::reconcile::run(client, args, shutdown).await?;
    Ok(())
}
