use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;
use taskweave::{config::Config, pipeline::StubPipeline, routes::routes, service::TaskService};

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  let config = Config::from_env();
  let port = config.server_port;
  let service = TaskService::from_config(config, Arc::new(StubPipeline::default()))
    .await
    .expect("Failed to open task store");

  info!(port, "taskweave api listening");
  warp::serve(routes(service))
    .run(([0, 0, 0, 0], port))
    .await;
}
