use metrics_agent::bootstrap::{init_registry, start_agent};
use metrics_agent::config::{
    Configuration, get_config_base_path, print_config, should_print_config_and_exit,
};
use metrics_agent::logging::setup_logging;
use metrics_agent::metrics::factory::MetricFactory;
use metrics_agent::server::start_server;
use metrics_agent::server::state::AppState;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let configuration = Configuration::load(get_config_base_path(std::env::args())?)?;
    if should_print_config_and_exit(std::env::args()) {
        print_config(&configuration)?;
        return Ok(());
    }

    configuration.validate()?;

    let _guard = setup_logging(&configuration.log)?;
    tracing::info!("Starting metrics agent");

    let registry = prometheus::Registry::new();
    let factory = MetricFactory::new(registry.clone());
    let shutdown = CancellationToken::new();

    let collectors = init_registry(&configuration.monitor, &factory)?;
    let agent = match start_agent(
        collectors,
        &configuration.monitor.collectors,
        &factory,
        &shutdown,
    )
    .await
    {
        Ok(agent) => agent,
        Err(error) => {
            tracing::error!(?error, "Failed to start the agent");
            return Err(error.into());
        }
    };

    let state = AppState {
        configuration: Arc::new(configuration),
        registry,
    };

    let result = start_server(state, shutdown.clone()).await;
    shutdown.cancel();

    if let Err(error) = agent.shutdown().await {
        tracing::error!(?error, "Failed to close the collectors");
    }

    result?;
    tracing::info!("Bye!");

    Ok(())
}
