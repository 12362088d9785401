//! Tower Siege server: run control endpoints and the live event stream.

use std::net::SocketAddr;
use std::sync::Arc;

use siege_core::{
    BattleConfig, BattleLedger, EventBus, LedgerSink, OverlayNetwork, ProviderRegistry,
    RunController, SandboxLifecycleManager, SandboxProvisioner, StreamGateway,
};

mod http;

pub use http::app_router;

/// Shared handles for the request handlers. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub controller: RunController,
    pub gateway: StreamGateway,
}

impl AppState {
    pub fn new(controller: RunController, gateway: StreamGateway) -> Self {
        Self {
            controller,
            gateway,
        }
    }

    /// Wire a controller and gateway around one ledger and one event bus.
    pub fn assemble(
        ledger: Arc<dyn BattleLedger>,
        provisioner: Arc<dyn SandboxProvisioner>,
        overlay: Arc<dyn OverlayNetwork>,
        providers: ProviderRegistry,
        config: BattleConfig,
    ) -> Self {
        let bus = EventBus::new();
        let sink = Arc::new(LedgerSink::new(ledger.clone(), bus.clone()));
        let sandboxes = Arc::new(SandboxLifecycleManager::new(
            provisioner,
            overlay,
            config.clone(),
        ));
        let gateway = StreamGateway::new(ledger.clone(), bus, &config);
        let controller = RunController::new(ledger, sink, sandboxes, Arc::new(providers), config);
        Self::new(controller, gateway)
    }
}

/// Serve until ctrl-c. Running battles are stopped and torn down before the
/// listener closes, so open event streams end with their `battle:end`.
pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let controller = state.controller.clone();
    let app = app_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("sieged listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if tokio::signal::ctrl_c().await.is_err() {
                futures::future::pending::<()>().await;
            }
            tracing::info!("shutdown requested, stopping running battles");
            controller.stop_all().await;
        })
        .await?;
    Ok(())
}
