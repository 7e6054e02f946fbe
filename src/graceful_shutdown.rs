//! Graceful shutdown coordinator: a broadcast signal, a registry of async
//! shutdown hooks with a timeout bound, and a final flush step for the
//! persistent cache's `sled` writes.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, broadcast};
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::responder::ResponderContext;

pub struct GracefulShutdown {
    shutdown_tx: broadcast::Sender<()>,
    components: Arc<Mutex<Vec<ShutdownComponent>>>,
    ctx: Arc<ResponderContext>,
}

type ShutdownResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;
type ShutdownFn = Box<dyn Fn() -> tokio::task::JoinHandle<ShutdownResult> + Send + Sync>;

struct ShutdownComponent {
    name: String,
    shutdown_fn: ShutdownFn,
}

impl GracefulShutdown {
    pub fn new(ctx: Arc<ResponderContext>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            shutdown_tx,
            components: Arc::new(Mutex::new(Vec::new())),
            ctx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    pub async fn register_component<F, Fut>(&self, name: String, shutdown_fn: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ShutdownResult> + Send + 'static,
    {
        let component = ShutdownComponent {
            name,
            shutdown_fn: Box::new(move || {
                let fut = shutdown_fn();
                tokio::spawn(fut)
            }),
        };
        self.components.lock().await.push(component);
    }

    pub async fn shutdown(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        info!("initiating graceful shutdown");

        if let Err(e) = self.shutdown_tx.send(()) {
            warn!(error = %e, "failed to send shutdown signal");
        }

        info!("waiting for in-flight requests to complete");
        tokio::time::sleep(Duration::from_millis(500)).await;

        let components = self.components.lock().await;
        let mut handles = Vec::new();
        for component in components.iter() {
            info!(component = %component.name, "shutting down component");
            let handle = (component.shutdown_fn)();
            handles.push((component.name.clone(), handle));
        }
        drop(components);

        for (name, handle) in handles {
            match timeout(Duration::from_secs(5), handle).await {
                Ok(Ok(Ok(()))) => info!(component = %name, "component shut down"),
                Ok(Ok(Err(e))) => error!(component = %name, error = %e, "component shutdown failed"),
                Ok(Err(e)) => error!(component = %name, error = %e, "component shutdown task panicked"),
                Err(_) => warn!(component = %name, "component shutdown timed out"),
            }
        }

        info!("flushing persistent cache before shutdown");
        if let Err(e) = self.ctx.sysdb.flush() {
            error!(error = %e, "failed to flush persistent cache during shutdown");
        }

        info!("graceful shutdown completed");
        Ok(())
    }
}
