//! Start/stop control for the proxy server.
//!
//! [`ProxyServer`] owns the only mutable server state: whether a listener is
//! running, and the handles needed to shut it down. Both transitions happen
//! under one mutex.

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::backend::ChatBackend;
use crate::config::Config;
use crate::filter::{FilterError, ModelFilter};
use crate::server::ollama_api::{build_router, AppState};

/// How long to wait for stragglers after streams have been force-closed.
const FORCE_CLOSE_WAIT: Duration = Duration::from_secs(1);

enum ServerState {
    Stopped,
    Running(RunningServer),
}

struct RunningServer {
    addr: SocketAddr,
    /// Stops accepting and starts the graceful drain.
    shutdown: CancellationToken,
    /// Ends in-flight streams once the grace period is over.
    force_close: CancellationToken,
    /// Released by `stop()`; `start()` waits on it.
    stopped: CancellationToken,
    /// Cancelled when the serve task ends, for whatever reason.
    exited: CancellationToken,
    handle: JoinHandle<std::io::Result<()>>,
}

pub struct ProxyServer {
    config: Arc<Config>,
    backend: Arc<dyn ChatBackend>,
    state: Mutex<ServerState>,
}

impl ProxyServer {
    pub fn new(config: Arc<Config>, backend: Arc<dyn ChatBackend>) -> Self {
        Self {
            config,
            backend,
            state: Mutex::new(ServerState::Stopped),
        }
    }

    /// Load the model filter, bind the listener and serve until [`stop`] is
    /// called. Returns immediately if the server is already running.
    ///
    /// [`stop`]: ProxyServer::stop
    pub async fn start(&self) -> anyhow::Result<()> {
        let (stopped, exited) = {
            let mut state = self.state.lock().await;
            if matches!(*state, ServerState::Running(_)) {
                warn!("Server already running");
                return Ok(());
            }

            let running = self.spawn().await?;
            let tokens = (running.stopped.clone(), running.exited.clone());
            *state = ServerState::Running(running);
            tokens
        };

        tokio::select! {
            biased;
            _ = stopped.cancelled() => Ok(()),
            _ = exited.cancelled() => self.reap().await,
        }
    }

    /// Clean up after a serve task that ended without going through `stop()`.
    async fn reap(&self) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        let running = match std::mem::replace(&mut *state, ServerState::Stopped) {
            ServerState::Running(running) if running.exited.is_cancelled() => running,
            // `stop()` got there first, or a new server is already up.
            other => {
                *state = other;
                return Ok(());
            }
        };

        let addr = running.addr;
        running.force_close.cancel();
        running.stopped.cancel();
        match running.handle.await {
            Ok(Ok(())) => {
                warn!(%addr, "Server exited without being stopped");
                Ok(())
            }
            Ok(Err(e)) => {
                error!(%addr, error = %e, "Server exited with an error");
                Err(e).context("server failed")
            }
            Err(e) => Err(e).context("server task failed"),
        }
    }

    async fn spawn(&self) -> anyhow::Result<RunningServer> {
        let filter = load_filter(&self.config.filter.path)?;

        let state = Arc::new(AppState::new(self.backend.clone(), filter));
        let force_close = state.force_close.clone();
        let app = build_router(state);

        let listener = TcpListener::bind(&self.config.server.listen)
            .await
            .with_context(|| format!("failed to bind {}", self.config.server.listen))?;
        let addr = listener.local_addr()?;

        let shutdown = CancellationToken::new();
        let exited = CancellationToken::new();
        let exit_guard = exited.clone().drop_guard();
        let serve = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown.clone().cancelled_owned())
            .into_future();
        let handle = tokio::spawn(async move {
            let _exit_guard = exit_guard;
            serve.await
        });

        info!(%addr, "Server started");

        Ok(RunningServer {
            addr,
            shutdown,
            force_close,
            stopped: CancellationToken::new(),
            exited,
            handle,
        })
    }

    /// Stop accepting connections, give in-flight requests the configured
    /// grace period, then cut off whatever is left. No-op when stopped.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        let ServerState::Running(running) = std::mem::replace(&mut *state, ServerState::Stopped)
        else {
            return;
        };

        let RunningServer {
            addr,
            shutdown,
            force_close,
            stopped,
            mut handle,
            ..
        } = running;

        shutdown.cancel();
        let grace = Duration::from_secs(self.config.server.shutdown_timeout_secs);

        let finished = match tokio::time::timeout(grace, &mut handle).await {
            Ok(result) => Some(result),
            Err(_) => {
                warn!(
                    %addr,
                    grace_secs = grace.as_secs(),
                    "Grace period elapsed, closing open streams"
                );
                force_close.cancel();
                tokio::time::timeout(FORCE_CLOSE_WAIT, &mut handle).await.ok()
            }
        };

        match finished {
            Some(Ok(Ok(()))) => {}
            Some(Ok(Err(e))) => error!(error = %e, "Server shutdown error"),
            Some(Err(e)) => error!(error = %e, "Server task failed"),
            None => {
                warn!(%addr, "Server did not drain in time, aborting");
                handle.abort();
            }
        }

        stopped.cancel();
        info!(%addr, "Server stopped");
    }

    pub async fn is_running(&self) -> bool {
        matches!(*self.state.lock().await, ServerState::Running(_))
    }

    /// Bound address while running. Useful when listening on port 0.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        match &*self.state.lock().await {
            ServerState::Running(running) => Some(running.addr),
            ServerState::Stopped => None,
        }
    }
}

/// A missing filter file means "no filtering"; other errors are fatal.
fn load_filter(path: &std::path::Path) -> Result<ModelFilter, FilterError> {
    match ModelFilter::load(path) {
        Ok(filter) => {
            info!(path = %path.display(), count = filter.len(), "Loaded models from filter");
            for model in filter.entries() {
                info!(" - {model}");
            }
            Ok(filter)
        }
        Err(FilterError::NotFound(_)) => {
            info!(path = %path.display(), "Model filter file not found, skipping model filtering");
            Ok(ModelFilter::allow_all())
        }
        Err(e) => {
            error!(error = %e, "Error loading model filter");
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::backend::{
        BackendError, ChatMessage, Completion, DeltaStream, ModelInfo, ShowResponse,
    };

    struct EmptyBackend;

    #[async_trait]
    impl ChatBackend for EmptyBackend {
        async fn list_models(&self) -> Result<Vec<ModelInfo>, BackendError> {
            Ok(Vec::new())
        }

        async fn model_details(&self, name: &str) -> Result<ShowResponse, BackendError> {
            Err(BackendError::ModelNotFound(name.to_string()))
        }

        async fn resolve_model(&self, alias: &str) -> Result<String, BackendError> {
            Err(BackendError::ModelNotFound(alias.to_string()))
        }

        async fn chat(
            &self,
            _messages: &[ChatMessage],
            _model: &str,
        ) -> Result<Completion, BackendError> {
            Err(BackendError::EmptyResponse)
        }

        async fn chat_stream(
            &self,
            _messages: &[ChatMessage],
            _model: &str,
        ) -> Result<DeltaStream, BackendError> {
            Err(BackendError::EmptyResponse)
        }
    }

    #[tokio::test]
    async fn test_start_returns_when_serve_task_exits() {
        let mut config = Config::default();
        config.server.listen = "127.0.0.1:0".to_string();
        config.filter.path = "/nonexistent/models-filter".into();
        let server = Arc::new(ProxyServer::new(Arc::new(config), Arc::new(EmptyBackend)));

        let runner = tokio::spawn({
            let server = server.clone();
            async move { server.start().await }
        });
        for _ in 0..100 {
            if server.is_running().await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // End the serve task behind the controller's back.
        match &*server.state.lock().await {
            ServerState::Running(running) => running.shutdown.cancel(),
            ServerState::Stopped => panic!("server did not start"),
        }

        let result = tokio::time::timeout(Duration::from_secs(2), runner)
            .await
            .expect("start() kept blocking after the server exited")
            .unwrap();
        assert!(result.is_ok());
        assert!(!server.is_running().await);
        assert!(server.local_addr().await.is_none());

        // Nothing left to stop.
        server.stop().await;
    }
}
