//! HTTP Server Module
//!
//! Routes `/increment`, `/fetch`, `/healthz` and `/static` onto the counter core and
//! renders JSON responses carrying the replica identity. Any method is accepted.

use crate::context::ServiceContext;
use crate::health::ReadinessMonitor;
use crate::increment_coordinator::IncrementCoordinator;
use crate::read_path::CounterReader;
use crate::shutdown::{ShutdownCoordinator, ShutdownSignal};
use crate::{CounterError, Result};
use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinError;
use tracing::{debug, error, info, warn};

/// JSON body of every successful response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    pub message: String,
    pub content: String,
}

impl StatusResponse {
    fn ok(content: String) -> Self {
        Self {
            pod: None,
            node: None,
            message: "Status OK".to_string(),
            content,
        }
    }

    fn attributed(context: &ServiceContext, label: &str, value: u64) -> Self {
        let identity = context.identity();
        Self {
            pod: Some(identity.pod_name.clone()),
            node: Some(identity.node_name.clone()),
            ..Self::ok(format!("{} = {}", label, value))
        }
    }
}

/// Request routing over the counter core
pub struct CounterRoutes {
    context: Arc<ServiceContext>,
    coordinator: Arc<IncrementCoordinator>,
    reader: CounterReader,
    readiness: ReadinessMonitor,
}

impl CounterRoutes {
    pub fn new(context: Arc<ServiceContext>) -> Self {
        Self {
            coordinator: Arc::new(IncrementCoordinator::new(Arc::clone(&context))),
            reader: CounterReader::new(Arc::clone(&context)),
            readiness: ReadinessMonitor::new(Arc::clone(&context)),
            context,
        }
    }

    pub fn readiness(&self) -> &ReadinessMonitor {
        &self.readiness
    }

    /// Handle one request; the body is never read
    pub async fn handle_request<B>(&self, req: Request<B>) -> Response<Full<Bytes>> {
        let path = req.uri().path().to_owned();
        debug!("Processing {} {}", req.method(), path);
        drop(req);

        match path.as_str() {
            "/increment" => self.handle_increment().await,
            "/fetch" => self.handle_fetch().await,
            "/healthz" => self.handle_healthz().await,
            "/static" => self.json_response(&StatusResponse::attributed(
                &self.context,
                "meaning of life",
                42,
            )),
            _ => text_response(StatusCode::NOT_FOUND, "404 page not found\n".to_string()),
        }
    }

    async fn handle_increment(&self) -> Response<Full<Bytes>> {
        // Own task, so a dropped connection cannot cancel the locked section midway
        let coordinator = Arc::clone(&self.coordinator);
        let outcome = match tokio::spawn(async move { coordinator.increment().await }).await {
            Ok(outcome) => outcome,
            Err(e) => Err(CounterError::Internal(format!("increment task failed: {}", e))),
        };

        match outcome {
            Ok(value) => self.json_response(&StatusResponse::ok(format!("count value = {}", value))),
            Err(e) => self.error_response(&e),
        }
    }

    async fn handle_fetch(&self) -> Response<Full<Bytes>> {
        match self.reader.read().await {
            Ok(value) => {
                self.json_response(&StatusResponse::attributed(&self.context, "count value", value))
            }
            Err(e) => self.error_response(&e),
        }
    }

    async fn handle_healthz(&self) -> Response<Full<Bytes>> {
        match self.readiness.probe().await {
            (_, Ok(members)) => {
                info!("etcd number of members: {}", members);
                self.json_response(&StatusResponse::attributed(
                    &self.context,
                    "etcd members",
                    members as u64,
                ))
            }
            (_, Err(_)) => text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Error, etcd is not ready or not accessible\n".to_string(),
            ),
        }
    }

    fn json_response(&self, body: &StatusResponse) -> Response<Full<Bytes>> {
        match serde_json::to_vec(body) {
            Ok(json) => {
                let mut response = Response::new(Full::new(Bytes::from(json)));
                response
                    .headers_mut()
                    .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
                response
            }
            Err(e) => self.error_response(&CounterError::from(e)),
        }
    }

    /// Plain-text error carrying the replica identity and last local value
    fn error_response(&self, err: &CounterError) -> Response<Full<Bytes>> {
        let identity = self.context.identity();
        let local_value = self.context.local_value();

        let (status, body) = match err {
            CounterError::LockAcquisitionFailed(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, format!("Warning: {}\n", msg))
            }
            CounterError::ShuttingDown(msg) => (
                StatusCode::SERVICE_UNAVAILABLE,
                format!("Service unavailable: {}. My pod name is: `{}`\n", msg, identity.pod_name),
            ),
            CounterError::SerializationError(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Error happened in JSON marshal\n".to_string(),
            ),
            other => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!(
                    "Error happened fetching key: {}. My pod name is: `{}`, my node name is: `{}`, local count value is: {}\n",
                    other, identity.pod_name, identity.node_name, local_value
                ),
            ),
        };

        warn!("Request failed with {}: {}", status, err);
        text_response(status, body)
    }
}

fn log_shutdown_outcome(joined: std::result::Result<Result<()>, JoinError>) {
    match joined {
        Ok(Ok(())) => debug!("Shutdown task finished"),
        Ok(Err(e)) => error!("Shutdown coordinator failed: {}", e),
        Err(e) if e.is_cancelled() => debug!("Shutdown listener stopped"),
        Err(e) => error!("Shutdown task failed: {}", e),
    }
}

fn text_response(status: StatusCode, body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

/// HTTP/1 server for the counter routes
pub struct CounterServer {
    listen_addr: SocketAddr,
    routes: Arc<CounterRoutes>,
    active_connections: Arc<AtomicUsize>,
    drain_timeout: Duration,
}

impl CounterServer {
    pub fn new(listen_addr: SocketAddr, context: Arc<ServiceContext>) -> Self {
        Self {
            listen_addr,
            routes: Arc::new(CounterRoutes::new(context)),
            active_connections: Arc::new(AtomicUsize::new(0)),
            drain_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    /// Bind and serve until the shutdown signal arrives, then drain open connections
    pub async fn start(&self, mut shutdown_signal: ShutdownSignal) -> Result<()> {
        let listener = TcpListener::bind(self.listen_addr).await.map_err(|e| {
            CounterError::IoError(format!("Failed to bind {}: {}", self.listen_addr, e))
        })?;
        self.serve(listener, &mut shutdown_signal).await
    }

    /// Serve until the shutdown sequence has run to completion.
    ///
    /// `shutdown_task` runs the coordinator's sequence once its trigger fires (normally
    /// `listen_for_shutdown`). It gets its own task and is never cancelled after the
    /// sequence has started. If the server exits first, the sequence is started here.
    pub async fn serve_until_shutdown<S>(
        self,
        coordinator: Arc<ShutdownCoordinator>,
        shutdown_task: S,
    ) -> Result<()>
    where
        S: Future<Output = Result<()>> + Send + 'static,
    {
        let lifecycle = Arc::clone(self.routes.context.lifecycle());
        let server_wait = self.drain_timeout + Duration::from_secs(1);
        let server_shutdown = ShutdownSignal::new(coordinator.subscribe());

        let mut server_task = tokio::spawn(async move { self.start(server_shutdown).await });
        let mut shutdown_handle = tokio::spawn(shutdown_task);

        let server_exit = tokio::select! {
            joined = &mut shutdown_handle => {
                log_shutdown_outcome(joined);
                None
            }
            served = &mut server_task => Some(served),
        };

        if server_exit.is_some() && lifecycle.is_running() {
            warn!("HTTP server exited before shutdown was requested");
        }
        // Starts the sequence if nothing has, otherwise waits for the run in progress
        if let Err(e) = coordinator.initiate_shutdown().await {
            error!("Shutdown sequence failed: {}", e);
        }

        let served = match server_exit {
            Some(served) => {
                // The sequence is complete, so this only stops a listener still waiting
                shutdown_handle.abort();
                log_shutdown_outcome(shutdown_handle.await);
                served
            }
            None => match tokio::time::timeout(server_wait, server_task).await {
                Ok(served) => served,
                Err(_) => {
                    warn!("HTTP server did not stop within {:?}", server_wait);
                    return Ok(());
                }
            },
        };

        match served {
            Ok(result) => result,
            Err(e) => Err(CounterError::Internal(format!("HTTP server task failed: {}", e))),
        }
    }

    /// Serve on an already bound listener
    pub async fn serve(&self, listener: TcpListener, shutdown_signal: &mut ShutdownSignal) -> Result<()> {
        info!("Starting http server on {}", listener.local_addr()?);

        // Tells open connections to finish their current request and close
        let (connection_shutdown, _) = broadcast::channel::<()>(1);

        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, addr)) => {
                            debug!("HTTP connection from {}", addr);
                            let routes = Arc::clone(&self.routes);
                            let active_connections = Arc::clone(&self.active_connections);
                            let shutdown = ShutdownSignal::new(connection_shutdown.subscribe());

                            tokio::spawn(async move {
                                Self::serve_connection(stream, addr, routes, active_connections, shutdown).await;
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept HTTP connection: {}", e);
                        }
                    }
                }
                _ = shutdown_signal.wait_for_shutdown() => {
                    info!("HTTP server received shutdown signal, stopping accept loop");
                    break;
                }
            }
        }

        let _ = connection_shutdown.send(());
        self.drain().await;

        info!("HTTP server shut down");
        Ok(())
    }

    async fn serve_connection(
        stream: TcpStream,
        addr: SocketAddr,
        routes: Arc<CounterRoutes>,
        active_connections: Arc<AtomicUsize>,
        mut shutdown: ShutdownSignal,
    ) {
        active_connections.fetch_add(1, Ordering::SeqCst);

        let io = TokioIo::new(stream);
        let service = service_fn(move |req| {
            let routes = Arc::clone(&routes);
            async move { Ok::<_, Infallible>(routes.handle_request(req).await) }
        });

        let connection = http1::Builder::new().serve_connection(io, service);
        tokio::pin!(connection);

        let result = tokio::select! {
            result = connection.as_mut() => result,
            _ = shutdown.wait_for_shutdown() => {
                connection.as_mut().graceful_shutdown();
                connection.as_mut().await
            }
        };

        if let Err(err) = result {
            if err.is_incomplete_message() || err.is_canceled() {
                debug!("Client disconnected from {}: {}", addr, err);
            } else {
                error!("Error serving HTTP connection from {}: {}", addr, err);
            }
        }

        active_connections.fetch_sub(1, Ordering::SeqCst);
    }

    async fn drain(&self) {
        let started = Instant::now();
        let active = self.active_connections.load(Ordering::SeqCst);
        if active == 0 {
            return;
        }

        info!(
            "HTTP server draining {} active connections (timeout: {:?})",
            active, self.drain_timeout
        );
        while self.active_connections.load(Ordering::SeqCst) > 0
            && started.elapsed() < self.drain_timeout
        {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let remaining = self.active_connections.load(Ordering::SeqCst);
        if remaining > 0 {
            warn!("HTTP server shut down with {} connections still active", remaining);
        } else {
            info!("HTTP server all connections drained");
        }
    }
}
