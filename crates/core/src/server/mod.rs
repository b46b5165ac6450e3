//! HTTP serving: port negotiation, connection tracking and the local asset
//! server the renderer fetches frames and static files from.

use std::collections::BTreeMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::services::ServeDir;
use tracing::{info, warn};

use crate::error::{GatewayError, ServerError};
use crate::gateway::{FrameDecodeGateway, FrameRequest};
use crate::port::{is_addr_in_use, listen_host, PortBinder, PortRequest, DEFAULT_PORT_RANGE};

pub mod connections;

use connections::{ConnectionSet, TrackedListener};

pub const DEFAULT_BIND_ATTEMPTS: usize = 5;
pub const UNSUPPORTED_ROUTE_BODY: &str = "Server only supports /proxy";

#[derive(Clone, Debug)]
pub struct ServerOptions {
    pub binder: PortBinder,
    pub port: PortRequest,
    pub listen_host: IpAddr,
    pub bind_attempts: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            binder: PortBinder::new(),
            port: PortRequest::new(None, DEFAULT_PORT_RANGE),
            listen_host: listen_host(),
            bind_attempts: DEFAULT_BIND_ATTEMPTS,
        }
    }
}

/// Reserves a port and binds the real listener on it, retrying when another
/// process grabs the port between probe and listen.
pub async fn listen_with_retry(
    binder: &PortBinder,
    request: &PortRequest,
    host: IpAddr,
    attempts: usize,
) -> Result<TcpListener, ServerError> {
    for attempt in 1..=attempts {
        let reservation = binder.reserve(request).await?;
        let addr = SocketAddr::new(host, reservation.port());
        match TcpListener::bind(addr).await {
            Ok(listener) => {
                reservation.commit();
                return Ok(listener);
            }
            Err(err) if is_addr_in_use(&err) => {
                warn!(attempt, port = addr.port(), "Port was taken before listen; retrying");
            }
            Err(source) => return Err(ServerError::Listen { addr, source }),
        }
    }
    Err(ServerError::BindExhausted { attempts })
}

/// An HTTP server whose open connections can be forcibly closed.
pub struct RunningServer {
    local_addr: SocketAddr,
    connections: ConnectionSet,
    shutdown: CancellationToken,
    task: tokio::sync::Mutex<Option<JoinHandle<io::Result<()>>>>,
    closed: AtomicBool,
}

impl RunningServer {
    pub async fn start(router: Router, options: &ServerOptions) -> Result<Self, ServerError> {
        let listener = listen_with_retry(
            &options.binder,
            &options.port,
            options.listen_host,
            options.bind_attempts,
        )
        .await?;
        let local_addr = listener.local_addr().map_err(|source| ServerError::Listen {
            addr: SocketAddr::new(options.listen_host, 0),
            source,
        })?;

        let connections = ConnectionSet::default();
        let shutdown = CancellationToken::new();
        let listener = TrackedListener::new(listener, connections.clone());
        let signal = shutdown.clone();
        let task = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move { signal.cancelled().await })
                .await
        });

        info!(addr = %local_addr, "Server listening");
        Ok(Self {
            local_addr,
            connections,
            shutdown,
            task: tokio::sync::Mutex::new(Some(task)),
            closed: AtomicBool::new(false),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn open_connections(&self) -> usize {
        self.connections.len()
    }

    /// Destroys open sockets, stops accepting and waits for the serve task.
    /// Calling it again (or concurrently) succeeds without doing anything.
    pub async fn close(&self) -> Result<(), ServerError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let destroyed = self.connections.destroy_all();
        self.shutdown.cancel();

        let task = self.task.lock().await.take();
        let result = match task {
            Some(task) => match task.await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(err)) => Err(ServerError::Serve(err.to_string())),
                Err(err) => Err(ServerError::Serve(err.to_string())),
            },
            None => Ok(()),
        };
        info!(addr = %self.local_addr, destroyed, "Server closed");
        result
    }
}

/// Static files plus the `/proxy` frame route, backed by a decode gateway.
pub struct AssetServer;

impl AssetServer {
    pub async fn start(
        static_root: Option<PathBuf>,
        options: &ServerOptions,
        gateway: Arc<FrameDecodeGateway>,
    ) -> Result<RunningAssetServer, ServerError> {
        let router = asset_router(static_root, gateway.clone());
        let server = RunningServer::start(router, options).await?;
        Ok(RunningAssetServer {
            server,
            gateway,
            closed: AtomicBool::new(false),
        })
    }
}

pub struct RunningAssetServer {
    server: RunningServer,
    gateway: Arc<FrameDecodeGateway>,
    closed: AtomicBool,
}

impl RunningAssetServer {
    pub fn port(&self) -> u16 {
        self.server.port()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    pub fn gateway(&self) -> &Arc<FrameDecodeGateway> {
        &self.gateway
    }

    pub fn open_connections(&self) -> usize {
        self.server.open_connections()
    }

    /// Shuts down the decode backend and the listener concurrently. The
    /// backend's error wins if both fail.
    pub async fn close(&self) -> Result<(), ServerError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let (backend, listener) = tokio::join!(self.gateway.shutdown(), self.server.close());
        backend.map_err(|err| ServerError::DecoderShutdown(err.to_string()))?;
        listener
    }
}

pub fn asset_router(static_root: Option<PathBuf>, gateway: Arc<FrameDecodeGateway>) -> Router {
    let proxy = Router::new()
        .route("/proxy", any(proxy_frame))
        .route("/proxy/{*rest}", any(proxy_frame))
        .with_state(gateway);

    let router = match static_root {
        Some(root) => proxy.fallback_service(ServeDir::new(root)),
        None => proxy.fallback(unsupported_route),
    };
    router.layer(CatchPanicLayer::new())
}

async fn unsupported_route() -> (StatusCode, &'static str) {
    (StatusCode::NOT_FOUND, UNSUPPORTED_ROUTE_BODY)
}

async fn proxy_frame(
    State(gateway): State<Arc<FrameDecodeGateway>>,
    Query(mut params): Query<BTreeMap<String, String>>,
) -> Response {
    let Some(src) = params.remove("src").filter(|src| !src.is_empty()) else {
        return (StatusCode::BAD_REQUEST, "missing `src` query parameter").into_response();
    };
    let time = match params.remove("time").map(|time| time.parse::<f64>()) {
        Some(Ok(time)) if time.is_finite() && time >= 0.0 => time,
        Some(_) => {
            return (StatusCode::BAD_REQUEST, "`time` must be a non-negative number of seconds")
                .into_response()
        }
        None => return (StatusCode::BAD_REQUEST, "missing `time` query parameter").into_response(),
    };

    match gateway.decode_frame(FrameRequest { src, time, params }).await {
        Ok(frame) => ([(header::CONTENT_TYPE, frame.content_type)], frame.data).into_response(),
        Err(GatewayError::DecodeFailed(message)) => (StatusCode::BAD_GATEWAY, message).into_response(),
        Err(err @ GatewayError::BackendUnavailable(_)) => {
            (StatusCode::SERVICE_UNAVAILABLE, err.to_string()).into_response()
        }
    }
}
