//! 服务端装配：路由、中间件、监听与优雅退出。

use axum::extract::{DefaultBodyLimit, Extension};
use axum::http::Request;
use axum::routing::{get, post, put};
use axum::{Router, middleware};
use axum_server::Handle;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info, info_span, warn};

use crate::background::spawn_background_tasks;
use crate::config::ServeArgs;
use crate::coordinator::{CoordinatorConfig, UploadCoordinator};
use crate::handlers;
use crate::http::{
    ClientIpPolicy, add_security_headers, build_cors_layer, client_ip_from_request,
};
use crate::metadata::FsMetadataStore;
use crate::rate_limit::{FixedWindowLimiter, RateLimiter, enforce_rate_limit};
use crate::storage::LocalStorage;
use crate::tls;

/// 构建应用路由；限流只作用于创建、上传与完成接口。
pub fn build_router(
    coordinator: Arc<UploadCoordinator>,
    limiter: Arc<dyn RateLimiter>,
    ip_policy: ClientIpPolicy,
) -> Router {
    let upload_routes = Router::new()
        .route("/{id}/create", post(handlers::create_file))
        .route(
            "/{id}/upload",
            put(handlers::upload_part).layer(DefaultBodyLimit::disable()),
        )
        .route("/{id}/complete", post(handlers::complete_upload))
        .route_layer(middleware::from_fn(enforce_rate_limit));

    Router::new()
        .route(
            "/{id}",
            get(handlers::download_file).delete(handlers::delete_file),
        )
        .merge(upload_routes)
        .layer(middleware::from_fn(add_security_headers))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(move |request: &Request<_>| {
                    let client_ip = client_ip_from_request(request, ip_policy)
                        .map(|ip| ip.to_string())
                        .unwrap_or_else(|| "unknown".to_string());
                    info_span!(
                        env!("CARGO_CRATE_NAME"),
                        client_ip,
                        method = ?request.method(),
                        path = ?request.uri().path(),
                    )
                })
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        )
        .layer(Extension(coordinator))
        .layer(Extension(limiter))
        .layer(Extension(ip_policy))
}

/// 启动服务并阻塞直到收到退出信号。
pub async fn serve(args: ServeArgs) -> io::Result<()> {
    let storage = Arc::new(LocalStorage::new(args.data_dir.join("storage")));
    storage.ensure_root().await?;
    let metadata = Arc::new(FsMetadataStore::new(args.data_dir.join("meta")));
    metadata.ensure_root().await?;
    let coordinator = Arc::new(UploadCoordinator::new(
        storage,
        metadata,
        CoordinatorConfig {
            max_object_size: args.max_object_size,
            metadata_ttl: Duration::from_secs(args.metadata_ttl_secs),
        },
    ));
    let limiter = Arc::new(FixedWindowLimiter::new(
        args.rate_limit_requests,
        Duration::from_secs(args.rate_limit_window_secs),
    ));

    let ip_policy = ClientIpPolicy {
        trust_forwarded_for: args.trust_forwarded_for,
    };
    if ip_policy.trust_forwarded_for {
        info!("Client addresses are taken from x-forwarded-for");
    }
    let mut app = build_router(coordinator.clone(), limiter.clone(), ip_policy);
    if let Some(cors_layer) = build_cors_layer(args.cors_origins.as_deref()) {
        app = app.layer(cors_layer);
    }

    let host = args
        .host
        .parse::<IpAddr>()
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err.to_string()))?;
    let addr = SocketAddr::new(host, args.port);
    let tls_config = tls::load_rustls_config(&args).await?;
    let handle = Handle::new();

    spawn_background_tasks(
        coordinator,
        limiter,
        Duration::from_secs(args.session_ttl_secs),
    );
    tokio::spawn(shutdown_signal(handle.clone()));

    let service = app.into_make_service_with_connect_info::<SocketAddr>();
    match tls_config {
        Some(config) => {
            info!(data_dir = ?args.data_dir, "🔒 Starting HTTPS server at {}", addr);
            axum_server::bind_rustls(addr, config)
                .handle(handle)
                .serve(service)
                .await
        }
        None => {
            info!(data_dir = ?args.data_dir, "🚀 Starting HTTP server at {}", addr);
            axum_server::bind(addr).handle(handle).serve(service).await
        }
    }
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received termination signal shutting down");
    handle.graceful_shutdown(Some(Duration::from_secs(10)));
}

/// 在随机端口启动内存中的测试服务，返回基础 URL。
#[cfg(test)]
pub(crate) async fn spawn_test_server(
    root: &std::path::Path,
    rate_limit_requests: u32,
) -> (String, Arc<UploadCoordinator>) {
    let storage = Arc::new(LocalStorage::new(root.join("storage")));
    storage.ensure_root().await.expect("storage root");
    let metadata = Arc::new(FsMetadataStore::new(root.join("meta")));
    metadata.ensure_root().await.expect("meta root");
    let coordinator = Arc::new(UploadCoordinator::new(
        storage,
        metadata,
        CoordinatorConfig {
            max_object_size: 0,
            metadata_ttl: Duration::from_secs(3600),
        },
    ));
    let limiter = Arc::new(FixedWindowLimiter::new(
        rate_limit_requests,
        Duration::from_secs(60),
    ));
    let app = build_router(coordinator.clone(), limiter, ClientIpPolicy::default());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test listener");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await;
    });
    (format!("http://{addr}"), coordinator)
}
