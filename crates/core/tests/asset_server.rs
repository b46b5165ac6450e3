use std::net::{IpAddr, Ipv4Addr};
use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Bytes;
use renderq_core::error::DecodeError;
use renderq_core::gateway::{DecodedFrame, FrameDecodeGateway, FrameDecoder, FrameRequest, GatewaySettings};
use renderq_core::port::{PortBinder, PortRequest};
use renderq_core::server::{AssetServer, RunningAssetServer, ServerOptions, UNSUPPORTED_ROUTE_BODY};
use tempfile::tempdir;

#[derive(Default)]
struct EchoDecoder {
    decodes: AtomicUsize,
    shutdowns: AtomicUsize,
}

#[async_trait]
impl FrameDecoder for EchoDecoder {
    async fn decode(&self, request: &FrameRequest) -> Result<DecodedFrame, DecodeError> {
        self.decodes.fetch_add(1, Ordering::SeqCst);
        if request.src.ends_with(".broken") {
            return Err(DecodeError::Failed(format!("cannot decode {}", request.src)));
        }
        Ok(DecodedFrame {
            data: Bytes::from(format!("{}@{}", request.src, request.time)),
            content_type: "image/png".to_string(),
        })
    }

    async fn shutdown(&self) -> Result<(), DecodeError> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

fn options(binder: &PortBinder, desired: Option<u16>, range: Range<u16>) -> ServerOptions {
    ServerOptions {
        binder: binder.clone(),
        port: PortRequest {
            desired,
            range,
            hosts: vec![LOCALHOST],
        },
        listen_host: LOCALHOST,
        bind_attempts: 5,
    }
}

async fn start(
    static_root: Option<std::path::PathBuf>,
    opts: &ServerOptions,
) -> (Arc<EchoDecoder>, RunningAssetServer) {
    let decoder = Arc::new(EchoDecoder::default());
    let gateway = Arc::new(FrameDecodeGateway::new(decoder.clone(), GatewaySettings::default()));
    let server = AssetServer::start(static_root, opts, gateway).await.unwrap();
    (decoder, server)
}

fn url(server: &RunningAssetServer, path: &str) -> String {
    format!("http://127.0.0.1:{}{path}", server.port())
}

#[tokio::test]
async fn serves_static_files_and_proxied_frames() {
    let public = tempdir().unwrap();
    std::fs::write(public.path().join("logo.svg"), "<svg/>").unwrap();
    let binder = PortBinder::new();
    let (decoder, server) = start(
        Some(public.path().to_path_buf()),
        &options(&binder, None, 42000..42100),
    )
    .await;
    let client = reqwest::Client::new();

    let response = client.get(url(&server, "/logo.svg")).send().await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "<svg/>");

    let response = client.get(url(&server, "/missing.svg")).send().await.unwrap();
    assert_eq!(response.status(), 404);

    let response = client
        .get(url(&server, "/proxy?src=clip.mp4&time=1.5"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["content-type"], "image/png");
    assert_eq!(response.text().await.unwrap(), "clip.mp4@1.5");

    // Second fetch of the same frame is a cache hit.
    let response = client
        .get(url(&server, "/proxy?src=clip.mp4&time=1.5"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(decoder.decodes.load(Ordering::SeqCst), 1);

    server.close().await.unwrap();
}

#[tokio::test]
async fn unsupported_paths_and_bad_frames_are_reported() {
    let binder = PortBinder::new();
    let (_, server) = start(None, &options(&binder, None, 42100..42200)).await;
    let client = reqwest::Client::new();

    let response = client.get(url(&server, "/index.html")).send().await.unwrap();
    assert_eq!(response.status(), 404);
    assert_eq!(response.text().await.unwrap(), UNSUPPORTED_ROUTE_BODY);

    let response = client.get(url(&server, "/proxy?time=1")).send().await.unwrap();
    assert_eq!(response.status(), 400);

    let response = client
        .get(url(&server, "/proxy?src=clip.broken&time=0"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 502);
    assert_eq!(response.text().await.unwrap(), "cannot decode clip.broken");

    server.close().await.unwrap();
}

#[tokio::test]
async fn busy_desired_port_falls_back_within_range() {
    let squatter = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    let taken = squatter.local_addr().unwrap().port();
    let binder = PortBinder::new();

    let (_, server) = start(None, &options(&binder, Some(taken), 42200..42300)).await;
    assert_ne!(server.port(), taken);
    assert!((42200..42300).contains(&server.port()));

    server.close().await.unwrap();
}

#[tokio::test]
async fn servers_sharing_a_binder_get_distinct_ports() {
    let binder = PortBinder::new();
    let opts = options(&binder, None, 42300..42400);

    let (first, second) = tokio::join!(start(None, &opts), start(None, &opts));
    assert_ne!(first.1.port(), second.1.port());

    first.1.close().await.unwrap();
    second.1.close().await.unwrap();
}

#[tokio::test]
async fn close_destroys_keep_alive_connections_and_is_idempotent() {
    let binder = PortBinder::new();
    let (decoder, server) = start(None, &options(&binder, None, 42400..42500)).await;
    let client = reqwest::Client::builder()
        .pool_idle_timeout(Duration::from_secs(600))
        .build()
        .unwrap();

    let response = client
        .get(url(&server, "/proxy?src=clip.mp4&time=0"))
        .send()
        .await
        .unwrap();
    assert_eq!(&response.bytes().await.unwrap()[..], b"clip.mp4@0");
    assert_eq!(server.open_connections(), 1);

    tokio::time::timeout(Duration::from_secs(5), server.close())
        .await
        .expect("close must not wait for idle keep-alive clients")
        .unwrap();
    server.close().await.unwrap();

    tokio::time::timeout(Duration::from_secs(2), async {
        while server.open_connections() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("destroyed connections leave the set");
    assert_eq!(decoder.shutdowns.load(Ordering::SeqCst), 1);
    assert!(!server.gateway().is_available());
    assert!(client
        .get(url(&server, "/proxy?src=clip.mp4&time=0"))
        .send()
        .await
        .is_err());
}
