//! Tests for staging traffic assertions against a fake stager.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use stagehand::traffic::{Stager, StagingRun, SUCCESS_MARKER, STARTED_MARKER};
use stagehand::{HarnessError, Result, StagingOutcome, TrafficMonitor};

const CONTAINER: &str = "172.17.0.2";

fn packet(src_port: u16, dst: &str) -> String {
    format!(
        "internet traffic: 10:15:42.123456 IP {}.{} > {}: Flags [S], seq 1, length 0",
        CONTAINER, src_port, dst
    )
}

fn built(mut lines: Vec<String>) -> StagingRun {
    lines.insert(0, STARTED_MARKER.to_string());
    lines.insert(1, "-----> Installing node 10.16.0".to_string());
    lines.insert(2, SUCCESS_MARKER.to_string());
    StagingRun {
        exit_code: Some(0),
        lines,
    }
}

/// Returns a canned run.
struct CannedStager(StagingRun);

#[async_trait]
impl Stager for CannedStager {
    async fn stage(&self, _: &Path, _: &Path, _: &[(String, String)]) -> Result<StagingRun> {
        Ok(self.0.clone())
    }
}

/// Behaves like a proxy-aware buildpack: tunnels to `upstream` through
/// `HTTP_PROXY` and reports the packets it sent.
struct ProxyAwareStager {
    upstream: SocketAddr,
    use_proxy: bool,
    extra: Vec<String>,
}

fn proxy_addr(env: &[(String, String)]) -> SocketAddr {
    let url = env
        .iter()
        .find(|(k, _)| k == "HTTP_PROXY")
        .map(|(_, v)| v.clone())
        .expect("HTTP_PROXY set");
    url.trim_start_matches("http://").parse().unwrap()
}

#[async_trait]
impl Stager for ProxyAwareStager {
    async fn stage(&self, _: &Path, _: &Path, env: &[(String, String)]) -> Result<StagingRun> {
        let proxy = proxy_addr(env);
        let mut lines = Vec::new();
        if self.use_proxy {
            let mut stream = TcpStream::connect(proxy).await?;
            stream
                .write_all(format!("CONNECT {} HTTP/1.1\r\n\r\n", self.upstream).as_bytes())
                .await?;
            let mut head = [0u8; 12];
            stream.read_exact(&mut head).await?;
            assert_eq!(&head, b"HTTP/1.1 200");
            lines.push(packet(40000, &format!("{}.{}:", proxy.ip(), proxy.port())));
        }
        lines.extend(self.extra.iter().cloned());
        Ok(built(lines))
    }
}

async fn listening_upstream() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut sink = Vec::new();
                let _ = socket.read_to_end(&mut sink).await;
            });
        }
    });
    addr
}

fn monitor(stager: impl Stager + 'static) -> TrafficMonitor {
    TrafficMonitor::new(Arc::new(stager))
}

#[tokio::test]
async fn test_vendored_app_is_airgapped() {
    let m = monitor(CannedStager(built(Vec::new())));
    let report = tokio_test::assert_ok!(
        m.assert_airgapped(Path::new("vendored"), Path::new("bp.zip")).await
    );
    assert_eq!(report.outcome, StagingOutcome::Built);
    assert!(report.traffic.is_empty());
}

#[tokio::test]
async fn test_non_vendored_app_reaches_internet() {
    let m = monitor(CannedStager(built(vec![packet(45678, "151.101.0.162.443:")])));
    let err = m
        .assert_airgapped(Path::new("no_vendor"), Path::new("bp.zip"))
        .await
        .unwrap_err();
    assert!(matches!(err, HarnessError::TrafficViolation(_)));
    assert!(err.to_string().contains("151.101.0.162:443"));
}

#[tokio::test]
async fn test_staging_that_never_ran_is_not_airgapped() {
    let m = monitor(CannedStager(StagingRun {
        exit_code: Some(125),
        lines: vec!["docker: Error response from daemon: no such image".to_string()],
    }));
    let err = m
        .assert_airgapped(Path::new("vendored"), Path::new("bp.zip"))
        .await
        .unwrap_err();
    assert!(matches!(err, HarnessError::StagingIncomplete(_)));
}

#[tokio::test]
async fn test_failed_build_reports_last_output() {
    let m = monitor(CannedStager(StagingRun {
        exit_code: Some(1),
        lines: vec![
            STARTED_MARKER.to_string(),
            "**ERROR** Unable to install node: no match found for 99.x".to_string(),
        ],
    }));
    let err = m
        .assert_airgapped(Path::new("unsupported"), Path::new("bp.zip"))
        .await
        .unwrap_err();
    assert!(matches!(err, HarnessError::StagingIncomplete(_)));
    assert!(err.to_string().contains("no match found"));
}

#[tokio::test]
async fn test_proxy_aware_staging_passes() {
    let upstream = listening_upstream().await;
    let m = monitor(ProxyAwareStager {
        upstream,
        use_proxy: true,
        extra: Vec::new(),
    });
    let report = m
        .assert_routes_through_proxy(Path::new("with_proxy"), Path::new("bp.zip"), Some("127.0.0.1"))
        .await
        .unwrap();
    assert_eq!(report.traffic.destinations().len(), 1);
}

#[tokio::test]
async fn test_direct_connection_beside_proxy_fails() {
    let upstream = listening_upstream().await;
    let m = monitor(ProxyAwareStager {
        upstream,
        use_proxy: true,
        extra: vec![packet(45679, "151.101.0.162.443:")],
    });
    let err = m
        .assert_routes_through_proxy(Path::new("with_proxy"), Path::new("bp.zip"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, HarnessError::TrafficViolation(_)));
    assert!(err.to_string().contains("151.101.0.162:443"));
}

#[tokio::test]
async fn test_proxy_never_used_fails() {
    let upstream = listening_upstream().await;
    let m = monitor(ProxyAwareStager {
        upstream,
        use_proxy: false,
        extra: Vec::new(),
    });
    let err = m
        .assert_routes_through_proxy(Path::new("with_proxy"), Path::new("bp.zip"), None)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("never used the proxy"));
}

#[tokio::test]
async fn test_unexpected_proxy_host_fails() {
    let upstream = listening_upstream().await;
    let m = monitor(ProxyAwareStager {
        upstream,
        use_proxy: true,
        extra: Vec::new(),
    });
    let err = m
        .assert_routes_through_proxy(Path::new("with_proxy"), Path::new("bp.zip"), Some("registry.npmjs.org"))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("expected only registry.npmjs.org"));
}
