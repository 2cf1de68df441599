#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dm_engine::firmware::FirmwareInstaller;
use dm_engine::process::ProcessOutcome;
use dm_engine::{Envelope, ManagementChannel, MemoryTransport, ResponseCode};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Answer every device-originated request with 200.
pub fn auto_ack(transport: &MemoryTransport) {
    transport.set_responder(Arc::new(|channel, request| match channel {
        ManagementChannel::Response | ManagementChannel::Notify => None,
        _ => Some(Envelope::response_to(request, ResponseCode::Success)),
    }));
}

pub fn request(req_id: &str, data: Value) -> Envelope {
    Envelope {
        data: Some(data),
        request_id: Some(req_id.to_string()),
        ..Default::default()
    }
}

/// Last response published for `req_id`.
pub fn response_for(transport: &MemoryTransport, req_id: &str) -> Option<Envelope> {
    transport
        .published_on(ManagementChannel::Response)
        .into_iter()
        .rev()
        .find(|r| r.request_id.as_deref() == Some(req_id))
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn eventually(timeout: Duration, check: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Serve `body` to the first HTTP request on a local port. Returns its URL.
pub async fn serve_once(body: Vec<u8>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        if let Ok((mut socket, _)) = listener.accept().await {
            let mut buf = vec![0u8; 4096];
            let _ = socket.read(&mut buf).await;
            let header = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/octet-stream\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            socket.write_all(header.as_bytes()).await.ok();
            socket.write_all(&body).await.ok();
            socket.shutdown().await.ok();
        }
    });
    format!("http://{}/firmware.deb", addr)
}

/// URL nothing listens on.
pub const UNREACHABLE_URL: &str = "http://127.0.0.1:1/firmware.deb";

/// Installer that writes a canned log and reports a canned exit status.
pub struct ScriptedInstaller {
    pub log: String,
    pub success: bool,
    pub remediation_success: bool,
    pub installs: AtomicUsize,
    pub remediations: AtomicUsize,
}

impl ScriptedInstaller {
    pub fn new(log: impl Into<String>, success: bool) -> Self {
        Self {
            log: log.into(),
            success,
            remediation_success: true,
            installs: AtomicUsize::new(0),
            remediations: AtomicUsize::new(0),
        }
    }

    pub fn with_remediation(mut self, success: bool) -> Self {
        self.remediation_success = success;
        self
    }

    fn exited(success: bool) -> ProcessOutcome {
        ProcessOutcome::Exited {
            success,
            code: Some(if success { 0 } else { 1 }),
            output: String::new(),
        }
    }
}

#[async_trait]
impl FirmwareInstaller for ScriptedInstaller {
    async fn install(&self, artifact: &Path, log: &Path) -> ProcessOutcome {
        self.installs.fetch_add(1, Ordering::SeqCst);
        assert!(artifact.exists(), "artifact missing at install time");
        tokio::fs::write(log, &self.log).await.unwrap();
        Self::exited(self.success)
    }

    async fn remediate(&self, _log: &Path) -> ProcessOutcome {
        self.remediations.fetch_add(1, Ordering::SeqCst);
        Self::exited(self.remediation_success)
    }
}
