//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use devserver::config::ServerConfig;
use devserver::http::{ServeError, StopReason};
use devserver::{App, Server};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// A server running inside the test process.
pub struct TestServer {
    pub addr: SocketAddr,
    pub handle: JoinHandle<Result<StopReason, ServeError>>,
    stop: Option<oneshot::Sender<()>>,
}

impl TestServer {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Signal the server and wait for the accept loop to finish.
    pub async fn stop(mut self) -> StopReason {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        tokio::time::timeout(Duration::from_secs(10), self.handle)
            .await
            .expect("server did not stop")
            .expect("server task panicked")
            .expect("server failed")
    }
}

pub fn server_config(port: u16) -> ServerConfig {
    ServerConfig {
        port,
        shutdown_grace_ms: 1_000,
        ..ServerConfig::default()
    }
}

/// Bind and start serving on the current runtime.
pub fn start_server(config: &ServerConfig, app: impl App) -> TestServer {
    let server = Server::bind(config, app).expect("bind test server");
    start_bound(server)
}

pub fn start_bound(server: Server) -> TestServer {
    let addr = server.local_addr();
    let (stop, stopped) = oneshot::channel::<()>();
    let handle = tokio::spawn(server.serve_forever(async move {
        let _ = stopped.await;
    }));
    TestServer {
        addr,
        handle,
        stop: Some(stop),
    }
}

/// Send raw bytes and read until the server closes the connection.
pub fn raw_exchange(addr: SocketAddr, request: &[u8]) -> String {
    let mut stream = TcpStream::connect(addr).expect("connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream.write_all(request).unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).expect("read response");
    String::from_utf8_lossy(&response).into_owned()
}

/// Run `raw_exchange` off the async runtime.
pub async fn raw(addr: SocketAddr, request: &'static [u8]) -> String {
    tokio::task::spawn_blocking(move || raw_exchange(addr, request))
        .await
        .unwrap()
}

/// The `devserver` binary running as a child process.
pub struct DevServerProcess {
    pub child: Child,
    pub port: u16,
}

impl DevServerProcess {
    pub fn spawn(port: u16, args: &[&str]) -> Self {
        let child = Command::new(env!("CARGO_BIN_EXE_devserver"))
            .arg("--port")
            .arg(port.to_string())
            .args(args)
            .env("RUST_LOG", "devserver=debug")
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .spawn()
            .expect("spawn devserver");
        Self { child, port }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{}", self.port, path)
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Send SIGTERM and wait for the process to exit.
    #[cfg(unix)]
    pub fn terminate(&mut self) -> ExitStatus {
        // SAFETY: signalling our own child.
        unsafe {
            libc::kill(self.child.id() as i32, libc::SIGTERM);
        }
        self.wait_exit(Duration::from_secs(15))
            .expect("devserver did not exit after SIGTERM")
    }

    pub fn wait_exit(&mut self, timeout: Duration) -> Option<ExitStatus> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if let Some(status) = self.child.try_wait().unwrap() {
                return Some(status);
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        None
    }
}

impl Drop for DevServerProcess {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            // SIGTERM first so a supervisor can take its worker down too.
            // SAFETY: signalling our own child.
            #[cfg(unix)]
            unsafe {
                libc::kill(self.child.id() as i32, libc::SIGTERM);
            }
            if self.wait_exit(Duration::from_secs(5)).is_none() {
                let _ = self.child.kill();
                let _ = self.child.wait();
            }
        }
    }
}

/// Poll `url` until it answers with a success status.
pub async fn wait_until_serving(client: &reqwest::Client, url: &str) -> String {
    let deadline = Instant::now() + Duration::from_secs(30);
    loop {
        if let Ok(response) = client.get(url).send().await {
            if response.status().is_success() {
                return response.text().await.unwrap();
            }
        }
        assert!(Instant::now() < deadline, "{} never came up", url);
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Bump a file's mtime well past anything the poller has recorded.
pub fn touch_later(path: &Path) {
    let file = std::fs::File::options().write(true).open(path).unwrap();
    file.set_modified(std::time::SystemTime::now() + Duration::from_secs(10))
        .unwrap();
}
