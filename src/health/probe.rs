//! Health probes.
//!
//! One probe is a single attempt against a destination, bounded by the
//! probe timeout. Failures are reported as a human readable reason.

use crate::model::Probe;
use std::net::SocketAddr;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::time::timeout;

/// Probe `target` once.
pub async fn probe(target: SocketAddr, probe: &Probe, check_timeout: Duration) -> Result<(), String> {
    match probe {
        Probe::Tcp => tcp_health_check(target, check_timeout).await,
        Probe::Http {
            path,
            expected_status,
        } => http_health_check(target, path, *expected_status, check_timeout).await,
        Probe::Script { command, args } => {
            script_health_check(target, command, args, check_timeout).await
        }
    }
}

/// Perform a TCP health check (just connect).
async fn tcp_health_check(target: SocketAddr, check_timeout: Duration) -> Result<(), String> {
    match timeout(check_timeout, TcpStream::connect(target)).await {
        Ok(Ok(_stream)) => Ok(()),
        Ok(Err(e)) => Err(format!("connection failed: {}", e)),
        Err(_) => Err("connection timeout".to_string()),
    }
}

/// Perform an HTTP health check. The whole exchange shares one deadline.
async fn http_health_check(
    target: SocketAddr,
    path: &str,
    expected_status: u16,
    check_timeout: Duration,
) -> Result<(), String> {
    let exchange = async {
        let mut stream = TcpStream::connect(target)
            .await
            .map_err(|e| format!("connection failed: {}", e))?;

        let request = format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
            path, target
        );
        stream
            .write_all(request.as_bytes())
            .await
            .map_err(|e| format!("write failed: {}", e))?;

        // The status line fits in the first read.
        let mut buf = vec![0u8; 1024];
        let n = stream
            .read(&mut buf)
            .await
            .map_err(|e| format!("read failed: {}", e))?;
        if n == 0 {
            return Err("empty response".to_string());
        }
        parse_http_status(&String::from_utf8_lossy(&buf[..n]))
    };

    let status = timeout(check_timeout, exchange)
        .await
        .map_err(|_| "http check timeout".to_string())??;

    if status == expected_status {
        Ok(())
    } else {
        Err(format!(
            "unexpected status: {} (expected {})",
            status, expected_status
        ))
    }
}

/// Run an external command. Exit status 0 is healthy.
async fn script_health_check(
    target: SocketAddr,
    command: &str,
    args: &[String],
    check_timeout: Duration,
) -> Result<(), String> {
    let mut cmd = Command::new(command);
    cmd.args(args)
        .env("L4PLANE_TARGET_ADDRESS", target.ip().to_string())
        .env("L4PLANE_TARGET_PORT", target.port().to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    match timeout(check_timeout, cmd.status()).await {
        Ok(Ok(status)) if status.success() => Ok(()),
        Ok(Ok(status)) => Err(format!("script exited with {}", status)),
        Ok(Err(e)) => Err(format!("failed to run script: {}", e)),
        Err(_) => Err("script timeout".to_string()),
    }
}

/// Parse HTTP status code from response.
fn parse_http_status(response: &str) -> Result<u16, String> {
    // Format: "HTTP/1.1 200 OK\r\n..."
    let parts: Vec<&str> = response.split_whitespace().collect();
    if parts.len() < 2 || !parts[0].starts_with("HTTP/") {
        return Err("invalid HTTP response".to_string());
    }

    parts[1]
        .parse()
        .map_err(|_| "invalid status code".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_parse_http_status() {
        assert_eq!(parse_http_status("HTTP/1.1 200 OK\r\n").unwrap(), 200);
        assert_eq!(parse_http_status("HTTP/1.0 404 Not Found\r\n").unwrap(), 404);
        assert_eq!(parse_http_status("HTTP/1.1 503 Service Unavailable").unwrap(), 503);
    }

    #[test]
    fn test_parse_http_status_invalid() {
        assert!(parse_http_status("invalid").is_err());
        assert!(parse_http_status("").is_err());
        assert!(parse_http_status("SSH-2.0-OpenSSH_9.6").is_err());
    }

    #[tokio::test]
    async fn test_tcp_probe_success() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let result = probe(addr, &Probe::Tcp, Duration::from_secs(5)).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_tcp_probe_refused() {
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let result = probe(addr, &Probe::Tcp, Duration::from_secs(1)).await;
        assert!(result.is_err());
    }

    async fn http_server(status_line: &'static str) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf).await;
                let response = format!("{}\r\nContent-Length: 0\r\n\r\n", status_line);
                let _ = stream.write_all(response.as_bytes()).await;
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_http_probe_expected_status() {
        let addr = http_server("HTTP/1.1 200 OK").await;
        let check = Probe::Http {
            path: "/healthz".to_string(),
            expected_status: 200,
        };
        assert!(probe(addr, &check, Duration::from_secs(5)).await.is_ok());
    }

    #[tokio::test]
    async fn test_http_probe_unexpected_status() {
        let addr = http_server("HTTP/1.1 503 Service Unavailable").await;
        let check = Probe::Http {
            path: "/".to_string(),
            expected_status: 200,
        };
        let result = probe(addr, &check, Duration::from_secs(5)).await;
        assert!(result.unwrap_err().contains("503"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_script_probe_sees_target() {
        let target: SocketAddr = "10.0.0.1:8080".parse().unwrap();
        let check = Probe::Script {
            command: "sh".to_string(),
            args: vec![
                "-c".to_string(),
                "test \"$L4PLANE_TARGET_ADDRESS:$L4PLANE_TARGET_PORT\" = 10.0.0.1:8080".to_string(),
            ],
        };
        assert!(probe(target, &check, Duration::from_secs(5)).await.is_ok());

        let failing = Probe::Script {
            command: "false".to_string(),
            args: vec![],
        };
        assert!(probe(target, &failing, Duration::from_secs(5)).await.is_err());
    }
}
