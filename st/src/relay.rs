//! `st --passthrough`: splice stdin/stdout onto the local server socket so a
//! remote client can reach it over a shell transport.

use st_common::config::{Endpoint, HostId, Network, ResolvedConfig};
use st_common::errors::{ErrorKind, Result, StError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// The endpoint of `server`'s platform that `local` can reach. The server
/// host itself may use any of its endpoints.
pub fn local_endpoint<'a>(server: &'a ResolvedConfig, local: &HostId) -> Result<&'a Endpoint> {
    let platform = server.platform()?;
    platform
        .endpoint_for(local)
        .or_else(|| {
            (server.host_id() == local)
                .then(|| platform.endpoints.first())
                .flatten()
        })
        .ok_or_else(|| {
            StError::with_message(
                ErrorKind::EndpointNotFound,
                format!("{} has no endpoint for platform {}", local, platform.name),
            )
        })
}

/// Copy `input` into `socket` in the background and `socket` into `output`
/// until the server closes. The input copy is not waited for.
pub async fn splice<S, I, O>(socket: S, mut input: I, mut output: O) -> Result<u64>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
    I: AsyncRead + Send + Unpin + 'static,
    O: AsyncWrite + Unpin,
{
    let (mut from_server, mut to_server) = tokio::io::split(socket);
    tokio::spawn(async move {
        match tokio::io::copy(&mut input, &mut to_server).await {
            Ok(n) => debug!("Forwarded {} bytes to the server", n),
            Err(e) => debug!("Input relay stopped: {}", e),
        }
        let _ = to_server.shutdown().await;
    });

    let mut total = 0u64;
    let mut buffer = vec![0u8; 64 * 1024];
    loop {
        let n = from_server.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        output.write_all(&buffer[..n]).await?;
        output.flush().await?;
        total += n as u64;
    }
    Ok(total)
}

/// Relay stdio to the local endpoint of `server`'s platform.
pub async fn passthrough(server: &ResolvedConfig, local: &HostId) -> Result<()> {
    let endpoint = local_endpoint(server, local)?;
    debug!("Passthrough to {}", endpoint);
    let failed = |e: std::io::Error| {
        StError::with_message(
            ErrorKind::ConnectionFailed,
            format!("cannot connect to {},{}", endpoint.network, endpoint.address),
        )
        .with_source(e)
    };
    let stdin = tokio::io::stdin();
    let stdout = tokio::io::stdout();
    let relayed = match endpoint.network {
        Network::Tcp => {
            let stream = tokio::net::TcpStream::connect(&endpoint.address)
                .await
                .map_err(failed)?;
            splice(stream, stdin, stdout).await?
        }
        #[cfg(unix)]
        Network::Unix => {
            let stream = tokio::net::UnixStream::connect(&endpoint.address)
                .await
                .map_err(failed)?;
            splice(stream, stdin, stdout).await?
        }
        #[cfg(not(unix))]
        Network::Unix => {
            return Err(StError::with_message(
                ErrorKind::EndpointNotFound,
                "unix endpoints are not supported on this platform",
            ));
        }
    };
    debug!("Relayed {} bytes from the server", relayed);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use st_common::config::ConfigFile;
    use std::path::Path;

    const CONFIG: &str = r#"{
      "desk": { "repositories": { "chrome": { "src": "/src" } } },
      "lab": { "repositories": { "chrome": { "src": "/lab/src", "platforms": {
        "linux": { "out": "out/Default", "mb_config": "debug_bot",
                   "endpoints": { "lab": "tcp,localhost:9000", "desk": "tcp,lab.lan:9000" } },
        "cros": { "out": "out/Cros", "mb_config": "cros_bot",
                  "endpoints": { "desk": "tcp,lab.lan:9001" } } } } } },
      "roof": { "repositories": { "chrome": { "src": "/roof/src" } } }
    }"#;

    fn server(platform: &str) -> ResolvedConfig {
        ConfigFile::from_json_str(CONFIG, Path::new("cfg"))
            .unwrap()
            .select_server(platform, "chrome")
            .unwrap()
    }

    #[test]
    fn endpoint_for_the_local_host_is_used() {
        let linux = server("linux");
        assert_eq!(local_endpoint(&linux, &HostId::new("desk")).unwrap().address, "lab.lan:9000");
        assert_eq!(local_endpoint(&linux, &HostId::new("lab")).unwrap().address, "localhost:9000");
    }

    #[test]
    fn server_host_falls_back_to_any_endpoint() {
        let cros = server("cros");
        assert_eq!(local_endpoint(&cros, &HostId::new("lab")).unwrap().address, "lab.lan:9001");
    }

    #[test]
    fn unrelated_host_has_no_endpoint() {
        let err = local_endpoint(&server("linux"), &HostId::new("roof")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EndpointNotFound);
    }

    #[tokio::test]
    async fn splice_relays_both_directions() {
        let (ours, mut theirs) = tokio::io::duplex(1024);
        let input: &'static [u8] = b"request bytes";
        let mut output = Vec::new();

        let server = tokio::spawn(async move {
            let mut received = vec![0u8; 13];
            theirs.read_exact(&mut received).await.unwrap();
            theirs.write_all(b"reply").await.unwrap();
            theirs.shutdown().await.unwrap();
            received
        });

        let relayed = splice(ours, input, &mut output).await.unwrap();
        assert_eq!(relayed, 5);
        assert_eq!(output, b"reply");
        assert_eq!(server.await.unwrap(), b"request bytes");
    }
}
