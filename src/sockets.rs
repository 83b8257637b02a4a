use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

use crate::error::{Result, ScError};
use crate::intr::Intr;
use crate::tunnel::Tunnel;

// module name for logging engine
const NAME: &str = "<i><bright-black> sockets: </>";

const DEVICE_NAME_FIELD_LENGTH: usize = 64;
const FORWARD_CONNECT_ATTEMPTS: usize = 100;
const FORWARD_CONNECT_DELAY: Duration = Duration::from_millis(100);

/// The three typed sockets established over the tunnel, in the fixed
/// `video, audio, control` order (§4.G).
#[derive(Default)]
pub struct EstablishedSockets {
    pub video: Option<TcpStream>,
    pub audio: Option<TcpStream>,
    pub control: Option<TcpStream>,
    pub device_name: String,
}

/// Which streams to establish, in the fixed positional order the remote
/// server itself connects/accepts in.
#[derive(Debug, Clone, Copy)]
pub struct RequestedStreams {
    pub video: bool,
    pub audio: bool,
    pub control: bool,
}

impl RequestedStreams {
    pub fn count(&self) -> usize {
        [self.video, self.audio, self.control]
            .into_iter()
            .filter(|b| *b)
            .count()
    }
}

/// Accepts or connects the requested sockets over `tunnel`, then reads the
/// fixed-width device-name handshake from the first established one. Closes
/// the tunnel once all sockets are up (its mapping is no longer needed) and,
/// on any failure, closes everything already opened before returning.
pub async fn establish(
    tunnel: &mut Tunnel,
    adb: &impl crate::adb::Adb,
    intr: &Intr,
    serial: &str,
    requested: RequestedStreams,
    tunnel_host: Option<&str>,
    tunnel_port: Option<u16>,
) -> Result<EstablishedSockets> {
    let result = if tunnel.forward() {
        establish_forward(tunnel, requested, tunnel_host, tunnel_port, intr).await
    } else {
        establish_reverse(tunnel, requested, intr).await
    };

    let mut sockets = match result {
        Ok(sockets) => sockets,
        Err(e) => {
            tunnel.close(adb, intr).await;
            return Err(e);
        }
    };

    tunnel.close(adb, intr).await;

    match read_device_name(&mut sockets, intr).await {
        Ok(name) => {
            sockets.device_name = name;
            Ok(sockets)
        }
        Err(e) => Err(e),
    }
}

async fn establish_reverse(
    tunnel: &mut Tunnel,
    requested: RequestedStreams,
    intr: &Intr,
) -> Result<EstablishedSockets> {
    let listener = tunnel
        .server_socket()
        .ok_or_else(|| ScError::TunnelSetupFailed("reverse tunnel has no listener".to_string()))?;

    let mut sockets = EstablishedSockets::default();
    for (enabled, label, slot) in [
        (requested.video, "video", &mut sockets.video),
        (requested.audio, "audio", &mut sockets.audio),
        (requested.control, "control", &mut sockets.control),
    ] {
        if !enabled {
            continue;
        }
        let (stream, _) = intr
            .guard(listener.accept())
            .await??;
        log::debug!("{} 🔗 accepted {} socket", NAME, label);
        *slot = Some(stream);
    }

    Ok(sockets)
}

async fn establish_forward(
    tunnel: &Tunnel,
    requested: RequestedStreams,
    tunnel_host: Option<&str>,
    tunnel_port: Option<u16>,
    intr: &Intr,
) -> Result<EstablishedSockets> {
    let host = tunnel_host.unwrap_or("127.0.0.1");
    let port = tunnel_port.unwrap_or_else(|| tunnel.local_port());

    let mut sockets = EstablishedSockets::default();
    let mut first = true;
    for (enabled, label, slot) in [
        (requested.video, "video", &mut sockets.video),
        (requested.audio, "audio", &mut sockets.audio),
        (requested.control, "control", &mut sockets.control),
    ] {
        if !enabled {
            continue;
        }
        let stream = if first {
            connect_with_liveness_probe(host, port, intr).await?
        } else {
            intr.guard(TcpStream::connect((host, port)))
                .await??
        };
        log::debug!("{} 🔗 connected {} socket", NAME, label);
        *slot = Some(stream);
        first = false;
    }

    Ok(sockets)
}

/// Connects and reads one liveness-probe byte, retrying up to
/// `FORWARD_CONNECT_ATTEMPTS` times at `FORWARD_CONNECT_DELAY` cadence,
/// because the tunnel mapping can succeed before the remote server is
/// actually listening (§4.G).
async fn connect_with_liveness_probe(host: &str, port: u16, intr: &Intr) -> Result<TcpStream> {
    let cancelled = intr.child_token();

    for attempt in 1..=FORWARD_CONNECT_ATTEMPTS {
        if attempt > 1 {
            tokio::select! {
                biased;
                _ = cancelled.cancelled() => return Err(ScError::Cancelled),
                _ = tokio::time::sleep(FORWARD_CONNECT_DELAY) => {}
            }
        }

        let mut stream = match intr.guard(TcpStream::connect((host, port))).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(_)) => continue,
            Err(e) => return Err(e),
        };

        let mut probe = [0u8; 1];
        match intr.guard(stream.read_exact(&mut probe)).await {
            Ok(Ok(1)) => return Ok(stream),
            _ => continue,
        }
    }

    Err(ScError::HandshakeFailed(format!(
        "no liveness byte received after {FORWARD_CONNECT_ATTEMPTS} attempts"
    )))
}

/// Reads the fixed-length device-name header from the first established
/// socket in `video, audio, control` order, truncating at the first NUL.
async fn read_device_name(sockets: &mut EstablishedSockets, intr: &Intr) -> Result<String> {
    let stream = sockets
        .video
        .as_mut()
        .or(sockets.audio.as_mut())
        .or(sockets.control.as_mut())
        .ok_or_else(|| ScError::HandshakeFailed("no socket established".to_string()))?;

    let mut buf = [0u8; DEVICE_NAME_FIELD_LENGTH];
    intr.guard(stream.read_exact(&mut buf))
        .await?
        .map_err(|_| ScError::HandshakeFailed("device name header truncated".to_string()))?;

    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    Ok(String::from_utf8_lossy(&buf[..end]).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adb::test_support::FakeAdb;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn reverse_establish_reads_device_name_in_order() {
        let adb = FakeAdb::default();
        let intr = Intr::new();
        let mut tunnel = Tunnel::open(&adb, &intr, "A1B2C3", "scrcpy_0a1b2c3d", (27583, 27590), false)
            .await
            .unwrap();
        let port = tunnel.local_port();

        let remote = tokio::spawn(async move {
            let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
            let mut name = [0u8; DEVICE_NAME_FIELD_LENGTH];
            name[..5].copy_from_slice(b"Pixel");
            stream.write_all(&name).await.unwrap();
        });

        let requested = RequestedStreams {
            video: true,
            audio: false,
            control: false,
        };
        let sockets = establish(&mut tunnel, &adb, &intr, "A1B2C3", requested, None, None)
            .await
            .unwrap();
        remote.await.unwrap();

        assert_eq!(sockets.device_name, "Pixel");
        assert!(sockets.video.is_some());
    }

    #[tokio::test]
    async fn forward_establish_retries_until_remote_listens() {
        let adb = FakeAdb::default();
        let intr = Intr::new();
        let tunnel = Tunnel::open(&adb, &intr, "A1B2C3", "scrcpy_0a1b2c3d", (27683, 27690), true)
            .await
            .unwrap();
        let port = tunnel.local_port();

        let accept_task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(&[0u8]).await.unwrap();
            let mut name = [0u8; DEVICE_NAME_FIELD_LENGTH];
            name[..6].copy_from_slice(b"Galaxy");
            stream.write_all(&name).await.unwrap();
        });

        let requested = RequestedStreams {
            video: true,
            audio: false,
            control: false,
        };
        let mut tunnel = tunnel;
        let sockets = establish(&mut tunnel, &adb, &intr, "A1B2C3", requested, None, None)
            .await
            .unwrap();
        accept_task.await.unwrap();

        assert_eq!(sockets.device_name, "Galaxy");
    }

    #[test]
    fn requested_streams_count() {
        let r = RequestedStreams {
            video: true,
            audio: true,
            control: false,
        };
        assert_eq!(r.count(), 2);
    }
}
