use std::time::Duration;

use anyhow::Context;
use cobble_process::{PlayerSample, ServerListing};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};

/// Larger responses are treated as garbage.
const MAX_JSON_BYTES: usize = 256 * 1024;
const MAX_VARINT_BYTES: usize = 5;
const NEXT_STATE_STATUS: i32 = 1;

pub fn encode_varint(value: i32) -> Vec<u8> {
    let mut v = value as u32;
    let mut out = Vec::with_capacity(MAX_VARINT_BYTES);
    loop {
        let byte = (v & 0x7F) as u8;
        v >>= 7;
        if v == 0 {
            out.push(byte);
            return out;
        }
        out.push(byte | 0x80);
    }
}

/// Returns the value and the number of bytes consumed.
pub fn decode_varint(buf: &[u8]) -> Option<(i32, usize)> {
    let mut value: u32 = 0;
    for (i, byte) in buf.iter().take(MAX_VARINT_BYTES).enumerate() {
        value |= u32::from(byte & 0x7F) << (7 * i);
        if byte & 0x80 == 0 {
            return Some((value as i32, i + 1));
        }
    }
    None
}

async fn read_varint<R: AsyncRead + Unpin>(r: &mut R) -> anyhow::Result<i32> {
    let mut value: u32 = 0;
    for i in 0..MAX_VARINT_BYTES {
        let byte = r.read_u8().await.context("read varint")?;
        value |= u32::from(byte & 0x7F) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(value as i32);
        }
    }
    anyhow::bail!("varint longer than {MAX_VARINT_BYTES} bytes")
}

fn frame(payload: &[u8]) -> Vec<u8> {
    let mut out = encode_varint(payload.len() as i32);
    out.extend_from_slice(payload);
    out
}

fn handshake_packet(host: &str, port: u16) -> Vec<u8> {
    let mut payload = vec![0x00];
    payload.extend(encode_varint(-1));
    payload.extend(encode_varint(host.len() as i32));
    payload.extend_from_slice(host.as_bytes());
    payload.extend_from_slice(&port.to_be_bytes());
    payload.extend(encode_varint(NEXT_STATE_STATUS));
    frame(&payload)
}

#[derive(Debug, Default, serde::Deserialize)]
struct StatusResponse {
    #[serde(default)]
    players: Option<Players>,
    #[serde(default)]
    version: Option<Version>,
    #[serde(default)]
    description: Option<serde_json::Value>,
}

#[derive(Debug, Default, serde::Deserialize)]
struct Players {
    #[serde(default)]
    online: u32,
    #[serde(default)]
    max: u32,
    #[serde(default)]
    sample: Vec<PlayerSample>,
}

#[derive(Debug, Default, serde::Deserialize)]
struct Version {
    #[serde(default)]
    name: String,
}

/// Flattens a plain or rich-text chat component into its visible text.
fn flatten_text(value: &serde_json::Value, out: &mut String) {
    match value {
        serde_json::Value::String(s) => out.push_str(s),
        serde_json::Value::Array(items) => {
            for item in items {
                flatten_text(item, out);
            }
        }
        serde_json::Value::Object(map) => {
            if let Some(text) = map.get("text") {
                flatten_text(text, out);
            }
            if let Some(extra) = map.get("extra") {
                flatten_text(extra, out);
            }
        }
        _ => {}
    }
}

pub fn parse_status_json(raw: &[u8]) -> anyhow::Result<ServerListing> {
    let resp: StatusResponse = serde_json::from_slice(raw).context("parse status json")?;
    let players = resp.players.unwrap_or_default();
    let motd = resp.description.map(|d| {
        let mut s = String::new();
        flatten_text(&d, &mut s);
        s
    });
    Ok(ServerListing {
        online: true,
        players_online: players.online,
        players_max: players.max,
        sample: players.sample,
        version: resp.version.map(|v| v.name).filter(|v| !v.is_empty()),
        motd,
    })
}

async fn exchange(host: &str, port: u16) -> anyhow::Result<ServerListing> {
    let mut stream = TcpStream::connect((host, port))
        .await
        .with_context(|| format!("connect {host}:{port}"))?;
    stream.set_nodelay(true).ok();

    let mut request = handshake_packet(host, port);
    request.extend(frame(&[0x00]));
    stream.write_all(&request).await.context("send handshake")?;

    let _frame_len = read_varint(&mut stream).await?;
    let _packet_id = read_varint(&mut stream).await?;
    let json_len = read_varint(&mut stream).await?;
    let json_len = usize::try_from(json_len).context("negative json length")?;
    if json_len > MAX_JSON_BYTES {
        anyhow::bail!("status json too large ({json_len} bytes)");
    }

    let mut buf = vec![0u8; json_len];
    stream
        .read_exact(&mut buf)
        .await
        .context("read status json")?;
    parse_status_json(&buf)
}

/// Queries `host:port`, returning an unreachable listing on any failure.
pub async fn query_status(host: &str, port: u16, timeout: Duration) -> ServerListing {
    match tokio::time::timeout(timeout, exchange(host, port)).await {
        Ok(Ok(listing)) => listing,
        Ok(Err(err)) => {
            tracing::trace!(host, port, error = %crate::error::format_error_chain(&err), "status query failed");
            ServerListing::unreachable()
        }
        Err(_) => {
            tracing::trace!(host, port, timeout_ms = timeout.as_millis() as u64, "status query timed out");
            ServerListing::unreachable()
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;

    #[test]
    fn varint_sizes() {
        assert_eq!(encode_varint(0), vec![0x00]);
        assert_eq!(encode_varint(127).len(), 1);
        assert_eq!(encode_varint(128).len(), 2);
        assert_eq!(encode_varint(300), vec![0xAC, 0x02]);
        assert_eq!(encode_varint(-1), vec![0xFF, 0xFF, 0xFF, 0xFF, 0x0F]);
    }

    #[test]
    fn varint_decodes_what_it_encodes() {
        assert_eq!(decode_varint(&encode_varint(300)), Some((300, 2)));
        assert_eq!(decode_varint(&encode_varint(-1)), Some((-1, 5)));
    }

    #[test]
    fn varint_rejects_truncated_and_overlong() {
        assert_eq!(decode_varint(&[0x80]), None);
        assert_eq!(decode_varint(&[0xFF; 6]), None);
    }

    #[test]
    fn handshake_layout() {
        let pkt = handshake_packet("localhost", 25565);
        let (len, used) = decode_varint(&pkt).unwrap();
        assert_eq!(len as usize, pkt.len() - used);
        let body = &pkt[used..];
        assert_eq!(body[0], 0x00);
        assert_eq!(&body[1..6], &[0xFF, 0xFF, 0xFF, 0xFF, 0x0F]);
        assert_eq!(body[6], 9);
        assert_eq!(&body[7..16], b"localhost");
        assert_eq!(&body[16..18], &25565u16.to_be_bytes());
        assert_eq!(body[18], 1);
    }

    #[test]
    fn rich_motd_is_flattened() {
        let raw = br#"{
            "version": {"name": "1.21.1", "protocol": 767},
            "players": {"online": 1, "max": 20, "sample": [{"name": "Alice", "id": "0000"}]},
            "description": {"text": "A ", "extra": [{"text": "Cobble"}, " server"]}
        }"#;
        let listing = parse_status_json(raw).unwrap();
        assert!(listing.online);
        assert_eq!(listing.players_online, 1);
        assert_eq!(listing.players_max, 20);
        assert_eq!(listing.sample[0].name, "Alice");
        assert_eq!(listing.version.as_deref(), Some("1.21.1"));
        assert_eq!(listing.motd.as_deref(), Some("A Cobble server"));
    }

    #[test]
    fn plain_motd_is_kept() {
        let listing = parse_status_json(br#"{"description": "hello"}"#).unwrap();
        assert_eq!(listing.motd.as_deref(), Some("hello"));
        assert_eq!(listing.players_max, 0);
    }

    async fn fake_server(json: &'static str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            // Handshake frame, then status request frame.
            for _ in 0..2 {
                let len = read_varint(&mut sock).await.unwrap();
                let mut body = vec![0u8; len as usize];
                sock.read_exact(&mut body).await.unwrap();
            }
            let mut packet = encode_varint(0);
            packet.extend(encode_varint(json.len() as i32));
            packet.extend_from_slice(json.as_bytes());
            sock.write_all(&frame(&packet)).await.unwrap();
        });
        port
    }

    #[tokio::test]
    async fn queries_fake_server() {
        let port = fake_server(r#"{"players":{"online":2,"max":10},"version":{"name":"Paper 1.20.4"},"description":{"text":"hi"}}"#).await;
        let listing = query_status("127.0.0.1", port, Duration::from_secs(2)).await;
        assert!(listing.online);
        assert_eq!(listing.players_online, 2);
        assert_eq!(listing.players_max, 10);
        assert_eq!(listing.version.as_deref(), Some("Paper 1.20.4"));
    }

    #[tokio::test]
    async fn closed_port_is_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let listing = query_status("127.0.0.1", port, Duration::from_millis(600)).await;
        assert_eq!(listing, ServerListing::unreachable());
    }

    #[tokio::test]
    async fn silent_server_times_out_as_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (_sock, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });
        let started = std::time::Instant::now();
        let listing = query_status("127.0.0.1", port, Duration::from_millis(200)).await;
        assert!(!listing.online);
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
