use rand::Rng;
use ring::digest;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use hyper_util::rt::TokioIo;
use rustls_pki_types::ServerName;

use crate::http::{Body, Request, Response, StatusCode, header};
use crate::proxy::handler::upstream_tls_config;
use crate::scan::{ScanMode, InjectionScanner, ScannerState};
use crate::types::action::Destination;
use crate::*;

pub mod opcode {
	pub const CONTINUATION: u8 = 0x0;
	pub const TEXT: u8 = 0x1;
	pub const BINARY: u8 = 0x2;
	pub const CLOSE: u8 = 0x8;
	pub const PING: u8 = 0x9;
	pub const PONG: u8 = 0xa;
}

/// Frames larger than this abort the relay rather than buffer unbounded.
const MAX_FRAME_PAYLOAD: u64 = 16 * 1024 * 1024;
const MAX_HANDSHAKE_BYTES: usize = 16 * 1024;

/// Normal-closure close frame body (code 1000).
const CLOSE_NORMAL: &[u8] = &[0x03, 0xe8];

pub trait Io: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Io for T {}

/// Wraps a non-`Sync` writer so it can live behind an `Arc`. Sound because
/// `tokio::sync::Mutex` only ever grants one task access to the inner value
/// at a time, which is exactly what `Sync` requires.
struct SyncWriteHalf(WriteHalf<Box<dyn Io>>);
unsafe impl Sync for SyncWriteHalf {}

impl AsyncWrite for SyncWriteHalf {
	fn poll_write(
		self: std::pin::Pin<&mut Self>,
		cx: &mut std::task::Context<'_>,
		buf: &[u8],
	) -> std::task::Poll<std::io::Result<usize>> {
		std::pin::Pin::new(&mut self.get_mut().0).poll_write(cx, buf)
	}

	fn poll_flush(
		self: std::pin::Pin<&mut Self>,
		cx: &mut std::task::Context<'_>,
	) -> std::task::Poll<std::io::Result<()>> {
		std::pin::Pin::new(&mut self.get_mut().0).poll_flush(cx)
	}

	fn poll_shutdown(
		self: std::pin::Pin<&mut Self>,
		cx: &mut std::task::Context<'_>,
	) -> std::task::Poll<std::io::Result<()>> {
		std::pin::Pin::new(&mut self.get_mut().0).poll_shutdown(cx)
	}
}

type SharedWriter = Arc<AsyncMutex<SyncWriteHalf>>;

#[derive(Debug, PartialEq)]
pub struct Frame {
	pub fin: bool,
	pub opcode: u8,
	pub payload: Vec<u8>,
}

/// Relay for upgraded WebSocket connections. Performs the 101 handshake
/// against the upstream itself and inspects frames in both directions.
pub struct WebSocketRelay {
	scanner: Arc<InjectionScanner>,
	state: Arc<ScannerState>,
	tls: TlsConnector,
}

impl WebSocketRelay {
	pub fn new(scanner: Arc<InjectionScanner>, state: Arc<ScannerState>) -> Self {
		WebSocketRelay {
			scanner,
			state,
			tls: TlsConnector::from(Arc::new(upstream_tls_config())),
		}
	}

	/// Dial the upstream, replay the upgrade, and (on 101) bridge the two
	/// connections frame by frame.
	pub async fn proxy(&self, mut req: Request, dest: &Destination) -> anyhow::Result<Response> {
		let use_tls = matches!(dest.scheme.as_str(), "https" | "wss");
		let port = if dest.port != 0 {
			dest.port
		} else if use_tls {
			443
		} else {
			80
		};
		let host = if dest.domain.is_empty() {
			dest
				.ip
				.map(|ip| ip.to_string())
				.ok_or_else(|| anyhow::anyhow!("websocket request has no destination"))?
		} else {
			dest.domain.to_string()
		};

		let stream = match dest.ip {
			Some(ip) => TcpStream::connect(SocketAddr::new(ip, port)).await?,
			None => TcpStream::connect((host.as_str(), port)).await?,
		};
		let mut upstream: Box<dyn Io> = if use_tls {
			let name = ServerName::try_from(host.clone())?;
			Box::new(self.tls.connect(name, stream).await?)
		} else {
			Box::new(stream)
		};

		let path = req
			.uri()
			.path_and_query()
			.map(|pq| pq.as_str().to_string())
			.unwrap_or_else(|| "/".to_string());
		let mut handshake = format!(
			"GET {path} HTTP/1.1\r\nHost: {host}\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n"
		);
		for (name, value) in req.headers() {
			if name.as_str().starts_with("sec-websocket-")
				&& let Ok(value) = value.to_str()
			{
				handshake.push_str(&format!("{name}: {value}\r\n"));
			}
		}
		handshake.push_str("\r\n");
		upstream.write_all(handshake.as_bytes()).await?;
		upstream.flush().await?;

		let (status, headers) = read_response_head(&mut upstream).await?;
		if status != StatusCode::SWITCHING_PROTOCOLS {
			debug!(%status, host = host.as_str(), "upstream refused websocket upgrade");
			let mut resp = ::http::Response::builder().status(status);
			for (name, value) in &headers {
				resp = resp.header(name.as_str(), value.as_str());
			}
			return Ok(resp.body(Body::empty())?);
		}

		let on_upgrade = hyper::upgrade::on(&mut req);
		let scanner = self.scanner.clone();
		let state = self.state.clone();
		tokio::spawn(async move {
			let upgraded = match on_upgrade.await {
				Ok(upgraded) => upgraded,
				Err(e) => {
					debug!("client upgrade failed: {e}");
					return;
				},
			};
			let client: Box<dyn Io> = Box::new(TokioIo::new(upgraded));
			relay(client, upstream, scanner, state).await;
		});

		let mut resp = ::http::Response::builder()
			.status(StatusCode::SWITCHING_PROTOCOLS)
			.header(header::CONNECTION, "Upgrade")
			.header(header::UPGRADE, "websocket");
		for (name, value) in &headers {
			if name.eq_ignore_ascii_case("connection") || name.eq_ignore_ascii_case("upgrade") {
				continue;
			}
			resp = resp.header(name.as_str(), value.as_str());
		}
		Ok(resp.body(Body::empty())?)
	}
}

async fn relay(
	client: Box<dyn Io>,
	upstream: Box<dyn Io>,
	scanner: Arc<InjectionScanner>,
	state: Arc<ScannerState>,
) {
	let (client_read, client_write) = tokio::io::split(client);
	let (upstream_read, upstream_write) = tokio::io::split(upstream);
	let client_write: SharedWriter = Arc::new(AsyncMutex::new(SyncWriteHalf(client_write)));
	let upstream_write: SharedWriter = Arc::new(AsyncMutex::new(SyncWriteHalf(upstream_write)));
	let cancel = CancellationToken::new();

	// Client frames arrive masked and leave masked with a fresh key; server
	// frames are never masked.
	let to_upstream = pump(PumpConfig {
		label: "client->upstream",
		reader: client_read,
		forward: upstream_write.clone(),
		forward_masked: true,
		block_notify: client_write.clone(),
		block_masked: false,
		scanner: scanner.clone(),
		state: state.clone(),
		cancel: cancel.clone(),
	});
	let to_client = pump(PumpConfig {
		label: "upstream->client",
		reader: upstream_read,
		forward: client_write,
		forward_masked: false,
		block_notify: upstream_write,
		block_masked: true,
		scanner,
		state,
		cancel,
	});
	let _ = tokio::join!(to_upstream, to_client);
}

struct PumpConfig {
	label: &'static str,
	reader: ReadHalf<Box<dyn Io>>,
	/// Writer toward the frame's destination.
	forward: SharedWriter,
	forward_masked: bool,
	/// Writer back toward whoever would have received the blocked frame's
	/// counterpart; receives the close frame on enforcement.
	block_notify: SharedWriter,
	block_masked: bool,
	scanner: Arc<InjectionScanner>,
	state: Arc<ScannerState>,
	cancel: CancellationToken,
}

async fn pump(mut cfg: PumpConfig) {
	loop {
		let frame = tokio::select! {
			_ = cfg.cancel.cancelled() => return,
			frame = read_frame(&mut cfg.reader) => match frame {
				Ok(frame) => frame,
				Err(e) => {
					debug!(direction = cfg.label, "relay read ended: {e}");
					cfg.cancel.cancel();
					return;
				},
			},
		};

		match frame.opcode {
			opcode::TEXT if cfg.state.enabled() => {
				let text = String::from_utf8_lossy(&frame.payload);
				let result = cfg.scanner.scan(&text);
				if result.detected {
					warn!(
						direction = cfg.label,
						patterns = ?result.pattern_names(),
						mode = ?cfg.state.mode(),
						"prompt injection detected in websocket frame"
					);
					if cfg.state.mode() == ScanMode::Enforce {
						let mut w = cfg.block_notify.lock().await;
						let _ = write_frame(&mut *w, opcode::CLOSE, CLOSE_NORMAL, cfg.block_masked).await;
						cfg.cancel.cancel();
						return;
					}
				}
				if forward(&cfg.forward, cfg.forward_masked, &cfg.cancel, &frame).await.is_err() {
					return;
				}
			},
			opcode::BINARY => {
				let hash = digest::digest(&digest::SHA256, &frame.payload);
				debug!(
					direction = cfg.label,
					len = frame.payload.len(),
					sha256 = hex::encode(hash.as_ref()),
					"binary frame"
				);
				if forward(&cfg.forward, cfg.forward_masked, &cfg.cancel, &frame).await.is_err() {
					return;
				}
			},
			opcode::CLOSE => {
				let _ = forward(&cfg.forward, cfg.forward_masked, &cfg.cancel, &frame).await;
				cfg.cancel.cancel();
				return;
			},
			_ => {
				if forward(&cfg.forward, cfg.forward_masked, &cfg.cancel, &frame).await.is_err() {
					return;
				}
			},
		}
	}
}

async fn forward(
	forward: &SharedWriter,
	forward_masked: bool,
	cancel: &CancellationToken,
	frame: &Frame,
) -> std::io::Result<()> {
	let mut w = forward.lock().await;
	let res = write_frame(&mut *w, frame.opcode, &frame.payload, forward_masked).await;
	if res.is_err() {
		cancel.cancel();
	}
	res
}

/// Read one frame, unmasking if needed (RFC 6455 §5.2).
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> std::io::Result<Frame> {
	let mut head = [0u8; 2];
	r.read_exact(&mut head).await?;
	let fin = head[0] & 0x80 != 0;
	let op = head[0] & 0x0f;
	let masked = head[1] & 0x80 != 0;
	let mut len = (head[1] & 0x7f) as u64;
	if len == 126 {
		let mut ext = [0u8; 2];
		r.read_exact(&mut ext).await?;
		len = u16::from_be_bytes(ext) as u64;
	} else if len == 127 {
		let mut ext = [0u8; 8];
		r.read_exact(&mut ext).await?;
		len = u64::from_be_bytes(ext);
	}
	if len > MAX_FRAME_PAYLOAD {
		return Err(std::io::Error::new(
			std::io::ErrorKind::InvalidData,
			format!("frame of {len} bytes exceeds limit"),
		));
	}
	let mut key = [0u8; 4];
	if masked {
		r.read_exact(&mut key).await?;
	}
	let mut payload = vec![0u8; len as usize];
	r.read_exact(&mut payload).await?;
	if masked {
		for (i, b) in payload.iter_mut().enumerate() {
			*b ^= key[i % 4];
		}
	}
	Ok(Frame {
		fin,
		opcode: op,
		payload,
	})
}

/// Write one frame with FIN set. Masked writes use a fresh random key.
pub async fn write_frame<W: AsyncWrite + Unpin>(
	w: &mut W,
	op: u8,
	payload: &[u8],
	masked: bool,
) -> std::io::Result<()> {
	let mut head = Vec::with_capacity(14);
	head.push(0x80 | (op & 0x0f));
	let mask_bit = if masked { 0x80 } else { 0x00 };
	let len = payload.len();
	if len < 126 {
		head.push(mask_bit | len as u8);
	} else if len <= u16::MAX as usize {
		head.push(mask_bit | 126);
		head.extend_from_slice(&(len as u16).to_be_bytes());
	} else {
		head.push(mask_bit | 127);
		head.extend_from_slice(&(len as u64).to_be_bytes());
	}
	if masked {
		let key: [u8; 4] = rand::rng().random();
		head.extend_from_slice(&key);
		w.write_all(&head).await?;
		let body: Vec<u8> = payload
			.iter()
			.enumerate()
			.map(|(i, b)| b ^ key[i % 4])
			.collect();
		w.write_all(&body).await?;
	} else {
		w.write_all(&head).await?;
		w.write_all(payload).await?;
	}
	w.flush().await
}

/// Read an HTTP/1.x response head byte-by-byte so no frame bytes are
/// consumed past the blank line.
async fn read_response_head<R: AsyncRead + Unpin>(
	r: &mut R,
) -> anyhow::Result<(StatusCode, Vec<(String, String)>)> {
	let mut buf = Vec::with_capacity(512);
	let mut byte = [0u8; 1];
	while !buf.ends_with(b"\r\n\r\n") {
		if buf.len() >= MAX_HANDSHAKE_BYTES {
			anyhow::bail!("upstream handshake response too large");
		}
		r.read_exact(&mut byte).await?;
		buf.push(byte[0]);
	}
	let head = String::from_utf8_lossy(&buf);
	let mut lines = head.split("\r\n");
	let status_line = lines.next().unwrap_or_default();
	let code = status_line
		.split_whitespace()
		.nth(1)
		.and_then(|c| c.parse::<u16>().ok())
		.ok_or_else(|| anyhow::anyhow!("malformed status line: {status_line}"))?;
	let status = StatusCode::from_u16(code)?;
	let headers = lines
		.filter(|l| !l.is_empty())
		.filter_map(|l| {
			let (name, value) = l.split_once(':')?;
			Some((name.trim().to_string(), value.trim().to_string()))
		})
		.collect();
	Ok((status, headers))
}

#[cfg(test)]
#[path = "websocket_tests.rs"]
mod tests;
