//! Fixtures shared by unit tests: a minimal HTTP server, WAV and Ogg/Opus
//! bytes, and a scripted audio backend with a manual clock.

use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use crate::audio::buffer::SampleBuffer;
use crate::audio::context::{AudioBackend, BackendFactory, PlaybackNode};
use crate::error::ViewerError;

// ---------------------------------------------------------------------------
// HTTP
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub(crate) struct Route {
    /// Matched against the full request target first, then the bare path.
    pub path: String,
    pub status: u16,
    pub body: Vec<u8>,
    pub delay: Duration,
}

impl Route {
    pub fn ok(path: &str, body: impl Into<Vec<u8>>) -> Self {
        Self {
            path: path.to_string(),
            status: 200,
            body: body.into(),
            delay: Duration::ZERO,
        }
    }

    pub fn status(path: &str, status: u16) -> Self {
        Self {
            path: path.to_string(),
            status,
            body: Vec::new(),
            delay: Duration::ZERO,
        }
    }

    pub fn json(path: &str, status: u16, value: serde_json::Value) -> Self {
        Self {
            path: path.to_string(),
            status,
            body: value.to_string().into_bytes(),
            delay: Duration::ZERO,
        }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[derive(Debug, Clone)]
pub(crate) struct RecordedRequest {
    pub method: String,
    pub target: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

pub(crate) struct TestServer {
    pub base_url: String,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    handle: JoinHandle<()>,
}

impl TestServer {
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub(crate) async fn serve(routes: Vec<Route>) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let routes = Arc::new(routes);
    let requests = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&requests);

    let handle = tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let routes = Arc::clone(&routes);
            let recorded = Arc::clone(&recorded);
            tokio::spawn(async move {
                let _ = handle_connection(stream, &routes, &recorded).await;
            });
        }
    });

    TestServer {
        base_url: format!("http://{}", addr),
        requests,
        handle,
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    routes: &[Route],
    recorded: &Mutex<Vec<RecordedRequest>>,
) -> std::io::Result<()> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let mut lines = head.split("\r\n");
    let mut request_line = lines.next().unwrap_or_default().split_whitespace();
    let method = request_line.next().unwrap_or_default().to_string();
    let target = request_line.next().unwrap_or_default().to_string();
    let headers: Vec<(String, String)> = lines
        .filter_map(|l| l.split_once(':'))
        .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim().to_string()))
        .collect();
    let content_length = headers
        .iter()
        .find(|(k, _)| k == "content-length")
        .and_then(|(_, v)| v.parse::<usize>().ok())
        .unwrap_or(0);

    let mut body = buf[header_end..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }

    let path = target.split('?').next().unwrap_or_default().to_string();
    recorded.lock().unwrap().push(RecordedRequest {
        method: method.clone(),
        target: target.clone(),
        headers,
        body,
    });

    let route = routes
        .iter()
        .find(|r| r.path == target)
        .or_else(|| routes.iter().find(|r| r.path == path));
    let (status, payload, delay) = match route {
        Some(r) => (r.status, r.body.clone(), r.delay),
        None => (404, Vec::new(), Duration::ZERO),
    };
    // HEAD probes answer immediately so delays only hold up downloads.
    if !delay.is_zero() && method != "HEAD" {
        tokio::time::sleep(delay).await;
    }

    let reason = if (200..300).contains(&status) { "OK" } else { "Error" };
    let header = format!(
        "HTTP/1.1 {} {}\r\nContent-Length: {}\r\nContent-Type: application/octet-stream\r\nConnection: close\r\n\r\n",
        status,
        reason,
        payload.len()
    );
    stream.write_all(header.as_bytes()).await?;
    if method != "HEAD" {
        stream.write_all(&payload).await?;
    }
    stream.shutdown().await?;
    Ok(())
}

/// A URL on a local port nothing listens on.
pub(crate) fn closed_port_url() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    format!("http://127.0.0.1:{}", port)
}

/// 16-bit PCM WAV bytes of a quiet sine tone.
pub(crate) fn wav_bytes(seconds: f64, sample_rate: u32, channels: u16) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
        let frames = (seconds * sample_rate as f64) as usize;
        for i in 0..frames {
            let t = i as f64 / sample_rate as f64;
            let value = ((t * 440.0 * std::f64::consts::TAU).sin() * 8000.0) as i16;
            for _ in 0..channels {
                writer.write_sample(value).unwrap();
            }
        }
        writer.finalize().unwrap();
    }
    cursor.into_inner()
}

/// A 20 ms Opus silence frame at 48 kHz.
const OPUS_SILENCE: [u8; 3] = [0xF8, 0xFF, 0xFE];

/// An Ogg/Opus stream of `frames` silence frames, laid out the way voice
/// notes arrive: OpusHead page, OpusTags page, then one audio page.
pub(crate) fn ogg_opus_bytes(frames: usize, channels: u8, pre_skip: u16) -> Vec<u8> {
    let mut head = b"OpusHead".to_vec();
    head.push(1);
    head.push(channels);
    head.extend_from_slice(&pre_skip.to_le_bytes());
    head.extend_from_slice(&48_000u32.to_le_bytes());
    head.extend_from_slice(&0i16.to_le_bytes());
    head.push(0);

    let vendor = b"voicenote-viewer";
    let mut tags = b"OpusTags".to_vec();
    tags.extend_from_slice(&(vendor.len() as u32).to_le_bytes());
    tags.extend_from_slice(vendor);
    tags.extend_from_slice(&0u32.to_le_bytes());

    let audio = vec![OPUS_SILENCE.to_vec(); frames];
    let granule = (frames * 960) as u64;

    let mut out = Vec::new();
    out.extend(ogg_page(0x02, 0, 0, &[head]));
    out.extend(ogg_page(0x00, 0, 1, &[tags]));
    out.extend(ogg_page(0x04, granule, 2, &audio));
    out
}

fn ogg_page(flags: u8, granule: u64, sequence: u32, packets: &[Vec<u8>]) -> Vec<u8> {
    let mut lacing = Vec::new();
    let mut body = Vec::new();
    for packet in packets {
        let mut len = packet.len();
        while len >= 255 {
            lacing.push(255);
            len -= 255;
        }
        lacing.push(len as u8);
        body.extend_from_slice(packet);
    }
    assert!(lacing.len() <= 255, "too many segments for one page");

    let mut page = b"OggS".to_vec();
    page.push(0);
    page.push(flags);
    page.extend_from_slice(&granule.to_le_bytes());
    page.extend_from_slice(&0x5654_4e31u32.to_le_bytes());
    page.extend_from_slice(&sequence.to_le_bytes());
    page.extend_from_slice(&[0; 4]);
    page.push(lacing.len() as u8);
    page.extend_from_slice(&lacing);
    page.extend_from_slice(&body);

    let crc = ogg_crc(&page);
    page[22..26].copy_from_slice(&crc.to_le_bytes());
    page
}

/// CRC-32 as Ogg defines it: polynomial 0x04C11DB7, no reflection, zero
/// initial value and no final xor.
fn ogg_crc(data: &[u8]) -> u32 {
    let mut crc = 0u32;
    for &byte in data {
        crc ^= (byte as u32) << 24;
        for _ in 0..8 {
            crc = if crc & 0x8000_0000 != 0 {
                (crc << 1) ^ 0x04C1_1DB7
            } else {
                crc << 1
            };
        }
    }
    crc
}

// ---------------------------------------------------------------------------
// Audio
// ---------------------------------------------------------------------------

/// Observable state shared by every mock backend created from it.
#[derive(Clone, Default)]
pub(crate) struct MockAudio {
    clock: Arc<Mutex<f64>>,
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    starts: Arc<Mutex<Vec<f64>>>,
    volumes: Arc<Mutex<Vec<f32>>>,
    closed: Arc<AtomicUsize>,
    opened: Arc<AtomicUsize>,
    fail_start: Arc<AtomicBool>,
    fail_open: Arc<AtomicBool>,
}

impl MockAudio {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_clock(&self, secs: f64) {
        *self.clock.lock().unwrap() = secs;
    }

    pub fn backend(&self) -> MockBackend {
        MockBackend {
            audio: self.clone(),
        }
    }

    pub fn factory(&self) -> BackendFactory {
        let audio = self.clone();
        Arc::new(move || {
            if audio.fail_open.load(Ordering::SeqCst) {
                return Err(ViewerError::PlaybackError("no output device".into()));
            }
            audio.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(audio.backend()) as Box<dyn AudioBackend>)
        })
    }

    pub fn fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    pub fn fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }

    /// Nodes currently started and not stopped.
    pub fn active_nodes(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously active nodes seen.
    pub fn peak_nodes(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Offsets every node was started at, in order.
    pub fn start_offsets(&self) -> Vec<f64> {
        self.starts.lock().unwrap().clone()
    }

    pub fn last_volume(&self) -> Option<f32> {
        self.volumes.lock().unwrap().last().copied()
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

pub(crate) struct MockBackend {
    audio: MockAudio,
}

impl AudioBackend for MockBackend {
    fn now(&self) -> f64 {
        *self.audio.clock.lock().unwrap()
    }

    fn start_node(
        &mut self,
        _buffer: &SampleBuffer,
        offset_secs: f64,
        volume: f32,
    ) -> Result<Box<dyn PlaybackNode>, ViewerError> {
        if self.audio.fail_start.load(Ordering::SeqCst) {
            return Err(ViewerError::PlaybackError("node refused to start".into()));
        }
        let active = self.audio.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.audio.peak.fetch_max(active, Ordering::SeqCst);
        self.audio.starts.lock().unwrap().push(offset_secs);
        self.audio.volumes.lock().unwrap().push(volume);
        Ok(Box::new(MockNode {
            audio: self.audio.clone(),
            stopped: false,
        }))
    }

    fn close(&mut self) {
        self.audio.closed.fetch_add(1, Ordering::SeqCst);
    }
}

struct MockNode {
    audio: MockAudio,
    stopped: bool,
}

impl PlaybackNode for MockNode {
    fn set_volume(&mut self, volume: f32) {
        self.audio.volumes.lock().unwrap().push(volume);
    }

    fn stop(&mut self) {
        if !self.stopped {
            self.stopped = true;
            self.audio.active.fetch_sub(1, Ordering::SeqCst);
        }
    }
}
