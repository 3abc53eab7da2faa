//! Decode pipeline: download an audio resource and decode it into a
//! [`SampleBuffer`] with Symphonia. Ogg/Opus voice notes are demuxed by
//! Symphonia and decoded with libopus.

use std::time::Duration;

use audiopus::coder::Decoder as OpusDecoder;
use audiopus::{Channels, SampleRate as OpusSampleRate};
use symphonia::core::audio::SampleBuffer as SymphoniaSamples;
use symphonia::core::codecs::{CodecParameters, DecoderOptions, CODEC_TYPE_NULL, CODEC_TYPE_OPUS};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, Packet};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::{debug, info, warn};

use super::buffer::SampleBuffer;
use crate::error::ViewerError;

/// Fetches and decodes audio resources.
#[derive(Clone)]
pub struct Decoder {
    client: reqwest::Client,
    timeout: Option<Duration>,
}

impl Decoder {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            timeout: None,
        }
    }

    /// Bound every download by `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Download the raw bytes at `url`.
    pub async fn fetch(&self, url: &str) -> Result<Vec<u8>, ViewerError> {
        let mut req = self.client.get(url);
        if let Some(timeout) = self.timeout {
            req = req.timeout(timeout);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| ViewerError::DownloadError(format!("request failed: {}", e)))?;

        if !resp.status().is_success() {
            return Err(ViewerError::DownloadError(format!(
                "server returned {}",
                resp.status()
            )));
        }

        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| ViewerError::DownloadError(format!("failed to read body: {}", e)))?;

        debug!(url, bytes = bytes.len(), content_type = ?content_type, "Audio downloaded");
        Ok(bytes.to_vec())
    }

    /// Decode on the blocking pool so the event loop keeps running.
    pub async fn decode(
        &self,
        bytes: Vec<u8>,
        extension: Option<String>,
    ) -> Result<SampleBuffer, ViewerError> {
        tokio::task::spawn_blocking(move || decode_bytes(bytes, extension.as_deref()))
            .await
            .map_err(|e| ViewerError::DecodeError(format!("decode task failed: {}", e)))?
    }

}

/// Opus always decodes at 48 kHz.
const OPUS_RATE: u32 = 48_000;
/// Longest Opus packet: 120 ms at 48 kHz, per channel.
const OPUS_MAX_FRAME: usize = 5760;

/// The parts of an OpusHead identification header the decoder needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct OpusHead {
    pub channels: u16,
    /// Frames at 48 kHz to discard from the start of the decoded stream.
    pub pre_skip: usize,
}

impl OpusHead {
    /// Read the header the Ogg demuxer leaves in `extra_data`, falling back
    /// to the generic codec parameters when it is absent.
    pub(crate) fn from_params(params: &CodecParameters) -> Self {
        let header = params
            .extra_data
            .as_deref()
            .filter(|h| h.len() >= 19 && h.starts_with(b"OpusHead"));
        match header {
            Some(h) => Self {
                channels: h[9] as u16,
                pre_skip: u16::from_le_bytes([h[10], h[11]]) as usize,
            },
            None => Self {
                channels: params.channels.map(|c| c.count() as u16).unwrap_or(0),
                pre_skip: params.delay.unwrap_or(0) as usize,
            },
        }
    }

    fn layout(&self) -> Result<Channels, ViewerError> {
        match self.channels {
            1 => Ok(Channels::Mono),
            2 => Ok(Channels::Stereo),
            n => Err(ViewerError::DecodeError(format!(
                "unsupported Opus channel count: {}",
                n
            ))),
        }
    }
}

/// PCM collected from a track before it becomes a [`SampleBuffer`].
struct Decoded {
    samples: Vec<f32>,
    channels: u16,
    sample_rate: u32,
    skipped: usize,
}

/// Next packet of `track_id`, or `None` at end of stream. Read errors after
/// some audio decoded end the stream early instead of failing it.
fn next_track_packet(
    format: &mut dyn FormatReader,
    track_id: u32,
    decoded_any: bool,
) -> Result<Option<Packet>, ViewerError> {
    loop {
        let packet = match format.next_packet() {
            Ok(p) => p,
            Err(SymphoniaError::IoError(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Ok(None);
            }
            Err(SymphoniaError::ResetRequired) => return Ok(None),
            Err(e) => {
                if !decoded_any {
                    return Err(ViewerError::DecodeError(format!("failed to read packet: {}", e)));
                }
                warn!("Stream ended early: {}", e);
                return Ok(None);
            }
        };
        if packet.track_id() == track_id {
            return Ok(Some(packet));
        }
    }
}

/// Decode a complete encoded file into interleaved f32 samples.
///
/// Corrupt packets are skipped. The call fails when the container cannot be
/// probed, the codec is unsupported, or no audio decodes at all.
pub fn decode_bytes(bytes: Vec<u8>, extension: Option<&str>) -> Result<SampleBuffer, ViewerError> {
    if bytes.is_empty() {
        return Err(ViewerError::DecodeError("empty audio file".into()));
    }

    let cursor = std::io::Cursor::new(bytes);
    let mss = MediaSourceStream::new(Box::new(cursor), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = extension {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| ViewerError::DecodeError(format!("unrecognised format: {}", e)))?;

    let mut format = probed.format;
    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| ViewerError::DecodeError("no audio track found".into()))?;
    let track_id = track.id;
    let params = track.codec_params.clone();

    let Decoded {
        samples,
        channels,
        sample_rate,
        skipped,
    } = if params.codec == CODEC_TYPE_OPUS {
        decode_opus(format.as_mut(), track_id, &params)?
    } else {
        decode_symphonia(format.as_mut(), track_id, &params)?
    };

    if samples.is_empty() {
        return Err(ViewerError::DecodeError("no audio could be decoded".into()));
    }

    let buffer = SampleBuffer::new(samples, channels, sample_rate).ok_or_else(|| {
        ViewerError::DecodeError(format!(
            "invalid stream parameters: {} channels at {} Hz",
            channels, sample_rate
        ))
    })?;

    info!(
        duration_secs = format!("{:.2}", buffer.duration_secs()),
        channels = buffer.channels(),
        sample_rate = buffer.sample_rate(),
        skipped_packets = skipped,
        "Audio decoded"
    );
    Ok(buffer)
}

fn decode_symphonia(
    format: &mut dyn FormatReader,
    track_id: u32,
    params: &CodecParameters,
) -> Result<Decoded, ViewerError> {
    let mut decoder = symphonia::default::get_codecs()
        .make(params, &DecoderOptions::default())
        .map_err(|e| ViewerError::DecodeError(format!("unsupported codec: {}", e)))?;

    let mut out = Decoded {
        samples: Vec::new(),
        channels: params.channels.map(|c| c.count() as u16).unwrap_or(0),
        sample_rate: params.sample_rate.unwrap_or(0),
        skipped: 0,
    };

    while let Some(packet) = next_track_packet(format, track_id, !out.samples.is_empty())? {
        let decoded = match decoder.decode(&packet) {
            Ok(d) => d,
            Err(SymphoniaError::DecodeError(e)) => {
                out.skipped += 1;
                debug!("Skipping corrupt packet: {}", e);
                continue;
            }
            Err(SymphoniaError::IoError(e)) => {
                out.skipped += 1;
                debug!("Skipping unreadable packet: {}", e);
                continue;
            }
            Err(e) => return Err(ViewerError::DecodeError(e.to_string())),
        };

        let spec = *decoded.spec();
        out.sample_rate = spec.rate;
        out.channels = spec.channels.count() as u16;

        let mut buf = SymphoniaSamples::<f32>::new(decoded.capacity() as u64, spec);
        buf.copy_interleaved_ref(decoded);
        out.samples.extend_from_slice(buf.samples());
    }
    Ok(out)
}

fn decode_opus(
    format: &mut dyn FormatReader,
    track_id: u32,
    params: &CodecParameters,
) -> Result<Decoded, ViewerError> {
    let head = OpusHead::from_params(params);
    let mut decoder = OpusDecoder::new(OpusSampleRate::Hz48000, head.layout()?)
        .map_err(|e| ViewerError::DecodeError(format!("failed to create Opus decoder: {}", e)))?;
    debug!(channels = head.channels, pre_skip = head.pre_skip, "Decoding Opus stream");

    let channels = head.channels as usize;
    let mut pcm = vec![0i16; OPUS_MAX_FRAME * channels];
    let mut to_skip = head.pre_skip * channels;
    let mut decoded_any = false;
    let mut out = Decoded {
        samples: Vec::new(),
        channels: head.channels,
        sample_rate: OPUS_RATE,
        skipped: 0,
    };

    while let Some(packet) = next_track_packet(format, track_id, decoded_any)? {
        let frames = match decoder.decode(Some(packet.buf()), &mut pcm[..], false) {
            Ok(n) => n,
            Err(e) => {
                out.skipped += 1;
                debug!("Skipping corrupt Opus packet: {}", e);
                continue;
            }
        };
        decoded_any = true;

        let frame = &pcm[..(frames * channels).min(pcm.len())];
        let trim = to_skip.min(frame.len());
        to_skip -= trim;
        out.samples
            .extend(frame[trim..].iter().map(|&s| s as f32 / i16::MAX as f32));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{closed_port_url, ogg_opus_bytes, serve, wav_bytes, Route};
    use symphonia::core::audio::Channels as ChannelMask;

    #[test]
    fn decodes_wav_into_interleaved_buffer() {
        let bytes = wav_bytes(0.5, 8000, 2);
        let buffer = decode_bytes(bytes, Some("wav")).unwrap();
        assert_eq!(buffer.channels(), 2);
        assert_eq!(buffer.sample_rate(), 8000);
        assert!((buffer.duration_secs() - 0.5).abs() < 0.01);
    }

    #[test]
    fn garbage_is_a_decode_error() {
        let err = decode_bytes(b"definitely not audio at all".to_vec(), Some("ogg")).unwrap_err();
        assert!(matches!(err, ViewerError::DecodeError(_)));
    }

    #[test]
    fn empty_input_is_a_decode_error() {
        let err = decode_bytes(Vec::new(), None).unwrap_err();
        assert!(matches!(err, ViewerError::DecodeError(_)));
    }

    #[test]
    fn decodes_ogg_opus_voice_note() {
        // 50 frames of 20 ms, minus the 312 frame pre-skip.
        let bytes = ogg_opus_bytes(50, 1, 312);
        let buffer = decode_bytes(bytes, Some("ogg")).unwrap();
        assert_eq!(buffer.channels(), 1);
        assert_eq!(buffer.sample_rate(), 48_000);
        let expected = (50.0 * 960.0 - 312.0) / 48_000.0;
        assert!(
            (buffer.duration_secs() - expected).abs() < 0.001,
            "duration {}",
            buffer.duration_secs()
        );
    }

    #[test]
    fn decodes_stereo_ogg_opus_without_hint() {
        let buffer = decode_bytes(ogg_opus_bytes(10, 2, 0), None).unwrap();
        assert_eq!(buffer.channels(), 2);
        assert_eq!(buffer.sample_rate(), 48_000);
        assert!((buffer.duration_secs() - 0.2).abs() < 0.001);
    }

    #[test]
    fn opus_head_reads_channels_and_pre_skip() {
        let mut header = b"OpusHead".to_vec();
        header.push(1);
        header.push(2);
        header.extend_from_slice(&3840u16.to_le_bytes());
        header.extend_from_slice(&48_000u32.to_le_bytes());
        header.extend_from_slice(&[0, 0, 0]);

        let mut params = CodecParameters::new();
        params.for_codec(CODEC_TYPE_OPUS).with_extra_data(header.into_boxed_slice());
        assert_eq!(
            OpusHead::from_params(&params),
            OpusHead { channels: 2, pre_skip: 3840 }
        );

        let mut params = CodecParameters::new();
        params
            .for_codec(CODEC_TYPE_OPUS)
            .with_channels(ChannelMask::FRONT_LEFT)
            .with_delay(120);
        assert_eq!(
            OpusHead::from_params(&params),
            OpusHead { channels: 1, pre_skip: 120 }
        );
    }

    #[test]
    fn surround_opus_is_a_decode_error() {
        let err = decode_bytes(ogg_opus_bytes(5, 6, 0), Some("opus")).unwrap_err();
        assert!(matches!(err, ViewerError::DecodeError(_)), "got {:?}", err);
    }

    #[tokio::test]
    async fn non_success_status_is_a_download_error() {
        let server = serve(vec![Route::status("/missing.ogg", 404)]).await;
        let decoder = Decoder::new(reqwest::Client::new());
        let err = decoder
            .fetch(&format!("{}/missing.ogg", server.base_url))
            .await
            .unwrap_err();
        assert!(matches!(err, ViewerError::DownloadError(_)), "got {:?}", err);
    }

    #[tokio::test]
    async fn network_failure_is_a_download_error() {
        let decoder = Decoder::new(reqwest::Client::new());
        let err = decoder
            .fetch(&format!("{}/a.wav", closed_port_url()))
            .await
            .unwrap_err();
        assert!(matches!(err, ViewerError::DownloadError(_)));
    }

    #[tokio::test]
    async fn fetches_and_decodes_off_the_event_loop() {
        let server = serve(vec![Route::ok("/note.wav", wav_bytes(1.0, 16_000, 1))]).await;
        let decoder = Decoder::new(reqwest::Client::new()).with_timeout(Duration::from_secs(5));
        let bytes = decoder
            .fetch(&format!("{}/note.wav", server.base_url))
            .await
            .unwrap();
        let buffer = decoder.decode(bytes, Some("wav".into())).await.unwrap();
        assert_eq!(buffer.channels(), 1);
        assert!((buffer.duration_secs() - 1.0).abs() < 0.01);
    }

    #[tokio::test]
    async fn slow_download_times_out() {
        let server = serve(vec![
            Route::ok("/slow.ogg", ogg_opus_bytes(5, 1, 0)).delayed(Duration::from_secs(2))
        ])
        .await;
        let decoder = Decoder::new(reqwest::Client::new()).with_timeout(Duration::from_millis(100));
        let err = decoder
            .fetch(&format!("{}/slow.ogg", server.base_url))
            .await
            .unwrap_err();
        assert!(matches!(err, ViewerError::DownloadError(_)), "got {:?}", err);
    }
}
