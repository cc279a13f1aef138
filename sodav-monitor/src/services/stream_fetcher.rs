//! Live stream acquisition and decoding
//!
//! Opens one HTTP(S) audio stream per station and turns it into a lazy
//! sequence of fixed-size mono PCM chunks stamped with capture time.
//! The network half pumps response bytes into a bounded channel; a
//! blocking decode task drives Symphonia over that channel, downmixes,
//! resamples to the configured rate and emits chunks.
//!
//! The fetcher performs no retries: an unreachable endpoint is
//! `StreamUnavailable`, a mid-stream failure is `StreamDropped`, and the
//! supervisor decides when to reopen.

use crate::error::{DetectError, DetectResult};
use crate::types::{AudioWindow, PcmChunk};
use chrono::Utc;
use futures::StreamExt;
use std::io::Read;
use std::sync::mpsc as std_mpsc;
use std::time::Duration;
use symphonia::core::audio::{AudioBufferRef, Signal};
use symphonia::core::codecs::DecoderOptions;
use symphonia::core::conv::FromSample;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::{MediaSource, MediaSourceStream};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tokio::sync::mpsc;

/// Samples per emitted chunk.
pub const CHUNK_SAMPLES: usize = 4096;

const BYTE_CHANNEL_DEPTH: usize = 64;
const CHUNK_CHANNEL_DEPTH: usize = 32;
const USER_AGENT: &str = "SODAV-Monitor/0.1 (https://sodav.sn)";

/// Stream fetcher; one instance serves all stations.
#[derive(Clone)]
pub struct StreamFetcher {
    http_client: reqwest::Client,
    target_sample_rate: u32,
}

impl StreamFetcher {
    pub fn new(target_sample_rate: u32, connect_timeout: Duration) -> DetectResult<Self> {
        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| DetectError::StreamUnavailable(format!("HTTP client build failed: {}", e)))?;

        Ok(Self {
            http_client,
            target_sample_rate,
        })
    }

    /// Open a station's stream.
    pub async fn open(&self, stream_url: &str) -> DetectResult<AudioStream> {
        let response = self
            .http_client
            .get(stream_url)
            .send()
            .await
            .map_err(|e| DetectError::StreamUnavailable(format!("connect failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DetectError::StreamUnavailable(format!("HTTP {}", status)));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        if !is_audio_mime(&content_type) {
            return Err(DetectError::StreamUnavailable(format!(
                "not an audio stream: Content-Type {}",
                content_type
            )));
        }

        tracing::info!(url = %stream_url, content_type = %content_type, "stream opened");

        // Network half: response bytes into a bounded sync channel the
        // blocking decoder reads from.
        let (byte_tx, byte_rx) = std_mpsc::sync_channel::<Vec<u8>>(BYTE_CHANNEL_DEPTH);
        let mut body = response.bytes_stream();
        let pump = tokio::spawn(async move {
            while let Some(next) = body.next().await {
                match next {
                    Ok(bytes) => {
                        if byte_tx.send(bytes.to_vec()).is_err() {
                            break; // decoder gone, stream closed
                        }
                    }
                    Err(e) => {
                        tracing::debug!("stream body error: {}", e);
                        break;
                    }
                }
            }
            // Dropping byte_tx signals end-of-stream to the decoder
        });

        let source = Box::new(ChannelMediaSource::new(byte_rx));
        let (chunk_tx, chunk_rx) = mpsc::channel(CHUNK_CHANNEL_DEPTH);
        let target_rate = self.target_sample_rate;
        let hint_ext = extension_for_mime(&content_type);
        let decoder = tokio::task::spawn_blocking(move || {
            run_decoder(source, hint_ext, target_rate, chunk_tx);
        });

        Ok(AudioStream {
            chunk_rx,
            sample_rate: self.target_sample_rate,
            pump_handle: pump,
            decoder_handle: decoder,
        })
    }
}

/// Decoded chunk sequence for one open stream.
pub struct AudioStream {
    chunk_rx: mpsc::Receiver<DetectResult<PcmChunk>>,
    sample_rate: u32,
    pump_handle: tokio::task::JoinHandle<()>,
    decoder_handle: tokio::task::JoinHandle<()>,
}

impl AudioStream {
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Next PCM chunk, or `StreamDropped` once the stream ends or fails.
    pub async fn next_chunk(&mut self) -> DetectResult<PcmChunk> {
        match self.chunk_rx.recv().await {
            Some(result) => result,
            None => Err(DetectError::StreamDropped("stream ended".to_string())),
        }
    }

    /// Assemble chunks into one analysis window of at least
    /// `window_samples` samples.
    pub async fn read_window(&mut self, window_samples: usize) -> DetectResult<AudioWindow> {
        let mut samples = Vec::with_capacity(window_samples);
        let mut captured_at = None;

        while samples.len() < window_samples {
            let chunk = self.next_chunk().await?;
            captured_at.get_or_insert(chunk.captured_at);
            samples.extend_from_slice(&chunk.samples);
        }

        Ok(AudioWindow {
            samples,
            sample_rate: self.sample_rate,
            captured_at: captured_at.unwrap_or_else(Utc::now),
        })
    }

    /// Tear the stream down.
    pub fn close(self) {
        self.pump_handle.abort();
        self.decoder_handle.abort();
    }
}

fn is_audio_mime(content_type: &str) -> bool {
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    mime.starts_with("audio/") || mime == "application/ogg"
}

fn extension_for_mime(content_type: &str) -> Option<&'static str> {
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    match mime.as_str() {
        "audio/mpeg" | "audio/mp3" => Some("mp3"),
        "audio/aac" | "audio/aacp" => Some("aac"),
        "audio/mp4" => Some("mp4"),
        "audio/wav" | "audio/x-wav" | "audio/wave" => Some("wav"),
        _ => None,
    }
}

/// Blocking `Read` over the byte channel, presented to Symphonia as an
/// unseekable media source.
struct ChannelMediaSource {
    rx: std::sync::Mutex<std_mpsc::Receiver<Vec<u8>>>,
    pending: Vec<u8>,
    offset: usize,
}

impl ChannelMediaSource {
    fn new(rx: std_mpsc::Receiver<Vec<u8>>) -> Self {
        Self {
            rx: std::sync::Mutex::new(rx),
            pending: Vec::new(),
            offset: 0,
        }
    }
}

impl Read for ChannelMediaSource {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.offset >= self.pending.len() {
            match self.rx.lock().unwrap().recv() {
                Ok(bytes) => {
                    self.pending = bytes;
                    self.offset = 0;
                }
                Err(_) => return Ok(0), // end of stream
            }
        }
        let available = &self.pending[self.offset..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.offset += n;
        Ok(n)
    }
}

impl std::io::Seek for ChannelMediaSource {
    fn seek(&mut self, _pos: std::io::SeekFrom) -> std::io::Result<u64> {
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "live stream is not seekable",
        ))
    }
}

impl MediaSource for ChannelMediaSource {
    fn is_seekable(&self) -> bool {
        false
    }

    fn byte_len(&self) -> Option<u64> {
        None
    }
}

/// Decode loop: probe, decode, downmix, resample, chunk.
///
/// Runs on a blocking thread until the source ends, a fatal decode
/// error occurs, or the receiver goes away.
pub(crate) fn run_decoder(
    source: Box<dyn MediaSource>,
    hint_ext: Option<&str>,
    target_rate: u32,
    chunk_tx: mpsc::Sender<DetectResult<PcmChunk>>,
) {
    let mss = MediaSourceStream::new(source, Default::default());
    let mut hint = Hint::new();
    if let Some(ext) = hint_ext {
        hint.with_extension(ext);
    }

    let probed = match symphonia::default::get_probe().format(
        &hint,
        mss,
        &FormatOptions::default(),
        &MetadataOptions::default(),
    ) {
        Ok(probed) => probed,
        Err(e) => {
            let _ = chunk_tx.blocking_send(Err(DetectError::StreamDropped(format!(
                "format probe failed: {}",
                e
            ))));
            return;
        }
    };

    let mut format_reader = probed.format;
    let Some(track) = format_reader.default_track() else {
        let _ = chunk_tx.blocking_send(Err(DetectError::StreamDropped(
            "no audio track in stream".to_string(),
        )));
        return;
    };
    let track_id = track.id;
    let source_rate = track.codec_params.sample_rate.unwrap_or(target_rate);

    let mut decoder = match symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
    {
        Ok(decoder) => decoder,
        Err(e) => {
            let _ = chunk_tx.blocking_send(Err(DetectError::StreamDropped(format!(
                "decoder creation failed: {}",
                e
            ))));
            return;
        }
    };

    let mut resampler = StreamResampler::new(source_rate, target_rate);
    let mut chunker: Vec<f32> = Vec::with_capacity(CHUNK_SAMPLES * 2);
    let mut consecutive_errors = 0u32;

    loop {
        let packet = match format_reader.next_packet() {
            Ok(packet) => packet,
            Err(e) => {
                let _ = chunk_tx.blocking_send(Err(DetectError::StreamDropped(format!(
                    "stream ended: {}",
                    e
                ))));
                return;
            }
        };
        if packet.track_id() != track_id {
            continue;
        }

        match decoder.decode(&packet) {
            Ok(decoded) => {
                consecutive_errors = 0;
                let mono = downmix_to_mono(&decoded);
                let resampled = resampler.process(&mono);
                chunker.extend_from_slice(&resampled);

                while chunker.len() >= CHUNK_SAMPLES {
                    let rest = chunker.split_off(CHUNK_SAMPLES);
                    let chunk = PcmChunk {
                        samples: std::mem::replace(&mut chunker, rest),
                        captured_at: Utc::now(),
                    };
                    if chunk_tx.blocking_send(Ok(chunk)).is_err() {
                        return; // consumer closed the stream
                    }
                }
            }
            Err(e) => {
                // Decode hiccups happen on live streams; only a run of
                // them means the stream is gone.
                consecutive_errors += 1;
                tracing::warn!("decode error ({} consecutive): {}", consecutive_errors, e);
                if consecutive_errors >= 10 {
                    let _ = chunk_tx.blocking_send(Err(DetectError::StreamDropped(format!(
                        "persistent decode failure: {}",
                        e
                    ))));
                    return;
                }
            }
        }
    }
}

/// Average all channels into mono f32.
fn downmix_to_mono(buffer: &AudioBufferRef) -> Vec<f32> {
    let channels = buffer.spec().channels.count();
    let frames = buffer.frames();
    let mut mono = Vec::with_capacity(frames);

    for frame_idx in 0..frames {
        let mut sum = 0.0f32;
        for ch in 0..channels {
            let sample = match buffer {
                AudioBufferRef::U8(buf) => f32::from_sample(buf.chan(ch)[frame_idx]),
                AudioBufferRef::U16(buf) => f32::from_sample(buf.chan(ch)[frame_idx]),
                AudioBufferRef::U24(buf) => f32::from_sample(buf.chan(ch)[frame_idx]),
                AudioBufferRef::U32(buf) => f32::from_sample(buf.chan(ch)[frame_idx]),
                AudioBufferRef::S8(buf) => f32::from_sample(buf.chan(ch)[frame_idx]),
                AudioBufferRef::S16(buf) => f32::from_sample(buf.chan(ch)[frame_idx]),
                AudioBufferRef::S24(buf) => f32::from_sample(buf.chan(ch)[frame_idx]),
                AudioBufferRef::S32(buf) => f32::from_sample(buf.chan(ch)[frame_idx]),
                AudioBufferRef::F32(buf) => buf.chan(ch)[frame_idx],
                AudioBufferRef::F64(buf) => buf.chan(ch)[frame_idx] as f32,
            };
            sum += sample;
        }
        mono.push(sum / channels as f32);
    }

    mono
}

/// Block-wise resampler to the analysis rate.
///
/// Passes audio through untouched when the stream already runs at the
/// target rate; otherwise buffers into fixed blocks for Rubato.
struct StreamResampler {
    inner: Option<rubato::SincFixedIn<f32>>,
    input_buffer: Vec<f32>,
    block_size: usize,
}

impl StreamResampler {
    const BLOCK_SIZE: usize = 1024;

    fn new(source_rate: u32, target_rate: u32) -> Self {
        if source_rate == target_rate {
            return Self {
                inner: None,
                input_buffer: Vec::new(),
                block_size: Self::BLOCK_SIZE,
            };
        }

        use rubato::{
            SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
        };

        let params = SincInterpolationParameters {
            sinc_len: 256,
            f_cutoff: 0.95,
            interpolation: SincInterpolationType::Linear,
            oversampling_factor: 256,
            window: WindowFunction::BlackmanHarris2,
        };
        let ratio = target_rate as f64 / source_rate as f64;
        let inner: SincFixedIn<f32> = SincFixedIn::new(ratio, 2.0, params, Self::BLOCK_SIZE, 1)
            .expect("resampler parameters are static and valid");

        Self {
            inner: Some(inner),
            input_buffer: Vec::with_capacity(Self::BLOCK_SIZE * 2),
            block_size: Self::BLOCK_SIZE,
        }
    }

    fn process(&mut self, samples: &[f32]) -> Vec<f32> {
        let Some(resampler) = self.inner.as_mut() else {
            return samples.to_vec();
        };

        use rubato::Resampler as _;

        self.input_buffer.extend_from_slice(samples);
        let mut out = Vec::new();

        while self.input_buffer.len() >= self.block_size {
            let rest = self.input_buffer.split_off(self.block_size);
            let block = std::mem::replace(&mut self.input_buffer, rest);
            match resampler.process(&[block], None) {
                Ok(mut resampled) => out.append(&mut resampled.remove(0)),
                Err(e) => {
                    tracing::warn!("resample block failed, dropping: {}", e);
                }
            }
        }

        out
    }
}
