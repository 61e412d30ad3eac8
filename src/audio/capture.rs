//! Audio sources feeding the PCM ring
//!
//! Device backends keep their `cpal::Stream` on a dedicated owner thread and
//! are controlled through a command channel, so the handle itself stays
//! `Send`. The realtime callback only converts samples into a stack buffer,
//! writes them into the ring and stamps the arrival time.

use super::replay::ReplaySource;
use super::ring::PcmProducer;
use super::sources::find_input_device;
use crate::clock::Clock;
use crate::config::{Backend, Config};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, SampleFormat, StreamConfig, SupportedBufferSize};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Upper bound on opening a device stream
pub const OPEN_TIMEOUT: Duration = Duration::from_secs(2);

/// Longest device gap that is zero-filled; longer gaps reset the pipeline
pub const MAX_GAP_FILL: Duration = Duration::from_millis(200);

/// Delay before the single re-open retry
const REOPEN_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Burst requested from the native backend when no hint is given
const DEFAULT_NATIVE_BURST: u32 = 192;

/// Samples converted per chunk inside the callback
const CONVERT_CHUNK: usize = 512;

/// Audio source errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Device busy: {0}")]
    DeviceBusy(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("I/O error: {0}")]
    Io(String),
}

/// Map a backend-specific message onto the closest error kind
fn classify_backend_error(description: &str) -> SourceError {
    let lower = description.to_ascii_lowercase();
    if lower.contains("permission") || lower.contains("denied") || lower.contains("not permitted")
    {
        SourceError::PermissionDenied(description.to_string())
    } else if lower.contains("busy") || lower.contains("in use") || lower.contains("exclusive") {
        SourceError::DeviceBusy(description.to_string())
    } else {
        SourceError::Io(description.to_string())
    }
}

impl From<cpal::BuildStreamError> for SourceError {
    fn from(err: cpal::BuildStreamError) -> Self {
        let message = err.to_string();
        match err {
            cpal::BuildStreamError::BackendSpecific { err } => {
                classify_backend_error(&err.description)
            }
            cpal::BuildStreamError::DeviceNotAvailable => SourceError::BackendUnavailable(message),
            cpal::BuildStreamError::StreamConfigNotSupported
            | cpal::BuildStreamError::InvalidArgument => SourceError::UnsupportedFormat(message),
            _ => SourceError::Io(message),
        }
    }
}

impl From<cpal::PlayStreamError> for SourceError {
    fn from(err: cpal::PlayStreamError) -> Self {
        let message = err.to_string();
        match err {
            cpal::PlayStreamError::BackendSpecific { err } => {
                classify_backend_error(&err.description)
            }
            _ => SourceError::BackendUnavailable(message),
        }
    }
}

impl From<cpal::DevicesError> for SourceError {
    fn from(err: cpal::DevicesError) -> Self {
        match err {
            cpal::DevicesError::BackendSpecific { err } => classify_backend_error(&err.description),
        }
    }
}

impl From<cpal::DefaultStreamConfigError> for SourceError {
    fn from(err: cpal::DefaultStreamConfigError) -> Self {
        let message = err.to_string();
        match err {
            cpal::DefaultStreamConfigError::BackendSpecific { err } => {
                classify_backend_error(&err.description)
            }
            cpal::DefaultStreamConfigError::StreamTypeNotSupported => {
                SourceError::UnsupportedFormat(message)
            }
            _ => SourceError::BackendUnavailable(message),
        }
    }
}

impl From<cpal::SupportedStreamConfigsError> for SourceError {
    fn from(err: cpal::SupportedStreamConfigsError) -> Self {
        let message = err.to_string();
        match err {
            cpal::SupportedStreamConfigsError::BackendSpecific { err } => {
                classify_backend_error(&err.description)
            }
            cpal::SupportedStreamConfigsError::InvalidArgument => {
                SourceError::UnsupportedFormat(message)
            }
            _ => SourceError::BackendUnavailable(message),
        }
    }
}

impl From<std::io::Error> for SourceError {
    fn from(err: std::io::Error) -> Self {
        SourceError::Io(err.to_string())
    }
}

/// Which backend a source uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// Fixed small bursts at the hinted rate
    Native,

    /// Platform default stream configuration
    Portable,

    /// Pre-recorded buffer pushed at real-time pace
    Replay,
}

impl From<Backend> for SourceKind {
    fn from(backend: Backend) -> Self {
        match backend {
            Backend::Native => SourceKind::Native,
            Backend::Portable => SourceKind::Portable,
        }
    }
}

/// Negotiated stream format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamFormat {
    pub sample_rate: u32,
    pub channels: u16,

    /// Frames per callback, 0 when the platform decides
    pub frames_per_burst: u32,
}

impl StreamFormat {
    pub fn new(sample_rate: u32, channels: u16, frames_per_burst: u32) -> Self {
        Self {
            sample_rate,
            channels,
            frames_per_burst,
        }
    }

    /// Interleaved samples per second
    pub fn samples_per_sec(&self) -> f64 {
        self.sample_rate as f64 * self.channels.max(1) as f64
    }
}

/// What the engine asks a backend to open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SourceRequest {
    pub input_device_id: i32,
    pub sample_rate_hint: u32,
    pub frames_per_burst_hint: u32,

    /// Opening and starting must finish by then; `None` allows
    /// [`OPEN_TIMEOUT`] from the moment the source is opened
    pub open_deadline: Option<Instant>,
}

impl SourceRequest {
    pub fn from_config(config: &Config) -> Self {
        Self {
            input_device_id: config.input_device_id,
            sample_rate_hint: config.sample_rate_hint,
            frames_per_burst_hint: config.frames_per_burst_hint,
            open_deadline: None,
        }
    }

    /// Share one deadline across every open attempt made with this request
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.open_deadline = Some(deadline);
        self
    }

    fn deadline(&self) -> Instant {
        self.open_deadline.unwrap_or_else(|| Instant::now() + OPEN_TIMEOUT)
    }
}

/// Out-of-band events a running source reports to the engine
#[derive(Debug, Default)]
pub struct SourceEvents {
    reopens: AtomicU64,
    resets: AtomicU64,
    lost: AtomicBool,
    lost_reason: Mutex<Option<SourceError>>,
}

impl SourceEvents {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The device was re-opened after a route change
    pub fn record_reopen(&self) {
        self.reopens.fetch_add(1, Ordering::Relaxed);
    }

    /// A gap was too long to zero-fill; downstream state must be reset
    pub fn record_reset(&self) {
        self.resets.fetch_add(1, Ordering::Release);
    }

    /// The device is gone for good
    pub fn record_lost(&self, error: SourceError) {
        *self.lost_reason.lock() = Some(error);
        self.lost.store(true, Ordering::Release);
    }

    pub fn reopen_count(&self) -> u64 {
        self.reopens.load(Ordering::Relaxed)
    }

    /// Bumped every time the pipeline has to be reset
    pub fn reset_generation(&self) -> u64 {
        self.resets.load(Ordering::Acquire)
    }

    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }

    /// Take the loss reason, if the source has been lost
    pub fn take_lost(&self) -> Option<SourceError> {
        if !self.is_lost() {
            return None;
        }
        self.lost_reason.lock().take()
    }
}

/// Holds the ring producer for the lifetime of one device stream.
///
/// When the stream (and with it the callback) is dropped, the producer goes
/// back to `home` so a re-opened stream can keep writing into the same ring.
struct ProducerLease {
    producer: Option<PcmProducer>,
    home: Arc<Mutex<Option<PcmProducer>>>,
    clock: Clock,
    scratch: [f32; CONVERT_CHUNK],
}

impl ProducerLease {
    fn take(home: &Arc<Mutex<Option<PcmProducer>>>, clock: Clock) -> Option<Self> {
        let producer = home.lock().take()?;
        Some(Self {
            producer: Some(producer),
            home: home.clone(),
            clock,
            scratch: [0.0; CONVERT_CHUNK],
        })
    }

    /// Convert and push one callback's worth of samples. Realtime-safe.
    #[inline]
    fn push<T>(&mut self, data: &[T])
    where
        T: cpal::SizedSample,
        f32: cpal::FromSample<T>,
    {
        let Some(producer) = self.producer.as_mut() else {
            return;
        };
        for chunk in data.chunks(CONVERT_CHUNK) {
            for (out, sample) in self.scratch.iter_mut().zip(chunk) {
                let value: f32 = cpal::Sample::from_sample(*sample);
                *out = value.clamp(-1.0, 1.0);
            }
            producer.write(&self.scratch[..chunk.len()]);
        }
        producer.stamp(self.clock.now_ns());
    }

    fn write_silence(&mut self, count: usize) {
        if let Some(producer) = self.producer.as_mut() {
            producer.write_silence(count);
            producer.stamp(self.clock.now_ns());
        }
    }
}

impl Drop for ProducerLease {
    fn drop(&mut self) {
        if let Some(producer) = self.producer.take() {
            *self.home.lock() = Some(producer);
        }
    }
}

/// Commands sent to the stream owner thread
enum SourceCommand {
    Attach {
        producer: PcmProducer,
        clock: Clock,
        events: Arc<SourceEvents>,
    },
    Stop,
    DeviceLost(String),
}

/// Replies from the stream owner thread, in order
enum OwnerReply {
    Negotiated(Result<StreamFormat, SourceError>),
    Started(Result<(), SourceError>),
}

/// Wait for the owner's next reply until `deadline`
fn reply_before(replies: &mpsc::Receiver<OwnerReply>, deadline: Instant) -> Option<OwnerReply> {
    replies
        .recv_timeout(deadline.saturating_duration_since(Instant::now()))
        .ok()
}

/// A cpal input device opened in native or portable mode.
///
/// Device lookup, format negotiation and the stream itself all live on the
/// owner thread. Opening and starting share one deadline taken from the
/// request, so a wedged driver cannot hold up the caller past it.
pub struct DeviceSource {
    kind: SourceKind,
    format: StreamFormat,
    deadline: Instant,
    command_tx: mpsc::Sender<SourceCommand>,
    replies: mpsc::Receiver<OwnerReply>,
    thread: Option<JoinHandle<()>>,
    running: bool,
}

fn is_convertible(format: SampleFormat) -> bool {
    matches!(
        format,
        SampleFormat::F32 | SampleFormat::I16 | SampleFormat::U16 | SampleFormat::I32
    )
}

fn burst_range(range: &cpal::SupportedStreamConfigRange) -> Option<(u32, u32)> {
    match *range.buffer_size() {
        SupportedBufferSize::Range { min, max } if min <= max && max > 0 => Some((min, max)),
        _ => None,
    }
}

/// Pick a fixed-burst config at the hinted rate
fn native_config(
    device: &cpal::Device,
    request: &SourceRequest,
) -> Result<(StreamConfig, SampleFormat), SourceError> {
    let rate = if request.sample_rate_hint > 0 {
        request.sample_rate_hint
    } else {
        device.default_input_config()?.sample_rate().0
    };

    let mut best: Option<(cpal::SupportedStreamConfigRange, (u32, u32))> = None;
    for range in device.supported_input_configs()? {
        if !is_convertible(range.sample_format()) {
            continue;
        }
        if range.min_sample_rate().0 > rate || range.max_sample_rate().0 < rate {
            continue;
        }
        let Some(bursts) = burst_range(&range) else {
            continue;
        };
        // Prefer float samples, then the fewest channels
        let rank = |r: &cpal::SupportedStreamConfigRange| {
            (r.sample_format() != SampleFormat::F32, r.channels())
        };
        let better = match &best {
            Some((current, _)) => rank(&range) < rank(current),
            None => true,
        };
        if better {
            best = Some((range, bursts));
        }
    }

    let (range, (min, max)) = best.ok_or_else(|| {
        SourceError::BackendUnavailable(format!("no fixed-burst input stream at {} Hz", rate))
    })?;
    let wanted = if request.frames_per_burst_hint > 0 {
        request.frames_per_burst_hint
    } else {
        DEFAULT_NATIVE_BURST
    };

    let config = StreamConfig {
        channels: range.channels(),
        sample_rate: cpal::SampleRate(rate),
        buffer_size: BufferSize::Fixed(wanted.clamp(min, max)),
    };
    Ok((config, range.sample_format()))
}

/// The device's own default configuration
fn portable_config(device: &cpal::Device) -> Result<(StreamConfig, SampleFormat), SourceError> {
    let supported = device.default_input_config()?;
    let sample_format = supported.sample_format();
    if !is_convertible(sample_format) {
        return Err(SourceError::UnsupportedFormat(format!("{:?}", sample_format)));
    }
    let mut config: StreamConfig = supported.into();
    config.buffer_size = BufferSize::Default;
    Ok((config, sample_format))
}

/// Device and stream configuration settled on by the owner thread
struct Negotiated {
    device_name: String,
    stream_config: StreamConfig,
    sample_format: SampleFormat,
}

impl Negotiated {
    fn resolve(kind: SourceKind, request: &SourceRequest) -> Result<Self, SourceError> {
        let host = cpal::default_host();
        let device = find_input_device(&host, request.input_device_id)?;
        let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());

        let (stream_config, sample_format) = match kind {
            SourceKind::Native => native_config(&device, request)?,
            _ => portable_config(&device)?,
        };
        Ok(Self {
            device_name,
            stream_config,
            sample_format,
        })
    }

    fn format(&self) -> StreamFormat {
        let frames_per_burst = match self.stream_config.buffer_size {
            BufferSize::Fixed(frames) => frames,
            BufferSize::Default => 0,
        };
        StreamFormat::new(
            self.stream_config.sample_rate.0,
            self.stream_config.channels,
            frames_per_burst,
        )
    }
}

impl DeviceSource {
    /// Resolve the device and negotiate a stream configuration on a fresh
    /// owner thread, waiting at most until the request's deadline
    pub fn open(kind: SourceKind, request: &SourceRequest) -> Result<Self, SourceError> {
        let deadline = request.deadline();
        let (command_tx, command_rx) = mpsc::channel();
        let (reply_tx, replies) = mpsc::sync_channel(2);

        let request = *request;
        let errors = command_tx.clone();
        let thread = thread::Builder::new()
            .name("audio-capture".to_string())
            .spawn(move || run_owner(kind, request, command_rx, errors, reply_tx))?;

        match reply_before(&replies, deadline) {
            Some(OwnerReply::Negotiated(Ok(format))) => Ok(Self {
                kind,
                format,
                deadline,
                command_tx,
                replies,
                thread: Some(thread),
                running: false,
            }),
            Some(OwnerReply::Negotiated(Err(e))) => {
                let _ = thread.join();
                Err(e)
            }
            Some(OwnerReply::Started(_)) => {
                let _ = command_tx.send(SourceCommand::Stop);
                Err(SourceError::Io("capture thread replied out of order".into()))
            }
            None => {
                // Detached; the owner exits once the driver returns
                let _ = command_tx.send(SourceCommand::Stop);
                Err(SourceError::BackendUnavailable(format!(
                    "opening {:?} input timed out",
                    kind
                )))
            }
        }
    }

    pub fn format(&self) -> StreamFormat {
        self.format
    }

    pub fn is_running(&self) -> bool {
        self.running && self.thread.is_some()
    }

    /// Hand the ring producer to the owner thread and wait for the stream to
    /// start playing, within what is left of the open deadline
    pub fn start(
        &mut self,
        producer: PcmProducer,
        clock: Clock,
        events: Arc<SourceEvents>,
    ) -> Result<(), SourceError> {
        if self.running {
            return Err(SourceError::DeviceBusy("source already started".into()));
        }
        let Some(thread) = self.thread.take() else {
            return Err(SourceError::BackendUnavailable("capture thread has exited".into()));
        };

        let attach = SourceCommand::Attach {
            producer,
            clock,
            events,
        };
        if self.command_tx.send(attach).is_err() {
            let _ = thread.join();
            return Err(SourceError::BackendUnavailable("capture thread has exited".into()));
        }

        match reply_before(&self.replies, self.deadline) {
            Some(OwnerReply::Started(Ok(()))) => {
                self.thread = Some(thread);
                self.running = true;
                Ok(())
            }
            Some(OwnerReply::Started(Err(e))) => {
                let _ = thread.join();
                Err(e)
            }
            Some(OwnerReply::Negotiated(_)) => {
                let _ = self.command_tx.send(SourceCommand::Stop);
                Err(SourceError::Io("capture thread replied out of order".into()))
            }
            None => {
                let _ = self.command_tx.send(SourceCommand::Stop);
                Err(SourceError::BackendUnavailable(format!(
                    "starting {:?} input timed out",
                    self.kind
                )))
            }
        }
    }

    pub fn stop(&mut self) {
        self.running = false;
        if let Some(thread) = self.thread.take() {
            let _ = self.command_tx.send(SourceCommand::Stop);
            let _ = thread.join();
        }
    }
}

impl Drop for DeviceSource {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Body of the owner thread: negotiate, wait for the ring, then run the stream
fn run_owner(
    kind: SourceKind,
    request: SourceRequest,
    commands: mpsc::Receiver<SourceCommand>,
    command_tx: mpsc::Sender<SourceCommand>,
    replies: mpsc::SyncSender<OwnerReply>,
) {
    let negotiated = match Negotiated::resolve(kind, &request) {
        Ok(negotiated) => negotiated,
        Err(e) => {
            let _ = replies.send(OwnerReply::Negotiated(Err(e)));
            return;
        }
    };

    let format = negotiated.format();
    log::info!(
        "Opened {:?} input '{}' ({:?}): {} Hz, {} channels, burst {}",
        kind,
        negotiated.device_name,
        negotiated.sample_format,
        format.sample_rate,
        format.channels,
        if format.frames_per_burst > 0 {
            format.frames_per_burst.to_string()
        } else {
            "default".to_string()
        }
    );
    if replies.send(OwnerReply::Negotiated(Ok(format))).is_err() {
        return;
    }

    let (producer, clock, events) = loop {
        match commands.recv() {
            Ok(SourceCommand::Attach {
                producer,
                clock,
                events,
            }) => break (producer, clock, events),
            Ok(SourceCommand::DeviceLost(_)) => continue,
            Ok(SourceCommand::Stop) | Err(_) => return,
        }
    };

    let owner = StreamOwner {
        kind,
        request,
        device_name: negotiated.device_name,
        stream_config: negotiated.stream_config,
        sample_format: negotiated.sample_format,
        home: Arc::new(Mutex::new(Some(producer))),
        clock,
        events,
        command_tx,
        gap_filled_to: 0,
        gap_reset: false,
    };
    owner.run(commands, replies);
}

/// What to do about the time a device was away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GapAction {
    /// Write this many interleaved zero samples
    Fill(usize),

    /// Too long to bridge; downstream state must start over
    Reset,
}

/// Decide how to bridge a device gap.
///
/// `lost_at_ns` is when the device went away and `filled_to_ns` how far
/// silence has already been written. Gaps up to [`MAX_GAP_FILL`] are
/// zero-filled from whichever of the two is later.
pub(crate) fn gap_action(
    now_ns: u64,
    lost_at_ns: u64,
    filled_to_ns: u64,
    sample_rate: u32,
    channels: u16,
) -> GapAction {
    if now_ns.saturating_sub(lost_at_ns) > MAX_GAP_FILL.as_nanos() as u64 {
        return GapAction::Reset;
    }

    let from = filled_to_ns.max(lost_at_ns);
    let gap_secs = now_ns.saturating_sub(from) as f64 / 1e9;
    let frames = (gap_secs * sample_rate as f64).round() as usize;
    GapAction::Fill(frames * channels as usize)
}

/// State living on the stream owner thread
struct StreamOwner {
    kind: SourceKind,
    request: SourceRequest,
    device_name: String,
    stream_config: StreamConfig,
    sample_format: SampleFormat,
    home: Arc<Mutex<Option<PcmProducer>>>,
    clock: Clock,
    events: Arc<SourceEvents>,
    command_tx: mpsc::Sender<SourceCommand>,
    gap_filled_to: u64,
    gap_reset: bool,
}

impl StreamOwner {
    fn run(mut self, commands: mpsc::Receiver<SourceCommand>, replies: mpsc::SyncSender<OwnerReply>) {
        let mut stream = match self.open_stream(None) {
            Ok(stream) => {
                let _ = replies.send(OwnerReply::Started(Ok(())));
                stream
            }
            Err(e) => {
                let _ = replies.send(OwnerReply::Started(Err(e)));
                return;
            }
        };
        log::info!("{:?} capture started on '{}'", self.kind, self.device_name);

        loop {
            match commands.recv() {
                Ok(SourceCommand::Stop) | Err(_) => break,
                Ok(SourceCommand::Attach { .. }) => {
                    log::warn!("Ignoring second attach on '{}'", self.device_name);
                }
                Ok(SourceCommand::DeviceLost(reason)) => {
                    log::warn!("Input '{}' lost ({}), re-opening", self.device_name, reason);
                    let lost_at = self.clock.now_ns();
                    drop(stream);

                    match self.reopen(lost_at) {
                        Ok(reopened) => {
                            stream = reopened;
                            self.events.record_reopen();
                            log::info!("Input '{}' re-opened", self.device_name);
                        }
                        Err(e) => {
                            log::error!("Input '{}' could not be re-opened: {}", self.device_name, e);
                            self.events.record_lost(e);
                            return;
                        }
                    }

                    // Errors queued by the old stream are stale now
                    let mut stop = false;
                    while let Ok(command) = commands.try_recv() {
                        if let SourceCommand::Stop = command {
                            stop = true;
                        }
                    }
                    if stop {
                        break;
                    }
                }
            }
        }

        drop(stream);
        log::info!("{:?} capture stopped", self.kind);
    }

    /// Re-open once, retry once after a short delay
    fn reopen(&mut self, lost_at: u64) -> Result<cpal::Stream, SourceError> {
        self.gap_filled_to = lost_at;
        self.gap_reset = false;
        match self.open_stream(Some(lost_at)) {
            Ok(stream) => Ok(stream),
            Err(first) => {
                log::warn!("Re-open failed ({}), retrying", first);
                thread::sleep(REOPEN_RETRY_DELAY);
                self.open_stream(Some(lost_at))
            }
        }
    }

    /// Look the device up again by name; route changes fall back to the default
    fn find_device(&self) -> Result<cpal::Device, SourceError> {
        let host = cpal::default_host();
        if let Ok(mut devices) = host.input_devices() {
            if let Some(device) =
                devices.find(|d| d.name().map(|n| n == self.device_name).unwrap_or(false))
            {
                return Ok(device);
            }
        }
        find_input_device(&host, self.request.input_device_id)
            .or_else(|_| find_input_device(&host, crate::config::DEFAULT_INPUT_DEVICE))
    }

    fn open_stream(&mut self, lost_at: Option<u64>) -> Result<cpal::Stream, SourceError> {
        let device = self.find_device()?;
        let mut lease = ProducerLease::take(&self.home, self.clock)
            .ok_or_else(|| SourceError::Io("ring producer is still attached".into()))?;

        if let Some(lost_at) = lost_at {
            self.fill_gap(&mut lease, lost_at);
        }

        let errors = self.command_tx.clone();
        let config = &self.stream_config;
        let stream = match self.sample_format {
            SampleFormat::F32 => build_stream::<f32>(&device, config, lease, errors),
            SampleFormat::I16 => build_stream::<i16>(&device, config, lease, errors),
            SampleFormat::U16 => build_stream::<u16>(&device, config, lease, errors),
            SampleFormat::I32 => build_stream::<i32>(&device, config, lease, errors),
            other => {
                return Err(SourceError::UnsupportedFormat(format!("{:?}", other)));
            }
        }?;
        stream.play()?;
        Ok(stream)
    }

    /// Zero-fill the time the device was away, or flag a pipeline reset
    fn fill_gap(&mut self, lease: &mut ProducerLease, lost_at: u64) {
        let now = self.clock.now_ns();
        let action = gap_action(
            now,
            lost_at,
            self.gap_filled_to,
            self.stream_config.sample_rate.0,
            self.stream_config.channels,
        );
        match action {
            GapAction::Fill(samples) => {
                lease.write_silence(samples);
                self.gap_filled_to = now;
            }
            GapAction::Reset if !self.gap_reset => {
                log::warn!(
                    "Input gap of {} ms exceeds {} ms, resetting pipeline",
                    now.saturating_sub(lost_at) / 1_000_000,
                    MAX_GAP_FILL.as_millis()
                );
                self.events.record_reset();
                self.gap_reset = true;
            }
            GapAction::Reset => {}
        }
    }
}

/// Build an input stream for the given sample type
fn build_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut lease: ProducerLease,
    errors: mpsc::Sender<SourceCommand>,
) -> Result<cpal::Stream, cpal::BuildStreamError>
where
    T: cpal::SizedSample,
    f32: cpal::FromSample<T>,
{
    device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| lease.push(data),
        move |err| {
            log::error!("Audio stream error: {}", err);
            if let cpal::StreamError::DeviceNotAvailable = err {
                let _ = errors.send(SourceCommand::DeviceLost(err.to_string()));
            }
        },
        None,
    )
}

/// Capture backend, selected as data
pub enum AudioSource {
    Native(DeviceSource),
    Portable(DeviceSource),
    Replay(ReplaySource),
}

impl AudioSource {
    /// Open a device backend. Replay sources are built with [`AudioSource::replay`].
    pub fn open(kind: SourceKind, request: &SourceRequest) -> Result<Self, SourceError> {
        match kind {
            SourceKind::Native => DeviceSource::open(kind, request).map(AudioSource::Native),
            SourceKind::Portable => DeviceSource::open(kind, request).map(AudioSource::Portable),
            SourceKind::Replay => Err(SourceError::BackendUnavailable(
                "replay sources carry their own samples".into(),
            )),
        }
    }

    /// A source that plays `samples` (interleaved) at real-time pace
    pub fn replay(samples: Vec<f32>, format: StreamFormat, looping: bool) -> Self {
        AudioSource::Replay(ReplaySource::new(samples, format, looping))
    }

    /// Whether `kind` should be the default on this platform
    pub fn recommended(kind: SourceKind) -> bool {
        match kind {
            SourceKind::Replay => false,
            SourceKind::Portable => cpal::default_host().default_input_device().is_some(),
            SourceKind::Native => {
                let Some(device) = cpal::default_host().default_input_device() else {
                    return false;
                };
                device
                    .supported_input_configs()
                    .map(|mut ranges| {
                        ranges.any(|r| is_convertible(r.sample_format()) && burst_range(&r).is_some())
                    })
                    .unwrap_or(false)
            }
        }
    }

    /// [`AudioSource::recommended`] answered on a helper thread; `false` if
    /// the answer does not arrive by `deadline`
    pub fn recommended_by(kind: SourceKind, deadline: Instant) -> bool {
        let (answer_tx, answer_rx) = mpsc::sync_channel(1);
        let spawned = thread::Builder::new()
            .name("audio-query".to_string())
            .spawn(move || {
                let _ = answer_tx.send(AudioSource::recommended(kind));
            });
        if let Err(e) = spawned {
            log::warn!("Cannot query {:?} backend: {}", kind, e);
            return false;
        }
        answer_rx
            .recv_timeout(deadline.saturating_duration_since(Instant::now()))
            .unwrap_or(false)
    }

    pub fn kind(&self) -> SourceKind {
        match self {
            AudioSource::Native(_) => SourceKind::Native,
            AudioSource::Portable(_) => SourceKind::Portable,
            AudioSource::Replay(_) => SourceKind::Replay,
        }
    }

    pub fn format(&self) -> StreamFormat {
        match self {
            AudioSource::Native(source) | AudioSource::Portable(source) => source.format(),
            AudioSource::Replay(source) => source.format(),
        }
    }

    pub fn is_running(&self) -> bool {
        match self {
            AudioSource::Native(source) | AudioSource::Portable(source) => source.is_running(),
            AudioSource::Replay(source) => source.is_running(),
        }
    }

    /// Start producing into the ring
    pub fn start(
        &mut self,
        producer: PcmProducer,
        clock: Clock,
        events: Arc<SourceEvents>,
    ) -> Result<(), SourceError> {
        match self {
            AudioSource::Native(source) | AudioSource::Portable(source) => {
                source.start(producer, clock, events)
            }
            AudioSource::Replay(source) => source.start(producer, clock),
        }
    }

    /// Stop producing; the source can be closed afterwards
    pub fn stop(&mut self) {
        match self {
            AudioSource::Native(source) | AudioSource::Portable(source) => source.stop(),
            AudioSource::Replay(source) => source.stop(),
        }
    }

    /// Stop and release the device
    pub fn close(mut self) {
        self.stop();
        log::debug!("{:?} source closed", self.kind());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::pcm_ring;

    #[test]
    fn backend_errors_are_classified() {
        assert!(matches!(
            classify_backend_error("Permission denied by user"),
            SourceError::PermissionDenied(_)
        ));
        assert!(matches!(
            classify_backend_error("Device or resource busy"),
            SourceError::DeviceBusy(_)
        ));
        assert!(matches!(
            classify_backend_error("broken pipe"),
            SourceError::Io(_)
        ));
    }

    #[test]
    fn build_errors_map_to_source_errors() {
        assert!(matches!(
            SourceError::from(cpal::BuildStreamError::DeviceNotAvailable),
            SourceError::BackendUnavailable(_)
        ));
        assert!(matches!(
            SourceError::from(cpal::BuildStreamError::StreamConfigNotSupported),
            SourceError::UnsupportedFormat(_)
        ));
    }

    #[test]
    fn lease_converts_and_returns_producer_on_drop() {
        let (producer, mut consumer) = pcm_ring(64);
        let home = Arc::new(Mutex::new(Some(producer)));
        let clock = Clock::new();

        {
            let mut lease = ProducerLease::take(&home, clock).unwrap();
            assert!(home.lock().is_none());
            assert!(ProducerLease::take(&home, clock).is_none());
            lease.push(&[i16::MAX, 0i16, i16::MIN]);
        }
        assert!(home.lock().is_some());

        let mut out = [0.0f32; 3];
        assert_eq!(consumer.read_into(&mut out, 3), 3);
        assert!((out[0] - 1.0).abs() < 1e-3);
        assert_eq!(out[1], 0.0);
        assert_eq!(out[2], -1.0);
    }

    #[test]
    fn lease_clamps_float_samples() {
        let (producer, mut consumer) = pcm_ring(64);
        let home = Arc::new(Mutex::new(Some(producer)));
        let mut lease = ProducerLease::take(&home, Clock::new()).unwrap();
        lease.push(&[1.5f32, -3.0, 0.25]);

        let mut out = [0.0f32; 3];
        consumer.read_into(&mut out, 3);
        assert_eq!(out, [1.0, -1.0, 0.25]);
    }

    #[test]
    fn events_report_loss_once() {
        let events = SourceEvents::new();
        assert!(events.take_lost().is_none());

        events.record_reset();
        events.record_reopen();
        events.record_lost(SourceError::BackendUnavailable("gone".into()));
        assert_eq!(events.reset_generation(), 1);
        assert_eq!(events.reopen_count(), 1);
        assert!(events.is_lost());
        assert!(events.take_lost().is_some());
        assert!(events.take_lost().is_none());
    }

    #[test]
    fn replay_sources_cannot_be_opened_by_kind() {
        assert!(AudioSource::open(SourceKind::Replay, &SourceRequest::default()).is_err());
        assert!(!AudioSource::recommended(SourceKind::Replay));
        let deadline = Instant::now() + Duration::from_secs(1);
        assert!(!AudioSource::recommended_by(SourceKind::Replay, deadline));

        // An expired deadline answers at once, whatever the device does
        let started = Instant::now();
        let _ = AudioSource::recommended_by(SourceKind::Native, started);
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn short_gaps_are_zero_filled() {
        let ms = 1_000_000u64;
        let lost_at = 10_000 * ms;
        assert_eq!(gap_action(lost_at, lost_at, 0, 48000, 1), GapAction::Fill(0));
        assert_eq!(
            gap_action(lost_at + 150 * ms, lost_at, 0, 48000, 1),
            GapAction::Fill(7200)
        );
        assert_eq!(
            gap_action(lost_at + 200 * ms, lost_at, 0, 48000, 1),
            GapAction::Fill(9600)
        );
    }

    #[test]
    fn long_gaps_reset_the_pipeline() {
        let ms = 1_000_000u64;
        let lost_at = 10_000 * ms;
        assert_eq!(
            gap_action(lost_at + 250 * ms, lost_at, 0, 48000, 1),
            GapAction::Reset
        );
        assert_eq!(
            gap_action(lost_at + 200 * ms + 1, lost_at, lost_at + 150 * ms, 48000, 2),
            GapAction::Reset
        );
    }

    #[test]
    fn gap_fill_resumes_where_silence_ends() {
        let ms = 1_000_000u64;
        let lost_at = 10_000 * ms;
        let filled_to = lost_at + 100 * ms;
        assert_eq!(
            gap_action(lost_at + 150 * ms, lost_at, filled_to, 48000, 2),
            GapAction::Fill(4800)
        );
        // Silence written before this loss does not count
        assert_eq!(
            gap_action(lost_at + 50 * ms, lost_at, lost_at - 500 * ms, 44100, 1),
            GapAction::Fill(2205)
        );
    }

    #[test]
    fn expired_deadline_fails_fast() {
        let request = SourceRequest::default().with_deadline(Instant::now());
        let started = Instant::now();
        let result = AudioSource::open(SourceKind::Native, &request);
        assert!(matches!(result, Err(SourceError::BackendUnavailable(_))));
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn source_kind_follows_backend() {
        assert_eq!(SourceKind::from(Backend::Native), SourceKind::Native);
        assert_eq!(SourceKind::from(Backend::Portable), SourceKind::Portable);
    }
}
