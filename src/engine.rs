//! Engine: lifecycle, worker loop and control surface
//!
//! `Idle -> Starting -> Running -> Stopping -> Idle`. The state lives in an
//! atomic so `is_running` and the single-instance guard never block; control
//! operations are serialised by the `control` lock. The worker thread owns
//! the assembler, extractor, renderer and transmitter; the only object it
//! shares with the audio thread is the PCM ring.

use crate::audio::{
    pcm_ring, AnalysisConfig, AudioSource, FeatureExtractor, FrameAssembler, PcmConsumer,
    SourceError, SourceEvents, SourceKind, SourceRequest, FRAME_SIZE, OPEN_TIMEOUT,
};
use crate::clock::Clock;
use crate::config::{Backend, Config, ConfigError, ConfigUpdate, EffectKind, DEFAULT_INPUT_DEVICE};
use crate::effects::Renderer;
use crate::protocol::{SendOutcome, TransmitError, TransmitStats, Transmitter};
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use thiserror::Error;
use thread_priority::{set_current_thread_priority, ThreadPriority};

/// Seconds of audio the PCM ring can hold
const RING_SECONDS: f64 = 0.5;

/// Weight of the newest sample in the latency average
const LATENCY_SMOOTHING: f32 = 0.1;

/// Errors returned across the control surface
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Device busy: {0}")]
    DeviceBusy(String),

    #[error("Transmit error: {0}")]
    TransmitError(String),

    #[error("Engine is already running")]
    AlreadyRunning,

    #[error("Engine is not running")]
    NotRunning,
}

impl From<SourceError> for EngineError {
    fn from(err: SourceError) -> Self {
        match err {
            SourceError::PermissionDenied(m) => EngineError::PermissionDenied(m),
            SourceError::DeviceBusy(m) => EngineError::DeviceBusy(m),
            SourceError::UnsupportedFormat(m) => {
                EngineError::BackendUnavailable(format!("unsupported format: {}", m))
            }
            SourceError::BackendUnavailable(m) => EngineError::BackendUnavailable(m),
            SourceError::Io(m) => EngineError::BackendUnavailable(m),
        }
    }
}

impl From<ConfigError> for EngineError {
    fn from(err: ConfigError) -> Self {
        EngineError::InvalidConfig(err.to_string())
    }
}

impl From<TransmitError> for EngineError {
    fn from(err: TransmitError) -> Self {
        match err {
            TransmitError::Resolve(e) => EngineError::InvalidConfig(e.to_string()),
            other => EngineError::TransmitError(other.to_string()),
        }
    }
}

/// Lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Idle = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
}

impl EngineState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => EngineState::Starting,
            2 => EngineState::Running,
            3 => EngineState::Stopping,
            _ => EngineState::Idle,
        }
    }
}

/// Why the worker stopped on its own
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// The capture device went away and could not be re-opened
    BackendLost(SourceError),
}

type StopCallback = Arc<dyn Fn(StopReason) + Send + Sync>;

/// Snapshot of the running pipeline's counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Diagnostics {
    pub underruns: u64,
    pub overruns: u64,
    pub send_failures: u64,
    pub consecutive_send_failures: u64,
    pub transmit_error: bool,
    pub frames_rendered: u64,
    pub datagrams_sent: u64,
    pub frames_coalesced: u64,
    pub measured_latency_ms: f32,
    pub native_fallback: bool,
    pub reopen_count: u64,
    pub pipeline_resets: u64,
    pub running: bool,
}

/// Stream hints applied at the next start when the config leaves them unset
#[derive(Debug, Clone, Copy, Default)]
struct StartDefaults {
    backend: Option<Backend>,
    input_device_id: Option<i32>,
    sample_rate: u32,
    frames_per_burst: u32,
}

/// State shared between the control side and one run's worker
struct RunShared {
    stop: AtomicBool,
    config: ArcSwap<Config>,
    config_generation: AtomicU64,
    underruns: AtomicU64,
    overruns: AtomicU64,
    frames_rendered: AtomicU64,
    pipeline_resets: AtomicU64,
    latency_ms: AtomicU32,
    native_fallback: bool,
    transmit: Arc<TransmitStats>,
    events: Arc<SourceEvents>,
}

impl RunShared {
    fn diagnostics(&self, running: bool) -> Diagnostics {
        Diagnostics {
            underruns: self.underruns.load(Ordering::Relaxed),
            overruns: self.overruns.load(Ordering::Relaxed),
            send_failures: self.transmit.send_failures(),
            consecutive_send_failures: self.transmit.consecutive_failures(),
            transmit_error: self.transmit.transmit_error(),
            frames_rendered: self.frames_rendered.load(Ordering::Relaxed),
            datagrams_sent: self.transmit.datagrams_sent(),
            frames_coalesced: self.transmit.frames_coalesced(),
            measured_latency_ms: f32::from_bits(self.latency_ms.load(Ordering::Relaxed)),
            native_fallback: self.native_fallback,
            reopen_count: self.events.reopen_count(),
            pipeline_resets: self.pipeline_resets.load(Ordering::Relaxed),
            running,
        }
    }
}

/// Resources owned by one run
struct Run {
    source: AudioSource,
    worker: JoinHandle<()>,
}

/// The audio-reactive LED engine
pub struct Engine {
    state: Arc<AtomicU8>,
    control: Mutex<Option<Run>>,
    shared: Mutex<Option<Arc<RunShared>>>,
    defaults: Mutex<StartDefaults>,
    effect: Arc<AtomicU8>,
    effect_chosen: AtomicBool,
    on_stopped: Mutex<Option<StopCallback>>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    pub fn new() -> Self {
        Self {
            state: Arc::new(AtomicU8::new(EngineState::Idle as u8)),
            control: Mutex::new(None),
            shared: Mutex::new(None),
            defaults: Mutex::new(StartDefaults::default()),
            effect: Arc::new(AtomicU8::new(EffectKind::Energy.to_u8())),
            effect_chosen: AtomicBool::new(false),
            on_stopped: Mutex::new(None),
        }
    }

    pub fn state(&self) -> EngineState {
        EngineState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_running(&self) -> bool {
        self.state() == EngineState::Running
    }

    /// Start capturing with the configured (or recommended) device backend
    pub fn start(&self, config: Config) -> Result<(), EngineError> {
        self.start_with_opener(config, AudioSource::open)
    }

    /// Start with a source the caller has already built (e.g. a replay)
    pub fn start_with_source(&self, config: Config, source: AudioSource) -> Result<(), EngineError> {
        let kind = source.kind();
        let mut slot = Some(source);
        self.start_inner(config, Some(kind), &mut |_: SourceKind, _: &SourceRequest| {
            slot.take()
                .ok_or_else(|| SourceError::BackendUnavailable("source already used".into()))
        })
    }

    /// Start with a custom backend opener.
    ///
    /// The opener is asked for the native backend first when that is the
    /// selected kind, and for the portable one if native fails.
    pub fn start_with_opener<F>(&self, config: Config, mut opener: F) -> Result<(), EngineError>
    where
        F: FnMut(SourceKind, &SourceRequest) -> Result<AudioSource, SourceError>,
    {
        self.start_inner(config, None, &mut opener)
    }

    fn start_inner(
        &self,
        config: Config,
        kind: Option<SourceKind>,
        opener: &mut dyn FnMut(SourceKind, &SourceRequest) -> Result<AudioSource, SourceError>,
    ) -> Result<(), EngineError> {
        let mut control = self.control.lock();
        if self.state() == EngineState::Stopping && control.is_some() {
            // The worker gave up after losing the device; finish its teardown
            self.teardown(&mut control);
        }

        if self
            .state
            .compare_exchange(
                EngineState::Idle as u8,
                EngineState::Starting as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Err(EngineError::AlreadyRunning);
        }

        match self.bring_up(config, kind, opener) {
            Ok(run) => {
                *control = Some(run);
                self.state
                    .store(EngineState::Running as u8, Ordering::Release);
                log::info!("Engine running");
                Ok(())
            }
            Err(e) => {
                self.state.store(EngineState::Idle as u8, Ordering::Release);
                log::error!("Engine start failed: {}", e);
                Err(e)
            }
        }
    }

    /// Fill unset config fields from the stored defaults
    fn effective_config(&self, mut config: Config) -> Config {
        let defaults = *self.defaults.lock();
        if config.backend.is_none() {
            config.backend = defaults.backend;
        }
        if config.input_device_id == DEFAULT_INPUT_DEVICE {
            if let Some(id) = defaults.input_device_id {
                config.input_device_id = id;
            }
        }
        if config.sample_rate_hint == 0 {
            config.sample_rate_hint = defaults.sample_rate;
        }
        if config.frames_per_burst_hint == 0 {
            config.frames_per_burst_hint = defaults.frames_per_burst;
        }
        config
    }

    fn bring_up(
        &self,
        config: Config,
        kind: Option<SourceKind>,
        opener: &mut dyn FnMut(SourceKind, &SourceRequest) -> Result<AudioSource, SourceError>,
    ) -> Result<Run, EngineError> {
        let config = self.effective_config(config);
        config.validate()?;

        // One budget covers the recommendation, the native attempt and the
        // portable fallback
        let deadline = Instant::now() + OPEN_TIMEOUT;
        let kind = match kind.or(config.backend.map(SourceKind::from)) {
            Some(kind) => kind,
            None if AudioSource::recommended_by(SourceKind::Native, deadline) => SourceKind::Native,
            None => SourceKind::Portable,
        };
        let request = SourceRequest::from_config(&config).with_deadline(deadline);
        let clock = Clock::new();
        let events = SourceEvents::new();

        let (mut source, consumer, native_fallback) =
            match open_source(kind, &request, opener, clock, &events) {
                Ok((source, consumer)) => (source, consumer, false),
                Err(first) if kind == SourceKind::Native => {
                    log::warn!("Native backend failed ({}), falling back to portable", first);
                    match open_source(SourceKind::Portable, &request, opener, clock, &events) {
                        Ok((source, consumer)) => (source, consumer, true),
                        Err(e) => {
                            log::error!("Portable backend failed too: {}", e);
                            return Err(first.into());
                        }
                    }
                }
                Err(e) => return Err(e.into()),
            };

        let transmit = Arc::new(TransmitStats::default());
        let transmitter = match Transmitter::open(
            &config.endpoint,
            config.effective_protocol(),
            config.timeout_secs,
            config.max_fps,
            transmit.clone(),
        ) {
            Ok(transmitter) => transmitter,
            Err(e) => {
                source.stop();
                source.close();
                return Err(e.into());
            }
        };

        let format = source.format();
        let analysis = AnalysisConfig::new(format.sample_rate, format.channels);
        if !self.effect_chosen.load(Ordering::Acquire) {
            self.effect.store(config.effect.to_u8(), Ordering::Release);
        }
        let renderer = Renderer::new(
            config.led_count,
            EffectKind::from_u8(self.effect.load(Ordering::Acquire)),
            config.symmetric,
            config.gamma,
            config.silence_gate_db,
            analysis.hop_seconds(),
        );

        let config = Arc::new(config);
        let shared = Arc::new(RunShared {
            stop: AtomicBool::new(false),
            config: ArcSwap::new(config.clone()),
            config_generation: AtomicU64::new(0),
            underruns: AtomicU64::new(0),
            overruns: AtomicU64::new(0),
            frames_rendered: AtomicU64::new(0),
            pipeline_resets: AtomicU64::new(0),
            latency_ms: AtomicU32::new(0f32.to_bits()),
            native_fallback,
            transmit,
            events,
        });

        let worker = Worker {
            assembler: FrameAssembler::new(consumer, &analysis),
            extractor: FeatureExtractor::new(&analysis),
            renderer,
            transmitter,
            shared: shared.clone(),
            state: self.state.clone(),
            effect: self.effect.clone(),
            clock,
            on_stopped: self.on_stopped.lock().take(),
            config,
            config_generation: 0,
            reset_generation: 0,
            latency_ms: None,
        };

        let handle = match thread::Builder::new()
            .name("ledfx-worker".to_string())
            .spawn(move || worker.run())
        {
            Ok(handle) => handle,
            Err(e) => {
                source.stop();
                source.close();
                return Err(EngineError::BackendUnavailable(format!(
                    "failed to spawn worker: {}",
                    e
                )));
            }
        };

        log::info!(
            "Pipeline up: {:?} source, {} Hz x {}, native_fallback={}",
            source.kind(),
            format.sample_rate,
            format.channels,
            native_fallback
        );
        *self.shared.lock() = Some(shared);
        Ok(Run {
            source,
            worker: handle,
        })
    }

    /// Stop the pipeline; a no-op when already stopped
    pub fn stop(&self) {
        let mut control = self.control.lock();
        if control.is_none() {
            return;
        }
        self.state
            .store(EngineState::Stopping as u8, Ordering::Release);
        self.teardown(&mut control);
    }

    /// Signal the worker, stop the source, join, close. Ends in `Idle`.
    fn teardown(&self, control: &mut Option<Run>) {
        if let Some(Run { mut source, worker }) = control.take() {
            if let Some(shared) = self.shared.lock().as_ref() {
                shared.stop.store(true, Ordering::Release);
            }
            source.stop();
            if worker.thread().id() == thread::current().id() {
                // Reached from the worker itself, which exits once this returns
                log::debug!("Teardown on the worker thread, not joining");
            } else if worker.join().is_err() {
                log::error!("Worker thread panicked");
            }
            source.close();
            log::info!("Engine stopped");
        }
        self.state.store(EngineState::Idle as u8, Ordering::Release);
    }

    /// Select the effect by name; applies live when running
    pub fn set_effect(&self, name: &str) -> Result<(), EngineError> {
        let kind = EffectKind::from_name(name)
            .ok_or_else(|| EngineError::InvalidConfig(format!("unknown effect '{}'", name)))?;
        self.effect.store(kind.to_u8(), Ordering::Release);
        self.effect_chosen.store(true, Ordering::Release);
        log::info!("Effect set to {}", kind.name());
        Ok(())
    }

    /// Input device for the next start (when the config leaves it at 0)
    pub fn set_input_device(&self, id: i32) {
        self.defaults.lock().input_device_id = Some(id);
        if self.is_running() {
            log::info!("Input device {} takes effect on the next start", id);
        }
    }

    /// Default backend for the next start (when the config leaves it unset)
    pub fn set_backend(&self, backend: Backend) -> Result<(), EngineError> {
        if self.state() != EngineState::Idle {
            return Err(EngineError::AlreadyRunning);
        }
        self.defaults.lock().backend = Some(backend);
        Ok(())
    }

    /// Stream hints used when the config leaves them at 0
    pub fn set_default_stream_values(&self, sample_rate: u32, frames_per_burst: u32) {
        let mut defaults = self.defaults.lock();
        defaults.sample_rate = sample_rate;
        defaults.frames_per_burst = frames_per_burst;
    }

    pub fn is_native_backend_recommended(&self) -> bool {
        AudioSource::recommended(SourceKind::Native)
    }

    /// Callback for an unrecoverable backend loss during the next run
    pub fn set_on_stopped<F>(&self, callback: F)
    where
        F: Fn(StopReason) + Send + Sync + 'static,
    {
        *self.on_stopped.lock() = Some(Arc::new(callback));
    }

    /// Counters of the current (or most recent) run
    pub fn diagnostics(&self) -> Diagnostics {
        let running = self.is_running();
        match self.shared.lock().as_ref() {
            Some(shared) => shared.diagnostics(running),
            None => Diagnostics {
                running,
                ..Diagnostics::default()
            },
        }
    }

    /// The config the running pipeline uses
    pub fn config(&self) -> Option<Arc<Config>> {
        if !self.is_running() {
            return None;
        }
        self.shared.lock().as_ref().map(|s| s.config.load_full())
    }

    /// Change `led_count` and/or `endpoint` while running
    pub fn update_config_live(&self, update: &ConfigUpdate) -> Result<(), EngineError> {
        let control = self.control.lock();
        if control.is_none() || !self.is_running() {
            return Err(EngineError::NotRunning);
        }
        if update.is_empty() {
            return Ok(());
        }

        let shared = self.shared.lock();
        let Some(shared) = shared.as_ref() else {
            return Err(EngineError::NotRunning);
        };
        let next = shared.config.load().with_update(update)?;
        if let Some(endpoint) = &update.endpoint {
            endpoint.resolve()?;
        }
        shared.config.store(Arc::new(next));
        shared.config_generation.fetch_add(1, Ordering::Release);
        log::info!("Live config update queued: {:?}", update);
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Open and start one backend, with a ring sized for its format
fn open_source(
    kind: SourceKind,
    request: &SourceRequest,
    opener: &mut dyn FnMut(SourceKind, &SourceRequest) -> Result<AudioSource, SourceError>,
    clock: Clock,
    events: &Arc<SourceEvents>,
) -> Result<(AudioSource, PcmConsumer), SourceError> {
    let mut source = opener(kind, request)?;
    let format = source.format();
    let capacity = ((format.samples_per_sec() * RING_SECONDS) as usize)
        .max(FRAME_SIZE * format.channels.max(1) as usize * 4);
    let (producer, consumer) = pcm_ring(capacity);
    source.start(producer, clock, events.clone())?;
    Ok((source, consumer))
}

/// Run the stop callback on its own thread so it may call back into the engine
fn notify_stopped(callback: StopCallback, reason: StopReason) {
    let spawned = thread::Builder::new()
        .name("ledfx-notify".to_string())
        .spawn(move || callback(reason));
    if let Err(e) = spawned {
        log::error!("Could not deliver stop notification: {}", e);
    }
}

/// Everything the worker thread owns
struct Worker {
    assembler: FrameAssembler,
    extractor: FeatureExtractor,
    renderer: Renderer,
    transmitter: Transmitter,
    shared: Arc<RunShared>,
    state: Arc<AtomicU8>,
    effect: Arc<AtomicU8>,
    clock: Clock,
    on_stopped: Option<StopCallback>,
    config: Arc<Config>,
    config_generation: u64,
    reset_generation: u64,
    latency_ms: Option<f32>,
}

impl Worker {
    fn run(mut self) {
        if let Err(e) = set_current_thread_priority(ThreadPriority::Max) {
            log::warn!("Could not raise worker thread priority: {:?}", e);
        }
        log::info!("Worker started");
        self.reset_generation = self.shared.events.reset_generation();

        while !self.shared.stop.load(Ordering::Acquire) {
            if let Some(error) = self.shared.events.take_lost() {
                log::error!("Capture backend lost: {}", error);
                self.state
                    .store(EngineState::Stopping as u8, Ordering::Release);
                if let Some(callback) = self.on_stopped.take() {
                    notify_stopped(callback, StopReason::BackendLost(error));
                }
                break;
            }

            self.apply_live_config();
            self.apply_pipeline_reset();
            self.renderer
                .set_effect(EffectKind::from_u8(self.effect.load(Ordering::Acquire)));

            let outcome = self.transmitter.flush(Instant::now());
            self.record(outcome);

            let Some(frame) = self.assembler.next_frame(&self.shared.stop) else {
                self.shared
                    .underruns
                    .store(self.assembler.underruns(), Ordering::Relaxed);
                continue;
            };
            let features = self.extractor.analyze(&frame);
            let strip = self.renderer.render(features);
            let outcome = self
                .transmitter
                .submit(strip.pixels(), features.newest_ns, Instant::now());
            self.record(outcome);

            self.shared.frames_rendered.fetch_add(1, Ordering::Relaxed);
            self.shared
                .overruns
                .store(self.assembler.overruns(), Ordering::Relaxed);
        }

        self.on_stopped = None;
        log::info!(
            "Worker stopped after {} frames",
            self.assembler.frames_emitted()
        );
    }

    fn record(&mut self, outcome: SendOutcome) {
        if let SendOutcome::Sent { newest_ns } = outcome {
            if newest_ns == 0 {
                return;
            }
            let sample_ms = self.clock.now_ns().saturating_sub(newest_ns) as f32 / 1e6;
            let smoothed = match self.latency_ms {
                Some(previous) => previous + LATENCY_SMOOTHING * (sample_ms - previous),
                None => sample_ms,
            };
            self.latency_ms = Some(smoothed);
            self.shared
                .latency_ms
                .store(smoothed.to_bits(), Ordering::Relaxed);
        }
    }

    /// Pick up a config published by `update_config_live`
    fn apply_live_config(&mut self) {
        let generation = self.shared.config_generation.load(Ordering::Acquire);
        if generation == self.config_generation {
            return;
        }
        self.config_generation = generation;
        let mut next = self.shared.config.load_full();

        if next.led_count != self.config.led_count {
            log::info!("LED count {} -> {}", self.config.led_count, next.led_count);
            self.renderer.set_led_count(next.led_count);
            self.transmitter.set_protocol(next.effective_protocol());
        }
        if next.endpoint != self.config.endpoint {
            if let Err(e) = self.transmitter.set_endpoint(&next.endpoint) {
                log::warn!("Keeping old endpoint, re-open failed: {}", e);
                let mut kept = (*next).clone();
                kept.endpoint = self.config.endpoint.clone();
                let kept = Arc::new(kept);
                // A newer update wins; its generation brings us back here
                let _ = self.shared.config.compare_and_swap(&next, kept.clone());
                next = kept;
            }
        }
        self.config = next;
    }

    /// Reset analysis and effect state after a long capture gap
    fn apply_pipeline_reset(&mut self) {
        let generation = self.shared.events.reset_generation();
        if generation == self.reset_generation {
            return;
        }
        self.reset_generation = generation;
        self.assembler.reset();
        self.extractor.reset();
        self.renderer.reset();
        self.shared.pipeline_resets.fetch_add(1, Ordering::Relaxed);
        log::warn!("Pipeline reset after capture gap");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_errors_map_to_boundary_kinds() {
        assert_eq!(
            EngineError::from(SourceError::PermissionDenied("mic".into())),
            EngineError::PermissionDenied("mic".into())
        );
        assert_eq!(
            EngineError::from(SourceError::DeviceBusy("x".into())),
            EngineError::DeviceBusy("x".into())
        );
        assert!(matches!(
            EngineError::from(SourceError::UnsupportedFormat("u8".into())),
            EngineError::BackendUnavailable(_)
        ));
    }

    #[test]
    fn config_errors_are_invalid_config() {
        let err: EngineError = ConfigError::InvalidPort.into();
        assert!(matches!(err, EngineError::InvalidConfig(_)));
    }

    #[test]
    fn new_engine_is_idle() {
        let engine = Engine::new();
        assert_eq!(engine.state(), EngineState::Idle);
        assert!(!engine.is_running());
        assert!(engine.config().is_none());
        assert_eq!(engine.diagnostics(), Diagnostics::default());
    }

    #[test]
    fn stop_when_idle_is_a_no_op() {
        let engine = Engine::new();
        engine.stop();
        engine.stop();
        assert_eq!(engine.state(), EngineState::Idle);
    }

    #[test]
    fn live_update_requires_running() {
        let engine = Engine::new();
        assert_eq!(
            engine.update_config_live(&ConfigUpdate::led_count(10)),
            Err(EngineError::NotRunning)
        );
    }

    #[test]
    fn unknown_effect_is_rejected() {
        let engine = Engine::new();
        assert!(matches!(
            engine.set_effect("rainbow"),
            Err(EngineError::InvalidConfig(_))
        ));
        assert!(engine.set_effect("scroll").is_ok());
        assert_eq!(
            EffectKind::from_u8(engine.effect.load(Ordering::Relaxed)),
            EffectKind::Scroll
        );
    }

    #[test]
    fn invalid_config_rolls_back_to_idle() {
        let engine = Engine::new();
        let config = Config {
            led_count: 0,
            ..Config::default()
        };
        let result = engine.start_with_opener(config, |_, _| {
            Err(SourceError::BackendUnavailable("unused".into()))
        });
        assert!(matches!(result, Err(EngineError::InvalidConfig(_))));
        assert_eq!(engine.state(), EngineState::Idle);
    }

    #[test]
    fn failing_backends_report_the_first_error() {
        let engine = Engine::new();
        let config = Config {
            backend: Some(Backend::Native),
            endpoint: crate::config::Endpoint::new("127.0.0.1", 21324),
            ..Config::default()
        };
        let mut asked = Vec::new();
        let result = engine.start_with_opener(config, |kind, _| {
            asked.push(kind);
            match kind {
                SourceKind::Native => Err(SourceError::PermissionDenied("native".into())),
                _ => Err(SourceError::DeviceBusy("portable".into())),
            }
        });
        assert_eq!(result, Err(EngineError::PermissionDenied("native".into())));
        assert_eq!(asked, vec![SourceKind::Native, SourceKind::Portable]);
        assert_eq!(engine.state(), EngineState::Idle);
    }

    #[test]
    fn set_backend_is_refused_while_not_idle() {
        let engine = Engine::new();
        assert!(engine.set_backend(Backend::Portable).is_ok());
        engine
            .state
            .store(EngineState::Running as u8, Ordering::Release);
        assert_eq!(
            engine.set_backend(Backend::Native),
            Err(EngineError::AlreadyRunning)
        );
        engine.state.store(EngineState::Idle as u8, Ordering::Release);
    }

    #[test]
    fn backend_loss_notifies_once_and_next_start_recovers() {
        use crate::audio::StreamFormat;
        use crate::config::Endpoint;
        use std::sync::atomic::AtomicUsize;
        use std::time::Duration;

        let rx = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = rx.local_addr().unwrap().port();
        let config = Config {
            endpoint: Endpoint::new("127.0.0.1", port),
            ..Config::default()
        };
        let replay = || AudioSource::replay(vec![0.0; 4800], StreamFormat::new(48000, 1, 128), true);

        let engine = Engine::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        engine.set_on_stopped(move |reason| {
            assert!(matches!(reason, StopReason::BackendLost(SourceError::DeviceBusy(_))));
            counter.fetch_add(1, Ordering::SeqCst);
        });
        engine.start_with_source(config.clone(), replay()).unwrap();

        let shared = engine.shared.lock().clone().unwrap();
        shared
            .events
            .record_lost(SourceError::DeviceBusy("unplugged".into()));
        let deadline = Instant::now() + Duration::from_secs(2);
        while calls.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(engine.state(), EngineState::Stopping);
        assert!(!engine.is_running());

        engine.start_with_source(config, replay()).unwrap();
        assert!(engine.is_running());
        engine.stop();
        assert_eq!(engine.state(), EngineState::Idle);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn defaults_fill_unset_fields() {
        let engine = Engine::new();
        engine.set_default_stream_values(44100, 96);
        engine.set_input_device(3);
        engine.set_backend(Backend::Portable).unwrap();

        let config = engine.effective_config(Config::default());
        assert_eq!(config.sample_rate_hint, 44100);
        assert_eq!(config.frames_per_burst_hint, 96);
        assert_eq!(config.input_device_id, 3);
        assert_eq!(config.backend, Some(Backend::Portable));

        let explicit = Config {
            sample_rate_hint: 48000,
            input_device_id: 1,
            backend: Some(Backend::Native),
            ..Config::default()
        };
        let config = engine.effective_config(explicit);
        assert_eq!(config.sample_rate_hint, 48000);
        assert_eq!(config.input_device_id, 1);
        assert_eq!(config.backend, Some(Backend::Native));
    }

    fn loopback() -> (std::net::UdpSocket, crate::config::Endpoint) {
        let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = socket.local_addr().unwrap().port();
        (socket, crate::config::Endpoint::new("127.0.0.1", port))
    }

    fn silent_replay() -> AudioSource {
        AudioSource::replay(
            vec![0.0; 4800],
            crate::audio::StreamFormat::new(48000, 1, 128),
            true,
        )
    }

    /// A worker wired up by hand, with the ring's producer end
    fn bare_worker(
        endpoint: crate::config::Endpoint,
        led_count: usize,
    ) -> (Worker, crate::audio::PcmProducer) {
        let analysis = AnalysisConfig::new(48000, 1);
        let (producer, consumer) = pcm_ring(48000);
        let config = Arc::new(Config {
            endpoint: endpoint.clone(),
            led_count,
            ..Config::default()
        });
        let transmit = Arc::new(TransmitStats::default());
        let transmitter = Transmitter::open(
            &endpoint,
            config.effective_protocol(),
            config.timeout_secs,
            config.max_fps,
            transmit.clone(),
        )
        .unwrap();
        let shared = Arc::new(RunShared {
            stop: AtomicBool::new(false),
            config: ArcSwap::new(config.clone()),
            config_generation: AtomicU64::new(0),
            underruns: AtomicU64::new(0),
            overruns: AtomicU64::new(0),
            frames_rendered: AtomicU64::new(0),
            pipeline_resets: AtomicU64::new(0),
            latency_ms: AtomicU32::new(0f32.to_bits()),
            native_fallback: false,
            transmit,
            events: SourceEvents::new(),
        });
        let worker = Worker {
            assembler: FrameAssembler::new(consumer, &analysis),
            extractor: FeatureExtractor::new(&analysis),
            renderer: Renderer::new(
                led_count,
                EffectKind::Energy,
                false,
                2.2,
                -70.0,
                analysis.hop_seconds(),
            ),
            transmitter,
            shared,
            state: Arc::new(AtomicU8::new(EngineState::Running as u8)),
            effect: Arc::new(AtomicU8::new(EffectKind::Energy.to_u8())),
            clock: Clock::new(),
            on_stopped: None,
            config,
            config_generation: 0,
            reset_generation: 0,
            latency_ms: None,
        };
        (worker, producer)
    }

    #[test]
    fn stop_from_the_stop_callback_returns_to_idle() {
        use std::sync::mpsc;
        use std::time::Duration;

        let (_rx, endpoint) = loopback();
        let config = Config {
            endpoint,
            ..Config::default()
        };
        let engine = Arc::new(Engine::new());
        let weak = Arc::downgrade(&engine);
        let (done_tx, done_rx) = mpsc::channel();
        engine.set_on_stopped(move |_| {
            if let Some(engine) = weak.upgrade() {
                engine.stop();
                let _ = done_tx.send(engine.state());
            }
        });
        engine
            .start_with_source(config.clone(), silent_replay())
            .unwrap();

        let shared = engine.shared.lock().clone().unwrap();
        shared
            .events
            .record_lost(SourceError::BackendUnavailable("unplugged".into()));
        let state = done_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(state, EngineState::Idle);
        assert_eq!(engine.state(), EngineState::Idle);

        engine.start_with_source(config, silent_replay()).unwrap();
        assert!(engine.is_running());
        engine.stop();
        assert_eq!(engine.state(), EngineState::Idle);
    }

    #[test]
    fn capture_gap_resets_the_running_pipeline() {
        use std::time::Duration;

        let (_rx, endpoint) = loopback();
        let config = Config {
            endpoint,
            ..Config::default()
        };
        let engine = Engine::new();
        engine.start_with_source(config, silent_replay()).unwrap();
        assert_eq!(engine.diagnostics().pipeline_resets, 0);

        let shared = engine.shared.lock().clone().unwrap();
        shared.events.record_reset();
        let deadline = Instant::now() + Duration::from_secs(2);
        while engine.diagnostics().pipeline_resets == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(engine.diagnostics().pipeline_resets, 1);
        assert!(engine.is_running());
        engine.stop();
    }

    #[test]
    fn pipeline_reset_clears_analysis_state() {
        use crate::audio::DB_FLOOR;
        use crate::effects::Rgb;

        let (_rx, endpoint) = loopback();
        let (mut worker, mut producer) = bare_worker(endpoint, 30);
        let tone: Vec<f32> = (0..24000)
            .map(|i| 0.5 * (2.0 * std::f32::consts::PI * 1000.0 * i as f32 / 48000.0).sin())
            .collect();
        assert_eq!(producer.write(&tone), tone.len());
        while let Some(frame) = worker.assembler.try_next() {
            let features = worker.extractor.analyze(&frame);
            worker.renderer.render(features);
        }
        assert!(worker.extractor.features().loudness > -20.0);

        worker.shared.events.record_reset();
        worker.apply_pipeline_reset();
        let features = worker.extractor.features();
        assert_eq!(features.loudness, DB_FLOOR);
        assert!(!features.onset);
        assert!(features.smoothed_bands.iter().all(|b| *b == DB_FLOOR));
        assert!(worker.renderer.strip().pixels().iter().all(|p| *p == Rgb::BLACK));
        assert_eq!(worker.shared.pipeline_resets.load(Ordering::Relaxed), 1);

        // Nothing new to apply
        worker.apply_pipeline_reset();
        assert_eq!(worker.shared.pipeline_resets.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn failed_endpoint_reopen_keeps_the_old_endpoint() {
        use crate::config::Endpoint;

        let (_rx, endpoint) = loopback();
        let (mut worker, _producer) = bare_worker(endpoint.clone(), 30);
        let mut next = (*worker.config).clone();
        next.endpoint = Endpoint::new("ledfx-unresolvable.invalid", 21324);
        next.led_count = 45;
        worker.shared.config.store(Arc::new(next));
        worker.shared.config_generation.fetch_add(1, Ordering::Release);

        worker.apply_live_config();
        assert_eq!(worker.transmitter.endpoint(), &endpoint);
        assert_eq!(worker.config.endpoint, endpoint);
        assert_eq!(worker.config.led_count, 45);
        let published = worker.shared.config.load_full();
        assert_eq!(published.endpoint, endpoint);
        assert_eq!(published.led_count, 45);
    }

    #[test]
    fn backend_attempts_share_one_open_deadline() {
        let engine = Engine::new();
        let config = Config {
            backend: Some(Backend::Native),
            endpoint: crate::config::Endpoint::new("127.0.0.1", 21324),
            ..Config::default()
        };
        let before = Instant::now();
        let mut deadlines = Vec::new();
        let result = engine.start_with_opener(config, |_, request| {
            deadlines.push(request.open_deadline);
            Err(SourceError::BackendUnavailable("no device".into()))
        });
        assert!(matches!(result, Err(EngineError::BackendUnavailable(_))));

        assert_eq!(deadlines.len(), 2);
        assert_eq!(deadlines[0], deadlines[1]);
        let deadline = deadlines[0].unwrap();
        assert!(deadline >= before + OPEN_TIMEOUT);
        assert!(deadline <= Instant::now() + OPEN_TIMEOUT);
    }
}
