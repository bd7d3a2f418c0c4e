//! Detector pipeline: frame queue → dedicated worker thread → event queue.
//!
//! The camera side only ever calls non-blocking `try_send`; a full queue drops a
//! frame per the configured policy instead of stalling capture.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use async_channel::{bounded, unbounded, Receiver, Sender, TrySendError};
use contracts::{CrossingEvent, DetectorConfig, DropPolicy, Frame, GateStatusInfo};
use tracing::{debug, info, instrument, trace, warn};

use crate::detector::CrossingDetector;
use crate::error::DetectorError;

/// Commands applied between frames.
#[derive(Debug, Clone, PartialEq)]
pub enum DetectorCommand {
    Arm,
    Disarm,
    Pause,
    Resume,
    Recalibrate,
    SetGatePosition(f64),
    Gyro(Option<f32>),
    Battery(Option<f32>),
}

/// Output of the detector worker.
#[derive(Debug, Clone, PartialEq)]
pub enum DetectorEvent {
    Crossing {
        gate_id: String,
        event: CrossingEvent,
    },
    Status {
        gate_id: String,
        status: GateStatusInfo,
    },
}

/// Pipeline metrics
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    pub frames_received: AtomicU64,
    pub frames_dropped: AtomicU64,
    pub frames_processed: AtomicU64,
    pub crossings_emitted: AtomicU64,
    pub crossings_suppressed: AtomicU64,
    pub queue_len: AtomicUsize,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> PipelineMetricsSnapshot {
        PipelineMetricsSnapshot {
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            frames_processed: self.frames_processed.load(Ordering::Relaxed),
            crossings_emitted: self.crossings_emitted.load(Ordering::Relaxed),
            crossings_suppressed: self.crossings_suppressed.load(Ordering::Relaxed),
            queue_len: self.queue_len.load(Ordering::Relaxed),
        }
    }
}

/// Metrics snapshot
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineMetricsSnapshot {
    pub frames_received: u64,
    pub frames_dropped: u64,
    pub frames_processed: u64,
    pub crossings_emitted: u64,
    pub crossings_suppressed: u64,
    pub queue_len: usize,
}

/// Camera-facing end of the frame queue (cheap to clone).
#[derive(Clone)]
pub struct FrameSender {
    gate_id: Arc<str>,
    tx: Sender<Frame>,
    /// Kept so `DropOldest` can evict the head of a full queue
    rx: Receiver<Frame>,
    drop_policy: DropPolicy,
    metrics: Arc<PipelineMetrics>,
}

impl FrameSender {
    /// Enqueue a frame without blocking.
    pub fn send(&self, frame: Frame) -> Result<(), DetectorError> {
        self.metrics.frames_received.fetch_add(1, Ordering::Relaxed);
        match self.tx.try_send(frame) {
            Ok(()) => {
                trace!(gate_id = %self.gate_id, "frame queued");
            }
            Err(TrySendError::Full(frame)) => {
                self.record_drop();
                match self.drop_policy {
                    DropPolicy::DropNewest => {
                        trace!(gate_id = %self.gate_id, "frame dropped (newest)");
                    }
                    DropPolicy::DropOldest => {
                        let _ = self.rx.try_recv();
                        if self.tx.try_send(frame).is_err() {
                            trace!(gate_id = %self.gate_id, "frame dropped after eviction");
                        } else {
                            trace!(gate_id = %self.gate_id, "oldest frame evicted");
                        }
                    }
                }
            }
            Err(TrySendError::Closed(_)) => {
                return Err(DetectorError::QueueClosed {
                    gate_id: self.gate_id.to_string(),
                });
            }
        }
        self.metrics.queue_len.store(self.tx.len(), Ordering::Relaxed);
        Ok(())
    }

    fn record_drop(&self) {
        self.metrics.frames_dropped.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("timing_frames_dropped_total", "gate" => self.gate_id.to_string())
            .increment(1);
    }

    /// Close the queue; the worker drains what is left and exits.
    pub fn close(&self) {
        self.tx.close();
    }
}

/// Handle to a running detector worker.
pub struct DetectorPipeline {
    gate_id: String,
    frames: FrameSender,
    control: Sender<DetectorCommand>,
    events: Receiver<DetectorEvent>,
    metrics: Arc<PipelineMetrics>,
    worker: Option<JoinHandle<()>>,
}

impl DetectorPipeline {
    /// Spawn the worker thread for one gate.
    #[instrument(name = "detector_pipeline_spawn", skip(config), fields(gate_id = %gate_id))]
    pub fn spawn(gate_id: &str, config: DetectorConfig) -> Result<Self, DetectorError> {
        let (frame_tx, frame_rx) = bounded(config.queue.capacity.max(1));
        let (control_tx, control_rx) = unbounded();
        let (event_tx, event_rx) = unbounded();
        let metrics = Arc::new(PipelineMetrics::new());

        let frames = FrameSender {
            gate_id: Arc::from(gate_id),
            tx: frame_tx,
            rx: frame_rx.clone(),
            drop_policy: config.queue.drop_policy,
            metrics: metrics.clone(),
        };

        let worker = DetectorWorker {
            detector: CrossingDetector::new(gate_id, config),
            frames: frame_rx,
            control: control_rx,
            events: event_tx,
            metrics: metrics.clone(),
            paused: false,
            last_status: None,
        };

        let handle = std::thread::Builder::new()
            .name(format!("detector-{gate_id}"))
            .spawn(move || worker.run())
            .map_err(|source| DetectorError::WorkerSpawn {
                gate_id: gate_id.to_string(),
                source,
            })?;

        info!(gate_id = %gate_id, "detector pipeline started");
        Ok(Self {
            gate_id: gate_id.to_string(),
            frames,
            control: control_tx,
            events: event_rx,
            metrics,
            worker: Some(handle),
        })
    }

    pub fn gate_id(&self) -> &str {
        &self.gate_id
    }

    pub fn frame_sender(&self) -> FrameSender {
        self.frames.clone()
    }

    pub fn events(&self) -> Receiver<DetectorEvent> {
        self.events.clone()
    }

    /// Control sender, also usable from async code via `send().await`.
    pub fn control(&self) -> Sender<DetectorCommand> {
        self.control.clone()
    }

    pub fn command(&self, command: DetectorCommand) -> Result<(), DetectorError> {
        self.control
            .try_send(command)
            .map_err(|_| DetectorError::ControlClosed {
                gate_id: self.gate_id.clone(),
            })
    }

    pub fn metrics(&self) -> Arc<PipelineMetrics> {
        self.metrics.clone()
    }

    /// Close the frame queue and wait for the worker to finish.
    pub fn shutdown(mut self) {
        self.frames.close();
        self.control.close();
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                warn!(gate_id = %self.gate_id, "detector worker panicked");
            }
        }
    }
}

impl Drop for DetectorPipeline {
    fn drop(&mut self) {
        self.frames.close();
        self.control.close();
    }
}

struct DetectorWorker {
    detector: CrossingDetector,
    frames: Receiver<Frame>,
    control: Receiver<DetectorCommand>,
    events: Sender<DetectorEvent>,
    metrics: Arc<PipelineMetrics>,
    paused: bool,
    last_status: Option<GateStatusInfo>,
}

impl DetectorWorker {
    fn run(mut self) {
        self.publish_status();
        while let Ok(frame) = self.frames.recv_blocking() {
            self.apply_commands();
            self.metrics.queue_len.store(self.frames.len(), Ordering::Relaxed);

            let outcome = self.detector.process(&frame);
            self.metrics.frames_processed.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("timing_frames_processed_total").increment(1);

            if let Some(event) = outcome.crossing {
                if self.detector.is_armed() && !self.paused {
                    self.metrics.crossings_emitted.fetch_add(1, Ordering::Relaxed);
                    self.emit(DetectorEvent::Crossing {
                        gate_id: self.detector.gate_id().to_string(),
                        event,
                    });
                } else {
                    self.metrics.crossings_suppressed.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        gate_id = %self.detector.gate_id(),
                        armed = self.detector.is_armed(),
                        paused = self.paused,
                        "crossing suppressed"
                    );
                }
            }
            self.publish_status();
        }
        debug!(gate_id = %self.detector.gate_id(), "frame queue closed, worker exiting");
    }

    fn apply_commands(&mut self) {
        while let Ok(command) = self.control.try_recv() {
            debug!(gate_id = %self.detector.gate_id(), ?command, "detector command");
            match command {
                DetectorCommand::Arm => self.detector.arm(),
                DetectorCommand::Disarm => self.detector.disarm(),
                DetectorCommand::Pause => self.paused = true,
                DetectorCommand::Resume => self.paused = false,
                DetectorCommand::Recalibrate => self.detector.recalibrate(),
                DetectorCommand::SetGatePosition(p) => self.detector.set_gate_position(p),
                DetectorCommand::Gyro(m) => self.detector.set_gyro_magnitude(m),
                DetectorCommand::Battery(b) => self.detector.set_battery_level(b),
            }
        }
    }

    fn publish_status(&mut self) {
        let status = self.detector.status();
        if self.last_status.as_ref() != Some(&status) {
            self.last_status = Some(status.clone());
            self.emit(DetectorEvent::Status {
                gate_id: self.detector.gate_id().to_string(),
                status,
            });
        }
    }

    fn emit(&self, event: DetectorEvent) {
        if self.events.try_send(event).is_err() {
            trace!(gate_id = %self.detector.gate_id(), "event receiver gone");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::SyntheticScene;

    fn collect_events(rx: &Receiver<DetectorEvent>) -> Vec<DetectorEvent> {
        let mut out = Vec::new();
        while let Ok(e) = rx.try_recv() {
            out.push(e);
        }
        out
    }

    fn wait_processed(pipeline: &DetectorPipeline, count: u64) {
        for _ in 0..500 {
            if pipeline.metrics().snapshot().frames_processed >= count {
                return;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        panic!("worker did not process {count} frames");
    }

    #[test]
    fn test_drop_oldest_keeps_newest_frames() {
        let (tx, rx) = bounded(2);
        let sender = FrameSender {
            gate_id: Arc::from("g"),
            tx,
            rx: rx.clone(),
            drop_policy: DropPolicy::DropOldest,
            metrics: Arc::new(PipelineMetrics::new()),
        };
        let scene = SyntheticScene::new(8, 8);
        for i in 0..4 {
            sender.send(scene.render(None, i, i as u64)).unwrap();
        }
        let indices: Vec<u64> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|f| f.frame_index)
            .collect();
        assert_eq!(indices, vec![2, 3]);
        assert_eq!(sender.metrics.snapshot().frames_dropped, 2);
    }

    #[test]
    fn test_drop_newest_keeps_oldest_frames() {
        let (tx, rx) = bounded(2);
        let sender = FrameSender {
            gate_id: Arc::from("g"),
            tx,
            rx: rx.clone(),
            drop_policy: DropPolicy::DropNewest,
            metrics: Arc::new(PipelineMetrics::new()),
        };
        let scene = SyntheticScene::new(8, 8);
        for i in 0..4 {
            sender.send(scene.render(None, i, i as u64)).unwrap();
        }
        let indices: Vec<u64> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|f| f.frame_index)
            .collect();
        assert_eq!(indices, vec![0, 1]);
    }

    #[test]
    fn test_pipeline_emits_crossing_only_when_armed() {
        let mut config = DetectorConfig::default();
        config.queue.capacity = 128;
        let pipeline = DetectorPipeline::spawn("finish", config).unwrap();
        let frames = pipeline.frame_sender();
        let events = pipeline.events();
        let scene = SyntheticScene::new(640, 120);

        let mut index = 0u64;
        let mut run = |lefts: &[Option<f32>]| {
            for left in lefts {
                let ts = index as i64 * 10_000_000;
                frames.send(scene.render(*left, ts, index)).unwrap();
                index += 1;
            }
        };

        let warm: Vec<Option<f32>> = vec![None; 12];
        let pass = [Some(250.0), Some(280.0), Some(310.0), Some(340.0)];
        let idle: Vec<Option<f32>> = vec![None; 40];

        run(&warm);
        run(&pass);
        run(&idle);
        wait_processed(&pipeline, 56);
        pipeline.command(DetectorCommand::Arm).unwrap();
        run(&pass);
        run(&idle);

        let metrics = pipeline.metrics();
        pipeline.shutdown();

        let crossings: Vec<_> = collect_events(&events)
            .into_iter()
            .filter(|e| matches!(e, DetectorEvent::Crossing { .. }))
            .collect();
        assert_eq!(crossings.len(), 1);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.crossings_suppressed, 1);
        assert_eq!(snapshot.frames_processed, 112);
    }
}
