//! Simulation orchestrator - one host and its gate devices in a single process.
//!
//! Every device gets its own skewed monotonic clock, transport endpoint on a
//! shared lossy network, detector pipeline and synthetic camera. The host
//! drives K sprints end to end while a scripted athlete runs the course.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clock_sync::{SkewedClock, SystemClock};
use contracts::{DeviceId, MonotonicClock, RunRecord, StartType, TimingBlueprint};
use crossing_detector::DetectorPipeline;
use protocol::EnvelopeBuilder;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use session::{
    CoordinatorError, DetectorLink, DriverHandle, HostCommand, HostCoordinator, HostSnapshot,
    ParticipantCommand, ParticipantCoordinator, SessionDriver, SessionPhase,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use transport::{MemoryNetwork, NetworkConditions, TransportHandle, TransportMetrics};

use super::camera::{spawn_camera, AthleteScript, CameraSpec, Sprint};
use super::course::bind_devices;
use super::stats::{ClockOutcome, RunOutcome, SimulationStats};

/// Run-up before the start line on a flying start (m)
const FLYING_LEAD_IN_M: f64 = 5.0;
const START_ATTEMPTS: u32 = 3;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Simulation configuration
#[derive(Debug, Clone)]
pub struct SimulationConfig {
    pub blueprint: TimingBlueprint,
    /// Sprints to time
    pub runs: u32,
    pub speed_mps: f64,
    pub fps: u32,
    pub conditions: NetworkConditions,
    /// Bound on the random device clock offset (ms)
    pub max_skew_ms: u64,
    /// Bound on the random device clock drift (ppm)
    pub max_drift_ppm: f64,
    pub seed: u64,
    /// Whole-session deadline
    pub timeout: Duration,
}

struct GateDevice {
    device_id: DeviceId,
    gate_id: String,
    offset_nanos: i64,
    driver: DriverHandle<ParticipantCoordinator>,
    transport: Arc<TransportMetrics>,
    pipeline: DetectorPipeline,
    camera: JoinHandle<u64>,
}

/// Main simulation orchestrator
pub struct Simulation {
    config: SimulationConfig,
}

impl Simulation {
    pub fn new(config: SimulationConfig) -> Self {
        Self { config }
    }

    /// Run the simulation to completion
    pub async fn run(self) -> Result<SimulationStats> {
        let started = Instant::now();
        let SimulationConfig {
            mut blueprint,
            runs,
            speed_mps,
            fps,
            conditions,
            max_skew_ms,
            max_drift_ppm,
            seed,
            timeout,
        } = self.config;

        let bound = bind_devices(&mut blueprint);
        config_loader::ConfigLoader::validate(&blueprint).context("Invalid simulation course")?;
        let bp = blueprint;

        let base = SystemClock::new();
        let true_clock: Arc<dyn MonotonicClock> = Arc::new(base);
        let network = MemoryNetwork::new(conditions, seed);
        let mut rng = StdRng::seed_from_u64(seed);
        let script = AthleteScript::new();
        let tick = bp.retry.tick();

        // Host
        let host_id = bp.session.host_id.clone();
        let host_builder = Arc::new(EnvelopeBuilder::new(
            host_id.clone(),
            bp.session.session_id.clone(),
        ));
        let (link, inbox) = network.join(host_id.clone());
        let (transport, events) = TransportHandle::spawn(
            link,
            inbox,
            host_builder.clone(),
            true_clock.clone(),
            bp.retry.clone(),
        );
        let host_transport = transport.metrics().clone();
        let mut host = SessionDriver::spawn(
            HostCoordinator::new(&bp, host_builder),
            transport,
            events,
            None,
            true_clock.clone(),
            tick,
        );
        info!(host = %host_id, gates = bound.len(), "host started");

        // Gate devices
        let mut gates = Vec::with_capacity(bound.len());
        for (device_id, idx) in bound {
            let gate = &bp.gates[idx];
            let max_skew = max_skew_ms as i64;
            let offset_nanos = rng.random_range(-max_skew..=max_skew) * 1_000_000;
            let drift_ppm = if max_drift_ppm > 0.0 {
                rng.random_range(-max_drift_ppm..=max_drift_ppm)
            } else {
                0.0
            };
            let clock: Arc<dyn MonotonicClock> =
                Arc::new(SkewedClock::new(base, offset_nanos, drift_ppm));

            let builder = Arc::new(EnvelopeBuilder::new(
                device_id.clone(),
                bp.session.session_id.clone(),
            ));
            let (link, inbox) = network.join(device_id.clone());
            let (transport, events) = TransportHandle::spawn(
                link,
                inbox,
                builder.clone(),
                clock.clone(),
                bp.retry.clone(),
            );
            let transport_metrics = transport.metrics().clone();

            let detector = bp.detector_for_gate(&gate.id);
            let gate_position = detector.gate_position;
            let pipeline = DetectorPipeline::spawn(&gate.id, detector)
                .with_context(|| format!("Failed to start detector for gate {}", gate.id))?;

            let coordinator = ParticipantCoordinator::new(
                device_id.as_str(),
                Some(gate.role),
                host_id.clone(),
                builder,
                bp.clock_sync.clone(),
                bp.heartbeat.clone(),
                bp.session.status_interval_nanos(),
            );
            let driver = SessionDriver::spawn(
                coordinator,
                transport,
                events,
                Some(DetectorLink {
                    events: pipeline.events(),
                    control: pipeline.control(),
                }),
                clock.clone(),
                tick,
            );
            let camera = spawn_camera(
                CameraSpec {
                    gate_id: gate.id.clone(),
                    gate_position,
                    gate_distance_m: gate.distance_m,
                    fps,
                },
                pipeline.frame_sender(),
                script.subscribe(),
                true_clock.clone(),
                clock,
            );
            driver
                .execute(ParticipantCommand::Connect)
                .await
                .with_context(|| format!("Device {device_id} failed to connect"))?;
            info!(
                device = %device_id,
                gate_id = %gate.id,
                offset_ms = offset_nanos as f64 / 1e6,
                drift_ppm = format!("{drift_ppm:.1}"),
                "gate device started"
            );

            gates.push(GateDevice {
                device_id,
                gate_id: gate.id.clone(),
                offset_nanos,
                driver,
                transport: transport_metrics,
                pipeline,
                camera,
            });
        }

        // Dispatcher
        let (record_tx, record_rx) = mpsc::channel::<RunRecord>(16);
        let dispatcher = dispatcher::create_dispatcher(bp.sinks.clone(), record_rx)
            .context("Failed to create dispatcher")?;
        let dispatcher_handle = dispatcher.spawn();

        let mut stats = SimulationStats::default();
        let session = Session {
            bp: &bp,
            gate_count: gates.len(),
            runs,
            speed_mps,
            script: &script,
            true_clock: true_clock.as_ref(),
            records: &record_tx,
        };
        let outcome = match tokio::time::timeout(timeout, session.drive(&mut host, &mut stats)).await {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!(
                "Simulation timed out after {}s",
                timeout.as_secs()
            )),
        };

        // Clock estimates as the host ended up seeing them
        let snapshot = host.snapshot();
        for gate in &gates {
            let estimate = snapshot
                .devices
                .iter()
                .find(|d| d.device_id == gate.device_id)
                .and_then(|d| d.clock.clone());
            if let Some(estimate) = &estimate {
                stats
                    .metrics
                    .record_clock_uncertainty(gate.device_id.as_str(), estimate.uncertainty_ms);
            }
            stats.clocks.push(ClockOutcome {
                device_id: gate.device_id.to_string(),
                true_offset_ms: gate.offset_nanos as f64 / 1e6,
                estimated_offset_ms: estimate.as_ref().map(|e| e.offset_nanos as f64 / 1e6),
                uncertainty_ms: estimate.map(|e| e.uncertainty_ms),
            });
        }

        if let Err(e) = host
            .execute(HostCommand::EndSession("simulation complete".to_string()))
            .await
        {
            warn!(error = %e, "could not end session");
        }
        for gate in &gates {
            let ended = gate
                .driver
                .wait_for(|s| s.phase == SessionPhase::SessionEnded);
            if tokio::time::timeout(SHUTDOWN_GRACE, ended).await.is_err() {
                debug!(device = %gate.device_id, "session end not seen");
            }
        }

        // Teardown
        drop(script);
        for gate in gates {
            let GateDevice {
                device_id,
                gate_id,
                driver,
                transport,
                pipeline,
                camera,
                ..
            } = gate;
            let frames = camera.await.unwrap_or_default();
            if let Err(e) = driver.shutdown().await {
                warn!(device = %device_id, error = %e, "participant driver shutdown failed");
            }
            let detector = pipeline.metrics();
            if tokio::task::spawn_blocking(move || pipeline.shutdown())
                .await
                .is_err()
            {
                warn!(gate_id = %gate_id, "detector shutdown panicked");
            }
            let detector = detector.snapshot();
            debug!(gate_id = %gate_id, frames, ?detector, "gate stopped");
            stats
                .metrics
                .add_frames(detector.frames_processed, detector.frames_dropped);
            for _ in 0..detector.crossings_emitted {
                stats.metrics.record_crossing(&gate_id);
            }
            let t = transport.snapshot();
            stats
                .metrics
                .add_transport(t.sent, t.retried, t.delivery_failures, t.duplicates_dropped);
        }

        let leftover = host.take_records();
        if !leftover.is_empty() {
            debug!(count = leftover.len(), "records after the last run");
        }
        if let Err(e) = host.shutdown().await {
            warn!(error = %e, "host driver shutdown failed");
        }
        let t = host_transport.snapshot();
        stats
            .metrics
            .add_transport(t.sent, t.retried, t.delivery_failures, t.duplicates_dropped);

        drop(record_tx);
        match dispatcher_handle.await {
            Ok(sinks) => {
                for (name, m) in sinks {
                    info!(
                        sink = %name,
                        written = m.write_count,
                        failed = m.failure_count,
                        dropped = m.dropped_count,
                        "sink closed"
                    );
                }
            }
            Err(e) => warn!(error = %e, "dispatcher task failed"),
        }

        let network_stats = network.stats();
        stats.network_dropped = network_stats.dropped;
        stats.network_duplicated = network_stats.duplicated;
        stats.duration = started.elapsed();

        outcome.map(|()| stats)
    }
}

/// Host-side script of one simulated session.
struct Session<'a> {
    bp: &'a TimingBlueprint,
    gate_count: usize,
    runs: u32,
    speed_mps: f64,
    script: &'a AthleteScript,
    true_clock: &'a dyn MonotonicClock,
    records: &'a mpsc::Sender<RunRecord>,
}

impl Session<'_> {
    async fn drive(
        &self,
        host: &mut DriverHandle<HostCoordinator>,
        stats: &mut SimulationStats,
    ) -> Result<()> {
        info!("waiting for gates to join");
        host.wait_for(|s| s.phase == SessionPhase::Calibrating)
            .await?;

        host.execute(HostCommand::CalibrateAll).await?;
        let snapshot = host
            .wait_for(|s| {
                self.all_devices(s, |d| {
                    d.calibrated.is_some() && d.clock.as_ref().is_some_and(|c| c.synced)
                })
            })
            .await?;
        if let Some(device) = snapshot.devices.iter().find(|d| d.calibrated == Some(false)) {
            bail!("Gate device {} failed to calibrate", device.device_id);
        }
        info!("all gates calibrated and synced");

        let start_type = self.bp.session.start_type;
        let (start_m, finish_m) = self.course_ends()?;
        for n in 1..=self.runs {
            host.execute(HostCommand::NewRun).await?;
            host.execute(HostCommand::ArmAll).await?;
            self.start_when_ready(host).await?;

            let now = self.true_clock.now_nanos();
            let sprint = match start_type {
                StartType::Flying => Sprint {
                    start_true_nanos: now,
                    speed_mps: self.speed_mps,
                    lead_in_m: FLYING_LEAD_IN_M - start_m,
                },
                StartType::Countdown => Sprint {
                    start_true_nanos: now
                        + i64::from(self.bp.session.countdown_seconds) * 1_000_000_000,
                    speed_mps: self.speed_mps,
                    lead_in_m: -start_m,
                },
                StartType::Manual => {
                    host.execute(HostCommand::StartTiming).await?;
                    Sprint {
                        start_true_nanos: self.true_clock.now_nanos(),
                        speed_mps: self.speed_mps,
                        lead_in_m: -start_m,
                    }
                }
            };
            self.script.run(sprint);
            let expected_seconds =
                (sprint.arrival_nanos(finish_m) - sprint.arrival_nanos(start_m)) as f64 / 1e9;
            info!(run = n, expected_seconds, "athlete running");

            match tokio::time::timeout(self.result_wait(), host.next_record()).await {
                Ok(Some(record)) => {
                    stats.metrics.record_run(&record);
                    let outcome = RunOutcome {
                        record: record.clone(),
                        expected_seconds,
                    };
                    info!(
                        run_id = %record.run_id,
                        seconds = record.total_seconds(),
                        error_ms = format!("{:+.2}", outcome.error_ms()),
                        "run timed"
                    );
                    stats.runs.push(outcome);
                    if self.records.send(record).await.is_err() {
                        warn!("dispatcher closed");
                    }
                }
                Ok(None) => bail!("Host driver stopped"),
                Err(_) => {
                    warn!(run = n, "no result, cancelling run");
                    if let Err(e) = host.execute(HostCommand::CancelRun).await {
                        debug!(error = %e, "run already closed by the host");
                    }
                    stats.metrics.record_cancelled();
                    stats.runs_cancelled += 1;
                }
            }
            self.script.clear();
        }
        Ok(())
    }

    /// Start the run once every gate is armed and clear.
    async fn start_when_ready(&self, host: &DriverHandle<HostCoordinator>) -> Result<()> {
        for attempt in 1..=START_ATTEMPTS {
            host.wait_for(|s| {
                s.phase == SessionPhase::Armed && self.all_devices(s, |d| d.ready_for_run())
            })
            .await?;
            match host.execute(HostCommand::StartRun).await {
                Ok(()) => return Ok(()),
                Err(CoordinatorError::GatesNotReady { gates }) if attempt < START_ATTEMPTS => {
                    debug!(?gates, attempt, "gates dropped out before start");
                }
                Err(e) => return Err(e.into()),
            }
        }
        bail!("Gates never became ready")
    }

    fn all_devices(&self, s: &HostSnapshot, pred: impl Fn(&session::DeviceRecord) -> bool) -> bool {
        s.devices.len() == self.gate_count && s.devices.iter().all(pred)
    }

    fn course_ends(&self) -> Result<(f64, f64)> {
        let gates = self.bp.gate_assignments();
        let distance = |role| {
            gates
                .iter()
                .find(|g| g.role == role)
                .map(|g| g.distance_meters)
        };
        match (
            distance(contracts::GateRole::Start),
            distance(contracts::GateRole::Finish),
        ) {
            (Some(start), Some(finish)) => Ok((start, finish)),
            _ => bail!("Course needs a start and a finish gate"),
        }
    }

    fn result_wait(&self) -> Duration {
        let session = &self.bp.session;
        Duration::from_secs_f64(
            session.result_timeout_secs + f64::from(session.countdown_seconds) + 1.0,
        )
    }
}
