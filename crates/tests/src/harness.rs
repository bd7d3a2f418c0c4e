//! One host and scripted gate devices on a shared in-memory network.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_channel::{Receiver, Sender};
use clock_sync::{SkewedClock, SystemClock};
use contracts::{
    CrossingEvent, DeviceId, GateConfig, GateRole, GateStatusInfo, MonotonicClock, RunRecord,
    StartType, TimingBlueprint,
};
use crossing_detector::{DetectorCommand, DetectorEvent};
use protocol::EnvelopeBuilder;
use session::{
    CoordinatorError, DetectorLink, DriverHandle, HostCommand, HostCoordinator, HostSnapshot,
    ParticipantCommand, ParticipantCoordinator, SessionDriver, SessionPhase,
};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use transport::{MemoryNetwork, NetworkConditions, TransportHandle};

/// Upper bound for any single step of a scenario
const STEP: Duration = Duration::from_secs(20);
const START_ATTEMPTS: u32 = 3;

/// Start, one lap gate at 10 m, finish at 30 m; each timing gate pre-bound to `gate-<index>`.
pub fn course(start_type: StartType) -> TimingBlueprint {
    let mut bp = TimingBlueprint::default();
    bp.session.session_id = "e2e".to_string();
    bp.session.start_type = start_type;
    bp.session.result_timeout_secs = 5.0;
    bp.session.status_interval_ms = 500;
    bp.heartbeat.interval_ms = 500;
    bp.heartbeat.peer_timeout_ms = 3_000;
    bp.gates = [
        ("start", GateRole::Start, 0.0),
        ("lap-1", GateRole::Lap, 10.0),
        ("finish", GateRole::Finish, 30.0),
    ]
    .into_iter()
    .zip(0u32..)
    .map(|((id, role, distance_m), index)| GateConfig {
        id: id.to_string(),
        role,
        index,
        distance_m,
        device_id: Some(DeviceId::new(&format!("gate-{index}"))),
        gate_position: None,
    })
    .collect();
    bp
}

/// How far a device clock sits from true time.
#[derive(Debug, Clone, Copy, Default)]
pub struct GateClock {
    pub offset_ms: i64,
    pub drift_ppm: f64,
}

impl GateClock {
    pub fn new(offset_ms: i64, drift_ppm: f64) -> Self {
        Self {
            offset_ms,
            drift_ppm,
        }
    }
}

/// A gate device whose camera is replaced by explicit crossings.
pub struct Gate {
    pub device_id: DeviceId,
    pub gate_id: String,
    pub offset_nanos: i64,
    pub driver: DriverHandle<ParticipantCoordinator>,
    clock: Arc<dyn MonotonicClock>,
    events: Sender<DetectorEvent>,
    detector: JoinHandle<()>,
}

impl Gate {
    /// Report a crossing at the current instant on this device's clock.
    pub async fn cross(&self) {
        let ts = self.clock.now_nanos();
        let event = DetectorEvent::Crossing {
            gate_id: self.gate_id.clone(),
            event: CrossingEvent {
                timestamp_nanos: ts,
                raw_timestamp_nanos: ts,
                frame_index: 0,
                confidence: 0.95,
                velocity_px_per_sec: -900.0,
                thumbnail: None,
            },
        };
        self.events.send(event).await.expect("detector link closed");
    }
}

/// Stands in for the detector worker: ready from the start, follows control commands.
fn spawn_scripted_detector(
    gate_id: String,
    gate_position: f64,
    events: Sender<DetectorEvent>,
    control: Receiver<DetectorCommand>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut status = GateStatusInfo {
            is_calibrated: true,
            is_armed: false,
            is_clear: true,
            is_prebuffer_ready: true,
            is_stable: true,
            gate_position,
            battery_level: None,
        };
        let report = |status: &GateStatusInfo| DetectorEvent::Status {
            gate_id: gate_id.clone(),
            status: status.clone(),
        };
        if events.send(report(&status)).await.is_err() {
            return;
        }
        while let Ok(command) = control.recv().await {
            match command {
                DetectorCommand::Recalibrate => {
                    let reset = GateStatusInfo {
                        is_calibrated: false,
                        ..status.clone()
                    };
                    if events.send(report(&reset)).await.is_err() {
                        return;
                    }
                }
                DetectorCommand::Arm => status.is_armed = true,
                DetectorCommand::Disarm => status.is_armed = false,
                DetectorCommand::SetGatePosition(position) => status.gate_position = position,
                DetectorCommand::Pause
                | DetectorCommand::Resume
                | DetectorCommand::Gyro(_)
                | DetectorCommand::Battery(_) => {}
            }
            if events.send(report(&status)).await.is_err() {
                return;
            }
        }
    })
}

pub async fn step<T>(what: &str, fut: impl Future<Output = T>) -> T {
    match timeout(STEP, fut).await {
        Ok(value) => value,
        Err(_) => panic!("timed out waiting for {what}"),
    }
}

pub struct Rig {
    pub network: MemoryNetwork,
    pub host: DriverHandle<HostCoordinator>,
    pub gates: Vec<Gate>,
}

impl Rig {
    /// Spawn the host and one scripted device per timing gate, then connect them.
    pub async fn start(
        bp: TimingBlueprint,
        conditions: NetworkConditions,
        clocks: Vec<GateClock>,
        seed: u64,
    ) -> Self {
        config_loader::ConfigLoader::validate(&bp).expect("invalid course");
        let base = SystemClock::new();
        let network = MemoryNetwork::new(conditions, seed);
        let tick = bp.retry.tick();

        let host_id = bp.session.host_id.clone();
        let host_builder = Arc::new(EnvelopeBuilder::new(
            host_id.clone(),
            bp.session.session_id.clone(),
        ));
        let (link, inbox) = network.join(host_id.clone());
        let host_clock: Arc<dyn MonotonicClock> = Arc::new(base);
        let (transport, events) = TransportHandle::spawn(
            link,
            inbox,
            host_builder.clone(),
            host_clock.clone(),
            bp.retry.clone(),
        );
        let host = SessionDriver::spawn(
            HostCoordinator::new(&bp, host_builder),
            transport,
            events,
            None,
            host_clock,
            tick,
        );

        let mut timing: Vec<&GateConfig> = bp.gates.iter().filter(|g| g.role.is_timing()).collect();
        timing.sort_by_key(|g| g.index);

        let mut gates = Vec::with_capacity(timing.len());
        for (n, gate) in timing.into_iter().enumerate() {
            let device_id = gate.device_id.clone().expect("gate without a device");
            let skew = clocks.get(n).copied().unwrap_or_default();
            let offset_nanos = skew.offset_ms * 1_000_000;
            let clock: Arc<dyn MonotonicClock> =
                Arc::new(SkewedClock::new(base, offset_nanos, skew.drift_ppm));

            let builder = Arc::new(EnvelopeBuilder::new(
                device_id.clone(),
                bp.session.session_id.clone(),
            ));
            let (link, inbox) = network.join(device_id.clone());
            let (transport, transport_events) = TransportHandle::spawn(
                link,
                inbox,
                builder.clone(),
                clock.clone(),
                bp.retry.clone(),
            );

            let (event_tx, event_rx) = async_channel::unbounded();
            let (control_tx, control_rx) = async_channel::unbounded();
            let detector = spawn_scripted_detector(
                gate.id.clone(),
                bp.detector_for_gate(&gate.id).gate_position,
                event_tx.clone(),
                control_rx,
            );

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
                transport_events,
                Some(DetectorLink {
                    events: event_rx,
                    control: control_tx,
                }),
                clock.clone(),
                tick,
            );
            driver
                .execute(ParticipantCommand::Connect)
                .await
                .expect("connect");

            gates.push(Gate {
                device_id,
                gate_id: gate.id.clone(),
                offset_nanos,
                driver,
                clock,
                events: event_tx,
                detector,
            });
        }

        Self {
            network,
            host,
            gates,
        }
    }

    pub fn gate(&self, gate_id: &str) -> &Gate {
        self.gates
            .iter()
            .find(|g| g.gate_id == gate_id)
            .unwrap_or_else(|| panic!("no gate {gate_id}"))
    }

    fn all_devices(&self, s: &HostSnapshot, pred: impl Fn(&session::DeviceRecord) -> bool) -> bool {
        s.devices.len() == self.gates.len() && s.devices.iter().all(pred)
    }

    /// Wait for every gate to join, then calibrate and sync them all.
    pub async fn calibrate(&self) {
        step(
            "gates to join",
            self.host.wait_for(|s| s.phase == SessionPhase::Calibrating),
        )
        .await
        .unwrap();
        self.host.execute(HostCommand::CalibrateAll).await.unwrap();
        let snapshot = step(
            "calibration and clock sync",
            self.host.wait_for(|s| {
                self.all_devices(s, |d| {
                    d.calibrated.is_some() && d.clock.as_ref().is_some_and(|c| c.synced)
                })
            }),
        )
        .await
        .unwrap();
        assert!(
            snapshot.devices.iter().all(|d| d.calibrated == Some(true)),
            "calibration failed: {:?}",
            snapshot.devices
        );
    }

    /// New run, arm, start. Returns the instant the host accepted the start.
    pub async fn arm_and_start(&self) -> Instant {
        self.host.execute(HostCommand::NewRun).await.unwrap();
        self.host.execute(HostCommand::ArmAll).await.unwrap();
        self.start_when_ready().await
    }

    /// Start the armed run once every gate is ready and wait for the gates to see it.
    pub async fn start_when_ready(&self) -> Instant {
        for attempt in 1..=START_ATTEMPTS {
            step(
                "gates to arm",
                self.host.wait_for(|s| {
                    s.phase == SessionPhase::Armed && self.all_devices(s, |d| d.ready_for_run())
                }),
            )
            .await
            .unwrap();
            let started = Instant::now();
            match self.host.execute(HostCommand::StartRun).await {
                Ok(()) => {
                    for gate in &self.gates {
                        step(
                            "gates to see the run",
                            gate.driver
                                .wait_for(|s| s.view.phase == SessionPhase::RunInProgress),
                        )
                        .await
                        .unwrap();
                    }
                    return started;
                }
                Err(CoordinatorError::GatesNotReady { .. }) if attempt < START_ATTEMPTS => {}
                Err(e) => panic!("start rejected: {e}"),
            }
        }
        unreachable!("start attempts exhausted")
    }

    /// A flying sprint: cross the start, then each later gate after its segment time.
    pub async fn sprint(&mut self, segments: &[Duration]) -> RunRecord {
        self.arm_and_start().await;
        let mut order: Vec<usize> = (0..self.gates.len()).collect();
        order.sort_by_key(|&i| self.gates[i].gate_id != "start");
        let (first, rest) = order.split_first().expect("course without gates");
        self.gates[*first].cross().await;
        for (&i, segment) in rest.iter().zip(segments) {
            tokio::time::sleep(*segment).await;
            self.gates[i].cross().await;
        }
        self.next_record().await
    }

    pub async fn next_record(&mut self) -> RunRecord {
        step("run result", self.host.next_record())
            .await
            .expect("host driver stopped")
    }

    pub async fn shutdown(self) {
        let _ = self
            .host
            .execute(HostCommand::EndSession("scenario complete".to_string()))
            .await;
        for gate in self.gates {
            let ended = gate
                .driver
                .wait_for(|s| s.phase == SessionPhase::SessionEnded);
            let _ = timeout(Duration::from_secs(1), ended).await;
            gate.driver.shutdown().await.unwrap();
            drop(gate.events);
            gate.detector.await.unwrap();
        }
        self.host.shutdown().await.unwrap();
    }
}
