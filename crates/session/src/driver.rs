//! SessionDriver - one coordination task per device
//!
//! Serializes transport events, detector events, local commands and timer
//! ticks into a single coordinator. Observers read the latest snapshot through
//! a watch channel; completed runs leave on their own channel.

use std::sync::Arc;
use std::time::Duration;

use async_channel::{Receiver, Sender};
use contracts::{MonotonicClock, RunRecord};
use crossing_detector::{DetectorCommand, DetectorEvent};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, instrument, warn};
use transport::{TransportEvent, TransportHandle};

use crate::host::{HostCommand, HostCoordinator, HostSnapshot};
use crate::participant::{ParticipantCommand, ParticipantCoordinator, ParticipantSnapshot};
use crate::{CoordinatorError, Output};

/// State machine the driver runs.
pub trait Coordinator: Send + 'static {
    type Command: Send + 'static;
    type Snapshot: Clone + PartialEq + Send + Sync + 'static;

    fn on_transport(&mut self, event: TransportEvent, now: i64) -> Vec<Output>;
    fn on_detector(&mut self, event: DetectorEvent, now: i64) -> Vec<Output>;
    fn on_command(&mut self, command: Self::Command, now: i64)
        -> Result<Vec<Output>, CoordinatorError>;
    fn tick(&mut self, now: i64) -> Vec<Output>;
    fn snapshot(&self) -> Self::Snapshot;
}

impl Coordinator for HostCoordinator {
    type Command = HostCommand;
    type Snapshot = HostSnapshot;

    fn on_transport(&mut self, event: TransportEvent, now: i64) -> Vec<Output> {
        self.handle_transport(event, now)
    }

    fn on_detector(&mut self, event: DetectorEvent, _now: i64) -> Vec<Output> {
        debug!(?event, "host has no local gate");
        Vec::new()
    }

    fn on_command(&mut self, command: HostCommand, now: i64) -> Result<Vec<Output>, CoordinatorError> {
        self.handle_command(command, now)
    }

    fn tick(&mut self, now: i64) -> Vec<Output> {
        HostCoordinator::tick(self, now)
    }

    fn snapshot(&self) -> HostSnapshot {
        HostCoordinator::snapshot(self)
    }
}

impl Coordinator for ParticipantCoordinator {
    type Command = ParticipantCommand;
    type Snapshot = ParticipantSnapshot;

    fn on_transport(&mut self, event: TransportEvent, now: i64) -> Vec<Output> {
        self.handle_transport(event, now)
    }

    fn on_detector(&mut self, event: DetectorEvent, now: i64) -> Vec<Output> {
        self.handle_detector(event, now)
    }

    fn on_command(
        &mut self,
        command: ParticipantCommand,
        now: i64,
    ) -> Result<Vec<Output>, CoordinatorError> {
        self.handle_command(command, now)
    }

    fn tick(&mut self, now: i64) -> Vec<Output> {
        ParticipantCoordinator::tick(self, now)
    }

    fn snapshot(&self) -> ParticipantSnapshot {
        ParticipantCoordinator::snapshot(self)
    }
}

/// Detector wiring for a gate device.
pub struct DetectorLink {
    pub events: Receiver<DetectorEvent>,
    pub control: Sender<DetectorCommand>,
}

struct Request<C: Coordinator> {
    command: C::Command,
    reply: oneshot::Sender<Result<(), CoordinatorError>>,
}

/// Handle to a running session driver
pub struct DriverHandle<C: Coordinator> {
    tx: mpsc::UnboundedSender<Request<C>>,
    snapshot: watch::Receiver<C::Snapshot>,
    records: mpsc::UnboundedReceiver<RunRecord>,
    worker_handle: JoinHandle<C>,
}

impl<C: Coordinator> DriverHandle<C> {
    /// Run a command on the coordination task and wait for its verdict.
    pub async fn execute(&self, command: C::Command) -> Result<(), CoordinatorError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Request { command, reply })
            .map_err(|_| CoordinatorError::DriverClosed)?;
        rx.await.map_err(|_| CoordinatorError::DriverClosed)?
    }

    pub fn snapshot(&self) -> C::Snapshot {
        self.snapshot.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<C::Snapshot> {
        self.snapshot.clone()
    }

    /// Wait until `pred` holds for the published snapshot.
    pub async fn wait_for(
        &self,
        pred: impl FnMut(&C::Snapshot) -> bool,
    ) -> Result<C::Snapshot, CoordinatorError> {
        let mut rx = self.snapshot.clone();
        let snapshot = rx
            .wait_for(pred)
            .await
            .map_err(|_| CoordinatorError::DriverClosed)?;
        Ok(snapshot.clone())
    }

    pub async fn next_record(&mut self) -> Option<RunRecord> {
        self.records.recv().await
    }

    /// Completed runs not yet taken.
    pub fn take_records(&mut self) -> Vec<RunRecord> {
        let mut out = Vec::new();
        while let Ok(record) = self.records.try_recv() {
            out.push(record);
        }
        out
    }

    /// Stop the task and hand back the coordinator.
    pub async fn shutdown(self) -> Result<C, CoordinatorError> {
        drop(self.tx);
        self.worker_handle.await.map_err(|e| {
            error!(error = ?e, "session driver panicked");
            CoordinatorError::DriverClosed
        })
    }
}

pub struct SessionDriver;

impl SessionDriver {
    pub fn spawn<C: Coordinator>(
        coordinator: C,
        transport: TransportHandle,
        transport_events: mpsc::UnboundedReceiver<TransportEvent>,
        detector: Option<DetectorLink>,
        clock: Arc<dyn MonotonicClock>,
        tick: Duration,
    ) -> DriverHandle<C> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(coordinator.snapshot());
        let (records_tx, records_rx) = mpsc::unbounded_channel();

        let worker = DriverWorker {
            coordinator,
            transport,
            detector_control: detector.as_ref().map(|d| d.control.clone()),
            clock,
            snapshot: snapshot_tx,
            records: records_tx,
        };
        let worker_handle = tokio::spawn(worker.run(
            rx,
            transport_events,
            detector.map(|d| d.events),
            tick,
        ));
        DriverHandle {
            tx,
            snapshot: snapshot_rx,
            records: records_rx,
            worker_handle,
        }
    }
}

struct DriverWorker<C: Coordinator> {
    coordinator: C,
    transport: TransportHandle,
    detector_control: Option<Sender<DetectorCommand>>,
    clock: Arc<dyn MonotonicClock>,
    snapshot: watch::Sender<C::Snapshot>,
    records: mpsc::UnboundedSender<RunRecord>,
}

/// Receive from an optional detector queue; an absent queue never resolves.
async fn next_detector(events: &Option<Receiver<DetectorEvent>>) -> Option<DetectorEvent> {
    match events {
        Some(rx) => rx.recv().await.ok(),
        None => std::future::pending().await,
    }
}

impl<C: Coordinator> DriverWorker<C> {
    #[instrument(name = "session_driver_loop", skip_all)]
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Request<C>>,
        mut transport_events: mpsc::UnboundedReceiver<TransportEvent>,
        mut detector: Option<Receiver<DetectorEvent>>,
        tick: Duration,
    ) -> C {
        let mut ticker = interval(tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                request = commands.recv() => match request {
                    Some(Request { command, reply }) => {
                        let now = self.clock.now_nanos();
                        let result = self.coordinator.on_command(command, now);
                        let verdict = match result {
                            Ok(outputs) => {
                                self.execute(outputs);
                                Ok(())
                            }
                            Err(e) => Err(e),
                        };
                        let _ = reply.send(verdict);
                    }
                    None => break,
                },
                event = transport_events.recv() => match event {
                    Some(event) => {
                        let outputs = self.coordinator.on_transport(event, self.clock.now_nanos());
                        self.execute(outputs);
                    }
                    None => {
                        warn!("transport closed");
                        break;
                    }
                },
                event = next_detector(&detector) => match event {
                    Some(event) => {
                        let outputs = self.coordinator.on_detector(event, self.clock.now_nanos());
                        self.execute(outputs);
                    }
                    None => {
                        debug!("detector queue closed");
                        detector = None;
                    }
                },
                _ = ticker.tick() => {
                    let outputs = self.coordinator.tick(self.clock.now_nanos());
                    self.execute(outputs);
                }
            }
            self.publish();
        }

        let device = self.transport.local_id().clone();
        self.transport.shutdown().await;
        debug!(device = %device, "session driver stopped");
        self.coordinator
    }

    fn execute(&mut self, outputs: Vec<Output>) {
        for output in outputs {
            match output {
                Output::Send { to, message } => {
                    if to.is_empty() {
                        continue;
                    }
                    if let Err(e) = self.transport.send(to, message) {
                        error!(error = %e, "transport rejected message");
                    }
                }
                Output::Detector(command) => match &self.detector_control {
                    Some(control) => {
                        if control.try_send(command).is_err() {
                            warn!("detector control queue closed");
                        }
                    }
                    None => debug!(?command, "no detector attached"),
                },
                Output::CancelRetries { run_id } => {
                    if let Err(e) = self.transport.cancel_run(run_id) {
                        error!(error = %e, "cannot cancel retries");
                    }
                }
                Output::RunCompleted(record) => {
                    if self.records.send(record).is_err() {
                        debug!("nobody is collecting run records");
                    }
                }
            }
        }
    }

    fn publish(&self) {
        let next = self.coordinator.snapshot();
        self.snapshot.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}
