//! TransportHandle - retrying, de-duplicating message transport on one device
//!
//! A single worker task owns the link, the retry queue and the duplicate
//! filter. Producers talk to it through an unbounded command channel so a
//! slow link never blocks them.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, instrument, trace, warn};

use contracts::{DeviceId, MonotonicClock, RetryConfig};
use protocol::{decode, encode, EnvelopeBuilder, Payload, TimingMessage};

use crate::dedup::Deduplicator;
use crate::metrics::TransportMetrics;
use crate::retry::{DeliveryFailure, RetryQueue};
use crate::{Datagram, PeerTransport, TransportError};

/// Requests accepted by the transport worker.
#[derive(Debug)]
pub enum TransportCommand {
    Send {
        to: Vec<DeviceId>,
        message: TimingMessage,
    },
    /// Stop retrying every message of a run
    CancelRun { run_id: String },
    /// Stop retrying messages to a peer that was declared gone
    ForgetPeer { peer: DeviceId },
}

/// Output of the transport worker.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// First delivery of an inbound message
    Message {
        from: DeviceId,
        message: TimingMessage,
    },
    /// A critical message exhausted its retry budget
    DeliveryFailed(DeliveryFailure),
    /// Inbound bytes that failed to decode
    Rejected { from: DeviceId, error: String },
}

/// Handle to a running transport worker
pub struct TransportHandle {
    local_id: DeviceId,
    tx: mpsc::UnboundedSender<TransportCommand>,
    metrics: Arc<TransportMetrics>,
    worker_handle: JoinHandle<()>,
}

impl TransportHandle {
    /// Spawn the worker and return the handle plus the inbound event stream.
    pub fn spawn<T>(
        link: T,
        inbound: mpsc::UnboundedReceiver<Datagram>,
        builder: Arc<EnvelopeBuilder>,
        clock: Arc<dyn MonotonicClock>,
        config: RetryConfig,
    ) -> (Self, mpsc::UnboundedReceiver<TransportEvent>)
    where
        T: PeerTransport + Send + Sync + 'static,
    {
        let local_id = link.local_id().clone();
        let (tx, rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let metrics = Arc::new(TransportMetrics::new());

        let worker = TransportWorker {
            link,
            builder,
            clock,
            retry: RetryQueue::new(config.clone()),
            dedup: Deduplicator::new(config.dedup_capacity),
            metrics: Arc::clone(&metrics),
            events: events_tx,
        };
        let worker_handle = tokio::spawn(worker.run(rx, inbound, config));

        (
            Self {
                local_id,
                tx,
                metrics,
                worker_handle,
            },
            events_rx,
        )
    }

    pub fn local_id(&self) -> &DeviceId {
        &self.local_id
    }

    pub fn metrics(&self) -> &Arc<TransportMetrics> {
        &self.metrics
    }

    /// Queue a message for one or more peers.
    pub fn send(&self, to: Vec<DeviceId>, message: TimingMessage) -> Result<(), TransportError> {
        self.command(TransportCommand::Send { to, message })
    }

    pub fn cancel_run(&self, run_id: impl Into<String>) -> Result<(), TransportError> {
        self.command(TransportCommand::CancelRun {
            run_id: run_id.into(),
        })
    }

    pub fn forget_peer(&self, peer: DeviceId) -> Result<(), TransportError> {
        self.command(TransportCommand::ForgetPeer { peer })
    }

    pub fn command(&self, command: TransportCommand) -> Result<(), TransportError> {
        self.tx.send(command).map_err(|_| TransportError::Closed)
    }

    /// Stop the worker; pending retries are abandoned.
    #[instrument(name = "transport_handle_shutdown", skip(self), fields(device = %self.local_id))]
    pub async fn shutdown(self) {
        drop(self.tx);
        if let Err(e) = self.worker_handle.await {
            error!(device = %self.local_id, error = ?e, "Transport worker panicked");
        }
        debug!(device = %self.local_id, "TransportHandle shutdown complete");
    }
}

struct TransportWorker<T> {
    link: T,
    builder: Arc<EnvelopeBuilder>,
    clock: Arc<dyn MonotonicClock>,
    retry: RetryQueue,
    dedup: Deduplicator,
    metrics: Arc<TransportMetrics>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl<T: PeerTransport + Send + Sync> TransportWorker<T> {
    #[instrument(name = "transport_worker_loop", skip_all)]
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<TransportCommand>,
        mut inbound: mpsc::UnboundedReceiver<Datagram>,
        config: RetryConfig,
    ) {
        let mut ticker = interval(config.tick());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut inbound_open = true;

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                datagram = inbound.recv(), if inbound_open => match datagram {
                    Some(datagram) => self.handle_datagram(datagram).await,
                    None => {
                        debug!("inbound link closed");
                        inbound_open = false;
                    }
                },
                _ = ticker.tick() => self.poll_retries().await,
            }
        }
        debug!(
            device = %self.link.local_id(),
            pending = self.retry.len(),
            "Transport worker stopped"
        );
    }

    async fn handle_command(&mut self, command: TransportCommand) {
        match command {
            TransportCommand::Send { to, message } => {
                if let Err(e) = self.send_message(&to, &message).await {
                    error!(case = message.case_name(), error = %e, "send failed");
                }
            }
            TransportCommand::CancelRun { run_id } => {
                self.retry.cancel_run(&run_id);
            }
            TransportCommand::ForgetPeer { peer } => {
                let dropped = self.retry.forget_peer(&peer);
                debug!(peer = %peer, dropped, "forgot peer");
            }
        }
    }

    async fn send_message(
        &mut self,
        to: &[DeviceId],
        message: &TimingMessage,
    ) -> Result<(), TransportError> {
        let bytes = encode(message)?;
        let case = message.case_name();
        let now = Instant::now();

        for peer in to {
            if let Err(e) = self.link.send(peer, bytes.clone()).await {
                warn!(peer = %peer, case, error = %e, "first attempt failed");
            }
            self.metrics.inc_sent();
            metrics::counter!("timing_messages_sent_total", "case" => case).increment(1);

            if let Some(message_id) = &message.message_id {
                self.retry.track(
                    peer.clone(),
                    message_id.clone(),
                    case,
                    message.payload.run_id().map(String::from),
                    bytes.clone(),
                    now,
                );
            }
        }
        trace!(case, seq = message.seq, peers = to.len(), "sent");
        Ok(())
    }

    async fn handle_datagram(&mut self, datagram: Datagram) {
        let Datagram { from, bytes } = datagram;
        self.metrics.inc_received();

        let message = match decode(&bytes) {
            Ok(message) => message,
            Err(e) => {
                self.metrics.inc_rejected();
                warn!(from = %from, error = %e, "rejected inbound message");
                self.emit(TransportEvent::Rejected {
                    from,
                    error: e.to_string(),
                });
                return;
            }
        };

        if let Payload::Ack { message_id } = &message.payload {
            if self.retry.acknowledge(&from, message_id) {
                self.metrics.inc_acked();
            }
            return;
        }

        // Duplicates are acked again: the first ack may have been lost.
        if let Some(message_id) = &message.message_id {
            self.send_ack(&from, message_id).await;
        }

        if !self.dedup.first_seen(message.dedup_key()) {
            self.metrics.inc_duplicates();
            metrics::counter!("timing_duplicates_dropped_total").increment(1);
            debug!(from = %from, seq = message.seq, case = message.case_name(), "duplicate dropped");
            return;
        }

        self.emit(TransportEvent::Message { from, message });
    }

    async fn send_ack(&mut self, to: &DeviceId, message_id: &str) {
        let ack = self.builder.build(
            Payload::Ack {
                message_id: message_id.to_string(),
            },
            self.clock.now_nanos(),
        );
        match encode(&ack) {
            Ok(bytes) => {
                if let Err(e) = self.link.send(to, bytes).await {
                    warn!(peer = %to, error = %e, "ack send failed");
                }
            }
            Err(e) => error!(error = %e, "ack encode failed"),
        }
    }

    async fn poll_retries(&mut self) {
        let poll = self.retry.poll(Instant::now());
        for (peer, bytes) in poll.resend {
            self.metrics.inc_retried();
            metrics::counter!("timing_messages_retried_total").increment(1);
            if let Err(e) = self.link.send(&peer, bytes).await {
                debug!(peer = %peer, error = %e, "resend failed");
            }
        }
        for failure in poll.failed {
            self.metrics.inc_delivery_failures();
            metrics::counter!("timing_delivery_failures_total").increment(1);
            self.emit(TransportEvent::DeliveryFailed(failure));
        }
    }

    fn emit(&self, event: TransportEvent) {
        if self.events.send(event).is_err() {
            trace!("transport event receiver dropped");
        }
    }
}
