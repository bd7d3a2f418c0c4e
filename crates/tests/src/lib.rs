//! End-to-end scenarios for the sprint timer.
//!
//! A host and its gate devices run in one process over a lossy in-memory
//! network. Cameras are replaced by scripted detectors so the scenarios run
//! on a paused tokio clock.

#[cfg(test)]
mod harness;

#[cfg(test)]
mod contract_tests {
    use config_loader::{ConfigFormat, ConfigLoader};
    use contracts::{DeviceId, GateRole, StartType};
    use protocol::{decode, encode, EnvelopeBuilder, Payload};
    use session::{EventLog, SessionPhase, SessionView};

    const COURSE: &str = r#"
[session]
session_id = "track-day"
host_id = "host"
start_type = "flying"

[[gates]]
id = "start"
role = "start"
index = 0
distance_m = 0.0

[[gates]]
id = "lap-1"
role = "lap"
index = 1
distance_m = 10.0

[[gates]]
id = "finish"
role = "finish"
index = 2
distance_m = 30.0
gate_position = 0.6

[[sinks]]
name = "console"
sink_type = "log"
"#;

    #[test]
    fn test_blueprint_survives_toml_and_json() {
        let bp = ConfigLoader::load_from_str(COURSE, ConfigFormat::Toml).unwrap();
        assert_eq!(bp.total_distance_m(), 30.0);

        let toml = ConfigLoader::to_toml(&bp).unwrap();
        let from_toml = ConfigLoader::load_from_str(&toml, ConfigFormat::Toml).unwrap();
        let json = ConfigLoader::to_json(&bp).unwrap();
        let from_json = ConfigLoader::load_from_str(&json, ConfigFormat::Json).unwrap();

        let expected = serde_json::to_value(&bp).unwrap();
        assert_eq!(serde_json::to_value(&from_toml).unwrap(), expected);
        assert_eq!(serde_json::to_value(&from_json).unwrap(), expected);

        let gates = from_json.gate_assignments();
        assert_eq!(gates[1].role, GateRole::Lap);
        assert_eq!(from_json.detector_for_gate("finish").gate_position, 0.6);
    }

    #[test]
    fn test_wire_message_keeps_envelope() {
        let builder = EnvelopeBuilder::new(DeviceId::from("host"), "track-day");
        let message = builder.build(
            Payload::StartTypeChanged {
                start_type: StartType::Countdown,
                version: 3,
            },
            42,
        );
        let bytes = encode(&message).unwrap();
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded, message);
        assert_eq!(decoded.case_name(), "startTypeChanged");
    }

    /// Host broadcasts for `runs` complete sprints, logged as the host logs them.
    fn session_broadcasts(builder: &EnvelopeBuilder, log: &mut EventLog, runs: u32) -> Vec<protocol::TimingMessage> {
        let mut sent = Vec::new();
        let mut push = |payload: Payload, sent: &mut Vec<_>| {
            let seq = builder.last_seq() + 1;
            let message = builder.build_with_event(payload, Some(format!("host-{seq}")), seq as i64);
            log.record(&message);
            sent.push(message);
        };
        push(Payload::CalibrateAll {}, &mut sent);
        for n in 1..=runs {
            let run_id = format!("run-{n}");
            push(Payload::NewRun { run_id: run_id.clone() }, &mut sent);
            push(Payload::ArmAll {}, &mut sent);
            push(
                Payload::StartRun {
                    countdown_seconds: 0,
                    run_id: run_id.clone(),
                },
                &mut sent,
            );
            push(
                Payload::TimingResultBroadcast {
                    split_nanos: 4_000_000_000 + i64::from(n),
                    uncertainty_ms: 1.0,
                    start_gate_id: "start".into(),
                    finish_gate_id: "finish".into(),
                    run_id,
                },
                &mut sent,
            );
        }
        sent
    }

    #[test]
    fn test_event_sync_replay_converges() {
        let builder = EnvelopeBuilder::new(DeviceId::from("host"), "track-day");
        let mut log = EventLog::new(256);
        let sent = session_broadcasts(&builder, &mut log, 3);

        let mut uninterrupted = SessionView::default();
        for message in &sent {
            uninterrupted.apply(message);
        }
        assert_eq!(uninterrupted.completed_runs.len(), 3);

        // Every cut point: the device misses the tail and asks for it back
        for cut in 0..=sent.len() {
            let mut reconnected = SessionView::default();
            for message in &sent[..cut] {
                reconnected.apply(message);
            }
            let run_id = reconnected.run_id.clone().unwrap_or_default();
            let missed = log.replay(reconnected.last_event_id.as_deref(), &run_id);
            assert_eq!(missed.len(), sent.len() - cut, "cut at {cut}");
            for message in &missed {
                reconnected.apply(message);
            }
            assert_eq!(reconnected, uninterrupted, "cut at {cut}");
        }
    }

    #[test]
    fn test_replay_after_duplicate_delivery() {
        let builder = EnvelopeBuilder::new(DeviceId::from("host"), "track-day");
        let mut log = EventLog::new(256);
        let sent = session_broadcasts(&builder, &mut log, 2);

        let mut expected = SessionView::default();
        for message in &sent {
            expected.apply(message);
        }

        // What a lossy link delivers: a gap, a duplicate, then the replay
        let mut view = SessionView::default();
        view.apply(&sent[0]);
        view.apply(&sent[1]);
        view.apply(&sent[1]);
        let missed = log.replay(view.last_event_id.as_deref(), "run-1");
        for message in &missed {
            view.apply(message);
        }
        assert_eq!(view.phase, expected.phase);
        assert_eq!(view.completed_runs, expected.completed_runs);
        assert_eq!(view.last_result, expected.last_result);
        assert_eq!(view.phase, SessionPhase::Idle);
    }
}

#[cfg(test)]
mod e2e_tests {
    use std::time::Duration;

    use contracts::{RunRecord, SinkConfig, SinkType, StartType};
    use dispatcher::create_dispatcher;
    use observability::TimingMetricsAggregator;
    use session::{HostCommand, ParticipantCommand, SessionPhase};
    use tokio::sync::mpsc;
    use transport::NetworkConditions;

    use crate::harness::{course, step, GateClock, Rig};

    const LOSSY: NetworkConditions = NetworkConditions {
        drop_rate: 0.1,
        duplicate_rate: 0.05,
    };

    fn skewed() -> Vec<GateClock> {
        vec![
            GateClock::new(180, 8.0),
            GateClock::new(-240, -5.0),
            GateClock::new(35, 2.5),
        ]
    }

    fn assert_close(record: &RunRecord, expected_seconds: f64) {
        let error_ms = (record.total_seconds() - expected_seconds) * 1e3;
        assert!(
            error_ms.abs() <= record.uncertainty_ms + 2.0,
            "run {} off by {error_ms:.3} ms (uncertainty {:.3} ms)",
            record.run_id,
            record.uncertainty_ms
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_flying_runs_over_lossy_network() {
        let mut rig = Rig::start(course(StartType::Flying), LOSSY, skewed(), 11).await;
        rig.calibrate().await;

        // Host estimates follow the device clocks
        let snapshot = rig.host.snapshot();
        for gate in &rig.gates {
            let device = snapshot
                .devices
                .iter()
                .find(|d| d.device_id == gate.device_id)
                .unwrap();
            let estimate = device.clock.as_ref().unwrap();
            assert!(estimate.synced);
            let error_ms = (estimate.offset_nanos - gate.offset_nanos) as f64 / 1e6;
            assert!(error_ms.abs() < 1.0, "{} off by {error_ms} ms", gate.device_id);
        }

        let mut metrics = TimingMetricsAggregator::new();
        let splits = [Duration::from_millis(1_480), Duration::from_millis(2_730)];
        for _ in 0..3 {
            let record = rig.sprint(&splits).await;
            assert_close(&record, 4.21);
            assert!(record.synced);
            assert_eq!(record.segments.len(), 2);
            let lap = &record.segments[0];
            assert_eq!(lap.to_gate_id, "lap-1");
            assert!((lap.split_nanos as f64 / 1e6 - 1_480.0).abs() <= lap.uncertainty_ms + 2.0);
            metrics.record_run(&record);
        }

        let summary = metrics.summary();
        assert_eq!(summary.runs_completed, 3);
        assert_eq!(summary.runs_unsynced, 0);
        assert!(rig.network.stats().dropped > 0);
        rig.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_countdown_start_uses_host_signal() {
        let mut bp = course(StartType::Countdown);
        bp.session.countdown_seconds = 3;
        let mut rig = Rig::start(bp, LOSSY, skewed(), 23).await;
        rig.calibrate().await;

        let started = rig.arm_and_start().await;
        // Start gate stays silent; timing begins when the countdown runs out
        let go = started + Duration::from_secs(3);
        tokio::time::sleep_until(go + Duration::from_millis(1_900)).await;
        rig.gate("lap-1").cross().await;
        tokio::time::sleep_until(go + Duration::from_millis(4_000)).await;
        rig.gate("finish").cross().await;

        let record = rig.next_record().await;
        assert_eq!(record.start_type, StartType::Countdown);
        assert_close(&record, 4.0);
        rig.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_lap_gate_still_finishes() {
        let mut bp = course(StartType::Flying);
        bp.session.result_timeout_secs = 6.0;
        let mut rig = Rig::start(bp, NetworkConditions::default(), skewed(), 5).await;
        rig.calibrate().await;

        rig.arm_and_start().await;
        rig.gate("start").cross().await;
        tokio::time::sleep(Duration::from_millis(3_500)).await;
        rig.gate("finish").cross().await;

        let record = rig.next_record().await;
        assert_close(&record, 3.5);
        assert!(record.segments.iter().all(|s| s.to_gate_id != "lap-1"));
        rig.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnected_gate_catches_up_by_event_sync() {
        let mut bp = course(StartType::Flying);
        // Give up on the absent gate quickly so only the replay can repair it
        bp.retry.max_attempts = 2;
        bp.heartbeat.peer_timeout_ms = 10_000;
        let mut rig = Rig::start(bp, NetworkConditions::default(), skewed(), 3).await;
        rig.calibrate().await;
        let first = rig.sprint(&[Duration::from_secs(1), Duration::from_secs(2)]).await;

        let absent = rig.gates[1].device_id.clone();
        rig.network.set_offline(&absent, true);
        rig.host.execute(HostCommand::NewRun).await.unwrap();
        rig.host.execute(HostCommand::ArmAll).await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;

        let stale = rig.gates[1].driver.snapshot();
        assert_eq!(stale.view.run_id.as_deref(), Some(first.run_id.as_str()));

        rig.network.set_offline(&absent, false);
        rig.gates[1]
            .driver
            .execute(ParticipantCommand::RequestEventSync)
            .await
            .unwrap();

        let host_run = rig.host.snapshot().run_id;
        let caught_up = tokio::time::timeout(
            Duration::from_secs(5),
            rig.gates[1]
                .driver
                .wait_for(|s| s.view.run_id == host_run && s.view.phase == SessionPhase::Armed),
        )
        .await
        .expect("gate never caught up")
        .unwrap();
        assert_eq!(caught_up.view, rig.gates[0].driver.snapshot().view);

        // The repaired gate takes part in the next start
        rig.start_when_ready().await;
        rig.gate("start").cross().await;
        tokio::time::sleep(Duration::from_millis(900)).await;
        rig.gate("lap-1").cross().await;
        tokio::time::sleep(Duration::from_millis(1_600)).await;
        rig.gate("finish").cross().await;
        let record = rig.next_record().await;
        assert_close(&record, 2.5);
        rig.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnected_gate_is_replayed_what_it_missed() {
        let mut bp = course(StartType::Flying);
        bp.retry.max_attempts = 2;
        // Long enough that the gate never notices the host was gone
        bp.heartbeat.peer_timeout_ms = 10_000;
        let mut rig = Rig::start(bp, NetworkConditions::default(), skewed(), 17).await;
        rig.calibrate().await;
        rig.sprint(&[Duration::from_secs(1), Duration::from_secs(2)]).await;

        let absent = rig.gates[2].device_id.clone();
        rig.network.set_offline(&absent, true);
        rig.host.execute(HostCommand::NewRun).await.unwrap();
        rig.host.execute(HostCommand::ArmAll).await.unwrap();
        step(
            "host to give up on the gate",
            rig.host.wait_for(|s| s.devices.iter().any(|d| d.device_id == absent && !d.connected)),
        )
        .await
        .unwrap();

        rig.network.set_offline(&absent, false);
        let host_run = rig.host.snapshot().run_id;
        let caught_up = step(
            "gate to catch up from its heartbeat alone",
            rig.gates[2]
                .driver
                .wait_for(|s| s.view.run_id == host_run && s.view.phase == SessionPhase::Armed),
        )
        .await
        .unwrap();
        assert_eq!(caught_up.view, rig.gates[0].driver.snapshot().view);

        rig.start_when_ready().await;
        rig.gate("start").cross().await;
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        rig.gate("lap-1").cross().await;
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        rig.gate("finish").cross().await;
        assert_close(&rig.next_record().await, 2.0);
        rig.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_results_fan_out_to_sinks() {
        let dir = tempfile::tempdir().unwrap();
        let mut params = std::collections::HashMap::new();
        params.insert("base_path".to_string(), dir.path().display().to_string());
        let sinks = vec![
            SinkConfig {
                name: "log".into(),
                sink_type: SinkType::Log,
                queue_capacity: 4,
                params: Default::default(),
            },
            SinkConfig {
                name: "file".into(),
                sink_type: SinkType::File,
                queue_capacity: 4,
                params,
            },
        ];
        let (tx, rx) = mpsc::channel(8);
        let dispatcher = create_dispatcher(sinks, rx).unwrap().spawn();

        let mut rig = Rig::start(course(StartType::Flying), LOSSY, skewed(), 17).await;
        rig.calibrate().await;
        for _ in 0..2 {
            let record = rig.sprint(&[Duration::from_secs(1), Duration::from_secs(1)]).await;
            tx.send(record).await.unwrap();
        }
        rig.shutdown().await;
        drop(tx);

        let metrics = dispatcher.await.unwrap();
        assert_eq!(metrics.len(), 2);
        assert!(metrics.iter().all(|(_, m)| m.write_count == 2));

        let mut lines = 0;
        for entry in std::fs::read_dir(dir.path()).unwrap() {
            let content = std::fs::read_to_string(entry.unwrap().path()).unwrap();
            for line in content.lines() {
                let record: RunRecord = serde_json::from_str(line).unwrap();
                assert_eq!(record.segments.len(), 2);
                lines += 1;
            }
        }
        assert_eq!(lines, 2);
    }
}
