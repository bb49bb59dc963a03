use log::{info, warn};

use crate::{
    config::DeviceConfig,
    portal::{run_portal, PortalOutcome, PortalUi},
    reset::{DoubleResetDetector, ResetMarker},
    store::{ConfigStore, LoadOutcome, Storage},
};

/// Pause before restarting after a failed provisioning cycle, so the
/// device never spins through a tight reset loop.
pub const RESTART_DELAY_MS: u64 = 3_000;

/// Joins the target network using credentials the network stack owns.
pub trait NetworkJoin {
    fn join(&mut self) -> bool;
}

/// What the firmware layer should do with this boot cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootOutcome<C> {
    /// Configured and joined; hand the record read-only to the runtime.
    Ready(C),
    /// Unrecoverable this cycle; restart after `delay_ms` and rerun the
    /// whole sequence. Retries are unbounded by design.
    Restart { delay_ms: u64 },
}

/// The once-per-power-cycle boot sequence: load config, classify the
/// reset, join or provision, and hand off.
pub fn run_boot<C, S, M, W, U>(
    store: &mut ConfigStore<S>,
    detector: &mut DoubleResetDetector<M>,
    network: &mut W,
    ui: &mut U,
    device_id: &str,
    now_ms: u64,
    portal_timeout_ms: u64,
) -> BootOutcome<C>
where
    C: DeviceConfig,
    S: Storage,
    M: ResetMarker,
    W: NetworkJoin,
    U: PortalUi,
{
    let (mut config, outcome) = store.load::<C>();
    match outcome {
        LoadOutcome::Stored => info!("loaded stored config"),
        LoadOutcome::Missing => info!("no stored config, starting from defaults"),
        LoadOutcome::Corrupt => warn!("stored config unreadable, starting from defaults"),
        LoadOutcome::Unavailable => warn!("storage unavailable, running with in-memory defaults"),
    }
    config.apply_identity_default(device_id);

    let forced = detector.detect(now_ms);
    if forced {
        info!("double reset detected, forcing reconfiguration");
    } else if network.join() {
        detector.stop();
        return BootOutcome::Ready(config);
    } else {
        warn!("network join failed with stored credentials, entering provisioning");
    }

    match run_portal(&config, ui, store, detector, portal_timeout_ms) {
        PortalOutcome::Committed(updated) => {
            if network.join() {
                BootOutcome::Ready(updated)
            } else {
                warn!("network join failed after provisioning, restarting");
                BootOutcome::Restart {
                    delay_ms: RESTART_DELAY_MS,
                }
            }
        }
        PortalOutcome::ResetSettings => {
            info!("settings reset requested, restarting");
            BootOutcome::Restart { delay_ms: 0 }
        }
        PortalOutcome::Abandoned => BootOutcome::Restart {
            delay_ms: RESTART_DELAY_MS,
        },
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        config::WebThingConfig,
        portal::{PortalEvent, PortalField},
        reset::SlotMarker,
        store::MemoryStorage,
    };

    struct ScriptedNetwork {
        results: Vec<bool>,
        calls: usize,
    }

    impl ScriptedNetwork {
        fn new(results: &[bool]) -> Self {
            Self {
                results: results.to_vec(),
                calls: 0,
            }
        }
    }

    impl NetworkJoin for ScriptedNetwork {
        fn join(&mut self) -> bool {
            let result = self.results.get(self.calls).copied().unwrap_or(false);
            self.calls += 1;
            result
        }
    }

    struct ScriptedUi {
        event: PortalEvent,
        captures: usize,
    }

    impl ScriptedUi {
        fn new(event: PortalEvent) -> Self {
            Self { event, captures: 0 }
        }
    }

    impl PortalUi for ScriptedUi {
        fn capture(&mut self, _fields: &[PortalField], _timeout_ms: u64) -> PortalEvent {
            self.captures += 1;
            self.event.clone()
        }
    }

    fn submission(values: &[(&str, &str)]) -> PortalEvent {
        PortalEvent::Submitted(
            values
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn configured_device_joins_without_the_portal() {
        let mut storage = MemoryStorage::default();
        storage.contents = Some(
            serde_json::to_vec(&WebThingConfig {
                thing_id: "dev-42".to_string(),
                thing_name: "Porch".to_string(),
            })
            .unwrap(),
        );
        let mut store = ConfigStore::new(storage);
        let mut detector = DoubleResetDetector::new(SlotMarker::default());
        let mut network = ScriptedNetwork::new(&[true]);
        let mut ui = ScriptedUi::new(PortalEvent::TimedOut);

        let outcome: BootOutcome<WebThingConfig> = run_boot(
            &mut store,
            &mut detector,
            &mut network,
            &mut ui,
            "Relay-0000",
            20_000,
            1_000,
        );

        assert_eq!(
            outcome,
            BootOutcome::Ready(WebThingConfig {
                thing_id: "dev-42".to_string(),
                thing_name: "Porch".to_string(),
            })
        );
        assert_eq!(ui.captures, 0);
        // Successful join clears the marker.
        assert!(!detector.detect(21_000));
    }

    #[test]
    fn first_boot_provisions_then_joins() {
        // Spec scenario: cold boot, nothing stored, join with empty
        // credentials fails, user submits id "dev-42" and no name.
        let mut store = ConfigStore::new(MemoryStorage::default());
        let mut detector = DoubleResetDetector::new(SlotMarker::default());
        let mut network = ScriptedNetwork::new(&[false, true]);
        let mut ui = ScriptedUi::new(submission(&[("thing_id", "dev-42"), ("thing_name", "")]));

        let outcome: BootOutcome<WebThingConfig> = run_boot(
            &mut store,
            &mut detector,
            &mut network,
            &mut ui,
            "Relay-0000",
            0,
            1_000,
        );

        let BootOutcome::Ready(config) = outcome else {
            panic!("expected ready, got {outcome:?}");
        };
        assert_eq!(config.thing_id, "dev-42");
        assert_eq!(config.thing_name, "dev-42");
        assert_eq!(network.calls, 2);

        let (stored, _) = store.load::<WebThingConfig>();
        assert_eq!(stored, config);
    }

    #[test]
    fn double_reset_skips_the_join_and_forces_the_portal() {
        let mut store = ConfigStore::new(MemoryStorage::default());
        let mut detector = DoubleResetDetector::new(SlotMarker(Some(17_000)));
        let mut network = ScriptedNetwork::new(&[true]);
        let mut ui = ScriptedUi::new(submission(&[("thing_id", "dev-42"), ("thing_name", "")]));

        let outcome: BootOutcome<WebThingConfig> = run_boot(
            &mut store,
            &mut detector,
            &mut network,
            &mut ui,
            "Relay-0000",
            20_000,
            1_000,
        );

        assert_eq!(ui.captures, 1);
        // The single scripted join success is consumed after the portal.
        assert_eq!(network.calls, 1);
        assert!(matches!(outcome, BootOutcome::Ready(_)));
    }

    #[test]
    fn identity_default_is_applied_before_seeding() {
        let mut store = ConfigStore::new(MemoryStorage::default());
        let mut detector = DoubleResetDetector::new(SlotMarker::default());
        let mut network = ScriptedNetwork::new(&[true]);
        let mut ui = ScriptedUi::new(PortalEvent::TimedOut);

        let outcome: BootOutcome<WebThingConfig> = run_boot(
            &mut store,
            &mut detector,
            &mut network,
            &mut ui,
            "Relay-a1b2c3",
            0,
            1_000,
        );

        assert_eq!(
            outcome,
            BootOutcome::Ready(WebThingConfig {
                thing_id: "Relay-a1b2c3".to_string(),
                thing_name: "Relay-a1b2c3".to_string(),
            })
        );
    }

    #[test]
    fn abandoned_portal_restarts_after_a_delay() {
        let mut store = ConfigStore::new(MemoryStorage::default());
        let mut detector = DoubleResetDetector::new(SlotMarker::default());
        let mut network = ScriptedNetwork::new(&[false]);
        let mut ui = ScriptedUi::new(PortalEvent::TimedOut);

        let outcome: BootOutcome<WebThingConfig> = run_boot(
            &mut store,
            &mut detector,
            &mut network,
            &mut ui,
            "Relay-0000",
            0,
            1_000,
        );

        assert_eq!(
            outcome,
            BootOutcome::Restart {
                delay_ms: RESTART_DELAY_MS
            }
        );
        // Marker cleared at portal entry: the retry boots clean.
        assert!(!detector.detect(500));
    }

    #[test]
    fn join_failure_after_commit_restarts() {
        let mut store = ConfigStore::new(MemoryStorage::default());
        let mut detector = DoubleResetDetector::new(SlotMarker::default());
        let mut network = ScriptedNetwork::new(&[false, false]);
        let mut ui = ScriptedUi::new(submission(&[("thing_id", "dev-42"), ("thing_name", "")]));

        let outcome: BootOutcome<WebThingConfig> = run_boot(
            &mut store,
            &mut detector,
            &mut network,
            &mut ui,
            "Relay-0000",
            0,
            1_000,
        );

        assert_eq!(
            outcome,
            BootOutcome::Restart {
                delay_ms: RESTART_DELAY_MS
            }
        );
        // The committed record is still durable for the retry boot.
        let (stored, _) = store.load::<WebThingConfig>();
        assert_eq!(stored.thing_id, "dev-42");
    }

    #[test]
    fn settings_reset_erases_and_restarts_immediately() {
        let mut storage = MemoryStorage::default();
        storage.contents = Some(b"{\"thing_id\":\"old\"}".to_vec());
        let mut store = ConfigStore::new(storage);
        let mut detector = DoubleResetDetector::new(SlotMarker::default());
        let mut network = ScriptedNetwork::new(&[false]);
        let mut ui = ScriptedUi::new(PortalEvent::ResetRequested);

        let outcome: BootOutcome<WebThingConfig> = run_boot(
            &mut store,
            &mut detector,
            &mut network,
            &mut ui,
            "Relay-0000",
            0,
            1_000,
        );

        assert_eq!(outcome, BootOutcome::Restart { delay_ms: 0 });
        let (config, load) = store.load::<WebThingConfig>();
        assert_eq!(load, crate::store::LoadOutcome::Missing);
        assert_eq!(config, WebThingConfig::default());
    }

    #[test]
    fn unavailable_storage_still_reaches_the_runtime() {
        let mut storage = MemoryStorage::default();
        storage.fail_mount = true;
        let mut store = ConfigStore::new(storage);
        let mut detector = DoubleResetDetector::new(SlotMarker::default());
        let mut network = ScriptedNetwork::new(&[true]);
        let mut ui = ScriptedUi::new(PortalEvent::TimedOut);

        let outcome: BootOutcome<WebThingConfig> = run_boot(
            &mut store,
            &mut detector,
            &mut network,
            &mut ui,
            "Relay-ffff",
            0,
            1_000,
        );

        assert_eq!(
            outcome,
            BootOutcome::Ready(WebThingConfig {
                thing_id: "Relay-ffff".to_string(),
                thing_name: "Relay-ffff".to_string(),
            })
        );
    }
}
