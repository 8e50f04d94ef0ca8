//! Lifecycle Controller.
//!
//! The controller is a plain state machine driven by [`Controller::tick`]. The
//! caller supplies the current time and the processes seen in the latest poll,
//! which keeps it independent of process enumeration and of the clock.

use core::time::Duration;
use std::{collections::BTreeMap, time::Instant};

use gfx_shim_common::config::LauncherConfig;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, trace};

use crate::{ErrorCategory, InjectError, ModuleHandle, Stage};

/// Something that loads the module into a process.
pub trait ModuleLoader {
    fn load(&mut self, process: &ObservedProcess) -> Result<ModuleHandle, InjectError>;
}

impl<F> ModuleLoader for F
where
    F: FnMut(&ObservedProcess) -> Result<ModuleHandle, InjectError>,
{
    fn load(&mut self, process: &ObservedProcess) -> Result<ModuleHandle, InjectError> {
        self(process)
    }
}

/// A process seen by one poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedProcess {
    pub pid: u32,
    pub name: String,
}

impl ObservedProcess {
    pub fn new(pid: u32, name: impl Into<String>) -> Self {
        Self {
            pid,
            name: name.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectionState {
    Detected,
    Stabilizing,
    Injecting,
    Injected,
    Failed,
    Exited,
}

/// A tracked target process.
#[derive(Debug, Clone)]
pub struct ProcessRecord {
    pub pid: u32,
    pub name: String,
    pub state: InjectionState,
    detected_at: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Injected(ModuleHandle),
    Failed {
        stage: Stage,
        category: ErrorCategory,
    },
}

/// One loader call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectionAttempt {
    pub pid: u32,
    pub name: String,

    /// Position of this attempt among the attempts for the process name.
    pub attempt_number: u32,
    pub outcome: AttemptOutcome,
    pub error_code: Option<i32>,
}

/// What happened during a tick, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerEvent {
    Detected {
        pid: u32,
        name: String,
    },
    Injecting {
        pid: u32,
        name: String,
        attempt: u32,
    },
    Injected {
        pid: u32,
        name: String,
        module: ModuleHandle,
    },
    AttemptFailed {
        pid: u32,
        name: String,
        stage: Stage,
        category: ErrorCategory,
        error: InjectError,
    },

    /// The crash-loop breaker tripped. Sent once per name.
    Suspended {
        name: String,
        failures: u32,
    },
    Exited {
        pid: u32,
        name: String,
        state: InjectionState,
    },
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub target_names: Vec<String>,
    pub settle_delay: Duration,
    pub max_crash_count: u32,
}

impl From<&LauncherConfig> for ControllerConfig {
    fn from(config: &LauncherConfig) -> Self {
        Self {
            target_names: config.target_process_names.clone(),
            settle_delay: config.settle_delay(),
            max_crash_count: config.max_crash_count,
        }
    }
}

#[derive(Debug, Default)]
struct NameState {
    attempts: u32,
    consecutive_failures: u32,
    suspended: bool,
}

#[derive(Debug)]
pub struct Controller {
    /// Lowercased target names.
    targets: FxHashSet<String>,
    settle_delay: Duration,
    max_crash_count: u32,

    records: BTreeMap<u32, ProcessRecord>,
    names: FxHashMap<String, NameState>,
    attempts: Vec<InjectionAttempt>,
}

impl Controller {
    pub fn new(config: ControllerConfig) -> Self {
        Self {
            targets: config
                .target_names
                .iter()
                .map(|name| name.to_lowercase())
                .collect(),
            settle_delay: config.settle_delay,
            max_crash_count: config.max_crash_count.max(1),
            records: BTreeMap::new(),
            names: FxHashMap::default(),
            attempts: Vec::new(),
        }
    }

    /// Process one poll.
    ///
    /// Records of processes missing from `observed` exit first, then new
    /// matches are detected, then records whose settle delay has passed are
    /// injected. A record detected by this poll stays `Detected` until a later
    /// poll finds it still settling. The loader is called at most once per
    /// tracked pid.
    pub fn tick(
        &mut self,
        now: Instant,
        observed: &[ObservedProcess],
        loader: &mut dyn ModuleLoader,
    ) -> Vec<ControllerEvent> {
        let mut events = Vec::new();
        self.remove_exited(observed, &mut events);
        let detected = self.detect(now, observed, &mut events);

        let due = self
            .records
            .values_mut()
            .filter_map(|record| match record.state {
                InjectionState::Detected | InjectionState::Stabilizing => {
                    if now.saturating_duration_since(record.detected_at) >= self.settle_delay {
                        Some(record.pid)
                    } else {
                        if !detected.contains(&record.pid) {
                            record.state = InjectionState::Stabilizing;
                        }
                        None
                    }
                }
                _ => None,
            })
            .collect::<Vec<_>>();

        for pid in due {
            self.attempt(pid, loader, &mut events);
        }

        events
    }

    fn remove_exited(&mut self, observed: &[ObservedProcess], events: &mut Vec<ControllerEvent>) {
        // A reused pid under another name is a different process.
        self.records.retain(|&pid, record| {
            let alive = observed
                .iter()
                .any(|process| process.pid == pid && process.name.eq_ignore_ascii_case(&record.name));
            if !alive {
                debug!(pid, name = record.name, state = ?record.state, "process exited");
                events.push(ControllerEvent::Exited {
                    pid,
                    name: record.name.clone(),
                    state: record.state,
                });
            }
            alive
        });
    }

    /// Track new matches. Returns the pids detected by this poll.
    fn detect(&mut self, now: Instant, observed: &[ObservedProcess], events: &mut Vec<ControllerEvent>) -> Vec<u32> {
        let mut detected = Vec::new();
        for process in observed {
            let key = process.name.to_lowercase();
            if !self.targets.contains(&key) || self.records.contains_key(&process.pid) {
                continue;
            }

            if self.names.get(&key).is_some_and(|state| state.suspended) {
                trace!(pid = process.pid, name = process.name, "injection suspended for name");
                continue;
            }

            debug!(pid = process.pid, name = process.name, "process detected");
            self.records.insert(
                process.pid,
                ProcessRecord {
                    pid: process.pid,
                    name: process.name.clone(),
                    state: InjectionState::Detected,
                    detected_at: now,
                },
            );
            events.push(ControllerEvent::Detected {
                pid: process.pid,
                name: process.name.clone(),
            });
            detected.push(process.pid);
        }

        detected
    }

    fn attempt(&mut self, pid: u32, loader: &mut dyn ModuleLoader, events: &mut Vec<ControllerEvent>) {
        let Some(record) = self.records.get_mut(&pid) else {
            return;
        };
        let name_state = self.names.entry(record.name.to_lowercase()).or_default();

        // Another process of the same name tripped the breaker while this one settled.
        if name_state.suspended {
            record.state = InjectionState::Failed;
            return;
        }

        name_state.attempts += 1;
        record.state = InjectionState::Injecting;
        events.push(ControllerEvent::Injecting {
            pid,
            name: record.name.clone(),
            attempt: name_state.attempts,
        });

        let process = ObservedProcess::new(pid, record.name.clone());
        let result = loader.load(&process);

        let (outcome, error_code) = match result {
            Ok(module) => {
                record.state = InjectionState::Injected;
                name_state.consecutive_failures = 0;
                events.push(ControllerEvent::Injected {
                    pid,
                    name: record.name.clone(),
                    module,
                });

                (AttemptOutcome::Injected(module), None)
            }

            Err(error) => {
                let stage = error.stage();
                let category = error.category();
                let code = error.code();

                record.state = InjectionState::Failed;
                events.push(ControllerEvent::AttemptFailed {
                    pid,
                    name: record.name.clone(),
                    stage,
                    category,
                    error,
                });

                if category.counts_as_crash() {
                    name_state.consecutive_failures += 1;
                    if name_state.consecutive_failures >= self.max_crash_count {
                        name_state.suspended = true;
                        events.push(ControllerEvent::Suspended {
                            name: record.name.clone(),
                            failures: name_state.consecutive_failures,
                        });
                    }
                }

                (AttemptOutcome::Failed { stage, category }, code)
            }
        };

        self.attempts.push(InjectionAttempt {
            pid,
            name: record.name.clone(),
            attempt_number: name_state.attempts,
            outcome,
            error_code,
        });
    }

    pub fn records(&self) -> impl Iterator<Item = &ProcessRecord> {
        self.records.values()
    }

    pub fn record(&self, pid: u32) -> Option<&ProcessRecord> {
        self.records.get(&pid)
    }

    /// Every loader call made so far.
    pub fn attempts(&self) -> &[InjectionAttempt] {
        &self.attempts
    }

    pub fn is_suspended(&self, name: &str) -> bool {
        self.names
            .get(&name.to_lowercase())
            .is_some_and(|state| state.suspended)
    }

    pub fn consecutive_failures(&self, name: &str) -> u32 {
        self.names
            .get(&name.to_lowercase())
            .map_or(0, |state| state.consecutive_failures)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(settle_delay: Duration) -> Controller {
        Controller::new(ControllerConfig {
            target_names: vec!["Player.exe".to_owned()],
            settle_delay,
            max_crash_count: 3,
        })
    }

    #[test]
    fn names_match_case_insensitively() {
        let mut controller = controller(Duration::ZERO);
        let mut calls = 0;
        let mut loader = |_: &ObservedProcess| -> Result<ModuleHandle, InjectError> {
            calls += 1;
            Ok(ModuleHandle(0x1000))
        };

        let events = controller.tick(
            Instant::now(),
            &[
                ObservedProcess::new(10, "PLAYER.EXE"),
                ObservedProcess::new(11, "explorer.exe"),
            ],
            &mut loader,
        );

        assert_eq!(calls, 1);
        assert_eq!(events.len(), 3);
        assert!(controller.record(11).is_none());
        assert_eq!(
            controller.record(10).map(|record| record.state),
            Some(InjectionState::Injected)
        );
    }

    #[test]
    fn waiting_record_is_stabilizing() {
        let mut controller = controller(Duration::from_secs(3));
        let start = Instant::now();
        let processes = [ObservedProcess::new(10, "player.exe")];
        let mut loader = |_: &ObservedProcess| -> Result<ModuleHandle, InjectError> {
            panic!("loaded before settle delay")
        };

        controller.tick(start, &processes, &mut loader);
        assert_eq!(
            controller.record(10).map(|record| record.state),
            Some(InjectionState::Detected)
        );

        controller.tick(start + Duration::from_secs(1), &processes, &mut loader);
        assert_eq!(
            controller.record(10).map(|record| record.state),
            Some(InjectionState::Stabilizing)
        );
    }

    #[test]
    fn permission_failures_do_not_trip_breaker() {
        let mut controller = controller(Duration::ZERO);
        let mut loader = |process: &ObservedProcess| -> Result<ModuleHandle, InjectError> {
            Err(InjectError::AccessDenied { pid: process.pid })
        };

        for pid in 1..=5 {
            controller.tick(
                Instant::now(),
                &[ObservedProcess::new(pid, "player.exe")],
                &mut loader,
            );
        }

        assert_eq!(controller.attempts().len(), 5);
        assert!(!controller.is_suspended("player.exe"));
        assert_eq!(controller.consecutive_failures("player.exe"), 0);
    }
}
