use core::time::Duration;
use std::{collections::VecDeque, time::Instant};

use gfx_shim_injector::{
    ErrorCategory, InjectError, ModuleHandle, Stage,
    lifecycle::{
        AttemptOutcome, Controller, ControllerConfig, ControllerEvent, InjectionState,
        ModuleLoader, ObservedProcess,
    },
};

/// Loader answering from a script and remembering who it was called for.
#[derive(Default)]
struct ScriptedLoader {
    script: VecDeque<Result<ModuleHandle, InjectError>>,
    calls: Vec<u32>,
}

impl ScriptedLoader {
    fn new(script: impl IntoIterator<Item = Result<ModuleHandle, InjectError>>) -> Self {
        Self {
            script: script.into_iter().collect(),
            calls: Vec::new(),
        }
    }
}

impl ModuleLoader for ScriptedLoader {
    fn load(&mut self, process: &ObservedProcess) -> Result<ModuleHandle, InjectError> {
        self.calls.push(process.pid);
        self.script.pop_front().unwrap_or(Ok(ModuleHandle(0x7ff0_0000)))
    }
}

fn refused() -> Result<ModuleHandle, InjectError> {
    Err(InjectError::ModuleRefused)
}

fn controller(settle_delay: Duration, max_crash_count: u32) -> Controller {
    Controller::new(ControllerConfig {
        target_names: vec!["player.exe".to_owned()],
        settle_delay,
        max_crash_count,
    })
}

fn player(pid: u32) -> ObservedProcess {
    ObservedProcess::new(pid, "player.exe")
}

#[test]
fn live_process_is_injected_once() {
    let mut controller = controller(Duration::from_secs(3), 3);
    let mut loader = ScriptedLoader::default();
    let start = Instant::now();

    for second in 0..20 {
        controller.tick(
            start + Duration::from_secs(second),
            &[player(42)],
            &mut loader,
        );
    }

    assert_eq!(loader.calls, [42]);
    assert_eq!(
        controller.record(42).map(|record| record.state),
        Some(InjectionState::Injected)
    );
}

#[test]
fn failed_process_is_not_retried() {
    let mut controller = controller(Duration::ZERO, 3);
    let mut loader = ScriptedLoader::new([refused()]);
    let start = Instant::now();

    for second in 0..5 {
        controller.tick(start + Duration::from_secs(second), &[player(7)], &mut loader);
    }

    assert_eq!(loader.calls, [7]);
    assert_eq!(
        controller.record(7).map(|record| record.state),
        Some(InjectionState::Failed)
    );
}

#[test]
fn injection_waits_for_settle_delay() {
    let mut controller = controller(Duration::from_secs(3), 3);
    let mut loader = ScriptedLoader::default();
    let start = Instant::now();

    let events = controller.tick(start, &[player(1)], &mut loader);
    assert_eq!(
        events,
        [ControllerEvent::Detected {
            pid: 1,
            name: "player.exe".to_owned()
        }]
    );

    controller.tick(start + Duration::from_millis(2999), &[player(1)], &mut loader);
    assert!(loader.calls.is_empty());

    let events = controller.tick(start + Duration::from_secs(3), &[player(1)], &mut loader);
    assert_eq!(loader.calls, [1]);
    assert!(matches!(
        events.as_slice(),
        [
            ControllerEvent::Injecting { pid: 1, attempt: 1, .. },
            ControllerEvent::Injected { pid: 1, .. },
        ]
    ));
}

#[test]
fn process_leaving_before_settling_is_never_injected() {
    let mut controller = controller(Duration::from_secs(3), 3);
    let mut loader = ScriptedLoader::default();
    let start = Instant::now();

    controller.tick(start, &[player(1)], &mut loader);
    controller.tick(start + Duration::from_secs(1), &[player(1)], &mut loader);
    let events = controller.tick(start + Duration::from_secs(2), &[], &mut loader);
    controller.tick(start + Duration::from_secs(10), &[], &mut loader);

    assert!(loader.calls.is_empty());
    assert_eq!(
        events,
        [ControllerEvent::Exited {
            pid: 1,
            name: "player.exe".to_owned(),
            state: InjectionState::Stabilizing,
        }]
    );
}

#[test]
fn process_gone_by_next_poll_exits_as_detected() {
    let mut controller = controller(Duration::from_secs(3), 3);
    let mut loader = ScriptedLoader::default();
    let start = Instant::now();

    let first = controller.tick(start, &[player(1)], &mut loader);
    assert_eq!(
        controller.record(1).map(|record| record.state),
        Some(InjectionState::Detected)
    );

    let events = controller.tick(start + Duration::from_secs(1), &[], &mut loader);
    assert_eq!(
        first,
        [ControllerEvent::Detected {
            pid: 1,
            name: "player.exe".to_owned(),
        }]
    );
    assert_eq!(
        events,
        [ControllerEvent::Exited {
            pid: 1,
            name: "player.exe".to_owned(),
            state: InjectionState::Detected,
        }]
    );
}

#[test]
fn breaker_trips_after_max_consecutive_load_failures() {
    let mut controller = controller(Duration::ZERO, 3);
    let mut loader = ScriptedLoader::new([refused(), refused(), refused()]);
    let start = Instant::now();

    let mut suspended = Vec::new();
    for pid in 1..=4 {
        // Each crash leaves the process list before the next instance starts.
        let now = start + Duration::from_secs(u64::from(pid) * 2);
        controller.tick(now, &[], &mut loader);
        suspended.extend(
            controller
                .tick(now, &[player(pid)], &mut loader)
                .into_iter()
                .filter(|event| matches!(event, ControllerEvent::Suspended { .. })),
        );
    }

    assert_eq!(loader.calls, [1, 2, 3]);
    assert!(controller.is_suspended("Player.exe"));
    assert_eq!(
        suspended,
        [ControllerEvent::Suspended {
            name: "player.exe".to_owned(),
            failures: 3,
        }]
    );
    assert!(controller.record(4).is_none());
}

#[test]
fn success_resets_crash_count() {
    let mut controller = controller(Duration::ZERO, 3);
    let mut loader = ScriptedLoader::new([
        refused(),
        refused(),
        Ok(ModuleHandle(0x1000)),
        refused(),
        refused(),
    ]);
    let start = Instant::now();

    for pid in 1..=5 {
        let now = start + Duration::from_secs(u64::from(pid));
        controller.tick(now, &[], &mut loader);
        controller.tick(now, &[player(pid)], &mut loader);
    }

    assert_eq!(loader.calls, [1, 2, 3, 4, 5]);
    assert_eq!(controller.consecutive_failures("player.exe"), 2);
    assert!(!controller.is_suspended("player.exe"));
}

#[test]
fn timeouts_count_as_crashes() {
    let mut controller = controller(Duration::ZERO, 2);
    let timeout = || Err(InjectError::Timeout(Duration::from_secs(5)));
    let mut loader = ScriptedLoader::new([timeout(), timeout()]);

    controller.tick(Instant::now(), &[player(1), player(2), player(3)], &mut loader);

    assert_eq!(loader.calls, [1, 2]);
    assert!(controller.is_suspended("player.exe"));
    assert_eq!(
        controller.record(3).map(|record| record.state),
        Some(InjectionState::Failed)
    );
}

#[test]
fn reused_pid_is_tracked_again() {
    let mut controller = controller(Duration::ZERO, 3);
    let mut loader = ScriptedLoader::default();
    let start = Instant::now();

    controller.tick(start, &[player(9)], &mut loader);
    controller.tick(start + Duration::from_secs(1), &[player(9)], &mut loader);

    let events = controller.tick(start + Duration::from_secs(2), &[], &mut loader);
    assert!(matches!(
        events.as_slice(),
        [ControllerEvent::Exited {
            pid: 9,
            state: InjectionState::Injected,
            ..
        }]
    ));
    assert!(controller.record(9).is_none());

    controller.tick(start + Duration::from_secs(3), &[player(9)], &mut loader);
    assert_eq!(loader.calls, [9, 9]);
}

#[test]
fn pid_reused_by_another_name_exits_old_record() {
    let mut controller = Controller::new(ControllerConfig {
        target_names: vec!["player.exe".to_owned(), "viewer.exe".to_owned()],
        settle_delay: Duration::ZERO,
        max_crash_count: 3,
    });
    let mut loader = ScriptedLoader::default();
    let now = Instant::now();

    controller.tick(now, &[player(5)], &mut loader);
    let events = controller.tick(now, &[ObservedProcess::new(5, "viewer.exe")], &mut loader);

    assert!(matches!(
        events.first(),
        Some(ControllerEvent::Exited { pid: 5, .. })
    ));
    assert_eq!(loader.calls, [5, 5]);
    assert_eq!(
        controller.record(5).map(|record| record.name.as_str()),
        Some("viewer.exe")
    );
}

#[test]
fn attempts_record_failure_stage_and_code() {
    let mut controller = controller(Duration::ZERO, 3);
    let mut loader = ScriptedLoader::new([Err(InjectError::Os {
        stage: Stage::CreateThread,
        code: 5,
    })]);

    let events = controller.tick(Instant::now(), &[player(3)], &mut loader);

    assert!(events.iter().any(|event| matches!(
        event,
        ControllerEvent::AttemptFailed {
            stage: Stage::CreateThread,
            category: ErrorCategory::LoadFailure,
            ..
        }
    )));
    assert_eq!(
        controller.attempts()[0].outcome,
        AttemptOutcome::Failed {
            stage: Stage::CreateThread,
            category: ErrorCategory::LoadFailure,
        }
    );
    assert_eq!(controller.attempts()[0].error_code, Some(5));
    assert_eq!(controller.attempts()[0].attempt_number, 1);
}
