//! Registry of running worlds, one dedicated thread each

use std::sync::Arc;
use std::thread::{self, Thread};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info, info_span};

use super::world::{FrameLog, RunOutcome, RunSignals, WorldError, WorldRunner};
use super::SessionId;

/// Live handle to a running world
struct RunnerHandle {
    signals: RunSignals,
    frames: FrameLog,
    thread: Option<Thread>,
}

/// Starts world runners and lets the session registry discard them
#[derive(Default)]
pub struct WorldRunnerService {
    runners: Arc<DashMap<SessionId, RunnerHandle>>,
}

impl WorldRunnerService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `runner` on its own thread, calling `on_finish` with the outcome
    /// once the loop exits.
    pub fn start<F>(&self, runner: WorldRunner, on_finish: F) -> Result<(), WorldError>
    where
        F: FnOnce(RunOutcome) + Send + 'static,
    {
        let session_id = runner.session_id();
        match self.runners.entry(session_id) {
            Entry::Occupied(_) => return Err(WorldError::AlreadyRunning(session_id)),
            Entry::Vacant(slot) => {
                slot.insert(RunnerHandle {
                    signals: runner.signals(),
                    frames: runner.frames(),
                    thread: None,
                });
            }
        }

        let runners = self.runners.clone();
        let spawned = thread::Builder::new()
            .name(format!("world-{}", session_id))
            .spawn(move || {
                let span = info_span!("world", session_id = %session_id);
                let _enter = span.enter();

                let mut runner = runner;
                let outcome = runner.run();
                runners.remove(&session_id);
                drop(runner);
                on_finish(outcome);
            });

        match spawned {
            Ok(join) => {
                if let Some(mut handle) = self.runners.get_mut(&session_id) {
                    handle.thread = Some(join.thread().clone());
                }
                info!(session_id = %session_id, "World runner started");
                Ok(())
            }
            Err(e) => {
                self.runners.remove(&session_id);
                Err(WorldError::Spawn(e))
            }
        }
    }

    /// Stop the session's world and forget it. The thread releases the world
    /// at its next iteration boundary.
    pub fn discard(&self, session_id: SessionId) -> bool {
        match self.runners.remove(&session_id) {
            Some((_, handle)) => {
                handle.signals.discard();
                if let Some(thread) = handle.thread {
                    thread.unpark();
                }
                info!(session_id = %session_id, "World runner discarded");
                true
            }
            None => {
                debug!(session_id = %session_id, "No world runner to discard");
                false
            }
        }
    }

    /// Discard every running world (shutdown)
    pub fn discard_all(&self) -> usize {
        let ids: Vec<SessionId> = self.runners.iter().map(|entry| *entry.key()).collect();
        ids.into_iter().filter(|id| self.discard(*id)).count()
    }

    /// Frame log of a running session
    pub fn frames(&self, session_id: SessionId) -> Option<FrameLog> {
        self.runners.get(&session_id).map(|h| h.frames.clone())
    }

    pub fn is_running(&self, session_id: SessionId) -> bool {
        self.runners
            .get(&session_id)
            .map_or(false, |h| h.signals.is_running())
    }

    pub fn active(&self) -> usize {
        self.runners.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::time::Duration;

    use glam::Vec2;

    use super::*;
    use crate::config::SimulationSettings;
    use crate::game::body::{BodyData, BodyDecl, BodyKind, BodyOptions, ShapeKind};

    fn long_running(session_id: SessionId) -> WorldRunner {
        let mut runner = WorldRunner::new(session_id, SimulationSettings::default());
        let ball = BodyDecl {
            id: 1,
            body_type: BodyKind::Dynamic,
            shape: ShapeKind::Circle,
            key_body: false,
            data: BodyData {
                position: Vec2::ZERO,
                angle: 0.0,
                size: None,
                radius: Some(0.5),
                config: None,
                options: BodyOptions::default(),
            },
        };
        runner.init_world(&[ball], &[]).unwrap();
        runner
    }

    #[test]
    fn test_discard_stops_running_world() {
        let service = WorldRunnerService::new();
        let session_id = SessionId::new();
        let (tx, rx) = mpsc::channel();

        service
            .start(long_running(session_id), move |outcome| {
                let _ = tx.send(outcome);
            })
            .unwrap();
        assert!(service.frames(session_id).is_some());
        assert_eq!(service.active(), 1);

        assert!(service.discard(session_id));
        let outcome = rx.recv_timeout(Duration::from_secs(5)).unwrap();

        assert!(matches!(outcome, RunOutcome::Discarded { .. }));
        assert_eq!(service.active(), 0);
        assert!(!service.discard(session_id));
    }

    #[test]
    fn test_same_session_cannot_start_twice() {
        let service = WorldRunnerService::new();
        let session_id = SessionId::new();

        service.start(long_running(session_id), |_| {}).unwrap();
        let second = service.start(long_running(session_id), |_| {});

        assert!(matches!(second, Err(WorldError::AlreadyRunning(id)) if id == session_id));
        assert_eq!(service.discard_all(), 1);
    }
}
