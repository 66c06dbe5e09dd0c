//! Alert manager thread and its command handle.
//!
//! The manager is single-owner: one thread selects over rule-engine output,
//! operator commands and a housekeeping tick. Everything else talks to it
//! through [`AimHandle`], one bounded reply channel per request.

use crossbeam_channel::{bounded, never, select, Receiver, Sender};
use std::io;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{info, warn};
use uuid::Uuid;

use tw_rules::Evaluation;
use tw_types::{
    ActivationRequest, Alert, AlertFilter, AlertStats, CandidateAlert, Counters,
    IsolationAction, Priority, ReleaseRequest, TwError, TwResult,
};

use crate::manager::AlertManager;

/// Reply slot of a mutating command. The deadline is the caller's: a command
/// still queued when it passes is refused rather than run, so an operator who
/// saw a timeout never has the mutation committed behind their back.
pub struct Reply<T> {
    tx: Sender<TwResult<T>>,
    deadline: Instant,
}

impl<T> Reply<T> {
    fn run(self, op: impl FnOnce() -> TwResult<T>) {
        let result = if Instant::now() >= self.deadline {
            warn!("operator command expired in the queue; not applied");
            Err(TwError::Unavailable("command expired before it ran".to_string()))
        } else {
            op()
        };
        // A dropped receiver means the caller gave up; nothing to do.
        let _ = self.tx.send(result);
    }
}

pub enum AimCommand {
    Ack {
        alert_id: Uuid,
        assignee: String,
        reply: Reply<Alert>,
    },
    Resolve {
        alert_id: Uuid,
        notes: Option<String>,
        reply: Reply<Alert>,
    },
    Escalate {
        alert_id: Uuid,
        to: Option<Priority>,
        reply: Reply<Alert>,
    },
    ListAlerts {
        filter: AlertFilter,
        reply: Sender<Vec<Alert>>,
    },
    GetAlert {
        alert_id: Uuid,
        reply: Sender<Option<Alert>>,
    },
    Stats {
        reply: Sender<AlertStats>,
    },
    ListIsolations {
        active_only: bool,
        reply: Sender<Vec<IsolationAction>>,
    },
    GetIsolation {
        action_id: Uuid,
        reply: Sender<Option<IsolationAction>>,
    },
    Activate {
        request: ActivationRequest,
        reply: Reply<IsolationAction>,
    },
    RequestRelease {
        action_id: Uuid,
        request: ReleaseRequest,
        reply: Reply<IsolationAction>,
    },
    ForceRelease {
        action_id: Uuid,
        principal: String,
        reply: Reply<IsolationAction>,
    },
    /// Fire-and-forget internal alert.
    Raise { candidate: CandidateAlert },
}

/// Cloneable front door to the manager thread.
#[derive(Clone)]
pub struct AimHandle {
    tx: Sender<AimCommand>,
    timeout: Duration,
}

impl AimHandle {
    pub fn new(tx: Sender<AimCommand>, timeout: Duration) -> Self {
        Self { tx, timeout }
    }

    fn call<T>(&self, make: impl FnOnce(Sender<T>) -> AimCommand) -> TwResult<T> {
        let (reply, rx) = bounded(1);
        self.tx
            .send_timeout(make(reply), self.timeout)
            .map_err(|_| not_accepting())?;
        rx.recv_timeout(self.timeout).map_err(|_| no_answer())
    }

    /// Mutations start only before the deadline; the reply is awaited for one
    /// more timeout so a command that did start reports its outcome.
    fn mutate<T>(&self, make: impl FnOnce(Reply<T>) -> AimCommand) -> TwResult<T> {
        let deadline = Instant::now() + self.timeout;
        let (tx, rx) = bounded(1);
        self.tx
            .send_deadline(make(Reply { tx, deadline }), deadline)
            .map_err(|_| not_accepting())?;
        rx.recv_deadline(deadline + self.timeout).map_err(|_| no_answer())?
    }

    pub fn ack(&self, alert_id: Uuid, assignee: &str) -> TwResult<Alert> {
        self.mutate(|reply| AimCommand::Ack {
            alert_id,
            assignee: assignee.to_string(),
            reply,
        })
    }

    pub fn resolve(&self, alert_id: Uuid, notes: Option<String>) -> TwResult<Alert> {
        self.mutate(|reply| AimCommand::Resolve {
            alert_id,
            notes,
            reply,
        })
    }

    pub fn escalate(&self, alert_id: Uuid, to: Option<Priority>) -> TwResult<Alert> {
        self.mutate(|reply| AimCommand::Escalate { alert_id, to, reply })
    }

    pub fn alerts(&self, filter: AlertFilter) -> TwResult<Vec<Alert>> {
        self.call(|reply| AimCommand::ListAlerts { filter, reply })
    }

    pub fn alert(&self, alert_id: Uuid) -> TwResult<Option<Alert>> {
        self.call(|reply| AimCommand::GetAlert { alert_id, reply })
    }

    pub fn stats(&self) -> TwResult<AlertStats> {
        self.call(|reply| AimCommand::Stats { reply })
    }

    pub fn isolations(&self, active_only: bool) -> TwResult<Vec<IsolationAction>> {
        self.call(|reply| AimCommand::ListIsolations { active_only, reply })
    }

    pub fn isolation(&self, action_id: Uuid) -> TwResult<Option<IsolationAction>> {
        self.call(|reply| AimCommand::GetIsolation { action_id, reply })
    }

    pub fn activate(&self, request: ActivationRequest) -> TwResult<IsolationAction> {
        self.mutate(|reply| AimCommand::Activate { request, reply })
    }

    pub fn request_release(&self, action_id: Uuid, request: ReleaseRequest) -> TwResult<IsolationAction> {
        self.mutate(|reply| AimCommand::RequestRelease {
            action_id,
            request,
            reply,
        })
    }

    pub fn force_release(&self, action_id: Uuid, principal: &str) -> TwResult<IsolationAction> {
        self.mutate(|reply| AimCommand::ForceRelease {
            action_id,
            principal: principal.to_string(),
            reply,
        })
    }

    /// Never blocks; returns false when the command queue is full.
    pub fn raise(&self, candidate: CandidateAlert) -> bool {
        self.tx.try_send(AimCommand::Raise { candidate }).is_ok()
    }
}

fn not_accepting() -> TwError {
    TwError::Unavailable("alert manager is not accepting commands".to_string())
}

fn no_answer() -> TwError {
    TwError::Unavailable("alert manager did not answer in time".to_string())
}

fn execute(manager: &mut AlertManager, command: AimCommand) {
    // A dropped reply receiver means the caller timed out; nothing to do.
    match command {
        AimCommand::Ack {
            alert_id,
            assignee,
            reply,
        } => reply.run(|| manager.ack(alert_id, &assignee)),
        AimCommand::Resolve {
            alert_id,
            notes,
            reply,
        } => reply.run(|| manager.resolve(alert_id, notes)),
        AimCommand::Escalate { alert_id, to, reply } => reply.run(|| manager.escalate(alert_id, to)),
        AimCommand::ListAlerts { filter, reply } => {
            let _ = reply.send(manager.alerts(filter));
        }
        AimCommand::GetAlert { alert_id, reply } => {
            let _ = reply.send(manager.get_alert(&alert_id));
        }
        AimCommand::Stats { reply } => {
            let _ = reply.send(manager.stats());
        }
        AimCommand::ListIsolations { active_only, reply } => {
            let _ = reply.send(manager.isolations(active_only));
        }
        AimCommand::GetIsolation { action_id, reply } => {
            let _ = reply.send(manager.get_isolation(&action_id));
        }
        AimCommand::Activate { request, reply } => reply.run(|| manager.activate(&request)),
        AimCommand::RequestRelease {
            action_id,
            request,
            reply,
        } => reply.run(|| manager.request_release(action_id, &request)),
        AimCommand::ForceRelease {
            action_id,
            principal,
            reply,
        } => reply.run(|| manager.force_release(action_id, &principal)),
        AimCommand::Raise { candidate } => {
            if let Err(e) = manager.raise(candidate) {
                warn!(error = %e, "internal alert not raised");
            }
        }
    }
}

/// What the manager thread reports when it exits.
#[derive(Debug, Default)]
pub struct AimExit {
    pub abandoned_notifications: usize,
    pub unsafe_reason: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct AimTiming {
    pub tick: Duration,
    pub flush_deadline: Duration,
}

/// Runs the manager until the evaluation channel disconnects, then flushes
/// pending notifications within the deadline.
pub fn spawn(
    mut manager: AlertManager,
    evaluations: Receiver<Evaluation>,
    commands: Receiver<AimCommand>,
    counters: Counters,
    timing: AimTiming,
) -> io::Result<JoinHandle<AimExit>> {
    thread::Builder::new()
        .name("tw-alert-manager".to_string())
        .spawn(move || {
            let mut commands = commands;
            let mut commands_open = true;
            let mut last_tick = Instant::now();
            loop {
                select! {
                    recv(evaluations) -> msg => match msg {
                        Ok(evaluation) => manager.handle_evaluation(evaluation),
                        Err(_) => break,
                    },
                    recv(commands) -> msg => match msg {
                        Ok(command) => execute(&mut manager, command),
                        Err(_) => commands_open = false,
                    },
                    default(timing.tick) => {}
                }
                if !commands_open {
                    // Every handle dropped; keep serving evaluations
                    commands = never();
                    commands_open = true;
                }
                counters.aim_queue_depth.set(evaluations.len() as i64);
                if last_tick.elapsed() >= timing.tick {
                    manager.tick();
                    last_tick = Instant::now();
                }
            }

            // Late commands get an answer before the flush
            while let Ok(command) = commands.try_recv() {
                execute(&mut manager, command);
            }
            let report = manager.flush(timing.flush_deadline);
            info!(
                abandoned = report.abandoned.len(),
                delivered = report.outcomes.len(),
                "alert manager stopped"
            );
            AimExit {
                abandoned_notifications: report.abandoned.len(),
                unsafe_reason: manager.unsafe_reason().map(str::to_string),
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isolation_book::{IsolationBook, IsolationPolicy};
    use crate::journal::MemoryJournal;
    use crate::router::LogRouter;
    use crate::sinks::Notifier;
    use chrono::Utc;
    use std::sync::Arc;
    use tw_types::{AckState, AlertPayload, ManualClock, RiskMetrics, Target, TwError};

    fn manager(journal: &MemoryJournal, counters: &Counters) -> AlertManager {
        AlertManager::new(
            IsolationBook::new(IsolationPolicy {
                operators: vec!["ops".into()],
                ..Default::default()
            })
            .unwrap(),
            Box::new(journal.clone()),
            Notifier::new(counters.clone()),
            Box::new(LogRouter),
            Arc::new(ManualClock::new(Utc::now())),
            counters.clone(),
            0,
        )
    }

    fn start() -> (Sender<Evaluation>, AimHandle, JoinHandle<AimExit>, MemoryJournal) {
        let counters = Counters::new().unwrap();
        let journal = MemoryJournal::new();
        let manager = manager(&journal, &counters);
        let (eval_tx, eval_rx) = bounded(16);
        let (cmd_tx, cmd_rx) = bounded(16);
        let handle = spawn(
            manager,
            eval_rx,
            cmd_rx,
            counters,
            AimTiming {
                tick: Duration::from_millis(10),
                flush_deadline: Duration::from_millis(100),
            },
        )
        .unwrap();
        (eval_tx, AimHandle::new(cmd_tx, Duration::from_secs(2)), handle, journal)
    }

    fn breach(seq: u64) -> Evaluation {
        Evaluation {
            metrics: Arc::new(RiskMetrics::empty(seq, Utc::now())),
            rule_set_version: 1,
            alerts: vec![CandidateAlert {
                rule_id: "var-limit".into(),
                target: Target::System,
                priority: Priority::High,
                triggered_seq: seq,
                triggered_at: Utc::now(),
                rule_set_version: 1,
                payload: AlertPayload::internal("var breach"),
            }],
            isolations: vec![],
            cleared: vec![],
        }
    }

    #[test]
    fn commands_round_trip_through_the_thread() {
        let (eval_tx, aim, handle, journal) = start();
        eval_tx.send(breach(1)).unwrap();

        let mut alerts = Vec::new();
        for _ in 0..200 {
            alerts = aim.alerts(AlertFilter::Active).unwrap();
            if !alerts.is_empty() {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(alerts.len(), 1);

        let acked = aim.ack(alerts[0].alert_id, "ops").unwrap();
        assert_eq!(acked.ack_state, AckState::Acked);
        assert!(matches!(
            aim.ack(Uuid::new_v4(), "ops"),
            Err(TwError::Alert(_))
        ));
        assert_eq!(aim.stats().unwrap().total_raised, 1);

        drop(eval_tx);
        let exit = handle.join().unwrap();
        assert!(exit.unsafe_reason.is_none());
        assert_eq!(journal.records().len(), 2);
    }

    #[test]
    fn stopped_manager_answers_with_an_error() {
        let (eval_tx, aim, handle, _) = start();
        drop(eval_tx);
        handle.join().unwrap();
        assert!(matches!(aim.stats(), Err(TwError::Unavailable(_))));
        assert!(matches!(
            aim.ack(Uuid::new_v4(), "ops"),
            Err(TwError::Unavailable(_))
        ));
        let mut evaluation = breach(1);
        assert!(!aim.raise(evaluation.alerts.remove(0)));
    }

    #[test]
    fn expired_mutation_is_refused_and_not_journaled() {
        let counters = Counters::new().unwrap();
        let journal = MemoryJournal::new();
        let mut aim = manager(&journal, &counters);
        let alert = aim.raise(breach(1).alerts.remove(0)).unwrap();
        let journaled = journal.records().len();

        let (tx, rx) = bounded(1);
        let command = AimCommand::Ack {
            alert_id: alert.alert_id,
            assignee: "ops".into(),
            reply: Reply {
                tx,
                deadline: Instant::now() - Duration::from_millis(1),
            },
        };
        execute(&mut aim, command);

        assert!(matches!(rx.recv().unwrap(), Err(TwError::Unavailable(_))));
        assert_eq!(aim.get_alert(&alert.alert_id).unwrap().ack_state, AckState::New);
        assert_eq!(journal.records().len(), journaled);
    }
}
