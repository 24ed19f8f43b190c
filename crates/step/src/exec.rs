//! Executor adapter: drives step state machines for the controller shell.
//!
//! Discipline: at most one concurrent execution per environment. The executor
//! does not requeue; the reconcile loop asks the planner again after each
//! status update.

use crate::{EventSink, StatusSink, Step};
use envop_core::{Nsn, StepState};
use metrics::{counter, histogram};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::oneshot;
use tracing::{debug, info};

pub struct Executor {
    /// Base environment handed to engine subprocesses.
    pub environ: Vec<(String, String)>,
    events: Arc<dyn EventSink>,
    status: Arc<dyn StatusSink>,
    busy: Mutex<HashSet<Nsn>>,
}

impl Executor {
    pub fn new(
        environ: Vec<(String, String)>,
        events: Arc<dyn EventSink>,
        status: Arc<dyn StatusSink>,
    ) -> Self {
        Self { environ, events, status, busy: Mutex::new(HashSet::new()) }
    }

    /// True when the environment currently runs a step.
    pub fn is_busy(&self, nsn: &Nsn) -> bool {
        self.busy.lock().unwrap().contains(nsn)
    }

    /// Accept a step for background execution. Returns false (and drops the
    /// step) when its environment already runs one.
    pub fn accept(self: &Arc<Self>, step: Step) -> bool {
        self.accept_with_cancel(step, None)
    }

    /// Like `accept`, with a cancellation signal: when it fires, the step's
    /// subprocesses are reaped and the step ends in `Error`.
    pub fn accept_with_cancel(
        self: &Arc<Self>,
        step: Step,
        cancel: Option<oneshot::Receiver<()>>,
    ) -> bool {
        let nsn = step.meta().id.nsn();
        {
            let mut busy = self.busy.lock().unwrap();
            if !busy.insert(nsn.clone()) {
                debug!(env = %nsn, step = %step.meta().id, "environment busy; step refused");
                return false;
            }
        }
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.run(nsn, step, cancel).await;
        });
        true
    }

    async fn run(&self, nsn: Nsn, mut step: Step, cancel: Option<oneshot::Receiver<()>>) {
        let started = Instant::now();
        let short = step.meta().id.short_name();

        let outcome = match cancel {
            None => Some(step.execute(&self.environ, self.events.as_ref(), self.status.as_ref()).await),
            Some(mut rx) => {
                let res = {
                    let fut = step.execute(&self.environ, self.events.as_ref(), self.status.as_ref());
                    tokio::pin!(fut);
                    tokio::select! {
                        ok = &mut fut => Some(ok),
                        _ = &mut rx => None,
                    }
                };
                if res.is_none() {
                    // The dropped execute future reaps its child processes.
                    let meta = step.meta_mut();
                    meta.state = StepState::Error;
                    meta.msg = "execution canceled".into();
                    self.status.update(meta);
                }
                res
            }
        };

        let ready = outcome.unwrap_or(false);
        histogram!("step_execute_seconds", started.elapsed().as_secs_f64(), "step" => short.clone());
        if ready {
            counter!("step_ready_total", 1u64);
        } else {
            counter!("step_error_total", 1u64);
        }
        info!(env = %nsn, step = %short, ready, "step finished");

        self.busy.lock().unwrap().remove(&nsn);
    }
}
