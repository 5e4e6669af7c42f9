// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Keel journal - Background committer
// Copyright (c) 2026 Keel contributors
//
// One thread per mounted journal in `CommitMode::Background`. It sleeps on
// the journal condvar, closes open transactions that aged out with no
// writers, commits closed lists and checkpoints per policy. It exits when
// `shutdown` is set or the instance stops being live.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::error::{JournalError, JournalResult};
use crate::journal::JournalInner;

const MAX_TICK: Duration = Duration::from_secs(1);
const MIN_TICK: Duration = Duration::from_millis(5);

pub(crate) struct CommitWorker {
    handle: JoinHandle<()>,
}

impl CommitWorker {
    pub fn spawn(inner: Arc<JournalInner>) -> JournalResult<Self> {
        let handle = thread::Builder::new()
            .name("keel-commit".to_string())
            .spawn(move || run(&inner))
            .map_err(|e| {
                JournalError::ResourceExhausted(format!("cannot start committer thread: {e}"))
            })?;
        Ok(Self { handle })
    }

    pub fn join(self) {
        if self.handle.join().is_err() {
            error!("Committer thread panicked");
        }
    }
}

/// How often the worker re-evaluates age-based thresholds while idle.
fn tick(inner: &JournalInner) -> Duration {
    let shortest = inner
        .config
        .max_trans_age()
        .min(inner.config.max_commit_age())
        .min(MAX_TICK);
    (shortest / 2).max(MIN_TICK)
}

fn run(inner: &JournalInner) {
    let tick = tick(inner);
    debug!(?tick, "Committer started");
    loop {
        {
            let mut state = inner.state.lock();
            if state.shutdown {
                break;
            }
            if !inner.has_background_work(&state) {
                inner.changed.wait_for(&mut state, tick);
            }
            if state.shutdown {
                break;
            }
            if !state.is_live() {
                continue;
            }
            if inner.idle_and_aged(&state) && inner.close_open(&mut state) {
                inner.changed.notify_all();
            }
        }
        if let Err(e) = inner.pump() {
            warn!(error = %e, "Background commit failed");
        }
    }
    debug!("Committer stopped");
}
