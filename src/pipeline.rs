// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Publishing Pipeline State
//!
//! The publisher's dispatcher only dequeues while the pipeline is `Active`. A transport
//! failure pauses it; a successful reconnection resumes it. The state lives in a single
//! `watch` channel so every transition is one guarded store and waiters are woken
//! without polling.

use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Active,
    Paused,
}

#[derive(Debug)]
pub struct Pipeline {
    state: watch::Sender<PipelineState>,
    pauses: AtomicU64,
}

impl Pipeline {
    /// Creates a paused pipeline; the publisher resumes it once the channel is ready.
    pub fn new() -> Self {
        let (state, _) = watch::channel(PipelineState::Paused);
        Pipeline {
            state,
            pauses: AtomicU64::new(0),
        }
    }

    /// Active -> Paused. Returns whether a transition happened.
    pub fn pause(&self) -> bool {
        let paused = self.state.send_if_modified(|state| {
            if *state == PipelineState::Active {
                *state = PipelineState::Paused;
                return true;
            }
            false
        });

        if paused {
            self.pauses.fetch_add(1, Ordering::Relaxed);
            warn!("publishing pipeline paused");
        }

        paused
    }

    /// Paused -> Active. Returns whether a transition happened.
    pub fn resume(&self) -> bool {
        let resumed = self.state.send_if_modified(|state| {
            if *state == PipelineState::Paused {
                *state = PipelineState::Active;
                return true;
            }
            false
        });

        if resumed {
            debug!("publishing pipeline resumed");
        }

        resumed
    }

    pub fn is_paused(&self) -> bool {
        *self.state.borrow() == PipelineState::Paused
    }

    /// Number of Active -> Paused transitions so far.
    pub fn pause_count(&self) -> u64 {
        self.pauses.load(Ordering::Relaxed)
    }

    pub fn state(&self) -> PipelineState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<PipelineState> {
        self.state.subscribe()
    }

    /// Waits until the pipeline is active.
    pub async fn wait_active(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|state| *state == PipelineState::Active).await;
    }

    /// Waits until the pipeline is paused.
    pub async fn wait_paused(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|state| *state == PipelineState::Paused).await;
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}
