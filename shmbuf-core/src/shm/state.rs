// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Access state machine.
//!
//! One access walks Idle → Validating → Acquiring → Transferring → Releasing →
//! PostProcessing → Idle. A blocking read that found nothing new goes back from
//! PostProcessing to Validating. Any failure returns straight to Idle.

use crate::error::ShmError;

/// Phases of a single access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessState {
    #[default]
    Idle,
    /// Checking that the buffer is usable for this request.
    Validating,
    /// Waiting for the exclusion.
    Acquiring,
    /// Exclusion held, data moving.
    Transferring,
    Releasing,
    /// Notifier flush or blocking-read decision.
    PostProcessing,
}

impl AccessState {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Validating => "Validating",
            Self::Acquiring => "Acquiring",
            Self::Transferring => "Transferring",
            Self::Releasing => "Releasing",
            Self::PostProcessing => "PostProcessing",
        }
    }

    pub fn can_transition_to(&self, target: AccessState) -> bool {
        matches!(
            (self, target),
            (Self::Idle, Self::Validating) |
            (Self::Validating, Self::Acquiring) |
            (Self::Acquiring, Self::Transferring) |
            (Self::Transferring, Self::Releasing) |
            (Self::Releasing, Self::PostProcessing) |
            (Self::PostProcessing, Self::Validating) |
            // Completion or early exit
            (Self::Validating, Self::Idle) |
            (Self::Acquiring, Self::Idle) |
            (Self::PostProcessing, Self::Idle)
        )
    }
}

impl std::fmt::Display for AccessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Tracks the phase of the access in progress on one buffer handle.
#[derive(Debug, Default)]
pub struct AccessStateMachine {
    current_state: AccessState,
    transition_count: u64,
}

impl AccessStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> AccessState {
        self.current_state
    }

    pub fn transition_count(&self) -> u64 {
        self.transition_count
    }

    pub fn transition_to(&mut self, target: AccessState) -> Result<(), ShmError> {
        if !self.current_state.can_transition_to(target) {
            return Err(ShmError::misc(format!(
                "invalid access transition {} -> {}",
                self.current_state.name(),
                target.name()
            )));
        }

        tracing::trace!(
            from = self.current_state.name(),
            to = target.name(),
            "Access transition"
        );

        self.current_state = target;
        self.transition_count += 1;
        Ok(())
    }

    /// Return to Idle from whatever phase an error interrupted.
    pub fn reset(&mut self) {
        if self.current_state != AccessState::Idle {
            tracing::trace!(from = self.current_state.name(), "Access reset");
            self.current_state = AccessState::Idle;
        }
    }
}
