//! Resource limits enforced while executing code units.

use std::time::{Duration, Instant};

use crate::exception::{ExcType, ExceptionRaise, RunError};

/// Default maximum depth of nested frame executions.
pub const DEFAULT_MAX_RECURSION_DEPTH: usize = 1000;

/// Maximum nesting of native re-entries into the interpreter: generator resumes from
/// running code, `yield from` forwarding and host calls. Calls between Python functions
/// do not nest natively and are bounded by `max_recursion_depth` alone.
pub const MAX_NATIVE_DEPTH: usize = 64;

/// How often (in executed instructions) the time limit is checked.
const TIME_CHECK_INTERVAL: u32 = 256;

/// Limits applied to a [`crate::Vm`].
///
/// `None` disables a limit. Deserializable so hosts can load limits from their own
/// configuration files.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Maximum number of frames executing at once. Exceeding it raises `RecursionError`.
    pub max_recursion_depth: Option<usize>,
    /// Maximum number of live heap objects. Exceeding it raises `MemoryError`.
    pub max_allocations: Option<usize>,
    /// Maximum wall-clock time for one top-level call. Exceeding it raises an
    /// uncatchable `TimeoutError`.
    pub max_duration: Option<Duration>,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_recursion_depth: Some(DEFAULT_MAX_RECURSION_DEPTH),
            max_allocations: None,
            max_duration: None,
        }
    }
}

impl ResourceLimits {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// No limits at all, including recursion depth.
    #[must_use]
    pub fn unlimited() -> Self {
        Self {
            max_recursion_depth: None,
            max_allocations: None,
            max_duration: None,
        }
    }

    #[must_use]
    pub fn max_recursion_depth(mut self, depth: usize) -> Self {
        self.max_recursion_depth = Some(depth);
        self
    }

    #[must_use]
    pub fn max_allocations(mut self, allocations: usize) -> Self {
        self.max_allocations = Some(allocations);
        self
    }

    #[must_use]
    pub fn max_duration(mut self, duration: Duration) -> Self {
        self.max_duration = Some(duration);
        self
    }
}

/// A limit was exceeded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResourceError {
    #[error("allocation limit of {limit} objects exceeded")]
    Allocation { limit: usize },
    #[error("time limit of {limit:?} exceeded after {elapsed:?}")]
    Time { limit: Duration, elapsed: Duration },
    #[error("maximum recursion depth exceeded")]
    Recursion { limit: usize },
}

impl From<ResourceError> for RunError {
    fn from(err: ResourceError) -> Self {
        match err {
            ResourceError::Allocation { .. } => ExceptionRaise::with_message(ExcType::MemoryError, err.to_string()).into(),
            ResourceError::Recursion { .. } => ExceptionRaise::with_message(ExcType::RecursionError, err.to_string()).into(),
            ResourceError::Time { .. } => {
                Self::UncatchableExc(Box::new(ExceptionRaise::with_message(ExcType::TimeoutError, err.to_string())))
            }
        }
    }
}

/// Tracks recursion depth and elapsed time for one VM.
#[derive(Debug)]
pub(crate) struct ResourceTracker {
    limits: ResourceLimits,
    depth: usize,
    native_depth: usize,
    started: Option<Instant>,
    ticks: u32,
}

impl ResourceTracker {
    pub fn new(limits: ResourceLimits) -> Self {
        Self {
            limits,
            depth: 0,
            native_depth: 0,
            started: None,
            ticks: 0,
        }
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    #[cfg(test)]
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Enters a frame. The outermost entry starts the clock.
    pub fn enter(&mut self) -> Result<(), ResourceError> {
        if let Some(limit) = self.limits.max_recursion_depth
            && self.depth >= limit
        {
            return Err(ResourceError::Recursion { limit });
        }
        if self.depth == 0 {
            self.started = Some(Instant::now());
            self.ticks = 0;
        }
        self.depth += 1;
        Ok(())
    }

    pub fn exit(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    /// Enters a native re-entry of the interpreter.
    pub fn enter_native(&mut self) -> Result<(), ResourceError> {
        if self.native_depth >= MAX_NATIVE_DEPTH {
            return Err(ResourceError::Recursion { limit: MAX_NATIVE_DEPTH });
        }
        self.native_depth += 1;
        Ok(())
    }

    pub fn exit_native(&mut self) {
        self.native_depth = self.native_depth.saturating_sub(1);
    }

    /// Called once per executed instruction; only looks at the clock periodically.
    pub fn check_time(&mut self) -> Result<(), ResourceError> {
        self.ticks = self.ticks.wrapping_add(1);
        if self.ticks % TIME_CHECK_INTERVAL != 0 {
            return Ok(());
        }
        if let (Some(limit), Some(started)) = (self.limits.max_duration, self.started) {
            let elapsed = started.elapsed();
            if elapsed > limit {
                return Err(ResourceError::Time { limit, elapsed });
            }
        }
        Ok(())
    }
}
