use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use crate::Micros;

/// What anchors a task's trigger time.
///
/// The discriminant doubles as the sign applied to `time_offset` for the
/// event-anchored kinds: a `BeforeEvent` task fires `offset` before the
/// event, `AfterEvent` fires `offset` after it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i8)]
pub enum TriggerKind {
    BeforeEvent = -1,
    OnEvent = 0,
    AfterEvent = 1,
    Periodic = 2,
}

impl TriggerKind {
    pub fn describe(self) -> &'static str {
        match self {
            TriggerKind::BeforeEvent => "triggered-before-event",
            TriggerKind::OnEvent => "triggered-on-event",
            TriggerKind::AfterEvent => "triggered-after-event",
            TriggerKind::Periodic => "triggered-periodically",
        }
    }
}

/// One scheduled task. `operation` may be `None`, which leaves the entry
/// registered but inert.
pub struct TaskConfig<C> {
    pub trigger: TriggerKind,
    /// Millisecond period, periodic tasks only. Clamped on registration.
    pub time_interval_ms: u64,
    /// Anchor timestamp, event-anchored tasks only.
    pub event_time: Micros,
    /// Millisecond offset from `event_time`, signed by the trigger kind.
    pub time_offset_ms: u64,
    pub has_triggered: bool,
    pub operation: Option<Box<dyn FnMut(&mut C)>>,
}

impl<C> TaskConfig<C> {
    pub fn periodic(interval_ms: u64, op: impl FnMut(&mut C) + 'static) -> Self {
        Self {
            trigger: TriggerKind::Periodic,
            time_interval_ms: interval_ms,
            event_time: Micros::ZERO,
            time_offset_ms: 0,
            has_triggered: false,
            operation: Some(Box::new(op)),
        }
    }

    pub fn event_anchored(trigger: TriggerKind, op: impl FnMut(&mut C) + 'static) -> Self {
        Self {
            trigger,
            time_interval_ms: 0,
            event_time: Micros::ZERO,
            time_offset_ms: 0,
            has_triggered: false,
            operation: Some(Box::new(op)),
        }
    }

    fn trigger_time(&self, last_op_time: Micros) -> Micros {
        match self.trigger {
            TriggerKind::Periodic => last_op_time + Micros::from_millis(self.time_interval_ms),
            kind => {
                let offset = Micros::from_millis(self.time_offset_ms);
                match kind {
                    TriggerKind::BeforeEvent => self.event_time.saturating_sub(offset),
                    TriggerKind::AfterEvent => self.event_time + offset,
                    _ => self.event_time,
                }
            }
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("task [{0}] not found")]
    NotFound(String),
    #[error("task [{0}] is not event-anchored")]
    NotEventAnchored(String),
}

struct TaskEntry<C> {
    config: TaskConfig<C>,
    last_op_time: Micros,
}

/// Name-keyed timed tasks, checked once per main-loop tick.
///
/// Operations run to completion inside `tick`, one after another, and are
/// handed the caller's context so they can reach transports and caches
/// without any global state.
pub struct TimedTaskScheduler<C> {
    tasks: BTreeMap<String, TaskEntry<C>>,
}

impl<C> Default for TimedTaskScheduler<C> {
    fn default() -> Self {
        Self { tasks: BTreeMap::new() }
    }
}

impl<C> TimedTaskScheduler<C> {
    /// Smallest accepted periodic interval.
    pub const MIN_INTERVAL_MS: u64 = 1;
    /// Largest accepted periodic interval, one day.
    pub const MAX_INTERVAL_MS: u64 = 86_400_000;

    /// Registering a name twice is a no-op success: the first registration
    /// wins, matching startup flows that layer built-in and custom tables.
    pub fn register(&mut self, name: &str, mut config: TaskConfig<C>) {
        if self.tasks.contains_key(name) {
            info!(task = name, "already registered, keeping the existing entry");
            return;
        }

        if config.trigger == TriggerKind::Periodic {
            config.time_interval_ms =
                config.time_interval_ms.clamp(Self::MIN_INTERVAL_MS, Self::MAX_INTERVAL_MS);
        }

        debug!(
            task = name,
            trigger = config.trigger.describe(),
            interval_ms = config.time_interval_ms,
            offset_ms = config.time_offset_ms,
            "timed task registered"
        );
        self.tasks.insert(name.to_string(), TaskEntry { config, last_op_time: Micros::ZERO });
    }

    pub fn unregister(&mut self, name: &str) -> Result<(), SchedulerError> {
        self.tasks
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| SchedulerError::NotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Re-arms an event-anchored task against a new anchor.
    pub fn set_event_time(
        &mut self,
        name: &str,
        event_time: Micros,
        offset_ms: u64,
    ) -> Result<(), SchedulerError> {
        let entry =
            self.tasks.get_mut(name).ok_or_else(|| SchedulerError::NotFound(name.to_string()))?;

        if entry.config.trigger == TriggerKind::Periodic {
            return Err(SchedulerError::NotEventAnchored(name.to_string()));
        }

        entry.config.event_time = event_time;
        entry.config.time_offset_ms = offset_ms;
        entry.config.has_triggered = false;
        Ok(())
    }

    /// Runs every task whose trigger time has passed. Periodic tasks are
    /// re-armed at `now`; event-anchored tasks fire once until re-armed via
    /// [`Self::set_event_time`].
    pub fn tick(&mut self, now: Micros, ctx: &mut C) {
        for (name, entry) in self.tasks.iter_mut() {
            if entry.config.operation.is_none() {
                continue;
            }

            let trigger_time = entry.config.trigger_time(entry.last_op_time);
            if now < trigger_time {
                continue;
            }

            let Some(op) = entry.config.operation.as_mut() else {
                continue;
            };

            let start = Micros::now();
            if entry.config.trigger == TriggerKind::Periodic {
                op(ctx);
                entry.last_op_time = now;
            } else {
                if entry.config.has_triggered {
                    continue;
                }
                op(ctx);
                entry.config.has_triggered = true;
            }

            let spent = Micros::now().elapsed_since(start);
            if spent > Micros::from_millis(100) {
                warn!(task = %name, spent_us = spent.0, "slow timed task");
            } else {
                debug!(task = %name, spent_us = spent.0, "one round done");
            }
        }
    }
}
