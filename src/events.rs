//! Message-disposition events, recorded for scenario tests and logged at
//! trace level otherwise.

use std::collections::VecDeque;
use std::sync::Mutex;

const EVENT_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    IgnoredUser,
    BotDirectMessage,
    CommandPluginRan,
    AmbientPluginRan,
    CatchAllRan,
    TriggeredTaskRan,
    SpawnedTaskRan,
    ScheduledTaskRan,
    JobTaskRan,
    GoPluginRan,
    ExternalTaskRan,
    ExternalTaskErrExit,
    ExternalTaskBadPath,
    ExternalTaskBadInterpreter,
    ExternalTaskStderrOutput,
    AuthRanSuccess,
    AuthRanFail,
    AuthRanMechanismFailed,
    AuthRanFailOther,
    AuthNoRunMisconfigured,
    AuthNoRunNotFound,
    ElevRanSuccess,
    ElevRanFail,
    ElevNoRunNotFound,
}

/// Event sink shared by the dispatcher and pipelines.
#[derive(Debug)]
pub struct EventLog {
    recording: bool,
    events: Mutex<VecDeque<Event>>,
}

impl EventLog {
    /// A log that keeps events for [`drain`](Self::drain).
    pub fn recording() -> Self {
        Self {
            recording: true,
            events: Mutex::new(VecDeque::with_capacity(EVENT_BUFFER)),
        }
    }

    /// A log that only traces.
    pub fn discarding() -> Self {
        Self {
            recording: false,
            events: Mutex::new(VecDeque::new()),
        }
    }

    pub fn emit(&self, event: Event) {
        tracing::trace!(?event, "event");
        if !self.recording {
            return;
        }
        if let Ok(mut events) = self.events.lock() {
            if events.len() >= EVENT_BUFFER {
                tracing::debug!(?event, "event buffer full, dropping event");
                return;
            }
            events.push_back(event);
        }
    }

    /// Take every event recorded so far.
    pub fn drain(&self) -> Vec<Event> {
        self.events
            .lock()
            .map(|mut events| events.drain(..).collect())
            .unwrap_or_default()
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::discarding()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_log_drains_in_order() {
        let log = EventLog::recording();
        log.emit(Event::CommandPluginRan);
        log.emit(Event::GoPluginRan);
        assert_eq!(log.drain(), vec![Event::CommandPluginRan, Event::GoPluginRan]);
        assert!(log.drain().is_empty());
    }

    #[test]
    fn discarding_log_keeps_nothing() {
        let log = EventLog::discarding();
        log.emit(Event::IgnoredUser);
        assert!(log.drain().is_empty());
    }

    #[test]
    fn buffer_is_bounded() {
        let log = EventLog::recording();
        for _ in 0..(EVENT_BUFFER + 10) {
            log.emit(Event::ExternalTaskRan);
        }
        assert_eq!(log.drain().len(), EVENT_BUFFER);
    }
}
