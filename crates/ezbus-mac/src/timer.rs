//! Cooperative timers.
//!
//! The engine owns every timer of a node in a flat arena and hands out
//! `TimerId` handles. Nothing here runs on its own: `sweep(now)` advances each
//! timer one step and returns the ids that expired during that sweep. Each
//! expiry is reported exactly once; the owner re-arms with `start`.

/// Milliseconds on the caller's monotonic clock.
pub type Tick = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    Stopped,
    Starting,
    Started,
    Pausing,
    Paused,
    Resume,
    Expiring,
    Expired,
    Stopping,
}

#[derive(Debug, Clone)]
struct Timer {
    key: &'static str,
    state: TimerState,
    start: Tick,
    period: Tick,
    pausable: bool,
    /// State to restore on resume.
    paused_from: TimerState,
    pause_start: Tick,
    /// Auto-resume after this long. None waits for an explicit resume.
    pause_duration: Option<Tick>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GroupRequest {
    Pause(Option<Tick>),
    Resume,
}

#[derive(Debug, Default)]
pub struct TimerEngine {
    timers: Vec<Timer>,
    pending: Option<GroupRequest>,
}

impl TimerEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a stopped timer.
    pub fn add(&mut self, key: &'static str, period: Tick, pausable: bool) -> TimerId {
        self.timers.push(Timer {
            key,
            state: TimerState::Stopped,
            start: 0,
            period,
            pausable,
            paused_from: TimerState::Stopped,
            pause_start: 0,
            pause_duration: None,
        });
        TimerId(self.timers.len() - 1)
    }

    pub fn key(&self, id: TimerId) -> &'static str {
        self.timers[id.0].key
    }

    pub fn state(&self, id: TimerId) -> TimerState {
        self.timers[id.0].state
    }

    pub fn period(&self, id: TimerId) -> Tick {
        self.timers[id.0].period
    }

    pub fn set_period(&mut self, id: TimerId, period: Tick) {
        self.timers[id.0].period = period;
    }

    /// Arm (or re-arm) from any state. The start tick is taken at the next
    /// sweep.
    pub fn start(&mut self, id: TimerId) {
        self.timers[id.0].state = TimerState::Starting;
    }

    /// Set the period and arm.
    pub fn start_with(&mut self, id: TimerId, period: Tick) {
        self.set_period(id, period);
        self.start(id);
    }

    /// Takes effect at the next sweep.
    pub fn stop(&mut self, id: TimerId) {
        let timer = &mut self.timers[id.0];
        if timer.state != TimerState::Stopped {
            timer.state = TimerState::Stopping;
        }
    }

    /// True while the timer is counting toward an expiry.
    pub fn is_running(&self, id: TimerId) -> bool {
        matches!(
            self.timers[id.0].state,
            TimerState::Starting | TimerState::Started
        )
    }

    /// Pause a running, pausable timer. Anything else is left alone.
    pub fn pause(&mut self, id: TimerId) {
        let timer = &mut self.timers[id.0];
        if timer.pausable && matches!(timer.state, TimerState::Starting | TimerState::Started) {
            timer.paused_from = timer.state;
            timer.state = TimerState::Pausing;
        }
    }

    /// Resume a paused timer at the next sweep. A pause that has not been
    /// swept yet is simply cancelled.
    pub fn resume(&mut self, id: TimerId) {
        let timer = &mut self.timers[id.0];
        match timer.state {
            TimerState::Pausing => {
                timer.state = timer.paused_from;
                timer.pause_duration = None;
            }
            TimerState::Paused => timer.state = TimerState::Resume,
            _ => {}
        }
    }

    pub fn set_pause_duration(&mut self, id: TimerId, duration: Option<Tick>) {
        self.timers[id.0].pause_duration = duration;
    }

    /// Pause every pausable timer at the start of the next sweep. With a
    /// duration they resume on their own once it has passed.
    pub fn request_pause_all(&mut self, duration: Option<Tick>) {
        self.pending = Some(GroupRequest::Pause(duration));
    }

    /// Resume every paused timer at the start of the next sweep.
    pub fn request_resume_all(&mut self) {
        self.pending = Some(GroupRequest::Resume);
    }

    /// True if any timer is paused or about to be.
    pub fn any_paused(&self) -> bool {
        matches!(self.pending, Some(GroupRequest::Pause(_)))
            || self.timers.iter().any(|t| {
                matches!(
                    t.state,
                    TimerState::Pausing | TimerState::Paused | TimerState::Resume
                )
            })
    }

    /// Advance every timer to `now`. Returns the timers that expired.
    pub fn sweep(&mut self, now: Tick) -> Vec<TimerId> {
        if let Some(request) = self.pending.take() {
            for id in 0..self.timers.len() {
                match request {
                    GroupRequest::Pause(duration) => {
                        self.timers[id].pause_duration = duration;
                        self.pause(TimerId(id));
                    }
                    GroupRequest::Resume => self.resume(TimerId(id)),
                }
            }
        }

        let mut expired = Vec::new();
        for (i, timer) in self.timers.iter_mut().enumerate() {
            match timer.state {
                TimerState::Stopped | TimerState::Expired => {}
                TimerState::Starting => {
                    timer.start = now;
                    timer.state = TimerState::Started;
                }
                TimerState::Started => {
                    if now.saturating_sub(timer.start) > timer.period {
                        tracing::trace!(timer = timer.key, now, "timer expired");
                        timer.state = TimerState::Expiring;
                        expired.push(TimerId(i));
                    }
                }
                TimerState::Expiring => {
                    timer.state = TimerState::Expired;
                }
                TimerState::Pausing => {
                    timer.pause_start = now;
                    timer.state = TimerState::Paused;
                }
                TimerState::Paused => {
                    if let Some(duration) = timer.pause_duration {
                        if now.saturating_sub(timer.pause_start) >= duration {
                            resume_at(timer, now);
                        }
                    }
                }
                TimerState::Resume => resume_at(timer, now),
                TimerState::Stopping => {
                    timer.state = TimerState::Stopped;
                }
            }
        }
        expired
    }
}

/// Shift the start forward by the time spent paused and restore the state
/// the timer was paused from.
fn resume_at(timer: &mut Timer, now: Tick) {
    timer.start += now.saturating_sub(timer.pause_start);
    timer.state = timer.paused_from;
    timer.pause_duration = None;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expires_once_after_period() {
        let mut engine = TimerEngine::new();
        let id = engine.add("t", 10, false);
        engine.start(id);

        assert!(engine.sweep(100).is_empty());
        assert_eq!(engine.state(id), TimerState::Started);
        assert!(engine.sweep(110).is_empty());
        assert_eq!(engine.sweep(111), vec![id]);
        assert_eq!(engine.state(id), TimerState::Expiring);

        // Never reported twice.
        assert!(engine.sweep(200).is_empty());
        assert_eq!(engine.state(id), TimerState::Expired);
        assert!(engine.sweep(300).is_empty());
    }

    #[test]
    fn restart_rearms_from_expired() {
        let mut engine = TimerEngine::new();
        let id = engine.add("t", 5, false);
        engine.start(id);
        engine.sweep(0);
        assert_eq!(engine.sweep(6), vec![id]);

        engine.start(id);
        engine.sweep(10);
        assert!(engine.sweep(15).is_empty());
        assert_eq!(engine.sweep(16), vec![id]);
    }

    #[test]
    fn stop_is_applied_at_next_sweep() {
        let mut engine = TimerEngine::new();
        let id = engine.add("t", 5, false);
        engine.start(id);
        engine.sweep(0);
        engine.stop(id);
        assert_eq!(engine.state(id), TimerState::Stopping);
        assert!(engine.sweep(100).is_empty());
        assert_eq!(engine.state(id), TimerState::Stopped);
        assert!(!engine.is_running(id));
    }

    #[test]
    fn pause_and_resume_preserve_remaining_time() {
        // Period 100, paused after 30, resumed 500 later: 70 remain.
        let mut engine = TimerEngine::new();
        let id = engine.add("t", 100, true);
        engine.start(id);
        engine.sweep(1000);

        engine.pause(id);
        engine.sweep(1030);
        assert_eq!(engine.state(id), TimerState::Paused);
        assert!(engine.sweep(1200).is_empty());

        engine.resume(id);
        engine.sweep(1530);
        assert_eq!(engine.state(id), TimerState::Started);
        assert!(engine.sweep(1530 + 70).is_empty());
        assert_eq!(engine.sweep(1530 + 71), vec![id]);
    }

    #[test]
    fn resume_before_pause_is_swept_keeps_schedule() {
        let mut engine = TimerEngine::new();
        let id = engine.add("t", 100, true);
        engine.start(id);
        engine.sweep(10_000);

        engine.pause(id);
        engine.resume(id);
        assert_eq!(engine.state(id), TimerState::Started);
        assert!(engine.sweep(10_010).is_empty());
        assert!(engine.sweep(10_100).is_empty());
        assert_eq!(engine.sweep(10_101), vec![id]);
    }

    #[test]
    fn group_resume_cancels_unswept_group_pause() {
        let mut engine = TimerEngine::new();
        let id = engine.add("t", 100, true);
        engine.start(id);
        engine.sweep(10_000);

        // Both land before the next sweep; the resume wins.
        engine.pause(id);
        engine.request_resume_all();
        engine.sweep(10_010);
        assert!(engine.is_running(id));
        assert!(!engine.any_paused());
        assert_eq!(engine.sweep(10_101), vec![id]);
    }

    #[test]
    fn unpausable_timer_ignores_pause() {
        let mut engine = TimerEngine::new();
        let id = engine.add("t", 10, false);
        engine.start(id);
        engine.sweep(0);
        engine.pause(id);
        assert_eq!(engine.state(id), TimerState::Started);
        assert_eq!(engine.sweep(11), vec![id]);
    }

    #[test]
    fn group_pause_with_duration_auto_resumes() {
        let mut engine = TimerEngine::new();
        let a = engine.add("a", 20, true);
        let b = engine.add("b", 20, false);
        engine.start(a);
        engine.start(b);
        engine.sweep(0);

        engine.request_pause_all(Some(50));
        assert!(engine.any_paused());
        engine.sweep(10);
        assert_eq!(engine.state(a), TimerState::Paused);
        assert_eq!(engine.state(b), TimerState::Started);

        // b keeps running.
        assert_eq!(engine.sweep(21), vec![b]);
        assert!(engine.sweep(59).is_empty());

        // a resumes at 60 with 10 already elapsed.
        engine.sweep(60);
        assert_eq!(engine.state(a), TimerState::Started);
        assert!(!engine.any_paused());
        assert!(engine.sweep(70).is_empty());
        assert_eq!(engine.sweep(71), vec![a]);
    }

    #[test]
    fn group_resume_releases_open_pause() {
        let mut engine = TimerEngine::new();
        let a = engine.add("a", 20, true);
        engine.start(a);
        engine.sweep(0);
        engine.request_pause_all(None);
        engine.sweep(5);
        assert!(engine.sweep(1000).is_empty());

        engine.request_resume_all();
        engine.sweep(1005);
        assert!(engine.is_running(a));
        assert_eq!(engine.sweep(1021), vec![a]);
    }
}
