use crate::models::RateLimitSnapshot;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitWindow {
    Session,
    Weekly,
}

impl LimitWindow {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Session => "session",
            Self::Weekly => "weekly",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitEventKind {
    Hit,
    Reset,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LimitEvent {
    pub profile_id: String,
    pub window: LimitWindow,
    pub kind: LimitEventKind,
    pub reset_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum ScheduleInstruction {
    /// Deliver a reset notification at `fire_at`, replacing any pending one
    /// with the same id.
    Schedule {
        id: String,
        profile_id: String,
        window: LimitWindow,
        fire_at: DateTime<Utc>,
    },
    Cancel {
        id: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LimitTransitions {
    pub events: Vec<LimitEvent>,
    pub instructions: Vec<ScheduleInstruction>,
}

impl LimitTransitions {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && self.instructions.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowState {
    pub hit: bool,
    pub reset_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LimitState {
    pub session: WindowState,
    pub weekly: WindowState,
}

pub fn schedule_id(profile_id: &str, window: LimitWindow) -> String {
    format!("{}-{}-reset", profile_id, window.as_str())
}

/// In-memory hit/reset tracking per profile. Nothing here is persisted;
/// `rebuild` restores it from cached snapshots after a restart.
#[derive(Debug)]
pub struct LimitNotifier {
    threshold: f64,
    states: HashMap<String, LimitState>,
}

impl LimitNotifier {
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold,
            states: HashMap::new(),
        }
    }

    pub fn state(&self, profile_id: &str) -> LimitState {
        self.states.get(profile_id).copied().unwrap_or_default()
    }

    pub fn observe(
        &mut self,
        profile_id: &str,
        snapshot: &RateLimitSnapshot,
        now: DateTime<Utc>,
    ) -> LimitTransitions {
        let threshold = self.threshold;
        let state = self.states.entry(profile_id.to_string()).or_default();
        let mut transitions = LimitTransitions::default();

        observe_window(
            &mut state.session,
            WindowObservation {
                profile_id,
                window: LimitWindow::Session,
                used: snapshot.effective_session_used(now),
                reset_at: snapshot.session_reset,
                threshold,
                now,
            },
            &mut transitions,
        );
        observe_window(
            &mut state.weekly,
            WindowObservation {
                profile_id,
                window: LimitWindow::Weekly,
                used: snapshot.effective_weekly_used(now),
                reset_at: snapshot.weekly_reset,
                threshold,
                now,
            },
            &mut transitions,
        );
        transitions
    }

    /// Seeds state from a cached snapshot without emitting events. Limits
    /// that are already hit get their pending reset notification re-armed.
    pub fn rebuild(
        &mut self,
        profile_id: &str,
        snapshot: &RateLimitSnapshot,
        now: DateTime<Utc>,
    ) -> Vec<ScheduleInstruction> {
        let mut instructions = Vec::new();
        let mut state = LimitState::default();
        let windows = [
            (
                LimitWindow::Session,
                &mut state.session,
                snapshot.effective_session_used(now),
                snapshot.session_reset,
            ),
            (
                LimitWindow::Weekly,
                &mut state.weekly,
                snapshot.effective_weekly_used(now),
                snapshot.weekly_reset,
            ),
        ];
        for (window, window_state, used, reset_at) in windows {
            if used < self.threshold {
                continue;
            }
            window_state.hit = true;
            window_state.reset_at = reset_at;
            if let Some(fire_at) = reset_at.filter(|at| *at > now) {
                instructions.push(ScheduleInstruction::Schedule {
                    id: schedule_id(profile_id, window),
                    profile_id: profile_id.to_string(),
                    window,
                    fire_at,
                });
            }
        }
        self.states.insert(profile_id.to_string(), state);
        instructions
    }

    /// Drops a profile's state and cancels its pending notifications.
    pub fn forget(&mut self, profile_id: &str) -> Vec<ScheduleInstruction> {
        self.states.remove(profile_id);
        [LimitWindow::Session, LimitWindow::Weekly]
            .into_iter()
            .map(|window| ScheduleInstruction::Cancel {
                id: schedule_id(profile_id, window),
            })
            .collect()
    }
}

struct WindowObservation<'a> {
    profile_id: &'a str,
    window: LimitWindow,
    used: f64,
    reset_at: Option<DateTime<Utc>>,
    threshold: f64,
    now: DateTime<Utc>,
}

fn observe_window(
    state: &mut WindowState,
    observation: WindowObservation<'_>,
    transitions: &mut LimitTransitions,
) {
    let WindowObservation {
        profile_id,
        window,
        used,
        reset_at,
        threshold,
        now,
    } = observation;
    let id = schedule_id(profile_id, window);
    let schedule = |fire_at: DateTime<Utc>| ScheduleInstruction::Schedule {
        id: id.clone(),
        profile_id: profile_id.to_string(),
        window,
        fire_at,
    };

    if used >= threshold {
        if !state.hit {
            transitions.events.push(LimitEvent {
                profile_id: profile_id.to_string(),
                window,
                kind: LimitEventKind::Hit,
                reset_at,
            });
            if let Some(fire_at) = reset_at.filter(|at| *at > now) {
                transitions.instructions.push(schedule(fire_at));
            }
        } else if state.reset_at != reset_at {
            match reset_at.filter(|at| *at > now) {
                Some(fire_at) => transitions.instructions.push(schedule(fire_at)),
                None => transitions
                    .instructions
                    .push(ScheduleInstruction::Cancel { id: id.clone() }),
            }
        }
        state.hit = true;
        state.reset_at = reset_at;
        return;
    }

    if state.hit {
        transitions.events.push(LimitEvent {
            profile_id: profile_id.to_string(),
            window,
            kind: LimitEventKind::Reset,
            reset_at: None,
        });
        transitions
            .instructions
            .push(ScheduleInstruction::Cancel { id: id.clone() });
    }
    state.hit = false;
    state.reset_at = None;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::UsageSource;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, 18, 0, 0).unwrap()
    }

    fn snapshot(session_used: f64, session_reset: Option<DateTime<Utc>>) -> RateLimitSnapshot {
        let mut snapshot = RateLimitSnapshot::percent_scale(UsageSource::Api, now());
        snapshot.session_used = session_used;
        snapshot.session_reset = session_reset;
        snapshot
    }

    #[test]
    fn hit_then_reset_emits_exactly_two_events() {
        let mut notifier = LimitNotifier::new(100.0);
        let reset = Some(now() + Duration::hours(2));
        let mut events = Vec::new();
        let mut instructions = Vec::new();
        for used in [50.0, 100.0, 100.0, 30.0] {
            let transitions = notifier.observe("p1", &snapshot(used, reset), now());
            events.extend(transitions.events);
            instructions.extend(transitions.instructions);
        }

        assert_eq!(
            events
                .iter()
                .map(|event| (event.window, event.kind))
                .collect::<Vec<_>>(),
            vec![
                (LimitWindow::Session, LimitEventKind::Hit),
                (LimitWindow::Session, LimitEventKind::Reset),
            ]
        );
        assert_eq!(
            instructions,
            vec![
                ScheduleInstruction::Schedule {
                    id: "p1-session-reset".to_string(),
                    profile_id: "p1".to_string(),
                    window: LimitWindow::Session,
                    fire_at: now() + Duration::hours(2),
                },
                ScheduleInstruction::Cancel {
                    id: "p1-session-reset".to_string()
                },
            ]
        );
    }

    #[test]
    fn changed_reset_time_reschedules_without_new_event() {
        let mut notifier = LimitNotifier::new(100.0);
        let first = now() + Duration::hours(1);
        let second = now() + Duration::hours(3);
        notifier.observe("p1", &snapshot(100.0, Some(first)), now());
        let transitions = notifier.observe("p1", &snapshot(100.0, Some(second)), now());
        assert!(transitions.events.is_empty());
        assert_eq!(
            transitions.instructions,
            vec![ScheduleInstruction::Schedule {
                id: "p1-session-reset".to_string(),
                profile_id: "p1".to_string(),
                window: LimitWindow::Session,
                fire_at: second,
            }]
        );
    }

    #[test]
    fn past_reset_time_counts_as_reset() {
        let mut notifier = LimitNotifier::new(100.0);
        notifier.observe("p1", &snapshot(100.0, Some(now() + Duration::minutes(5))), now());
        let later = now() + Duration::minutes(10);
        let transitions =
            notifier.observe("p1", &snapshot(100.0, Some(now() + Duration::minutes(5))), later);
        assert_eq!(transitions.events.len(), 1);
        assert_eq!(transitions.events[0].kind, LimitEventKind::Reset);
    }

    #[test]
    fn hit_without_known_reset_schedules_nothing() {
        let mut notifier = LimitNotifier::new(100.0);
        let transitions = notifier.observe("p1", &snapshot(100.0, None), now());
        assert_eq!(transitions.events.len(), 1);
        assert!(transitions.instructions.is_empty());
    }

    #[test]
    fn rebuild_rearms_schedule_without_refiring_hit() {
        let mut notifier = LimitNotifier::new(100.0);
        let mut cached = snapshot(100.0, Some(now() + Duration::hours(1)));
        cached.weekly_used = 40.0;
        let instructions = notifier.rebuild("p1", &cached, now());
        assert_eq!(instructions.len(), 1);
        assert!(notifier.state("p1").session.hit);
        assert!(!notifier.state("p1").weekly.hit);

        let transitions = notifier.observe("p1", &cached, now());
        assert!(transitions.is_empty());
    }

    #[test]
    fn windows_and_profiles_are_tracked_independently() {
        let mut notifier = LimitNotifier::new(100.0);
        let mut both = snapshot(100.0, None);
        both.weekly_used = 100.0;
        let transitions = notifier.observe("p1", &both, now());
        assert_eq!(transitions.events.len(), 2);

        let transitions = notifier.observe("p2", &snapshot(100.0, None), now());
        assert_eq!(transitions.events.len(), 1);
        assert_eq!(transitions.events[0].profile_id, "p2");

        let cancels = notifier.forget("p1");
        assert_eq!(cancels.len(), 2);
        assert_eq!(notifier.state("p1"), LimitState::default());
    }
}
