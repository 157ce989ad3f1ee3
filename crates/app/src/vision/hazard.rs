//! Sliding-window hazard confirmation.
//!
//! Each loop (file session or camera feed) owns one [`HazardTracker`]. A
//! hazard is confirmed only while its window holds [`HAZARD_WINDOW_LEN`]
//! consecutive positive frames.

use std::collections::VecDeque;

use ml_core::Detection;

use crate::vision::alarm::AlarmDispatcher;

pub const HAZARD_WINDOW_LEN: usize = 5;

/// Alarm category; selects the sound that is played.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Hazard {
    Fire,
    Smoke,
}

impl Hazard {
    pub fn as_str(self) -> &'static str {
        match self {
            Hazard::Fire => "fire",
            Hazard::Smoke => "smoke",
        }
    }
}

/// Outcome of a successful confirmation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfirmedHazard {
    Fire,
    FireAndSmoke,
    Smoke,
}

impl ConfirmedHazard {
    pub fn as_str(self) -> &'static str {
        match self {
            ConfirmedHazard::Fire => "fire",
            ConfirmedHazard::FireAndSmoke => "fire_and_smoke",
            ConfirmedHazard::Smoke => "smoke",
        }
    }

    /// Fire outranks smoke whenever both are present.
    pub fn alarm(self) -> Hazard {
        match self {
            ConfirmedHazard::Fire | ConfirmedHazard::FireAndSmoke => Hazard::Fire,
            ConfirmedHazard::Smoke => Hazard::Smoke,
        }
    }
}

/// Class keywords matched against detection labels.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HazardLabels {
    pub fire: String,
    pub smoke: String,
}

impl HazardLabels {
    pub fn new(fire: impl Into<String>, smoke: impl Into<String>) -> Self {
        Self {
            fire: fire.into(),
            smoke: smoke.into(),
        }
    }

    /// Substring match used by the sliding windows.
    pub fn matches(&self, hazard: Hazard, detection: &Detection) -> bool {
        detection.label_contains(self.keyword(hazard))
    }

    /// Exact (case-insensitive) class match used for still images.
    pub fn is_exactly(&self, hazard: Hazard, class_label: &str) -> bool {
        class_label.eq_ignore_ascii_case(self.keyword(hazard))
    }

    /// Category a label is drawn in, if any.
    pub fn classify(&self, class_label: &str) -> Option<Hazard> {
        let lower = class_label.to_lowercase();
        if lower.contains(&self.fire.to_lowercase()) {
            Some(Hazard::Fire)
        } else if lower.contains(&self.smoke.to_lowercase()) {
            Some(Hazard::Smoke)
        } else {
            None
        }
    }

    fn keyword(&self, hazard: Hazard) -> &str {
        match hazard {
            Hazard::Fire => &self.fire,
            Hazard::Smoke => &self.smoke,
        }
    }
}

impl Default for HazardLabels {
    fn default() -> Self {
        Self::new("fire", "smoke")
    }
}

/// Ring buffer of the most recent per-frame presence flags.
#[derive(Clone, Debug, Default)]
pub struct HazardWindow {
    samples: VecDeque<bool>,
}

impl HazardWindow {
    pub fn push(&mut self, present: bool) {
        if self.samples.len() == HAZARD_WINDOW_LEN {
            self.samples.pop_front();
        }
        self.samples.push_back(present);
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_full(&self) -> bool {
        self.samples.len() == HAZARD_WINDOW_LEN
    }

    pub fn is_unanimous(&self) -> bool {
        self.is_full() && self.samples.iter().all(|present| *present)
    }
}

#[derive(Debug, Default)]
pub struct HazardTracker {
    labels: HazardLabels,
    fire: HazardWindow,
    smoke: HazardWindow,
}

impl HazardTracker {
    pub fn new(labels: HazardLabels) -> Self {
        Self {
            labels,
            fire: HazardWindow::default(),
            smoke: HazardWindow::default(),
        }
    }

    /// Record one frame's detections and report a confirmation, if any.
    ///
    /// Confirmation repeats on every call while a window stays unanimous.
    pub fn observe(&mut self, detections: &[Detection]) -> Option<ConfirmedHazard> {
        let fire = detections
            .iter()
            .any(|det| self.labels.matches(Hazard::Fire, det));
        let smoke = detections
            .iter()
            .any(|det| self.labels.matches(Hazard::Smoke, det));
        self.fire.push(fire);
        self.smoke.push(smoke);

        match (self.fire.is_unanimous(), self.smoke.is_unanimous()) {
            (true, true) => Some(ConfirmedHazard::FireAndSmoke),
            (true, false) => Some(ConfirmedHazard::Fire),
            (false, true) => Some(ConfirmedHazard::Smoke),
            (false, false) => None,
        }
    }

    /// [`observe`](Self::observe), then hand any confirmation to the dispatcher.
    pub fn observe_and_dispatch(
        &mut self,
        detections: &[Detection],
        alarms: &AlarmDispatcher,
    ) -> Option<ConfirmedHazard> {
        let confirmed = self.observe(detections)?;
        tracing::debug!("hazard confirmed: {}", confirmed.as_str());
        alarms.trigger(confirmed.alarm());
        Some(confirmed)
    }

    #[cfg(test)]
    pub fn window(&self, hazard: Hazard) -> &HazardWindow {
        match hazard {
            Hazard::Fire => &self.fire,
            Hazard::Smoke => &self.smoke,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::Arc,
        time::{Duration, Instant},
    };

    use super::*;
    use crate::vision::session::testing::CountingPlayer;

    fn frame(labels: &[&str]) -> Vec<Detection> {
        labels
            .iter()
            .map(|label| Detection::new(*label, 0.9, Some([0.0, 0.0, 4.0, 4.0])))
            .collect()
    }

    #[test]
    fn partial_window_never_confirms() {
        let mut tracker = HazardTracker::default();
        for _ in 0..HAZARD_WINDOW_LEN - 1 {
            assert_eq!(tracker.observe(&frame(&["fire", "smoke"])), None);
        }
        assert_eq!(tracker.window(Hazard::Fire).len(), HAZARD_WINDOW_LEN - 1);
    }

    #[test]
    fn fifth_consecutive_fire_confirms_and_repeats_while_unanimous() {
        let mut tracker = HazardTracker::default();
        let results: Vec<_> = (0..7).map(|_| tracker.observe(&frame(&["Fire"]))).collect();
        assert_eq!(&results[..4], &[None, None, None, None]);
        assert_eq!(&results[4..], &[Some(ConfirmedHazard::Fire); 3]);
    }

    #[test]
    fn gap_resets_unanimity_until_window_refills() {
        let mut tracker = HazardTracker::default();
        for _ in 0..5 {
            tracker.observe(&frame(&["smoke"]));
        }
        assert_eq!(tracker.observe(&frame(&[])), None);
        for _ in 0..4 {
            assert_eq!(tracker.observe(&frame(&["smoke"])), None);
        }
        assert_eq!(tracker.observe(&frame(&["smoke"])), Some(ConfirmedHazard::Smoke));
    }

    #[test]
    fn both_unanimous_reports_combined_with_fire_alarm() {
        let mut tracker = HazardTracker::default();
        let mut last = None;
        for _ in 0..5 {
            last = tracker.observe(&frame(&["fire", "heavy_smoke"]));
        }
        assert_eq!(last, Some(ConfirmedHazard::FireAndSmoke));
        assert_eq!(last.map(ConfirmedHazard::alarm), Some(Hazard::Fire));
    }

    #[test]
    fn fire_wins_when_smoke_window_is_not_unanimous() {
        let mut tracker = HazardTracker::default();
        tracker.observe(&frame(&["fire"]));
        let mut last = None;
        for _ in 0..4 {
            last = tracker.observe(&frame(&["fire", "smoke"]));
        }
        assert_eq!(last, Some(ConfirmedHazard::Fire));
    }

    #[test]
    fn custom_labels_and_classification() {
        let labels = HazardLabels::new("flame", "haze");
        assert_eq!(labels.classify("Open_Flame"), Some(Hazard::Fire));
        assert_eq!(labels.classify("haze"), Some(Hazard::Smoke));
        assert_eq!(labels.classify("person"), None);
        assert!(labels.is_exactly(Hazard::Fire, "FLAME"));
        assert!(!labels.is_exactly(Hazard::Fire, "open_flame"));

        let mut tracker = HazardTracker::new(labels);
        let mut last = None;
        for _ in 0..5 {
            last = tracker.observe(&frame(&["haze"]));
        }
        assert_eq!(last, Some(ConfirmedHazard::Smoke));
        assert_eq!(tracker.window(Hazard::Fire).len(), HAZARD_WINDOW_LEN);
    }

    #[test]
    fn combined_confirmation_plays_only_the_fire_sound() {
        let player = Arc::new(CountingPlayer::default());
        let alarms = AlarmDispatcher::new(player.clone());
        let mut tracker = HazardTracker::default();

        let mut confirmed = None;
        for _ in 0..HAZARD_WINDOW_LEN {
            confirmed = tracker.observe_and_dispatch(&frame(&["fire", "smoke"]), &alarms);
        }
        assert_eq!(confirmed, Some(ConfirmedHazard::FireAndSmoke));

        let deadline = Instant::now() + Duration::from_secs(5);
        while alarms.is_active() {
            assert!(Instant::now() < deadline, "playback did not finish");
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(*player.played.lock().unwrap(), vec![Hazard::Fire]);
    }
}
