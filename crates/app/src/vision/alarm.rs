//! Alarm dispatch with an at-most-one playback policy.
//!
//! `trigger` never blocks the caller. Playback runs on its own named thread
//! and the active flag is cleared by a drop guard, so a missing sound file,
//! a player error or a panic never leaves the dispatcher un-armable.

use std::{
    collections::HashMap,
    path::PathBuf,
    process::{Child, Command, Stdio},
    sync::{Arc, Mutex, PoisonError},
    thread,
    time::Duration,
};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, info_span, warn};

use crate::vision::{config::AlarmSettings, hazard::Hazard, telemetry::spawn_thread};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A playable sound located for one hazard.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SoundResource {
    pub hazard: Hazard,
    pub path: PathBuf,
}

/// One in-flight playback.
pub trait Playback: Send {
    fn is_playing(&mut self) -> Result<bool>;

    fn stop(&mut self);
}

/// Audio subsystem boundary.
pub trait AlertPlayer: Send + Sync {
    fn resolve(&self, hazard: Hazard) -> Option<SoundResource>;

    fn play(&self, sound: &SoundResource) -> Result<Box<dyn Playback>>;
}

/// Plays sound files by spawning an external player, `ffplay` by default.
pub struct CommandPlayer {
    program: String,
    args: Vec<String>,
    sounds: HashMap<Hazard, PathBuf>,
}

impl CommandPlayer {
    pub fn new(program: impl Into<String>, sounds: HashMap<Hazard, PathBuf>) -> Self {
        let program = program.into();
        let args = if program.ends_with("ffplay") {
            ["-nodisp", "-autoexit", "-loglevel", "error"]
                .into_iter()
                .map(String::from)
                .collect()
        } else {
            Vec::new()
        };
        Self {
            program,
            args,
            sounds,
        }
    }

    pub fn from_settings(settings: &AlarmSettings) -> Self {
        let sounds = HashMap::from([
            (Hazard::Fire, settings.fire_sound.clone()),
            (Hazard::Smoke, settings.smoke_sound.clone()),
        ]);
        Self::new(settings.player.clone(), sounds)
    }
}

impl AlertPlayer for CommandPlayer {
    fn resolve(&self, hazard: Hazard) -> Option<SoundResource> {
        let path = self.sounds.get(&hazard)?;
        path.is_file().then(|| SoundResource {
            hazard,
            path: path.clone(),
        })
    }

    fn play(&self, sound: &SoundResource) -> Result<Box<dyn Playback>> {
        let child = Command::new(&self.program)
            .args(&self.args)
            .arg(&sound.path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("failed to spawn {}", self.program))?;
        Ok(Box::new(ChildPlayback { child }))
    }
}

struct ChildPlayback {
    child: Child,
}

impl Playback for ChildPlayback {
    fn is_playing(&mut self) -> Result<bool> {
        match self.child.try_wait()? {
            None => Ok(true),
            Some(status) if status.success() => Ok(false),
            Some(status) => Err(anyhow!("alert player exited with {status}")),
        }
    }

    fn stop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl Drop for ChildPlayback {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            self.stop();
        }
    }
}

/// Logs alarms instead of playing them (`--no-audio`).
#[derive(Clone, Copy, Debug, Default)]
pub struct SilentPlayer;

impl AlertPlayer for SilentPlayer {
    fn resolve(&self, hazard: Hazard) -> Option<SoundResource> {
        Some(SoundResource {
            hazard,
            path: PathBuf::new(),
        })
    }

    fn play(&self, sound: &SoundResource) -> Result<Box<dyn Playback>> {
        info!("ALARM: {} detected (audio disabled)", sound.hazard.as_str());
        Ok(Box::new(Finished))
    }
}

struct Finished;

impl Playback for Finished {
    fn is_playing(&mut self) -> Result<bool> {
        Ok(false)
    }

    fn stop(&mut self) {}
}

pub struct AlarmDispatcher {
    active: Arc<Mutex<bool>>,
    player: Arc<dyn AlertPlayer>,
    poll_interval: Duration,
}

impl AlarmDispatcher {
    pub fn new(player: Arc<dyn AlertPlayer>) -> Self {
        Self {
            active: Arc::new(Mutex::new(false)),
            player,
            poll_interval: POLL_INTERVAL,
        }
    }

    pub fn from_settings(settings: &AlarmSettings) -> Self {
        if settings.muted {
            Self::new(Arc::new(SilentPlayer))
        } else {
            Self::new(Arc::new(CommandPlayer::from_settings(settings)))
        }
    }

    /// Start playback for `hazard` unless one is already running.
    ///
    /// Returns whether a playback thread was started.
    pub fn trigger(&self, hazard: Hazard) -> bool {
        {
            let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
            if *active {
                debug!("alarm already playing; {} swallowed", hazard.as_str());
                return false;
            }
            *active = true;
        }

        let guard = ActiveGuard(self.active.clone());
        let player = self.player.clone();
        let poll_interval = self.poll_interval;
        metrics::counter!("firewatch_alarms_triggered_total", "hazard" => hazard.as_str())
            .increment(1);

        match spawn_thread("alarm-playback", move || {
            let _guard = guard;
            let span = info_span!("alarm.playback", hazard = hazard.as_str());
            let _enter = span.enter();
            if let Err(err) = play_to_completion(player.as_ref(), hazard, poll_interval) {
                warn!("alarm playback failed: {err:#}");
            }
        }) {
            Ok(_) => true,
            // The closure (and its guard) was dropped with the failed spawn.
            Err(err) => {
                warn!("failed to spawn alarm playback thread: {err}");
                false
            }
        }
    }

    pub fn is_active(&self) -> bool {
        *self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn play_to_completion(player: &dyn AlertPlayer, hazard: Hazard, poll: Duration) -> Result<()> {
    let sound = player
        .resolve(hazard)
        .ok_or_else(|| anyhow!("no alert sound available for {}", hazard.as_str()))?;
    info!("playing {} alarm", hazard.as_str());
    let mut playback = player.play(&sound)?;
    while playback.is_playing()? {
        thread::sleep(poll);
    }
    Ok(())
}

/// Clears the alarm flag when playback ends for any reason.
struct ActiveGuard(Arc<Mutex<bool>>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Instant,
    };

    /// Player whose playback lasts a fixed number of polls.
    #[derive(Default)]
    struct ScriptedPlayer {
        played: Mutex<Vec<Hazard>>,
        polls: usize,
        missing: bool,
        fail_play: bool,
    }

    struct CountdownPlayback {
        remaining: Arc<AtomicUsize>,
    }

    impl Playback for CountdownPlayback {
        fn is_playing(&mut self) -> Result<bool> {
            let left = self.remaining.load(Ordering::SeqCst);
            if left == 0 {
                return Ok(false);
            }
            self.remaining.store(left - 1, Ordering::SeqCst);
            Ok(true)
        }

        fn stop(&mut self) {}
    }

    impl AlertPlayer for ScriptedPlayer {
        fn resolve(&self, hazard: Hazard) -> Option<SoundResource> {
            (!self.missing).then(|| SoundResource {
                hazard,
                path: PathBuf::from(format!("{}.mp3", hazard.as_str())),
            })
        }

        fn play(&self, sound: &SoundResource) -> Result<Box<dyn Playback>> {
            if self.fail_play {
                return Err(anyhow!("device busy"));
            }
            self.played.lock().unwrap().push(sound.hazard);
            Ok(Box::new(CountdownPlayback {
                remaining: Arc::new(AtomicUsize::new(self.polls)),
            }))
        }
    }

    fn dispatcher(player: Arc<ScriptedPlayer>) -> AlarmDispatcher {
        let mut alarms = AlarmDispatcher::new(player);
        alarms.poll_interval = Duration::from_millis(5);
        alarms
    }

    fn wait_until_idle(alarms: &AlarmDispatcher) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while alarms.is_active() {
            assert!(Instant::now() < deadline, "alarm never cleared");
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn second_trigger_is_swallowed_while_playing() {
        let player = Arc::new(ScriptedPlayer {
            polls: 20,
            ..Default::default()
        });
        let alarms = dispatcher(player.clone());

        assert!(alarms.trigger(Hazard::Fire));
        assert!(alarms.is_active());
        assert!(!alarms.trigger(Hazard::Smoke));
        wait_until_idle(&alarms);

        assert_eq!(*player.played.lock().unwrap(), vec![Hazard::Fire]);
        assert!(alarms.trigger(Hazard::Smoke));
        wait_until_idle(&alarms);
        assert_eq!(
            *player.played.lock().unwrap(),
            vec![Hazard::Fire, Hazard::Smoke]
        );
    }

    #[test]
    fn missing_sound_clears_active_flag() {
        let alarms = dispatcher(Arc::new(ScriptedPlayer {
            missing: true,
            ..Default::default()
        }));
        assert!(alarms.trigger(Hazard::Fire));
        wait_until_idle(&alarms);
        assert!(alarms.trigger(Hazard::Fire));
        wait_until_idle(&alarms);
    }

    #[test]
    fn playback_error_clears_active_flag() {
        let player = Arc::new(ScriptedPlayer {
            fail_play: true,
            ..Default::default()
        });
        let alarms = dispatcher(player.clone());
        assert!(alarms.trigger(Hazard::Smoke));
        wait_until_idle(&alarms);
        assert!(player.played.lock().unwrap().is_empty());
    }

    #[test]
    fn silent_player_completes_immediately() {
        let alarms = AlarmDispatcher::new(Arc::new(SilentPlayer));
        assert!(alarms.trigger(Hazard::Fire));
        wait_until_idle(&alarms);
    }

    #[test]
    fn command_player_skips_missing_files() {
        let player = CommandPlayer::new(
            "ffplay",
            HashMap::from([(Hazard::Fire, PathBuf::from("/nonexistent/fire.mp3"))]),
        );
        assert_eq!(player.resolve(Hazard::Fire), None);
        assert_eq!(player.resolve(Hazard::Smoke), None);
        assert_eq!(player.args[..2], ["-nodisp", "-autoexit"]);
    }
}
