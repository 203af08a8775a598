// Copyright 2025 Chris Custine
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Built-in alert channels wrapping platform collaborators.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use log::debug;

use super::{Alert, AlertChannel, AlertError};

/// Delay before an in-process popup is dismissed.
pub const POPUP_DISMISS_AFTER: Duration = Duration::from_secs(5);
/// Vibrate, pause, vibrate, pause, vibrate.
pub const VIBRATION_PATTERN_MS: [u64; 5] = [200, 100, 200, 100, 200];
pub const ALERT_TONE_HZ: f32 = 800.0;
pub const ALERT_TONE_DURATION: Duration = Duration::from_millis(500);

/// Result of a notification permission request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    Granted,
    Denied,
    Unsupported,
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Granted => "granted",
            Self::Denied => "denied",
            Self::Unsupported => "unsupported",
        })
    }
}

/// Options passed with a system notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationOptions {
    pub tag: String,
    pub require_interaction: bool,
    pub vibrate: Vec<u64>,
    pub actions: Vec<String>,
}

/// Platform notification service.
pub trait NotificationSink: Send + Sync {
    fn request_permission(&self) -> Permission;

    fn show(&self, title: &str, body: &str, options: &NotificationOptions) -> Result<(), AlertError>;
}

/// System notification channel. Permission is requested once and cached.
pub struct NotificationChannel<S> {
    sink: S,
    permission: OnceLock<Permission>,
}

impl<S: NotificationSink> NotificationChannel<S> {
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            permission: OnceLock::new(),
        }
    }

    pub fn permission(&self) -> Permission {
        *self.permission.get_or_init(|| self.sink.request_permission())
    }
}

impl<S: NotificationSink> AlertChannel for NotificationChannel<S> {
    fn name(&self) -> &'static str {
        "notification"
    }

    fn deliver(&self, alert: &Alert) -> Result<(), AlertError> {
        match self.permission() {
            Permission::Granted => {}
            other => return Err(AlertError::Permission(other)),
        }
        let options = NotificationOptions {
            tag: alert.tag.clone(),
            require_interaction: true,
            vibrate: VIBRATION_PATTERN_MS.to_vec(),
            actions: vec!["view".to_string(), "dismiss".to_string()],
        };
        self.sink.show(&alert.title, &alert.body, &options)
    }
}

/// In-process visual alert surface.
pub trait PopupSink: Send + Sync {
    fn show(&self, alert: &Alert);

    fn dismiss(&self);
}

/// Non-blocking popup, dismissed after [`POPUP_DISMISS_AFTER`].
///
/// A newer popup resets the timer; the stale timer does not dismiss it.
pub struct PopupChannel<P> {
    sink: Arc<P>,
    generation: Arc<AtomicU64>,
    dismiss_after: Duration,
}

impl<P: PopupSink + 'static> PopupChannel<P> {
    pub fn new(sink: P) -> Self {
        Self::with_delay(sink, POPUP_DISMISS_AFTER)
    }

    pub fn with_delay(sink: P, dismiss_after: Duration) -> Self {
        Self {
            sink: Arc::new(sink),
            generation: Arc::new(AtomicU64::new(0)),
            dismiss_after,
        }
    }
}

impl<P: PopupSink + 'static> AlertChannel for PopupChannel<P> {
    fn name(&self) -> &'static str {
        "popup"
    }

    fn deliver(&self, alert: &Alert) -> Result<(), AlertError> {
        self.sink.show(alert);
        let shown = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let handle = tokio::runtime::Handle::try_current()
            .map_err(|_| AlertError::Delivery("no runtime for popup dismissal".to_string()))?;
        let sink = Arc::clone(&self.sink);
        let generation = Arc::clone(&self.generation);
        let delay = self.dismiss_after;
        handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if generation.load(Ordering::SeqCst) == shown {
                sink.dismiss();
            }
        });
        Ok(())
    }
}

/// Device vibration motor.
pub trait Vibrator: Send + Sync {
    fn is_available(&self) -> bool;

    fn vibrate(&self, pattern_ms: &[u64]) -> Result<(), AlertError>;
}

/// Haptic feedback; skipped when the device has no vibrator.
pub struct HapticChannel<V> {
    vibrator: V,
}

impl<V: Vibrator> HapticChannel<V> {
    pub fn new(vibrator: V) -> Self {
        Self { vibrator }
    }
}

impl<V: Vibrator> AlertChannel for HapticChannel<V> {
    fn name(&self) -> &'static str {
        "haptic"
    }

    fn deliver(&self, _alert: &Alert) -> Result<(), AlertError> {
        if !self.vibrator.is_available() {
            debug!("No vibrator, skipping haptic feedback");
            return Ok(());
        }
        self.vibrator.vibrate(&VIBRATION_PATTERN_MS)
    }
}

/// Audio output able to play a short tone.
pub trait TonePlayer: Send + Sync {
    fn play_tone(&self, frequency_hz: f32, duration: Duration) -> Result<(), AlertError>;
}

/// Audible cue. Playback failures are ignored.
pub struct AudioChannel<T> {
    player: T,
}

impl<T: TonePlayer> AudioChannel<T> {
    pub fn new(player: T) -> Self {
        Self { player }
    }
}

impl<T: TonePlayer> AlertChannel for AudioChannel<T> {
    fn name(&self) -> &'static str {
        "audio"
    }

    fn deliver(&self, _alert: &Alert) -> Result<(), AlertError> {
        if let Err(e) = self.player.play_tone(ALERT_TONE_HZ, ALERT_TONE_DURATION) {
            debug!("Alert tone failed: {}", e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Marker;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    fn alert() -> Alert {
        Alert::for_marker(&Marker::with_id("m1", "Tree", 0.0, 0.0, "g1"), 42.0)
    }

    struct Sink {
        permission: Permission,
        requests: AtomicUsize,
        shown: Mutex<Vec<NotificationOptions>>,
    }

    impl Sink {
        fn new(permission: Permission) -> Self {
            Self {
                permission,
                requests: AtomicUsize::new(0),
                shown: Mutex::new(Vec::new()),
            }
        }
    }

    impl NotificationSink for Sink {
        fn request_permission(&self) -> Permission {
            self.requests.fetch_add(1, Ordering::SeqCst);
            self.permission
        }

        fn show(&self, _title: &str, _body: &str, options: &NotificationOptions) -> Result<(), AlertError> {
            self.shown.lock().unwrap().push(options.clone());
            Ok(())
        }
    }

    #[test]
    fn test_notification_permission_requested_once() {
        let channel = NotificationChannel::new(Sink::new(Permission::Granted));
        channel.deliver(&alert()).unwrap();
        channel.deliver(&alert()).unwrap();
        assert_eq!(channel.sink.requests.load(Ordering::SeqCst), 1);

        let shown = channel.sink.shown.lock().unwrap();
        assert_eq!(shown.len(), 2);
        assert_eq!(shown[0].tag, "location-alert-m1");
        assert!(shown[0].require_interaction);
    }

    #[test]
    fn test_notification_denied() {
        let channel = NotificationChannel::new(Sink::new(Permission::Denied));
        assert_eq!(
            channel.deliver(&alert()),
            Err(AlertError::Permission(Permission::Denied))
        );
        assert!(channel.sink.shown.lock().unwrap().is_empty());
    }

    #[derive(Default)]
    struct Popup {
        shown: AtomicUsize,
        dismissed: AtomicUsize,
    }

    impl PopupSink for Popup {
        fn show(&self, _alert: &Alert) {
            self.shown.fetch_add(1, Ordering::SeqCst);
        }

        fn dismiss(&self) {
            self.dismissed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_popup_auto_dismiss() {
        let channel = PopupChannel::new(Popup::default());
        channel.deliver(&alert()).unwrap();
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(channel.sink.dismissed.load(Ordering::SeqCst), 0);

        // A second popup pushes the dismissal out.
        channel.deliver(&alert()).unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(channel.sink.dismissed.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(channel.sink.dismissed.load(Ordering::SeqCst), 1);
        assert_eq!(channel.sink.shown.load(Ordering::SeqCst), 2);
    }

    struct NoVibrator;

    impl Vibrator for NoVibrator {
        fn is_available(&self) -> bool {
            false
        }

        fn vibrate(&self, _pattern_ms: &[u64]) -> Result<(), AlertError> {
            Err(AlertError::Unsupported("vibration"))
        }
    }

    struct BrokenSpeaker;

    impl TonePlayer for BrokenSpeaker {
        fn play_tone(&self, _frequency_hz: f32, _duration: Duration) -> Result<(), AlertError> {
            Err(AlertError::Delivery("no audio device".to_string()))
        }
    }

    #[test]
    fn test_missing_capabilities_are_not_failures() {
        assert!(HapticChannel::new(NoVibrator).deliver(&alert()).is_ok());
        assert!(AudioChannel::new(BrokenSpeaker).deliver(&alert()).is_ok());
    }
}
