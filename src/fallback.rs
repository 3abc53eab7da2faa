//! Fallback controller: mobile detection and transcription extraction.
//!
//! Inline decode/playback is unreliable on mobile user agents, so a decode or
//! playback failure there switches the viewer to download-only instead of
//! surfacing an error. Transcriptions need no audio and are always shown.

use once_cell::sync::Lazy;
use regex::Regex;

static MOBILE_UA: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)Android|webOS|iPhone|iPad|iPod|BlackBerry|IEMobile|Opera Mini")
        .expect("mobile user-agent pattern is valid")
});

static TRANSCRIPTION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"Nota de voz - Transcripción: (.+)").expect("transcription pattern is valid")
});

/// Whether `user_agent` names a mobile OS or browser.
pub fn should_fallback(user_agent: &str) -> bool {
    MOBILE_UA.is_match(user_agent)
}

/// Text following the voice-note transcription marker, up to the end of
/// that line. `None` when the marker is absent or nothing follows it.
pub fn extract_transcription(text: &str) -> Option<String> {
    TRANSCRIPTION
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim_end_matches('\r').to_string())
}

/// Platform classification used by the viewer. Substitutable in tests.
pub trait PlatformProfile: Send + Sync {
    fn is_mobile(&self) -> bool;
}

/// Classifies by user-agent string.
#[derive(Debug, Clone, Default)]
pub struct UserAgentProfile {
    user_agent: String,
}

impl UserAgentProfile {
    pub fn new(user_agent: impl Into<String>) -> Self {
        Self {
            user_agent: user_agent.into(),
        }
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }
}

impl PlatformProfile for UserAgentProfile {
    fn is_mobile(&self) -> bool {
        should_fallback(&self.user_agent)
    }
}

/// A platform with a fixed answer.
#[derive(Debug, Clone, Copy)]
pub struct FixedProfile(pub bool);

impl PlatformProfile for FixedProfile {
    fn is_mobile(&self) -> bool {
        self.0
    }
}
