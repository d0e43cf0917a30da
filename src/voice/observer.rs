//! Fire-and-forget notifications for UI and the owning agent

use super::SpeechReport;

/// Receives lifecycle notifications from the speech front-end
///
/// All methods default to no-ops. Implementations must return quickly: they
/// are called inline from the pipeline and never awaited.
pub trait SpeechObserver: Send + Sync {
    /// Microphone opened for a user turn
    fn on_listening_started(&self) {}

    /// Microphone closed for a user turn
    fn on_listening_ended(&self) {}

    /// Command listener started polling during playback
    fn on_command_listening_started(&self) {}

    /// Command listener stopped polling
    fn on_command_listening_ended(&self) {}

    /// Responder produced a reply
    fn on_thinking_ended(&self) {}

    /// A synthesis call began (cache hits included)
    fn on_speech_started(&self) {}

    /// A synthesis call ended, paired with `on_speech_started`
    fn on_speech_ended(&self) {}

    /// A `speak` call finished; invoked exactly once per call
    fn on_speech_finished(&self, _report: &SpeechReport) {}
}

/// Observer that ignores every notification
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl SpeechObserver for NoopObserver {}

/// Observer that logs every notification via `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingObserver;

impl SpeechObserver for LoggingObserver {
    fn on_listening_started(&self) {
        tracing::info!("listening");
    }

    fn on_listening_ended(&self) {
        tracing::debug!("listening ended");
    }

    fn on_command_listening_started(&self) {
        tracing::debug!("command listening started");
    }

    fn on_command_listening_ended(&self) {
        tracing::debug!("command listening ended");
    }

    fn on_thinking_ended(&self) {
        tracing::debug!("thinking ended");
    }

    fn on_speech_started(&self) {
        tracing::trace!("speech started");
    }

    fn on_speech_ended(&self) {
        tracing::trace!("speech ended");
    }

    fn on_speech_finished(&self, report: &SpeechReport) {
        tracing::info!(
            status = ?report.status,
            segments = report.segments,
            played = report.played.len(),
            dropped = report.dropped.len(),
            "speech finished"
        );
    }
}
