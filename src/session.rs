//! Call session state machine
//!
//! A [`CallSession`] owns everything known about one call and decides what
//! happens next, but performs no I/O itself. Every user intent, server frame,
//! completion and timer arrives as an [`Input`]; the resulting side effects
//! are queued as [`Command`]s and drained by whoever drives the session.
//! Inputs are handled one at a time, so transitions never interleave.
//!
//! Turn-taking is strict: the AI speaks, then after a short delay the caller
//! is recorded for a bounded time and the recording is sent as a single
//! binary frame. Escalation to a human agent suppresses all further audio at
//! once, lets a single announcement finish, and only then hands off.

use crate::announce::Announcement;
use crate::config::ClientConfig;
use crate::error::{CallError, Result};
use crate::playback::{PlaybackOutcome, SuppressFlag};
use crate::presenter::Notification;
use crate::protocol::{
    AgentInfo, AnnouncementSource, ClientFrame, Escalation, Frame, ServerEvent, ServerMessage,
    TurnReport,
};
use crate::registration::{Caller, Registration};
use chrono::{DateTime, Local};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Lifecycle of one call, as seen by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Idle,
    Registered,
    Connecting,
    AiSpeaking,
    Listening,
    Recording,
    Escalating,
    Escalated,
    Ended,
    Error,
}

impl CallState {
    /// The channel is up (or coming up) and the call has not finished.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::AiSpeaking | Self::Listening | Self::Recording | Self::Escalating
        )
    }

    /// Turn-taking states plus the escalation hand-off.
    pub fn is_active(self) -> bool {
        matches!(self, Self::AiSpeaking | Self::Listening | Self::Recording | Self::Escalating)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Escalated | Self::Ended | Self::Error)
    }
}

/// Deferred wake-ups. The token ties a timer to the turn that scheduled it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timer {
    StartRecording(u64),
    AnnouncementDeadline(u64),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    /// User asked to start the call
    Start,
    /// User asked to end the call
    End { keep_escalation_ui: bool },
    /// User finished speaking before the recording limit
    StopRecording,
    TransportOpened,
    TransportClosed,
    TransportFailed(String),
    Frame(Frame),
    PlaybackFinished(PlaybackOutcome),
    /// Recording stopped; `None` when nothing was captured
    CaptureFinished(Option<Vec<u8>>),
    CaptureFailed(String),
    TimerFired(Timer),
    AnnouncementFinished,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    OpenTransport { url: String },
    SendText(ClientFrame),
    SendBinary(Vec<u8>),
    CloseTransport,
    Play(Vec<u8>),
    StopPlayback,
    Announce(Announcement),
    Schedule { after: Duration, timer: Timer },
    StartCapture { max: Duration },
    StopCapture,
    /// Drop the current recording and release the microphone
    AbortCapture,
    Notify(Notification),
}

/// Session-relevant slice of the client configuration.
#[derive(Debug, Clone)]
struct SessionSettings {
    voice_ws_url: String,
    max_recording: Duration,
    post_turn_delay: Duration,
    announcement_wait: Duration,
    escalation_notice: Option<String>,
    notice_lang: String,
}

impl From<&ClientConfig> for SessionSettings {
    fn from(config: &ClientConfig) -> Self {
        Self {
            voice_ws_url: config.voice_ws_url.clone(),
            max_recording: config.max_recording,
            post_turn_delay: config.post_turn_delay,
            announcement_wait: config.announcement_wait,
            escalation_notice: config.escalation_notice.clone(),
            notice_lang: config.notice_lang.clone(),
        }
    }
}

#[derive(Debug)]
struct PendingEscalation {
    agent: AgentInfo,
    summary: Option<String>,
    awaiting_stream: bool,
    announcing: bool,
    token: u64,
}

pub struct CallSession {
    settings: SessionSettings,
    state: CallState,
    caller: Option<Caller>,
    registration: Option<Registration>,
    clarification_count: u32,
    suppress: SuppressFlag,
    last_decision: Option<String>,
    last_confidence: Option<f64>,
    agent: Option<AgentInfo>,

    transport_open: bool,
    playing: bool,
    /// Segments that arrived while another was playing, in arrival order
    queued_segments: VecDeque<Vec<u8>>,
    capture_active: bool,
    next_token: u64,
    pending_record: Option<u64>,
    escalation: Option<PendingEscalation>,
    torn_down: bool,

    /// Outbound command queue (drained after each input)
    outbound: Vec<Command>,
}

impl CallSession {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            settings: SessionSettings::from(config),
            state: CallState::Idle,
            caller: None,
            registration: None,
            clarification_count: 0,
            suppress: SuppressFlag::default(),
            last_decision: None,
            last_confidence: None,
            agent: None,
            transport_open: false,
            playing: false,
            queued_segments: VecDeque::new(),
            capture_active: false,
            next_token: 0,
            pending_record: None,
            escalation: None,
            torn_down: false,
            outbound: Vec::new(),
        }
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn is_live(&self) -> bool {
        self.state.is_live()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.registration.as_ref().map(|r| r.session_id.as_str())
    }

    pub fn clarification_count(&self) -> u32 {
        self.clarification_count
    }

    pub fn last_decision(&self) -> Option<&str> {
        self.last_decision.as_deref()
    }

    pub fn last_confidence(&self) -> Option<f64> {
        self.last_confidence
    }

    pub fn agent(&self) -> Option<&AgentInfo> {
        self.agent.as_ref()
    }

    pub fn is_audio_suppressed(&self) -> bool {
        self.suppress.is_set()
    }

    /// Handle to the cancellation flag, for the audio components.
    pub fn suppress_flag(&self) -> SuppressFlag {
        self.suppress.clone()
    }

    /// Drain all pending outbound commands
    pub fn drain_commands(&mut self) -> Vec<Command> {
        std::mem::take(&mut self.outbound)
    }

    /// Store the identifiers the backend issued for `caller`.
    pub fn registered(&mut self, caller: Caller, registration: Registration) -> Result<()> {
        if self.state.is_live() {
            return Err(CallError::Precondition("end the current call before registering again"));
        }

        info!(
            "📇 Registered {} (session {}, client {})",
            caller.name(),
            registration.session_id,
            registration.client_id
        );
        self.caller = Some(caller);
        self.registration = Some(registration);
        self.agent = None;
        self.transition(CallState::Registered);
        self.status("Click Start Call to begin the call");
        Ok(())
    }

    /// Process one input. Only `Start` can fail; everything else is absorbed
    /// into state and commands.
    pub fn handle(&mut self, input: Input) -> Result<()> {
        match input {
            Input::Start => return self.start_call(),
            Input::End { keep_escalation_ui } => self.end_call(keep_escalation_ui),
            Input::StopRecording => self.stop_recording(),
            Input::TransportOpened => self.on_transport_opened(),
            Input::TransportClosed => self.on_transport_closed(),
            Input::TransportFailed(reason) => self.on_transport_failed(reason),
            Input::Frame(frame) => self.on_server_frame(frame),
            Input::PlaybackFinished(outcome) => self.on_playback_finished(outcome),
            Input::CaptureFinished(chunk) => self.on_capture_finished(chunk),
            Input::CaptureFailed(reason) => self.on_capture_failed(reason),
            Input::TimerFired(timer) => self.on_timer(timer),
            Input::AnnouncementFinished => self.on_announcement_finished(),
        }
        Ok(())
    }

    pub fn start_call(&mut self) -> Result<()> {
        if self.registration.is_none() {
            self.notify(Notification::Error("Please register before starting a call".to_string()));
            return Err(CallError::Precondition("no session id; register first"));
        }
        if self.state.is_live() {
            return Err(CallError::Precondition("a call is already in progress"));
        }
        if self.state != CallState::Registered {
            self.notify(Notification::Error("Please register again to start a new call".to_string()));
            return Err(CallError::Precondition("a new call requires a fresh registration"));
        }

        self.suppress.clear();
        self.clarification_count = 0;
        self.last_decision = None;
        self.last_confidence = None;
        self.agent = None;
        self.transport_open = false;
        self.playing = false;
        self.queued_segments.clear();
        self.capture_active = false;
        self.pending_record = None;
        self.escalation = None;
        self.torn_down = false;

        self.transition(CallState::Connecting);
        self.outbound.push(Command::OpenTransport {
            url: self.settings.voice_ws_url.clone(),
        });
        Ok(())
    }

    /// End the call if one is in progress. Calling it again is a no-op.
    pub fn end_call(&mut self, keep_escalation_ui: bool) {
        if !self.state.is_live() {
            debug!("end_call ignored in state {:?}", self.state);
            return;
        }
        info!("📴 Ending call");
        let was_connecting = self.state == CallState::Connecting;
        self.finish(CallState::Ended, keep_escalation_ui);
        if was_connecting {
            self.outbound.push(Command::CloseTransport);
        }
        self.status("Call ended");
    }

    /// Dispatch one frame from the realtime channel.
    pub fn on_server_frame(&mut self, frame: Frame) {
        match frame {
            Frame::Text(text) => match ServerMessage::parse(&text) {
                Ok(message) => self.on_server_message(message),
                Err(e) => warn!("Ignoring malformed control frame: {} ({})", e, text),
            },
            Frame::Binary(audio) => self.on_audio(audio),
        }
    }

    fn on_server_message(&mut self, message: ServerMessage) {
        if let (Some(call_id), Some(registration)) = (message.call_id, self.registration.as_mut()) {
            if registration.session_id != call_id {
                debug!("Session id updated by server: {} -> {}", registration.session_id, call_id);
                registration.session_id = call_id;
            }
        }

        // Once escalation starts the turn loop is over.
        if !self.state.is_active() || self.state == CallState::Escalating {
            debug!("Ignoring {:?} in state {:?}", message.event, self.state);
            return;
        }

        match message.event {
            ServerEvent::Escalate(escalation) => self.begin_escalation(escalation),
            ServerEvent::AiSpeaking => self.on_ai_speaking(),
            ServerEvent::AiDone(report) => self.on_ai_done(report),
            ServerEvent::Other => {}
        }
    }

    fn on_ai_speaking(&mut self) {
        info!("🗣️ AI is speaking, stopping any recording");
        self.cancel_recording();
        self.transition(CallState::AiSpeaking);
        self.status("AI speaking...");
    }

    fn on_ai_done(&mut self, report: TurnReport) {
        if report.decision.is_some() {
            self.last_decision = report.decision.clone();
        }
        if report.confidence.is_some() {
            self.last_confidence = report.confidence;
        }
        if let Some(count) = report.clarification_count {
            self.clarification_count = self.clarification_count.max(count);
        }
        self.notify(Notification::Decision {
            decision: self.last_decision.clone(),
            confidence: self.last_confidence,
            clarification_count: self.clarification_count,
        });

        if report.is_goodbye() {
            info!("👋 Caller said goodbye");
            self.status("Call ended by user.");
            self.notify(Notification::Summary(report.summary));
            self.finish(CallState::Ended, false);
            return;
        }

        if self.playing || !self.queued_segments.is_empty() {
            // The end of playback schedules the next recording.
            return;
        }
        match self.state {
            CallState::AiSpeaking | CallState::Listening => {
                self.transition(CallState::Listening);
                self.schedule_recording();
            }
            _ => {}
        }
    }

    fn on_audio(&mut self, audio: Vec<u8>) {
        if let Some(escalation) = self.escalation.as_mut() {
            if escalation.awaiting_stream && !audio.is_empty() {
                info!("📢 Escalation announcement received ({} bytes)", audio.len());
                escalation.awaiting_stream = false;
                escalation.announcing = true;
                self.outbound.push(Command::Announce(Announcement::Audio(audio)));
            }
            return;
        }

        if self.suppress.is_set() || !self.state.is_active() {
            debug!("Dropping {} bytes of audio in state {:?}", audio.len(), self.state);
            return;
        }
        if audio.is_empty() {
            return;
        }

        self.cancel_recording();
        if self.state != CallState::AiSpeaking {
            self.transition(CallState::AiSpeaking);
        }

        if self.playing {
            debug!("Queueing {} bytes behind the current segment", audio.len());
            self.queued_segments.push_back(audio);
        } else {
            self.playing = true;
            self.status("AI speaking...");
            self.outbound.push(Command::Play(audio));
        }
    }

    fn on_playback_finished(&mut self, outcome: PlaybackOutcome) {
        if !self.playing {
            debug!("Stale playback completion ({:?})", outcome);
            return;
        }
        self.playing = false;

        if outcome == PlaybackOutcome::Interrupted || self.suppress.is_set() || !self.state.is_active() {
            debug!("Playback interrupted, not continuing the turn");
            return;
        }

        if let Some(next) = self.queued_segments.pop_front() {
            self.playing = true;
            self.outbound.push(Command::Play(next));
            return;
        }

        if self.state == CallState::AiSpeaking {
            self.transition(CallState::Listening);
            self.status("Listening...");
            self.schedule_recording();
        }
    }

    fn schedule_recording(&mut self) {
        if self.suppress.is_set() || self.capture_active || self.pending_record.is_some() {
            return;
        }
        let token = self.take_token();
        self.pending_record = Some(token);
        self.outbound.push(Command::Schedule {
            after: self.settings.post_turn_delay,
            timer: Timer::StartRecording(token),
        });
    }

    fn on_timer(&mut self, timer: Timer) {
        match timer {
            Timer::StartRecording(token) => {
                if self.pending_record != Some(token) {
                    debug!("Stale recording timer {}", token);
                    return;
                }
                self.pending_record = None;

                if self.suppress.is_set()
                    || self.state != CallState::Listening
                    || !self.transport_open
                    || self.playing
                    || self.capture_active
                {
                    debug!("Not recording in state {:?}", self.state);
                    return;
                }

                info!("🎤 Recording caller (max {:?})", self.settings.max_recording);
                self.capture_active = true;
                self.transition(CallState::Recording);
                self.status("Recording...");
                self.outbound.push(Command::StartCapture {
                    max: self.settings.max_recording,
                });
            }
            Timer::AnnouncementDeadline(token) => {
                let expired = self
                    .escalation
                    .as_ref()
                    .is_some_and(|e| e.token == token && e.awaiting_stream);
                if expired && self.state == CallState::Escalating {
                    warn!("⏱️ Escalation announcement never arrived, handing off without it");
                    self.complete_escalation();
                }
            }
        }
    }

    fn stop_recording(&mut self) {
        if self.state == CallState::Recording && self.capture_active {
            debug!("Caller finished speaking, stopping capture");
            self.outbound.push(Command::StopCapture);
        }
    }

    fn on_capture_finished(&mut self, chunk: Option<Vec<u8>>) {
        if !self.capture_active {
            debug!("Stale capture result");
            return;
        }
        self.capture_active = false;

        let was_recording = self.state == CallState::Recording;
        if was_recording {
            self.transition(CallState::Listening);
        }

        match chunk {
            Some(chunk)
                if !chunk.is_empty()
                    && was_recording
                    && self.transport_open
                    && !self.suppress.is_set() =>
            {
                info!("📤 Sending {} KB of caller audio", chunk.len() / 1024);
                self.status("Processing...");
                self.outbound.push(Command::SendBinary(chunk));
            }
            Some(_) => debug!("Discarding recording captured outside an active turn"),
            None => debug!("Nothing captured this turn"),
        }
    }

    fn on_capture_failed(&mut self, reason: String) {
        if !self.capture_active {
            return;
        }
        self.capture_active = false;
        if self.state == CallState::Recording {
            self.transition(CallState::Listening);
        }
        warn!("🎤 Microphone unavailable: {}", reason);
        self.notify(Notification::Error(format!("Error accessing microphone: {}", reason)));
        self.status("Error accessing microphone");
    }

    fn on_transport_opened(&mut self) {
        if self.state != CallState::Connecting {
            warn!("Transport opened in state {:?}, closing it", self.state);
            self.outbound.push(Command::CloseTransport);
            return;
        }
        self.transport_open = true;
        self.transition(CallState::Listening);
        self.status("Connected, waiting for AI...");

        if let (Some(caller), Some(registration)) = (&self.caller, &self.registration) {
            self.outbound.push(Command::SendText(ClientFrame::RegisterClient {
                client_id: registration.client_id.clone(),
                user_name: caller.name().to_string(),
                phone_number: caller.phone().to_string(),
            }));
        }
    }

    fn on_transport_closed(&mut self) {
        self.transport_open = false;
        match self.state {
            CallState::Escalating => {
                info!("Channel closed during escalation");
                self.channel_lost_while_escalating();
            }
            state if state.is_live() => {
                info!("🔌 Channel closed by server");
                self.finish(CallState::Ended, false);
                self.status("Call ended");
            }
            _ => {}
        }
    }

    fn on_transport_failed(&mut self, reason: String) {
        self.transport_open = false;
        match self.state {
            CallState::Escalating => {
                warn!("Channel error during escalation: {}", reason);
                self.channel_lost_while_escalating();
            }
            state if state.is_live() => {
                warn!("🔌 Channel error: {}", reason);
                self.notify(Notification::Error(format!("Connection error: {}", reason)));
                self.finish(CallState::Error, false);
                self.status("Connection error");
            }
            _ => debug!("Channel error after the call: {}", reason),
        }
    }

    /// A streamed announcement can no longer arrive; one already playing is
    /// allowed to finish.
    fn channel_lost_while_escalating(&mut self) {
        let announcing = self.escalation.as_ref().is_some_and(|e| e.announcing);
        if !announcing {
            self.complete_escalation();
        }
    }

    fn begin_escalation(&mut self, escalation: Escalation) {
        info!("🙋 Escalating to {}", escalation.agent.display_name());

        // Nothing else may be captured or played from here on.
        self.suppress.set();
        self.pending_record = None;
        self.queued_segments.clear();
        if self.capture_active {
            self.capture_active = false;
            self.outbound.push(Command::AbortCapture);
        }
        if self.playing {
            self.playing = false;
            self.outbound.push(Command::StopPlayback);
        }

        self.agent = Some(escalation.agent.clone());
        let token = self.take_token();
        let mut pending = PendingEscalation {
            agent: escalation.agent,
            summary: escalation.summary,
            awaiting_stream: false,
            announcing: false,
            token,
        };

        self.transition(CallState::Escalating);
        self.status("Transferring you to a human agent...");

        match escalation.source {
            AnnouncementSource::Inline(audio) => {
                pending.announcing = true;
                self.outbound.push(Command::Announce(Announcement::Audio(audio)));
            }
            AnnouncementSource::Streamed => {
                pending.awaiting_stream = true;
                self.outbound.push(Command::Schedule {
                    after: self.settings.announcement_wait,
                    timer: Timer::AnnouncementDeadline(token),
                });
            }
            AnnouncementSource::None => match self.settings.escalation_notice.clone() {
                Some(text) => {
                    pending.announcing = true;
                    self.outbound.push(Command::Announce(Announcement::Speech {
                        text,
                        lang: self.settings.notice_lang.clone(),
                    }));
                }
                None => {
                    self.escalation = Some(pending);
                    self.complete_escalation();
                    return;
                }
            },
        }

        self.escalation = Some(pending);
    }

    fn on_announcement_finished(&mut self) {
        let announcing = self.escalation.as_ref().is_some_and(|e| e.announcing);
        if self.state == CallState::Escalating && announcing {
            self.complete_escalation();
        } else {
            debug!("Stale announcement completion in state {:?}", self.state);
        }
    }

    fn complete_escalation(&mut self) {
        let Some(pending) = self.escalation.take() else {
            return;
        };
        info!("✅ Call handed off to {}", pending.agent.display_name());

        self.transition(CallState::Escalated);
        self.status("Transfert vers un agent humain...");
        self.notify(Notification::Escalated {
            agent: pending.agent,
            session_id: self.session_id().map(str::to_string),
            summary: pending.summary,
        });
        self.teardown();
        self.notify(Notification::CallEnded { keep_escalation_ui: true });
    }

    fn finish(&mut self, terminal: CallState, keep_escalation_ui: bool) {
        self.escalation = None;
        self.transition(terminal);
        self.teardown();
        self.notify(Notification::CallEnded { keep_escalation_ui });
    }

    /// Release every resource the call holds. Runs at most once per call.
    fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;

        self.suppress.set();
        self.pending_record = None;
        self.queued_segments.clear();
        if self.playing {
            self.playing = false;
            self.outbound.push(Command::StopPlayback);
        }
        self.capture_active = false;
        self.outbound.push(Command::AbortCapture);

        if self.transport_open {
            self.outbound.push(Command::SendText(ClientFrame::EndCall));
            self.outbound.push(Command::CloseTransport);
            self.transport_open = false;
        }
    }

    fn cancel_recording(&mut self) {
        self.pending_record = None;
        if self.capture_active {
            self.capture_active = false;
            self.outbound.push(Command::AbortCapture);
        }
    }

    fn take_token(&mut self) -> u64 {
        self.next_token += 1;
        self.next_token
    }

    fn transition(&mut self, to: CallState) {
        if self.state == to {
            return;
        }
        info!("🔄 Call state transition: {:?} -> {:?}", self.state, to);
        self.state = to;
        self.notify(Notification::State(to));
    }

    fn status(&mut self, text: &str) {
        self.notify(Notification::Status(text.to_string()));
    }

    fn notify(&mut self, notification: Notification) {
        self.outbound.push(Command::Notify(notification));
    }

    /// Plain-text hand-off report for an escalated call.
    pub fn escalation_report(&self, generated_at: DateTime<Local>) -> Option<String> {
        let registration = self.registration.as_ref()?;
        let agent = self.agent.as_ref()?;
        let (name, phone) = self
            .caller
            .as_ref()
            .map(|c| (c.name(), c.phone()))
            .unwrap_or(("", ""));

        Some(format!(
            "RAPPORT D'APPEL\n\nCall ID: {}\nClient: {}\nPhone: {}\nClient ID: {}\nAgent: {}\nStatus: Escaladé\nClarifications: {}\nTime: {}\n",
            registration.session_id,
            name,
            phone,
            registration.client_id,
            agent.display_name(),
            self.clarification_count,
            generated_at.format("%d/%m/%Y %H:%M:%S"),
        ))
    }
}
