//! Call controller
//!
//! Drives a [`CallSession`]: executes the commands it emits against the real
//! transport and audio components, and feeds every completion, timer and
//! inbound frame back to it as an [`Input`]. Inputs are processed strictly
//! one at a time.

use crate::announce::Announcer;
use crate::capture::{AudioCapture, CaptureOutcome, Microphone};
use crate::config::ClientConfig;
use crate::error::{CallError, Result};
use crate::playback::{AudioPlayback, PlaybackOutcome, Speaker};
use crate::presenter::{Notification, Presenter};
use crate::registration::{Caller, Registrar, Registration};
use crate::session::{CallSession, Command, Input};
use crate::transport::{Transport, TransportEvent};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Everything a call needs from the outside world.
pub struct CallParts {
    pub transport: Box<dyn Transport>,
    pub registrar: Arc<dyn Registrar>,
    pub microphone: Arc<dyn Microphone>,
    pub speaker: Arc<dyn Speaker>,
    pub announcer: Arc<dyn Announcer>,
    pub presenter: Box<dyn Presenter>,
}

/// Cloneable handle for requesting actions from other tasks.
#[derive(Clone)]
pub struct CallHandle {
    tx: UnboundedSender<Input>,
}

impl CallHandle {
    pub fn end_call(&self, keep_escalation_ui: bool) {
        let _ = self.tx.send(Input::End { keep_escalation_ui });
    }

    pub fn stop_recording(&self) {
        let _ = self.tx.send(Input::StopRecording);
    }
}

enum Next {
    Transport(Option<TransportEvent>),
    Input(Input),
}

pub struct CallController {
    session: CallSession,
    transport: Box<dyn Transport>,
    transport_rx: Option<UnboundedReceiver<TransportEvent>>,
    registrar: Arc<dyn Registrar>,
    capture: AudioCapture,
    playback: AudioPlayback,
    announcer: Arc<dyn Announcer>,
    announcement: Option<JoinHandle<()>>,
    timers: Vec<JoinHandle<()>>,
    presenter: Box<dyn Presenter>,

    /// Completions from spawned work
    events_tx: UnboundedSender<Input>,
    events_rx: UnboundedReceiver<Input>,
    /// Inputs raised while executing commands, handled before anything else
    pending: VecDeque<Input>,
}

impl CallController {
    pub fn new(config: &ClientConfig, parts: CallParts) -> Self {
        let session = CallSession::new(config);
        let playback = AudioPlayback::new(parts.speaker, session.suppress_flag());
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        Self {
            session,
            transport: parts.transport,
            transport_rx: None,
            registrar: parts.registrar,
            capture: AudioCapture::new(parts.microphone),
            playback,
            announcer: parts.announcer,
            announcement: None,
            timers: Vec::new(),
            presenter: parts.presenter,
            events_tx,
            events_rx,
            pending: VecDeque::new(),
        }
    }

    pub fn session(&self) -> &CallSession {
        &self.session
    }

    pub fn handle(&self) -> CallHandle {
        CallHandle {
            tx: self.events_tx.clone(),
        }
    }

    /// Validate the caller and open a session with the backend. A call in
    /// progress is ended first. On failure the state is left as it was.
    pub async fn register(&mut self, name: &str, phone: &str) -> Result<Registration> {
        let caller = match Caller::new(name, phone) {
            Ok(caller) => caller,
            Err(e) => {
                self.presenter.render(&Notification::Error(e.to_string()));
                return Err(e.into());
            }
        };

        if self.session.is_live() {
            info!("Registering again, ending the current call first");
            self.end_call(false).await;
        }

        let registration = match self.registrar.start_call(&caller).await {
            Ok(registration) => registration,
            Err(e) => {
                error!("❌ Registration failed: {}", e);
                self.presenter
                    .render(&Notification::Error(format!("Registration failed: {}", e)));
                return Err(e);
            }
        };

        self.session.registered(caller, registration.clone())?;
        self.pump().await;
        Ok(registration)
    }

    pub async fn start_call(&mut self) -> Result<()> {
        self.dispatch(Input::Start).await
    }

    pub async fn end_call(&mut self, keep_escalation_ui: bool) {
        let _ = self.dispatch(Input::End { keep_escalation_ui }).await;
    }

    pub async fn stop_recording(&mut self) {
        let _ = self.dispatch(Input::StopRecording).await;
    }

    /// Hand one input to the session and carry out everything it asks for.
    pub async fn dispatch(&mut self, input: Input) -> Result<()> {
        let result = self.session.handle(input);
        self.pump().await;
        result
    }

    /// Wait for the next event and process it.
    pub async fn step(&mut self) {
        let next = tokio::select! {
            event = next_transport_event(&mut self.transport_rx) => Next::Transport(event),
            Some(input) = self.events_rx.recv() => Next::Input(input),
        };

        let input = match next {
            Next::Input(input) => input,
            Next::Transport(Some(TransportEvent::Message(frame))) => Input::Frame(frame),
            Next::Transport(event) => {
                self.transport_rx = None;
                if self.transport.is_open() {
                    if let Err(e) = self.transport.close().await {
                        debug!("Closing a dead channel: {}", e);
                    }
                }
                match event {
                    Some(TransportEvent::Error(reason)) => Input::TransportFailed(reason),
                    Some(TransportEvent::Closed(reason)) => {
                        info!("Voice channel closed ({})", reason.as_deref().unwrap_or("no reason"));
                        Input::TransportClosed
                    }
                    _ => Input::TransportClosed,
                }
            }
        };

        if let Err(e) = self.dispatch(input).await {
            warn!("Input rejected: {}", e);
        }
    }

    /// Process events until the call is over.
    pub async fn run_until_finished(&mut self) {
        while self.session.is_live() {
            self.step().await;
        }
        info!("📴 Call finished in state {:?}", self.session.state());
    }

    async fn pump(&mut self) {
        loop {
            let commands = self.session.drain_commands();
            if commands.is_empty() {
                match self.pending.pop_front() {
                    Some(input) => {
                        if let Err(e) = self.session.handle(input) {
                            warn!("Input rejected: {}", e);
                        }
                        continue;
                    }
                    None => break,
                }
            }
            for command in commands {
                self.execute(command).await;
            }
        }

        if self.session.state().is_terminal() {
            self.release();
        }
    }

    /// Cancel leftover background work once the call is over.
    fn release(&mut self) {
        for timer in self.timers.drain(..) {
            timer.abort();
        }
        if let Some(announcement) = self.announcement.take() {
            if !announcement.is_finished() {
                debug!("Cancelling announcement");
            }
            announcement.abort();
        }
        self.capture.abort();
        self.playback.stop();
    }

    async fn execute(&mut self, command: Command) {
        match command {
            Command::OpenTransport { url } => match self.transport.open(&url).await {
                Ok(rx) => {
                    self.transport_rx = Some(rx);
                    self.pending.push_back(Input::TransportOpened);
                }
                Err(e) => {
                    error!("❌ Failed to connect to {}: {}", url, e);
                    self.pending.push_back(Input::TransportFailed(e.to_string()));
                }
            },
            Command::SendText(frame) => {
                let result = match frame.to_json() {
                    Ok(json) => self.transport.send_text(json).await,
                    Err(e) => Err(e.into()),
                };
                self.on_send_result(result).await;
            }
            Command::SendBinary(data) => {
                let result = self.transport.send_binary(data).await;
                self.on_send_result(result).await;
            }
            Command::CloseTransport => {
                self.transport_rx = None;
                if let Err(e) = self.transport.close().await {
                    warn!("Error closing voice channel: {}", e);
                }
            }
            Command::Play(audio) => {
                let tx = self.events_tx.clone();
                let started = self.playback.play(audio, move |outcome| {
                    let _ = tx.send(Input::PlaybackFinished(outcome));
                });
                if !started {
                    // The skipped segment counts as played so the turn moves on.
                    warn!("Playback still busy, segment dropped");
                    self.pending
                        .push_back(Input::PlaybackFinished(PlaybackOutcome::Completed));
                }
            }
            Command::StopPlayback => self.playback.stop(),
            Command::Announce(announcement) => {
                let announcer = self.announcer.clone();
                let tx = self.events_tx.clone();
                self.announcement = Some(tokio::spawn(async move {
                    if let Err(e) = announcer.announce(announcement).await {
                        warn!("Announcement failed: {}", e);
                    }
                    let _ = tx.send(Input::AnnouncementFinished);
                }));
            }
            Command::Schedule { after, timer } => {
                self.timers.retain(|t| !t.is_finished());
                let tx = self.events_tx.clone();
                self.timers.push(tokio::spawn(async move {
                    tokio::time::sleep(after).await;
                    let _ = tx.send(Input::TimerFired(timer));
                }));
            }
            Command::StartCapture { max } => {
                let tx = self.events_tx.clone();
                let started = self.capture.start(max, move |outcome| {
                    let input = match outcome {
                        CaptureOutcome::Captured(chunk) => Input::CaptureFinished(chunk),
                        CaptureOutcome::Failed(e) => Input::CaptureFailed(e.to_string()),
                    };
                    let _ = tx.send(input);
                });
                if !started {
                    warn!("Capture already running");
                }
            }
            Command::StopCapture => self.capture.stop(),
            Command::AbortCapture => self.capture.abort(),
            Command::Notify(notification) => self.presenter.render(&notification),
        }
    }

    /// A failed send means the channel is gone: drop it and tell the session.
    async fn on_send_result(&mut self, result: Result<()>) {
        let input = match result {
            Ok(()) => return,
            Err(CallError::TransportClosed) => {
                warn!("Voice channel closed while sending");
                Input::TransportClosed
            }
            Err(e) => {
                error!("Send failed: {}", e);
                Input::TransportFailed(e.to_string())
            }
        };
        self.transport_rx = None;
        if self.transport.is_open() {
            if let Err(e) = self.transport.close().await {
                debug!("Closing a broken channel: {}", e);
            }
        }
        self.pending.push_back(input);
    }
}

async fn next_transport_event(
    rx: &mut Option<UnboundedReceiver<TransportEvent>>,
) -> Option<TransportEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
