//! End-to-end call scenarios against in-memory transport, microphone and
//! speaker. Time is paused, so recording limits and delays run instantly.

use async_trait::async_trait;
use callbot::announce::{Announcement, Announcer};
use callbot::capture::{MicStream, Microphone};
use callbot::error::{CallError, ValidationError};
use callbot::playback::Speaker;
use callbot::presenter::{Notification, Presenter};
use callbot::protocol::Frame;
use callbot::registration::{Caller, Registrar, Registration};
use callbot::transport::{Transport, TransportEvent};
use callbot::{CallController, CallParts, CallState, ClientConfig, Result};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Default)]
struct Wire {
    texts: Vec<Value>,
    binaries: Vec<(Instant, Vec<u8>)>,
    server: Option<UnboundedSender<TransportEvent>>,
    opened: usize,
    closed: usize,
    /// Uploads fail as if the socket broke mid-write
    fail_binary: bool,
}

struct FakeTransport {
    wire: Arc<Mutex<Wire>>,
    open: bool,
}

#[async_trait]
impl Transport for FakeTransport {
    async fn open(&mut self, _url: &str) -> Result<UnboundedReceiver<TransportEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut wire = self.wire.lock().unwrap();
        wire.server = Some(tx);
        wire.opened += 1;
        self.open = true;
        Ok(rx)
    }

    async fn send_text(&mut self, text: String) -> Result<()> {
        if !self.open {
            return Err(CallError::TransportClosed);
        }
        self.wire.lock().unwrap().texts.push(serde_json::from_str(&text)?);
        Ok(())
    }

    async fn send_binary(&mut self, data: Vec<u8>) -> Result<()> {
        if !self.open {
            return Err(CallError::TransportClosed);
        }
        let mut wire = self.wire.lock().unwrap();
        if wire.fail_binary {
            return Err(CallError::Transport("broken pipe".to_string()));
        }
        wire.binaries.push((Instant::now(), data));
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if self.open {
            self.open = false;
            self.wire.lock().unwrap().closed += 1;
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

#[derive(Default)]
struct MicStats {
    opened: AtomicUsize,
    released: AtomicUsize,
}

/// Delivers 20 ms blocks; `silent` sources end immediately.
struct FakeMic {
    stats: Arc<MicStats>,
    silent: bool,
}

struct FakeMicStream {
    stats: Arc<MicStats>,
    silent: bool,
}

#[async_trait]
impl Microphone for FakeMic {
    async fn open(&self) -> Result<Box<dyn MicStream>> {
        self.stats.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeMicStream {
            stats: self.stats.clone(),
            silent: self.silent,
        }))
    }
}

#[async_trait]
impl MicStream for FakeMicStream {
    async fn read(&mut self) -> Option<Vec<i16>> {
        if self.silent {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        Some(vec![500; 320])
    }
}

impl Drop for FakeMicStream {
    fn drop(&mut self) {
        self.stats.released.fetch_add(1, Ordering::SeqCst);
    }
}

/// Every segment takes one second to play.
#[derive(Default)]
struct FakeSpeaker {
    played: Mutex<Vec<Vec<u8>>>,
}

#[async_trait]
impl Speaker for FakeSpeaker {
    async fn play(&self, audio: Vec<u8>) -> Result<()> {
        self.played.lock().unwrap().push(audio);
        tokio::time::sleep(Duration::from_secs(1)).await;
        Ok(())
    }
}

/// Holds each announcement until released.
#[derive(Default)]
struct GatedAnnouncer {
    heard: Mutex<Vec<Announcement>>,
    gate: Notify,
}

#[async_trait]
impl Announcer for GatedAnnouncer {
    async fn announce(&self, announcement: Announcement) -> Result<()> {
        self.heard.lock().unwrap().push(announcement);
        self.gate.notified().await;
        Ok(())
    }
}

#[derive(Default)]
struct FakeRegistrar {
    calls: AtomicUsize,
    fail: bool,
}

#[async_trait]
impl Registrar for FakeRegistrar {
    async fn start_call(&self, _caller: &Caller) -> Result<Registration> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(CallError::BackendUnavailable("connection refused".to_string()));
        }
        Ok(Registration {
            session_id: "call-42".to_string(),
            client_id: "client-7".to_string(),
        })
    }
}

struct RecordingPresenter(Arc<Mutex<Vec<Notification>>>);

impl Presenter for RecordingPresenter {
    fn render(&mut self, notification: &Notification) {
        self.0.lock().unwrap().push(notification.clone());
    }
}

struct Harness {
    controller: CallController,
    wire: Arc<Mutex<Wire>>,
    mic: Arc<MicStats>,
    speaker: Arc<FakeSpeaker>,
    announcer: Arc<GatedAnnouncer>,
    registrar: Arc<FakeRegistrar>,
    seen: Arc<Mutex<Vec<Notification>>>,
}

impl Harness {
    fn new() -> Self {
        Self::with(false, false)
    }

    fn with(silent_mic: bool, failing_registrar: bool) -> Self {
        let wire = Arc::new(Mutex::new(Wire::default()));
        let mic = Arc::new(MicStats::default());
        let speaker = Arc::new(FakeSpeaker::default());
        let announcer = Arc::new(GatedAnnouncer::default());
        let registrar = Arc::new(FakeRegistrar {
            calls: AtomicUsize::new(0),
            fail: failing_registrar,
        });
        let seen = Arc::new(Mutex::new(Vec::new()));

        let parts = CallParts {
            transport: Box::new(FakeTransport {
                wire: wire.clone(),
                open: false,
            }),
            registrar: registrar.clone(),
            microphone: Arc::new(FakeMic {
                stats: mic.clone(),
                silent: silent_mic,
            }),
            speaker: speaker.clone(),
            announcer: announcer.clone(),
            presenter: Box::new(RecordingPresenter(seen.clone())),
        };

        Self {
            controller: CallController::new(&ClientConfig::default(), parts),
            wire,
            mic,
            speaker,
            announcer,
            registrar,
            seen,
        }
    }

    async fn connect(&mut self) {
        self.controller.register("Amina", "+212 612345678").await.unwrap();
        self.controller.start_call().await.unwrap();
        assert_eq!(self.state(), CallState::Listening);
    }

    fn state(&self) -> CallState {
        self.controller.session().state()
    }

    fn server_sends(&self, frame: Frame) {
        let wire = self.wire.lock().unwrap();
        wire.server
            .as_ref()
            .expect("channel not open")
            .send(TransportEvent::Message(frame))
            .unwrap();
    }

    fn server_json(&self, value: Value) {
        self.server_sends(Frame::Text(value.to_string()));
    }

    fn server_closes(&self) {
        let wire = self.wire.lock().unwrap();
        wire.server
            .as_ref()
            .expect("channel not open")
            .send(TransportEvent::Closed(None))
            .unwrap();
    }

    fn server_fails(&self, reason: &str) {
        let wire = self.wire.lock().unwrap();
        wire.server
            .as_ref()
            .expect("channel not open")
            .send(TransportEvent::Error(reason.to_string()))
            .unwrap();
    }

    async fn step_until_state(&mut self, state: CallState) {
        let controller = &mut self.controller;
        tokio::time::timeout(Duration::from_secs(60), async {
            while controller.session().state() != state {
                controller.step().await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("never reached {:?}", state));
    }

    /// Process events until nothing happens for a while.
    async fn settle(&mut self) {
        while tokio::time::timeout(Duration::from_millis(50), self.controller.step())
            .await
            .is_ok()
        {}
    }

    fn end_call_frames(&self) -> usize {
        self.wire
            .lock()
            .unwrap()
            .texts
            .iter()
            .filter(|t| t["event"] == "end_call")
            .count()
    }

    fn mic_released(&self) -> bool {
        self.mic.opened.load(Ordering::SeqCst) == self.mic.released.load(Ordering::SeqCst)
    }

    /// Get into a recording turn: one AI segment, then the post-turn delay.
    async fn reach_recording(&mut self) {
        self.connect().await;
        self.server_sends(Frame::Binary(vec![1; 32]));
        self.step_until_state(CallState::Recording).await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_full_turn_sends_one_recording() {
    let mut h = Harness::new();
    h.connect().await;

    {
        let wire = h.wire.lock().unwrap();
        assert_eq!(wire.opened, 1);
        assert_eq!(
            wire.texts,
            vec![json!({
                "event": "register_client",
                "client_id": "client-7",
                "user_name": "Amina",
                "phone_number": "+212612345678"
            })]
        );
    }

    let t0 = Instant::now();
    h.server_json(json!({"event": "ai_speaking"}));
    h.server_sends(Frame::Binary(vec![7; 64]));

    let controller = &mut h.controller;
    let wire = h.wire.clone();
    tokio::time::timeout(Duration::from_secs(30), async {
        while wire.lock().unwrap().binaries.is_empty() {
            controller.step().await;
        }
    })
    .await
    .expect("recording never sent");

    // 1 s of playback, 500 ms pause, 8 s of recording
    let (sent_at, chunk) = h.wire.lock().unwrap().binaries[0].clone();
    let elapsed = sent_at - t0;
    assert!(elapsed >= Duration::from_millis(9500), "sent after {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(9600), "sent after {:?}", elapsed);
    assert_eq!(&chunk[..4], b"RIFF");

    h.settle().await;
    assert_eq!(h.state(), CallState::Listening);
    assert_eq!(h.wire.lock().unwrap().binaries.len(), 1);
    assert_eq!(h.mic.opened.load(Ordering::SeqCst), 1);
    assert!(h.mic_released());
    assert_eq!(h.speaker.played.lock().unwrap().as_slice(), &[vec![7; 64]]);
}

#[tokio::test(start_paused = true)]
async fn test_silent_turn_sends_nothing() {
    let mut h = Harness::with(true, false);
    h.reach_recording().await;
    h.step_until_state(CallState::Listening).await;

    h.settle().await;
    assert!(h.wire.lock().unwrap().binaries.is_empty());
    assert!(h.mic_released());
}

#[tokio::test(start_paused = true)]
async fn test_explicit_stop_sends_early() {
    let mut h = Harness::new();
    h.reach_recording().await;

    tokio::time::sleep(Duration::from_secs(2)).await;
    h.controller.handle().stop_recording();
    h.step_until_state(CallState::Listening).await;
    h.settle().await;

    assert_eq!(h.wire.lock().unwrap().binaries.len(), 1);
    assert!(h.mic_released());
}

#[tokio::test(start_paused = true)]
async fn test_escalation_announces_before_handoff() {
    let mut h = Harness::new();
    h.reach_recording().await;

    h.server_json(json!({
        "decision": "AGENT",
        "agent": {"agent_name": "Sara", "department": "Support"},
        "summary": "Réclamation facture"
    }));
    h.step_until_state(CallState::Escalating).await;

    assert!(h.controller.session().is_audio_suppressed());

    // Late audio and turn events are ignored while the notice plays.
    h.server_sends(Frame::Binary(vec![9; 16]));
    h.server_json(json!({"event": "ai_done"}));
    h.settle().await;
    assert_eq!(h.state(), CallState::Escalating);
    assert!(h.mic_released());
    assert_eq!(h.speaker.played.lock().unwrap().len(), 1);
    assert_eq!(h.mic.opened.load(Ordering::SeqCst), 1);
    assert!(matches!(
        h.announcer.heard.lock().unwrap().as_slice(),
        [Announcement::Speech { lang, .. }] if lang == "fr-FR"
    ));
    assert!(!h
        .seen
        .lock()
        .unwrap()
        .iter()
        .any(|n| matches!(n, Notification::Escalated { .. })));

    h.announcer.gate.notify_one();
    h.step_until_state(CallState::Escalated).await;

    assert!(h.wire.lock().unwrap().binaries.is_empty());
    assert_eq!(h.end_call_frames(), 1);
    assert_eq!(h.wire.lock().unwrap().closed, 1);

    let seen = h.seen.lock().unwrap().clone();
    let escalated = seen
        .iter()
        .position(|n| matches!(n, Notification::Escalated { agent, .. } if agent.display_name() == "Sara"))
        .expect("no escalation notification");
    let ended = seen
        .iter()
        .position(|n| *n == Notification::CallEnded { keep_escalation_ui: true })
        .expect("no end notification");
    assert!(escalated < ended);

    let report = h
        .controller
        .session()
        .escalation_report(chrono::Local::now())
        .unwrap();
    assert!(report.contains("Agent: Sara"));
    assert!(report.contains("Call ID: call-42"));
}

#[tokio::test(start_paused = true)]
async fn test_goodbye_while_recording_releases_mic() {
    let mut h = Harness::new();
    h.reach_recording().await;

    h.server_json(json!({"event": "ai_done", "reason": "USER_GOODBYE", "summary": "Au revoir"}));
    h.step_until_state(CallState::Ended).await;
    h.settle().await;

    assert!(h.mic_released());
    assert!(h.wire.lock().unwrap().binaries.is_empty());
    assert_eq!(h.end_call_frames(), 1);
    assert_eq!(h.wire.lock().unwrap().closed, 1);
    assert!(h
        .seen
        .lock()
        .unwrap()
        .contains(&Notification::Summary(Some("Au revoir".to_string()))));

    // Already over.
    h.controller.run_until_finished().await;
}

#[tokio::test(start_paused = true)]
async fn test_hang_up_is_idempotent() {
    let mut h = Harness::new();
    h.connect().await;
    h.server_sends(Frame::Binary(vec![3; 8]));
    h.step_until_state(CallState::AiSpeaking).await;

    let handle = h.controller.handle();
    handle.end_call(false);
    handle.end_call(false);
    h.controller.run_until_finished().await;
    h.controller.end_call(false).await;
    h.settle().await;

    assert_eq!(h.state(), CallState::Ended);
    assert_eq!(h.end_call_frames(), 1);
    assert_eq!(h.wire.lock().unwrap().closed, 1);
    assert_eq!(h.mic.opened.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_server_close_ends_call() {
    let mut h = Harness::new();
    h.connect().await;
    h.server_closes();
    h.step_until_state(CallState::Ended).await;

    assert_eq!(h.end_call_frames(), 0);
    assert!(h
        .seen
        .lock()
        .unwrap()
        .contains(&Notification::CallEnded { keep_escalation_ui: false }));
}

#[tokio::test(start_paused = true)]
async fn test_channel_error_while_recording() {
    let mut h = Harness::new();
    h.reach_recording().await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(h.mic.opened.load(Ordering::SeqCst), 1);

    h.server_fails("connection reset");
    h.step_until_state(CallState::Error).await;
    h.settle().await;

    assert!(h.mic_released());
    assert!(h.wire.lock().unwrap().binaries.is_empty());
    assert_eq!(h.end_call_frames(), 0);
    let seen = h.seen.lock().unwrap().clone();
    assert!(seen.iter().any(|n| matches!(n, Notification::Error(_))));
    assert!(seen.contains(&Notification::CallEnded { keep_escalation_ui: false }));

    h.controller.run_until_finished().await;
}

#[tokio::test(start_paused = true)]
async fn test_failed_upload_ends_call() {
    let mut h = Harness::new();
    h.reach_recording().await;
    h.wire.lock().unwrap().fail_binary = true;

    tokio::time::sleep(Duration::from_secs(1)).await;
    h.controller.handle().stop_recording();
    h.step_until_state(CallState::Error).await;
    h.settle().await;

    assert!(!h.controller.session().is_live());
    assert!(h.mic_released());
    assert_eq!(h.end_call_frames(), 0);
    assert_eq!(h.wire.lock().unwrap().closed, 1);
    assert!(h
        .seen
        .lock()
        .unwrap()
        .contains(&Notification::CallEnded { keep_escalation_ui: false }));
}

#[tokio::test(start_paused = true)]
async fn test_registration_is_validated_locally() {
    let mut h = Harness::new();

    assert!(matches!(
        h.controller.register("  ", "+212 612345678").await,
        Err(CallError::Validation(ValidationError::MissingField))
    ));
    assert!(matches!(
        h.controller.register("Amina", "0612345678").await,
        Err(CallError::Validation(ValidationError::BadPhone))
    ));
    assert!(matches!(
        h.controller.register(&"x".repeat(51), "+212 612345678").await,
        Err(CallError::Validation(ValidationError::NameTooLong { .. }))
    ));
    assert_eq!(h.registrar.calls.load(Ordering::SeqCst), 0);

    assert!(matches!(
        h.controller.start_call().await,
        Err(CallError::Precondition(_))
    ));
    assert_eq!(h.state(), CallState::Idle);
    assert_eq!(h.wire.lock().unwrap().opened, 0);
}

#[tokio::test(start_paused = true)]
async fn test_backend_failure_keeps_state() {
    let mut h = Harness::with(false, true);
    assert!(matches!(
        h.controller.register("Amina", "+212 612345678").await,
        Err(CallError::BackendUnavailable(_))
    ));
    assert_eq!(h.state(), CallState::Idle);
    assert_eq!(h.controller.session().session_id(), None);
    assert!(h
        .seen
        .lock()
        .unwrap()
        .iter()
        .any(|n| matches!(n, Notification::Error(_))));
}

#[tokio::test(start_paused = true)]
async fn test_reregistering_ends_live_call() {
    let mut h = Harness::new();
    h.connect().await;

    let registration = h.controller.register("Amina", "+212 612345678").await.unwrap();
    assert_eq!(registration.session_id, "call-42");
    assert_eq!(h.state(), CallState::Registered);
    assert_eq!(h.end_call_frames(), 1);
    assert_eq!(h.registrar.calls.load(Ordering::SeqCst), 2);
}
