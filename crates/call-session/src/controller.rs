//! `SessionController` - the actor that owns the local call.
//!
//! All state changes happen on the actor task. Work that can suspend (media
//! acquisition, offer/answer creation, applying remote descriptions) runs in
//! a [`JoinSet`] as sub-tasks tagged with the call attempt's id, so the actor
//! keeps handling `End` and channel-closed events while they are in flight.
//! A completion whose call id no longer matches the live call is stale: it
//! is discarded and any media it acquired is released on the spot.
//!
//! # Teardown
//!
//! Every path to `Ended` goes through [`SessionController::teardown`], which
//! takes the call out of the actor. The engine is closed and the local media
//! released exactly once; a second end request finds no call and is a no-op.

use std::sync::Arc;

use signaling_protocol::{
    CallerProfile, ClientFrame, NegotiationBlob, ServerFrame, SignalingMessage, UserId,
};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::SessionConfig;
use crate::errors::{CallError, MediaError, NegotiationError};
use crate::media::{LocalMedia, MediaDevices, MediaStream};
use crate::messages::{ControllerMessage, Reply};
use crate::negotiation::{
    NegotiationEngine, NegotiationEngineFactory, NegotiationEvent, RemoteMedia,
};
use crate::state::{CallEvent, CallRole, CallSnapshot, CallState, EndReason};

/// Handle to the `SessionController`.
#[derive(Clone, Debug)]
pub struct SessionHandle {
    user_id: UserId,
    sender: mpsc::Sender<ControllerMessage>,
    events: broadcast::Sender<CallEvent>,
    cancel_token: CancellationToken,
}

impl SessionHandle {
    async fn send(&self, message: ControllerMessage) -> Result<(), CallError> {
        self.sender
            .send(message)
            .await
            .map_err(|e| CallError::Internal(format!("channel send failed: {e}")))
    }

    async fn request(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<(), CallError>>) -> ControllerMessage,
    ) -> Result<(), CallError> {
        let (tx, rx) = oneshot::channel();
        self.send(build(tx)).await?;

        rx.await
            .map_err(|e| CallError::Internal(format!("response receive failed: {e}")))?
    }

    /// The local user this controller acts for.
    #[must_use]
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Call `peer_id`. Resolves once local media is acquired and the invite
    /// is sent.
    pub async fn initiate(&self, peer_id: UserId) -> Result<(), CallError> {
        self.request(|respond_to| ControllerMessage::Initiate {
            peer_id,
            respond_to,
        })
        .await
    }

    /// Accept the ringing call. Resolves once local media is acquired and
    /// the accept is sent.
    pub async fn accept_locally(&self) -> Result<(), CallError> {
        self.request(|respond_to| ControllerMessage::Accept { respond_to })
            .await
    }

    /// Decline the ringing call. No-op when idle.
    pub async fn reject_locally(&self) -> Result<(), CallError> {
        self.request(|respond_to| ControllerMessage::Reject { respond_to })
            .await
    }

    /// Hang up. No-op when idle.
    pub async fn end_call(&self) -> Result<(), CallError> {
        self.request(|respond_to| ControllerMessage::End { respond_to })
            .await
    }

    /// Enable or disable the local audio track. Local only.
    pub async fn toggle_mic(&self, enabled: bool) -> Result<(), CallError> {
        self.request(|respond_to| ControllerMessage::ToggleMic {
            enabled,
            respond_to,
        })
        .await
    }

    /// Enable or disable the local video track. Local only.
    pub async fn toggle_camera(&self, enabled: bool) -> Result<(), CallError> {
        self.request(|respond_to| ControllerMessage::ToggleCamera {
            enabled,
            respond_to,
        })
        .await
    }

    pub async fn snapshot(&self) -> Result<CallSnapshot, CallError> {
        let (tx, rx) = oneshot::channel();
        self.send(ControllerMessage::Snapshot { respond_to: tx })
            .await?;

        rx.await
            .map_err(|e| CallError::Internal(format!("response receive failed: {e}")))
    }

    /// Subscribe to call events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    /// Hand the controller a freshly opened relay connection.
    pub async fn channel_opened(&self, outbound: mpsc::Sender<ClientFrame>) -> Result<(), CallError> {
        self.send(ControllerMessage::ChannelOpened { outbound })
            .await
    }

    /// Report that the connection opened with `outbound` closed. Ignored if
    /// a newer connection has replaced it.
    pub async fn channel_closed(&self, outbound: mpsc::Sender<ClientFrame>) -> Result<(), CallError> {
        self.send(ControllerMessage::ChannelClosed { outbound })
            .await
    }

    /// Deliver a frame received from the relay.
    pub async fn deliver(&self, frame: ServerFrame) -> Result<(), CallError> {
        self.send(ControllerMessage::Inbound(frame)).await
    }

    /// Cancel the controller. A live call is ended.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    #[must_use]
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }
}

/// Result of a suspended sub-task, tagged with its call attempt.
enum Completion {
    MediaAcquired {
        call_id: u64,
        result: Result<Arc<dyn MediaStream>, MediaError>,
    },
    OfferCreated {
        call_id: u64,
        result: Result<NegotiationBlob, NegotiationError>,
    },
    AnswerCreated {
        call_id: u64,
        result: Result<NegotiationBlob, NegotiationError>,
    },
    RemoteAnswerApplied {
        call_id: u64,
        result: Result<(), NegotiationError>,
    },
    CandidateApplied {
        call_id: u64,
        result: Result<(), NegotiationError>,
    },
}

impl Completion {
    fn call_id(&self) -> u64 {
        match self {
            Completion::MediaAcquired { call_id, .. }
            | Completion::OfferCreated { call_id, .. }
            | Completion::AnswerCreated { call_id, .. }
            | Completion::RemoteAnswerApplied { call_id, .. }
            | Completion::CandidateApplied { call_id, .. } => *call_id,
        }
    }
}

/// One call attempt, from `initiate`/incoming invite to `Ended`.
struct CallSession {
    call_id: u64,
    state: CallState,
    role: CallRole,
    peer_id: UserId,
    peer_profile: Option<CallerProfile>,
    local_media: Option<LocalMedia>,
    remote_media: Option<RemoteMedia>,
    engine: Option<Arc<dyn NegotiationEngine>>,
    engine_events: Option<mpsc::Receiver<NegotiationEvent>>,
    /// Caller of `initiate`/`accept_locally` waiting on media.
    pending_reply: Option<Reply>,
    /// Media acquisition in flight.
    acquiring: bool,
    /// The peer has heard of this call (invite or accept sent, or invite received).
    signaled: bool,
    /// Accept arrived before local media was ready.
    peer_accepted: bool,
    pending_offer: Option<NegotiationBlob>,
    /// Remote candidates held until the remote description is applied.
    pending_candidates: Vec<NegotiationBlob>,
    remote_description_applied: bool,
    mic_enabled: bool,
    camera_enabled: bool,
}

impl CallSession {
    fn new(call_id: u64, role: CallRole, state: CallState, peer_id: UserId) -> Self {
        Self {
            call_id,
            state,
            role,
            peer_id,
            peer_profile: None,
            local_media: None,
            remote_media: None,
            engine: None,
            engine_events: None,
            pending_reply: None,
            acquiring: false,
            signaled: false,
            peer_accepted: false,
            pending_offer: None,
            pending_candidates: Vec::new(),
            remote_description_applied: false,
            mic_enabled: true,
            camera_enabled: true,
        }
    }

    fn snapshot(&self) -> CallSnapshot {
        CallSnapshot {
            call_id: Some(self.call_id),
            state: self.state,
            peer_id: Some(self.peer_id.clone()),
            peer_profile: self.peer_profile.clone(),
            role: Some(self.role),
            mic_enabled: self.mic_enabled,
            camera_enabled: self.camera_enabled,
            local_media: self.local_media.as_ref().map(|m| m.id().to_string()),
            remote_media: self.remote_media.clone(),
        }
    }

    fn reply(&mut self, result: Result<(), CallError>) {
        if let Some(reply) = self.pending_reply.take() {
            let _ = reply.send(result);
        }
    }
}

/// Outbound side of the relay connection.
#[derive(Default)]
struct Outbound {
    sender: Option<mpsc::Sender<ClientFrame>>,
}

impl Outbound {
    fn is_current(&self, other: &mpsc::Sender<ClientFrame>) -> bool {
        self.sender.as_ref().is_some_and(|s| s.same_channel(other))
    }

    fn is_open(&self) -> bool {
        self.sender.as_ref().is_some_and(|s| !s.is_closed())
    }

    async fn signal(&self, message: SignalingMessage) -> bool {
        let kind = message.kind();
        let Some(sender) = &self.sender else {
            debug!(
                target: "call.session.controller",
                kind = %kind,
                "No relay channel, signal not sent"
            );
            return false;
        };

        if sender.send(ClientFrame::Signal(message)).await.is_err() {
            debug!(
                target: "call.session.controller",
                kind = %kind,
                "Relay channel closed, signal not sent"
            );
            return false;
        }
        true
    }
}

/// The `SessionController` implementation.
pub struct SessionController {
    local: CallerProfile,
    receiver: mpsc::Receiver<ControllerMessage>,
    events: broadcast::Sender<CallEvent>,
    cancel_token: CancellationToken,
    media_devices: Arc<dyn MediaDevices>,
    engine_factory: Arc<dyn NegotiationEngineFactory>,
    ice_servers: Vec<String>,
    outbound: Outbound,
    session: Option<CallSession>,
    tasks: JoinSet<Completion>,
    next_call_id: u64,
}

impl SessionController {
    /// Spawn a controller acting for `local`.
    ///
    /// Returns a handle and the task join handle.
    pub fn spawn(
        local: CallerProfile,
        config: &SessionConfig,
        media_devices: Arc<dyn MediaDevices>,
        engine_factory: Arc<dyn NegotiationEngineFactory>,
        cancel_token: CancellationToken,
    ) -> (SessionHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(config.command_buffer);
        let (events, _) = broadcast::channel(config.event_buffer);

        let handle = SessionHandle {
            user_id: local.id.clone(),
            sender,
            events: events.clone(),
            cancel_token: cancel_token.clone(),
        };

        let controller = Self {
            local,
            receiver,
            events,
            cancel_token,
            media_devices,
            engine_factory,
            ice_servers: config.ice_servers.clone(),
            outbound: Outbound::default(),
            session: None,
            tasks: JoinSet::new(),
            next_call_id: 1,
        };

        let task_handle = tokio::spawn(controller.run());

        (handle, task_handle)
    }

    #[instrument(skip_all, name = "call.session.controller", fields(user_id = %self.local.id))]
    async fn run(mut self) {
        info!(
            target: "call.session.controller",
            user_id = %self.local.id,
            "SessionController started"
        );

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    debug!(
                        target: "call.session.controller",
                        user_id = %self.local.id,
                        "SessionController received cancellation signal"
                    );
                    break;
                }

                msg = self.receiver.recv() => {
                    if let Some(message) = msg {
                        self.handle_message(message).await;
                    } else {
                        debug!(
                            target: "call.session.controller",
                            user_id = %self.local.id,
                            "SessionController channel closed, exiting"
                        );
                        break;
                    }
                }

                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    match joined {
                        Ok(completion) => self.handle_completion(completion).await,
                        Err(e) => warn!(
                            target: "call.session.controller",
                            error = %e,
                            "Session sub-task failed"
                        ),
                    }
                }

                event = next_negotiation_event(&mut self.session) => {
                    match event {
                        Some(event) => self.handle_negotiation_event(event).await,
                        None => {
                            if let Some(session) = self.session.as_mut() {
                                session.engine_events = None;
                            }
                        }
                    }
                }
            }
        }

        self.teardown(EndReason::LocalEnded, true).await;

        // Release media from sub-tasks that finished but were never joined.
        self.tasks.abort_all();
        while let Some(joined) = self.tasks.join_next().await {
            if let Ok(completion) = joined {
                discard(completion);
            }
        }

        info!(
            target: "call.session.controller",
            user_id = %self.local.id,
            "SessionController stopped"
        );
    }

    async fn handle_message(&mut self, message: ControllerMessage) {
        match message {
            ControllerMessage::Initiate {
                peer_id,
                respond_to,
            } => self.handle_initiate(peer_id, respond_to),
            ControllerMessage::Accept { respond_to } => self.handle_accept(respond_to),
            ControllerMessage::Reject { respond_to } => {
                let result = self.handle_reject().await;
                let _ = respond_to.send(result);
            }
            ControllerMessage::End { respond_to } => {
                let result = self.handle_end().await;
                let _ = respond_to.send(result);
            }
            ControllerMessage::ToggleMic {
                enabled,
                respond_to,
            } => {
                let result = self.toggle(enabled, true);
                let _ = respond_to.send(result);
            }
            ControllerMessage::ToggleCamera {
                enabled,
                respond_to,
            } => {
                let result = self.toggle(enabled, false);
                let _ = respond_to.send(result);
            }
            ControllerMessage::Snapshot { respond_to } => {
                let snapshot = self
                    .session
                    .as_ref()
                    .map_or_else(CallSnapshot::idle, CallSession::snapshot);
                let _ = respond_to.send(snapshot);
            }
            ControllerMessage::ChannelOpened { outbound } => {
                info!(
                    target: "call.session.controller",
                    user_id = %self.local.id,
                    "Relay channel opened"
                );
                self.outbound.sender = Some(outbound);
            }
            ControllerMessage::ChannelClosed { outbound } => {
                if !self.outbound.is_current(&outbound) {
                    debug!(
                        target: "call.session.controller",
                        "Superseded relay channel closed, ignored"
                    );
                    return;
                }
                info!(
                    target: "call.session.controller",
                    user_id = %self.local.id,
                    "Relay channel closed"
                );
                self.outbound.sender = None;
                self.teardown(EndReason::ChannelClosed, false).await;
            }
            ControllerMessage::Inbound(frame) => self.handle_frame(frame).await,
        }
    }

    fn handle_initiate(&mut self, peer_id: UserId, respond_to: Reply) {
        if let Some(session) = &self.session {
            let _ = respond_to.send(Err(CallError::InvalidState {
                operation: "initiate",
                state: session.state,
            }));
            return;
        }
        if peer_id == self.local.id {
            let _ = respond_to.send(Err(CallError::InvalidPeer(peer_id)));
            return;
        }
        if !self.outbound.is_open() {
            let _ = respond_to.send(Err(CallError::ChannelClosed));
            return;
        }

        let call_id = self.next_call_id();
        info!(
            target: "call.session.controller",
            call_id,
            peer_id = %peer_id,
            "Initiating call"
        );

        let mut session = CallSession::new(call_id, CallRole::Initiator, CallState::Calling, peer_id);
        session.pending_reply = Some(respond_to);
        session.acquiring = true;
        self.publish(CallEvent::StateChanged(session.snapshot()));
        self.session = Some(session);

        self.spawn_acquire(call_id);
    }

    fn handle_accept(&mut self, respond_to: Reply) {
        let Some(session) = self.session.as_mut() else {
            let _ = respond_to.send(Err(CallError::InvalidState {
                operation: "accept",
                state: CallState::Idle,
            }));
            return;
        };
        if session.state != CallState::Ringing || session.acquiring {
            let _ = respond_to.send(Err(CallError::InvalidState {
                operation: "accept",
                state: session.state,
            }));
            return;
        }
        if !self.outbound.is_open() {
            let _ = respond_to.send(Err(CallError::ChannelClosed));
            return;
        }

        debug!(
            target: "call.session.controller",
            call_id = session.call_id,
            peer_id = %session.peer_id,
            "Accepting call, acquiring media"
        );
        session.pending_reply = Some(respond_to);
        session.acquiring = true;
        let call_id = session.call_id;
        self.spawn_acquire(call_id);
    }

    async fn handle_reject(&mut self) -> Result<(), CallError> {
        let Some(session) = &self.session else {
            return Ok(());
        };
        if session.state != CallState::Ringing {
            return Err(CallError::InvalidState {
                operation: "reject",
                state: session.state,
            });
        }

        let reject = SignalingMessage::Reject {
            from: self.local.id.clone(),
            to: session.peer_id.clone(),
        };
        self.outbound.signal(reject).await;
        self.teardown(EndReason::Declined, false).await;
        Ok(())
    }

    async fn handle_end(&mut self) -> Result<(), CallError> {
        match self.session.as_ref().map(|s| s.state) {
            None => Ok(()),
            Some(CallState::Ringing) => self.handle_reject().await,
            Some(_) => {
                self.teardown(EndReason::LocalEnded, true).await;
                Ok(())
            }
        }
    }

    fn toggle(&mut self, enabled: bool, audio: bool) -> Result<(), CallError> {
        let Some(session) = self.session.as_mut() else {
            return Err(CallError::NoLocalMedia);
        };
        let Some(media) = &session.local_media else {
            return Err(CallError::NoLocalMedia);
        };

        if audio {
            media.set_audio_enabled(enabled);
            session.mic_enabled = enabled;
        } else {
            media.set_video_enabled(enabled);
            session.camera_enabled = enabled;
        }
        let snapshot = session.snapshot();
        self.publish(CallEvent::StateChanged(snapshot));
        Ok(())
    }

    async fn handle_frame(&mut self, frame: ServerFrame) {
        match frame {
            ServerFrame::Registered { user_id } => {
                debug!(
                    target: "call.session.controller",
                    user_id = %user_id,
                    "Registered with relay"
                );
            }
            ServerFrame::PresenceChanged { user_id, online } => {
                debug!(
                    target: "call.session.controller",
                    user_id = %user_id,
                    online,
                    "Presence changed"
                );
            }
            ServerFrame::UserUnreachable { user_id } => {
                self.handle_invite_failure(&user_id, EndReason::Unreachable)
                    .await;
            }
            ServerFrame::UserBusy { user_id } => {
                self.handle_invite_failure(&user_id, EndReason::Busy).await;
            }
            ServerFrame::Signal(message) => self.handle_signal(message).await,
        }
    }

    async fn handle_invite_failure(&mut self, user_id: &UserId, reason: EndReason) {
        let calling_peer = self
            .session
            .as_ref()
            .is_some_and(|s| s.state == CallState::Calling && &s.peer_id == user_id);

        if calling_peer {
            self.teardown(reason, false).await;
        } else {
            debug!(
                target: "call.session.controller",
                user_id = %user_id,
                reason = %reason,
                "Stale invite reply dropped"
            );
        }
    }

    async fn handle_signal(&mut self, message: SignalingMessage) {
        if message.to() != &self.local.id {
            debug!(
                target: "call.session.controller",
                kind = %message.kind(),
                to = %message.to(),
                "Signal addressed to another user dropped"
            );
            return;
        }

        let from_peer = self
            .session
            .as_ref()
            .is_some_and(|s| &s.peer_id == message.from());

        match message {
            SignalingMessage::Invite { from, caller, .. } => {
                self.handle_invite(from, caller).await;
            }
            SignalingMessage::Accept { from, .. } if from_peer => {
                self.handle_remote_accept(&from).await;
            }
            SignalingMessage::Reject { .. } if from_peer => {
                self.teardown(EndReason::Rejected, false).await;
            }
            SignalingMessage::End { .. } if from_peer => {
                self.teardown(EndReason::RemoteEnded, false).await;
            }
            SignalingMessage::NegotiationOffer { offer, .. } if from_peer => {
                self.handle_remote_offer(offer);
            }
            SignalingMessage::NegotiationAnswer { answer, .. } if from_peer => {
                self.handle_remote_answer(answer);
            }
            SignalingMessage::NegotiationCandidate { candidate, .. } if from_peer => {
                self.handle_remote_candidate(candidate);
            }
            other => {
                debug!(
                    target: "call.session.controller",
                    kind = %other.kind(),
                    from = %other.from(),
                    "Stale signal dropped"
                );
            }
        }
    }

    async fn handle_invite(&mut self, from: UserId, caller: CallerProfile) {
        let Some(session) = self.session.as_mut() else {
            let call_id = self.next_call_id();
            info!(
                target: "call.session.controller",
                call_id,
                peer_id = %from,
                "Incoming call"
            );

            let mut session = CallSession::new(call_id, CallRole::Responder, CallState::Ringing, from);
            session.peer_profile = Some(caller.clone());
            session.signaled = true;
            self.publish(CallEvent::IncomingCall { caller });
            self.publish(CallEvent::StateChanged(session.snapshot()));
            self.session = Some(session);
            return;
        };

        if session.peer_id != from {
            // Busy with another call: decline without touching ours.
            debug!(
                target: "call.session.controller",
                call_id = session.call_id,
                from = %from,
                "Invite while busy, rejecting"
            );
            let reject = SignalingMessage::Reject {
                from: self.local.id.clone(),
                to: from,
            };
            self.outbound.signal(reject).await;
            return;
        }

        let glare = session.state == CallState::Calling && session.role == CallRole::Initiator;
        if !glare || self.local.id < from {
            debug!(
                target: "call.session.controller",
                call_id = session.call_id,
                from = %from,
                "Duplicate invite ignored"
            );
            return;
        }

        // Glare: the greater user id answers the peer's invite.
        info!(
            target: "call.session.controller",
            call_id = session.call_id,
            peer_id = %from,
            "Simultaneous invites, yielding to peer"
        );
        session.role = CallRole::Responder;
        session.peer_profile = Some(caller);
        if session.local_media.is_some() {
            self.answer_invite().await;
        }
    }

    /// Responder with local media ready: send Accept and create the engine.
    async fn answer_invite(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };

        let accept = SignalingMessage::Accept {
            from: self.local.id.clone(),
            to: session.peer_id.clone(),
        };
        if !self.outbound.signal(accept).await {
            self.teardown(EndReason::ChannelClosed, false).await;
            return;
        }
        session.signaled = true;
        session.state = CallState::Connecting;
        session.reply(Ok(()));

        if let Err(e) = self.start_engine() {
            warn!(
                target: "call.session.controller",
                error = %e,
                "Negotiation engine creation failed"
            );
            self.teardown(EndReason::NegotiationFailed, true).await;
            return;
        }
        self.publish_snapshot();
    }

    async fn handle_remote_accept(&mut self, from: &UserId) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.state != CallState::Calling || session.role != CallRole::Initiator {
            debug!(
                target: "call.session.controller",
                call_id = session.call_id,
                from = %from,
                state = %session.state,
                "Unexpected accept dropped"
            );
            return;
        }

        if session.local_media.is_none() {
            session.peer_accepted = true;
            return;
        }
        self.begin_offer().await;
    }

    /// Initiator with local media ready: create the engine and the offer.
    async fn begin_offer(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.state = CallState::Connecting;
        let call_id = session.call_id;

        match self.start_engine() {
            Ok(engine) => {
                self.tasks.spawn(async move {
                    Completion::OfferCreated {
                        call_id,
                        result: engine.create_offer().await,
                    }
                });
                self.publish_snapshot();
            }
            Err(e) => {
                warn!(
                    target: "call.session.controller",
                    error = %e,
                    "Negotiation engine creation failed"
                );
                self.teardown(EndReason::NegotiationFailed, true).await;
            }
        }
    }

    /// Create the call's engine. Applies an offer that arrived early.
    fn start_engine(&mut self) -> Result<Arc<dyn NegotiationEngine>, NegotiationError> {
        let Some(session) = self.session.as_mut() else {
            return Err(NegotiationError::Closed);
        };
        let Some(media) = &session.local_media else {
            return Err(NegotiationError::Failed("no local media".to_string()));
        };

        let created = self.engine_factory.create(&self.ice_servers, media)?;
        let engine = created.engine;
        session.engine = Some(Arc::clone(&engine));
        session.engine_events = Some(created.events);

        if let Some(offer) = session.pending_offer.take() {
            spawn_apply_offer(&mut self.tasks, session.call_id, Arc::clone(&engine), offer);
        }
        Ok(engine)
    }

    fn handle_remote_offer(&mut self, offer: NegotiationBlob) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.role != CallRole::Responder {
            debug!(
                target: "call.session.controller",
                call_id = session.call_id,
                "Offer received as initiator, dropped"
            );
            return;
        }

        match &session.engine {
            Some(engine) => {
                spawn_apply_offer(&mut self.tasks, session.call_id, Arc::clone(engine), offer);
            }
            None => session.pending_offer = Some(offer),
        }
    }

    fn handle_remote_answer(&mut self, answer: NegotiationBlob) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let Some(engine) = session.engine.clone() else {
            debug!(
                target: "call.session.controller",
                call_id = session.call_id,
                "Answer before negotiation started, dropped"
            );
            return;
        };
        if session.role != CallRole::Initiator {
            return;
        }

        let call_id = session.call_id;
        self.tasks.spawn(async move {
            Completion::RemoteAnswerApplied {
                call_id,
                result: engine.apply_remote_answer(answer).await,
            }
        });
    }

    fn handle_remote_candidate(&mut self, candidate: NegotiationBlob) {
        let Some(session) = self.session.as_mut() else {
            return;
        };

        match (&session.engine, session.remote_description_applied) {
            (Some(engine), true) => {
                spawn_add_candidate(&mut self.tasks, session.call_id, Arc::clone(engine), candidate);
            }
            _ => session.pending_candidates.push(candidate),
        }
    }

    fn flush_candidates(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let Some(engine) = &session.engine else {
            return;
        };

        for candidate in session.pending_candidates.drain(..) {
            spawn_add_candidate(&mut self.tasks, session.call_id, Arc::clone(engine), candidate);
        }
    }

    async fn handle_completion(&mut self, completion: Completion) {
        let live = self
            .session
            .as_ref()
            .is_some_and(|s| s.call_id == completion.call_id());
        if !live {
            debug!(
                target: "call.session.controller",
                call_id = completion.call_id(),
                "Stale completion discarded"
            );
            discard(completion);
            return;
        }

        match completion {
            Completion::MediaAcquired { result, .. } => self.handle_media(result).await,
            Completion::OfferCreated { result, .. } => match result {
                Ok(offer) => self.send_to_peer(|from, to| SignalingMessage::NegotiationOffer {
                    from,
                    to,
                    offer,
                })
                .await,
                Err(e) => self.negotiation_failed(&e).await,
            },
            Completion::AnswerCreated { result, .. } => match result {
                Ok(answer) => {
                    self.send_to_peer(|from, to| SignalingMessage::NegotiationAnswer {
                        from,
                        to,
                        answer,
                    })
                    .await;
                    self.remote_description_applied();
                }
                Err(e) => self.negotiation_failed(&e).await,
            },
            Completion::RemoteAnswerApplied { result, .. } => match result {
                Ok(()) => self.remote_description_applied(),
                Err(e) => self.negotiation_failed(&e).await,
            },
            Completion::CandidateApplied { result, call_id } => {
                if let Err(e) = result {
                    debug!(
                        target: "call.session.controller",
                        call_id,
                        error = %e,
                        "Remote candidate rejected"
                    );
                }
            }
        }
    }

    async fn handle_media(&mut self, result: Result<Arc<dyn MediaStream>, MediaError>) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.acquiring = false;

        let stream = match result {
            Ok(stream) => stream,
            Err(e) => {
                // No signaling: the call silently returns to idle.
                warn!(
                    target: "call.session.controller",
                    call_id = session.call_id,
                    error = %e,
                    "Local media acquisition failed"
                );
                if let Some(mut session) = self.session.take() {
                    session.reply(Err(CallError::MediaAcquisitionFailed(e)));
                }
                self.publish(CallEvent::StateChanged(CallSnapshot::idle()));
                return;
            }
        };

        let media = LocalMedia::new(stream);
        debug!(
            target: "call.session.controller",
            call_id = session.call_id,
            stream_id = %media.id(),
            "Local media acquired"
        );
        session.local_media = Some(media);

        match (session.role, session.state) {
            (CallRole::Initiator, CallState::Calling) => {
                let invite = SignalingMessage::Invite {
                    from: self.local.id.clone(),
                    to: session.peer_id.clone(),
                    caller: self.local.clone(),
                };
                if !self.outbound.signal(invite).await {
                    self.teardown(EndReason::ChannelClosed, false).await;
                    return;
                }
                session.signaled = true;
                session.reply(Ok(()));

                if session.peer_accepted {
                    self.begin_offer().await;
                } else {
                    self.publish_snapshot();
                }
            }
            // Accepted locally, or yielded to the peer's invite.
            (CallRole::Responder, CallState::Ringing | CallState::Calling) => {
                self.answer_invite().await;
            }
            (role, state) => {
                debug!(
                    target: "call.session.controller",
                    ?role,
                    %state,
                    "Media acquired in unexpected state"
                );
                self.publish_snapshot();
            }
        }
    }

    async fn handle_negotiation_event(&mut self, event: NegotiationEvent) {
        match event {
            NegotiationEvent::LocalCandidate(candidate) => {
                self.send_to_peer(|from, to| SignalingMessage::NegotiationCandidate {
                    from,
                    to,
                    candidate,
                })
                .await;
            }
            NegotiationEvent::RemoteMedia(remote) => {
                if let Some(session) = self.session.as_mut() {
                    session.remote_media = Some(remote);
                }
                self.publish_snapshot();
            }
            NegotiationEvent::Connected => {
                if let Some(session) = self.session.as_mut() {
                    if session.state == CallState::Connecting {
                        info!(
                            target: "call.session.controller",
                            call_id = session.call_id,
                            peer_id = %session.peer_id,
                            "Call connected"
                        );
                        session.state = CallState::Connected;
                    }
                }
                self.publish_snapshot();
            }
            NegotiationEvent::Failed(reason) => {
                self.negotiation_failed(&NegotiationError::Failed(reason))
                    .await;
            }
            NegotiationEvent::Disconnected => {
                self.negotiation_failed(&NegotiationError::Failed("disconnected".to_string()))
                    .await;
            }
        }
    }

    fn remote_description_applied(&mut self) {
        if let Some(session) = self.session.as_mut() {
            session.remote_description_applied = true;
        }
        self.flush_candidates();
    }

    async fn negotiation_failed(&mut self, error: &NegotiationError) {
        warn!(
            target: "call.session.controller",
            error = %error,
            "Negotiation failed"
        );
        self.teardown(EndReason::NegotiationFailed, true).await;
    }

    async fn send_to_peer(&mut self, build: impl FnOnce(UserId, UserId) -> SignalingMessage) {
        let Some(session) = &self.session else {
            return;
        };
        let message = build(self.local.id.clone(), session.peer_id.clone());
        self.outbound.signal(message).await;
    }

    /// End the live call, if any. Idempotent.
    async fn teardown(&mut self, reason: EndReason, notify_peer: bool) {
        let Some(mut session) = self.session.take() else {
            return;
        };

        if notify_peer && session.signaled {
            let end = SignalingMessage::End {
                from: self.local.id.clone(),
                to: session.peer_id.clone(),
            };
            self.outbound.signal(end).await;
        }

        if let Some(engine) = session.engine.take() {
            engine.close();
        }
        session.engine_events = None;
        if let Some(media) = session.local_media.take() {
            media.release();
        }
        session.reply(Err(CallError::CallEnded(reason)));

        info!(
            target: "call.session.controller",
            call_id = session.call_id,
            peer_id = %session.peer_id,
            reason = %reason,
            "Call ended"
        );

        self.publish(CallEvent::StateChanged(CallSnapshot::ended(session.call_id)));
        self.publish(CallEvent::CallEnded {
            peer_id: session.peer_id,
            reason,
        });
        self.publish(CallEvent::StateChanged(CallSnapshot::idle()));
    }

    fn spawn_acquire(&mut self, call_id: u64) {
        let devices = Arc::clone(&self.media_devices);
        self.tasks.spawn(async move {
            Completion::MediaAcquired {
                call_id,
                result: devices.acquire().await,
            }
        });
    }

    fn next_call_id(&mut self) -> u64 {
        let id = self.next_call_id;
        self.next_call_id += 1;
        id
    }

    fn publish_snapshot(&self) {
        if let Some(session) = &self.session {
            self.publish(CallEvent::StateChanged(session.snapshot()));
        }
    }

    fn publish(&self, event: CallEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

fn spawn_apply_offer(
    tasks: &mut JoinSet<Completion>,
    call_id: u64,
    engine: Arc<dyn NegotiationEngine>,
    offer: NegotiationBlob,
) {
    tasks.spawn(async move {
        Completion::AnswerCreated {
            call_id,
            result: engine.apply_remote_offer(offer).await,
        }
    });
}

fn spawn_add_candidate(
    tasks: &mut JoinSet<Completion>,
    call_id: u64,
    engine: Arc<dyn NegotiationEngine>,
    candidate: NegotiationBlob,
) {
    tasks.spawn(async move {
        Completion::CandidateApplied {
            call_id,
            result: engine.add_remote_candidate(candidate).await,
        }
    });
}

/// Drop a completion that no longer has a call, releasing its media.
fn discard(completion: Completion) {
    if let Completion::MediaAcquired {
        result: Ok(stream), ..
    } = completion
    {
        LocalMedia::new(stream).release();
    }
}

async fn next_negotiation_event(session: &mut Option<CallSession>) -> Option<NegotiationEvent> {
    match session.as_mut().and_then(|s| s.engine_events.as_mut()) {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}
