//! Incoming-call presence: surfaces ringing sessions addressed to this
//! client and runs the callee-side ring window.

use log::{debug, info, warn};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::CallError;
use crate::session::CallSessionManager;
use crate::types::call::{CallId, CallStatus, UserId};
use crate::types::events::IncomingCall;

/// Subscribes to "ringing session created with self as target" records,
/// registers each with the session manager, and emits [`IncomingCall`]
/// events. Runs its own ring timer per call, independent of the session's
/// own; both derive the deadline from the same configured window and
/// converge on the same idempotent timeout path, so the timeout fires
/// effectively once.
pub struct PresenceListener {
    local_user: UserId,
    manager: Arc<CallSessionManager>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PresenceListener {
    /// Subscribe and start listening. The returned listener must be
    /// `stop`ped (or dropped) to release the subscription.
    pub async fn start(manager: Arc<CallSessionManager>) -> Result<Arc<Self>, CallError> {
        let local_user = manager.local_user().clone();
        let mut feed = manager
            .store()
            .subscribe_incoming_sessions(&local_user)
            .await?;

        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let listener = Arc::new(Self {
            local_user: local_user.clone(),
            manager: manager.clone(),
            shutdown,
            task: Mutex::new(None),
        });

        let task_manager = manager.clone();
        let ring_window = manager.config().ring_timeout;
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = async { let _ = shutdown_rx.wait_for(|stop| *stop).await; } => break,
                    record = feed.recv() => {
                        let Some(record) = record else { break };
                        if record.target_id != local_user || record.status != CallStatus::Ringing {
                            continue;
                        }
                        if task_manager.get_call(&record.id).is_some() {
                            debug!("call {}: already registered, ignoring duplicate", record.id);
                            continue;
                        }

                        let session = match task_manager.register_incoming(&record).await {
                            Ok(session) => session,
                            Err(e) => {
                                warn!("call {}: failed to register incoming call: {}", record.id, e);
                                continue;
                            }
                        };

                        info!(
                            "call {}: incoming from {} ({:?})",
                            record.id, record.initiator_id, record.media_kind
                        );
                        let _ = task_manager.events().incoming_call.send(Arc::new(IncomingCall {
                            call_id: record.id.clone(),
                            initiator_id: record.initiator_id.clone(),
                            media_kind: record.media_kind,
                        }));

                        // Independent ring timer; the session's own timer and
                        // this one agree on the deadline and race harmlessly.
                        let timer_manager = task_manager.clone();
                        let call_id = session.id().clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(ring_window).await;
                            timer_manager.fire_ring_timeout(&call_id).await;
                        });
                    }
                }
            }
        });
        *listener.task.lock().expect("task lock poisoned") = Some(handle);
        Ok(listener)
    }

    pub fn local_user(&self) -> &UserId {
        &self.local_user
    }

    /// Accept an incoming call.
    pub async fn accept(&self, call_id: &CallId) -> Result<(), CallError> {
        self.manager.answer_call(call_id).await
    }

    /// Decline an incoming call.
    pub async fn decline(&self, call_id: &CallId) -> Result<(), CallError> {
        self.manager.decline_call(call_id).await
    }

    /// Stop listening and release the subscription.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let handle = self.task.lock().expect("task lock poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}
