//! Session lifecycle notifications.

use crate::models::session::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionEventType {
    Authenticated,
    Unauthenticated,
    Updated,
    Gone,
}

impl SessionEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionEventType::Authenticated => "AUTHENTICATED",
            SessionEventType::Unauthenticated => "UNAUTHENTICATED",
            SessionEventType::Updated => "UPDATED",
            SessionEventType::Gone => "GONE",
        }
    }
}

/// Request details attached to an event when one is available.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    pub remote_ip: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SessionEvent {
    pub event_type: SessionEventType,
    pub session: Session,
    pub context: Option<RequestContext>,
}

impl SessionEvent {
    pub fn new(event_type: SessionEventType, session: &Session) -> Self {
        Self {
            event_type,
            session: session.clone(),
            context: None,
        }
    }

    pub fn with_context(mut self, context: RequestContext) -> Self {
        self.context = Some(context);
        self
    }
}

#[cfg_attr(test, mockall::automock)]
pub trait SessionEventListener: Send + Sync {
    fn on_event(&self, event: &SessionEvent) -> anyhow::Result<()>;
}

/// Dispatches `event`; listener failures are logged and dropped.
pub fn notify(listener: &dyn SessionEventListener, event: SessionEvent) {
    if let Err(err) = listener.on_event(&event) {
        tracing::error!(
            session_id = %event.session.id,
            event = event.event_type.as_str(),
            "Session event listener failed: {:#}",
            err
        );
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSessionEventListener;

impl SessionEventListener for TracingSessionEventListener {
    fn on_event(&self, event: &SessionEvent) -> anyhow::Result<()> {
        tracing::info!(
            session_id = %event.session.id,
            sid = %event.session.outside_sid,
            state = event.session.state.as_str(),
            remote_ip = event
                .context
                .as_ref()
                .and_then(|context| context.remote_ip.as_deref()),
            "session event {}",
            event.event_type.as_str()
        );
        Ok(())
    }
}
