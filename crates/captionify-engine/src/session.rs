use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use captionify_contracts::caption::ImagePayload;
use captionify_contracts::event_payload;
use captionify_contracts::events::EventWriter;
use tracing::{info, warn};

use crate::invoker::{InvokeError, Invoker, RetryPolicy};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Readiness {
    #[default]
    Uninitialized,
    Connecting,
    Ready,
    Failed(String),
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Connecting => "connecting",
            Self::Ready => "ready",
            Self::Failed(_) => "failed",
        }
    }
}

impl fmt::Display for Readiness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed(reason) => write!(f, "failed: {reason}"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Live handle to the captioning backend, shared by every run.
#[async_trait]
pub trait SessionHandle: Send + Sync + fmt::Debug {
    fn backend(&self) -> &str;

    fn is_ready(&self) -> bool;

    /// Raw stage-1 text for `image`, before any cleaning.
    async fn describe(
        &self,
        invoker: &Invoker,
        image: &ImagePayload,
        policy: &RetryPolicy,
    ) -> Result<String, InvokeError>;
}

#[async_trait]
pub trait SessionConnector: Send + Sync {
    fn backend(&self) -> &str;

    async fn connect(
        &self,
        invoker: &Invoker,
        policy: &RetryPolicy,
    ) -> anyhow::Result<Arc<dyn SessionHandle>>;
}

#[derive(Debug, Default)]
struct SessionSlot {
    readiness: Readiness,
    handle: Option<Arc<dyn SessionHandle>>,
}

/// Owns the captioning session: Uninitialized, Connecting, Ready or Failed.
///
/// A failed session stays failed until [`SessionManager::initialize`] is
/// called again.
pub struct SessionManager {
    connector: Arc<dyn SessionConnector>,
    invoker: Invoker,
    policy: RetryPolicy,
    events: Option<EventWriter>,
    slot: RwLock<SessionSlot>,
}

impl SessionManager {
    pub fn new(connector: Arc<dyn SessionConnector>, invoker: Invoker, policy: RetryPolicy) -> Self {
        Self {
            connector,
            invoker,
            policy,
            events: None,
            slot: RwLock::new(SessionSlot::default()),
        }
    }

    pub fn with_events(mut self, events: Option<EventWriter>) -> Self {
        self.events = events;
        self
    }

    pub fn backend(&self) -> &str {
        self.connector.backend()
    }

    pub fn readiness(&self) -> Readiness {
        self.slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .readiness
            .clone()
    }

    pub fn handle(&self) -> Result<Arc<dyn SessionHandle>, Readiness> {
        let slot = self.slot.read().unwrap_or_else(PoisonError::into_inner);
        match (&slot.readiness, &slot.handle) {
            (Readiness::Ready, Some(handle)) if handle.is_ready() => Ok(Arc::clone(handle)),
            (readiness, _) => Err(readiness.clone()),
        }
    }

    #[tracing::instrument(name = "SessionManager::initialize", skip_all, fields(backend = self.connector.backend()))]
    pub async fn initialize(&self) -> Readiness {
        {
            let mut slot = self.slot.write().unwrap_or_else(PoisonError::into_inner);
            if matches!(slot.readiness, Readiness::Ready | Readiness::Connecting) {
                return slot.readiness.clone();
            }
            slot.readiness = Readiness::Connecting;
            slot.handle = None;
        }
        self.emit("session_connecting", None);

        let connected = self.connector.connect(&self.invoker, &self.policy).await;

        let readiness = {
            let mut slot = self.slot.write().unwrap_or_else(PoisonError::into_inner);
            if slot.readiness != Readiness::Connecting {
                // shut down while connecting
                return slot.readiness.clone();
            }
            match connected {
                Ok(handle) if handle.is_ready() => {
                    slot.handle = Some(handle);
                    slot.readiness = Readiness::Ready;
                }
                Ok(_) => {
                    slot.readiness =
                        Readiness::Failed("backend reported the session as not ready".to_string());
                }
                Err(err) => {
                    slot.readiness = Readiness::Failed(format!("{err:#}"));
                }
            }
            slot.readiness.clone()
        };

        match &readiness {
            Readiness::Failed(reason) => {
                warn!("caption session failed: {reason}");
                self.emit("session_failed", Some(reason));
            }
            _ => {
                info!("caption session ready");
                self.emit("session_ready", None);
            }
        }
        readiness
    }

    pub fn shutdown(&self) {
        let mut slot = self.slot.write().unwrap_or_else(PoisonError::into_inner);
        slot.handle = None;
        slot.readiness = Readiness::Uninitialized;
    }

    fn emit(&self, event_type: &str, reason: Option<&str>) {
        let Some(events) = self.events.as_ref() else {
            return;
        };
        let mut payload = event_payload! { "backend" => self.connector.backend() };
        if let Some(reason) = reason {
            payload.insert("reason".to_string(), reason.into());
        }
        if let Err(err) = events.emit(event_type, payload) {
            warn!("failed to write {event_type} event: {err:#}");
        }
    }
}

impl fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManager")
            .field("backend", &self.connector.backend())
            .field("readiness", &self.readiness())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use captionify_contracts::caption::ImagePayload;
    use captionify_contracts::events::{read_events, EventWriter};

    use super::{Readiness, SessionConnector, SessionHandle, SessionManager};
    use crate::invoker::{InvokeError, Invoker, RetryPolicy};
    use crate::test_support::ScriptedTransport;

    #[derive(Debug)]
    struct StaticHandle {
        ready: bool,
    }

    #[async_trait]
    impl SessionHandle for StaticHandle {
        fn backend(&self) -> &str {
            "static"
        }

        fn is_ready(&self) -> bool {
            self.ready
        }

        async fn describe(
            &self,
            _invoker: &Invoker,
            _image: &ImagePayload,
            _policy: &RetryPolicy,
        ) -> Result<String, InvokeError> {
            Ok("a dog".to_string())
        }
    }

    /// Pops one outcome per connect: `Ok(ready)` or `Err(reason)`.
    struct FakeConnector {
        outcomes: Mutex<VecDeque<Result<bool, String>>>,
        connects: AtomicUsize,
        delay: Duration,
    }

    impl FakeConnector {
        fn new(outcomes: Vec<Result<bool, String>>) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes.into()),
                connects: AtomicUsize::new(0),
                delay: Duration::ZERO,
            })
        }

        fn slow(outcomes: Vec<Result<bool, String>>, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes.into()),
                connects: AtomicUsize::new(0),
                delay,
            })
        }
    }

    #[async_trait]
    impl SessionConnector for FakeConnector {
        fn backend(&self) -> &str {
            "fake"
        }

        async fn connect(
            &self,
            _invoker: &Invoker,
            _policy: &RetryPolicy,
        ) -> anyhow::Result<Arc<dyn SessionHandle>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let next = self
                .outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err("no scripted outcome".to_string()));
            match next {
                Ok(ready) => Ok(Arc::new(StaticHandle { ready })),
                Err(reason) => Err(anyhow::anyhow!(reason)),
            }
        }
    }

    fn manager(connector: Arc<FakeConnector>) -> SessionManager {
        let invoker = Invoker::new(ScriptedTransport::new(Vec::new()));
        SessionManager::new(connector, invoker, RetryPolicy::default())
    }

    #[tokio::test]
    async fn starts_uninitialized_without_handle() {
        let manager = manager(FakeConnector::new(Vec::new()));
        assert_eq!(manager.readiness(), Readiness::Uninitialized);
        assert_eq!(manager.handle().unwrap_err(), Readiness::Uninitialized);
    }

    #[tokio::test]
    async fn failed_stays_failed_until_initialized_again() {
        let connector = FakeConnector::new(vec![Err("space is sleeping".to_string()), Ok(true)]);
        let manager = manager(Arc::clone(&connector));

        let first = manager.initialize().await;
        assert_eq!(first, Readiness::Failed("space is sleeping".to_string()));
        assert_eq!(manager.readiness(), first);
        assert!(manager.handle().is_err());
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);

        let second = manager.initialize().await;
        assert_eq!(second, Readiness::Ready);
        assert!(manager.handle().is_ok());
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn initialize_when_ready_is_a_no_op() {
        let connector = FakeConnector::new(vec![Ok(true)]);
        let manager = manager(Arc::clone(&connector));

        assert_eq!(manager.initialize().await, Readiness::Ready);
        assert_eq!(manager.initialize().await, Readiness::Ready);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn handle_reporting_not_ready_fails_the_session() {
        let manager = manager(FakeConnector::new(vec![Ok(false)]));
        let readiness = manager.initialize().await;
        assert!(matches!(readiness, Readiness::Failed(_)));
        assert!(manager.handle().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_initialize_reports_connecting_without_second_connect() {
        let connector = FakeConnector::slow(vec![Ok(true)], Duration::from_secs(5));
        let manager = manager(Arc::clone(&connector));

        let (first, second) = tokio::join!(manager.initialize(), async {
            tokio::task::yield_now().await;
            manager.initialize().await
        });

        assert_eq!(first, Readiness::Ready);
        assert_eq!(second, Readiness::Connecting);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn shutdown_drops_the_handle() {
        let manager = manager(FakeConnector::new(vec![Ok(true), Ok(true)]));
        manager.initialize().await;
        let handle = manager.handle().unwrap();

        manager.shutdown();

        assert_eq!(manager.readiness(), Readiness::Uninitialized);
        assert!(manager.handle().is_err());
        assert_eq!(Arc::strong_count(&handle), 1);
        assert_eq!(manager.initialize().await, Readiness::Ready);
    }

    #[tokio::test]
    async fn transitions_are_recorded_as_events() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        let manager = manager(FakeConnector::new(vec![Err("bad token".to_string()), Ok(true)]))
            .with_events(Some(EventWriter::open(&path, "s-1")?));

        manager.initialize().await;
        manager.initialize().await;

        let events = read_events(&path)?;
        let types: Vec<&str> = events
            .iter()
            .map(|event| event["type"].as_str().unwrap_or_default())
            .collect();
        assert_eq!(
            types,
            vec![
                "session_connecting",
                "session_failed",
                "session_connecting",
                "session_ready"
            ]
        );
        Ok(())
    }

    #[test]
    fn readiness_display_is_lowercase_with_reason() {
        assert_eq!(Readiness::Uninitialized.to_string(), "uninitialized");
        assert_eq!(Readiness::Connecting.to_string(), "connecting");
        assert_eq!(
            Readiness::Failed("timeout".to_string()).to_string(),
            "failed: timeout"
        );
    }
}
