//! Session lifecycle: login, periodic silent renewal, logout.
//!
//! `SessionManager` owns the only mutable copy of the session. Every state
//! change goes through its lock and is persisted before the lock is released;
//! the lock is never held across an upstream call.
//!
//! Two counters keep overlapping work honest:
//! - `generation` moves on every login and logout. A renewal remembers the
//!   generation it started under and drops its result if that has changed,
//!   so a logout can never be undone by a late renewal.
//! - `timer_id` identifies the one renewal timer belonging to the live
//!   session. A timer that finds itself superseded exits.

use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::api::{ApiError, Upstream};
use crate::config::SessionSettings;
use crate::models::{PolicyDocument, TicketImage, TicketRecord};

use super::session::{
    now_secs, AuthState, Freshness, PersistedSession, SessionData, SessionStore,
};
use super::vault::{PasswordVault, SealedSecret};

/// Buffer size for the session event channel
const EVENT_BUFFER_SIZE: usize = 16;

/// Check interval used when the configured one is zero
const MIN_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Notifications for the UI collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The token was silently replaced.
    Renewed { expires_at: i64 },
    /// The session is gone; the caller should send the user to the login screen.
    LoginRequired { reason: String },
}

/// What a single periodic check did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenewalOutcome {
    Unauthenticated,
    NotNeeded,
    /// Another renewal is already running.
    InFlight,
    Renewed { expires_at: i64 },
    /// The session changed (logout or a fresh login) while renewing.
    Discarded,
    LoggedOut { reason: String },
}

/// Read-only view of the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct SessionSnapshot {
    pub is_authenticated: bool,
    pub username: Option<String>,
    pub token: Option<String>,
    pub expires_at: Option<i64>,
    pub remember_credential: bool,
    pub state: AuthState,
}

impl SessionSnapshot {
    fn of(session: Option<&SessionData>, now: i64, threshold: Duration) -> Self {
        match session {
            None => Self {
                is_authenticated: false,
                username: None,
                token: None,
                expires_at: None,
                remember_credential: false,
                state: AuthState::Unauthenticated,
            },
            Some(data) => Self {
                is_authenticated: true,
                username: Some(data.username.clone()),
                token: Some(data.token.clone()),
                expires_at: Some(data.token_expires_at),
                remember_credential: data.remember_credential,
                state: AuthState::Authenticated(data.freshness(now, threshold)),
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoginResult {
    pub session: SessionSnapshot,
    pub documents_to_accept: Vec<PolicyDocument>,
}

#[derive(Default)]
struct ManagerState {
    session: Option<SessionData>,
    generation: u64,
    /// Generation of the renewal currently in flight, if any.
    renewing: Option<u64>,
    timer: Option<JoinHandle<()>>,
    timer_id: u64,
}

struct Inner {
    upstream: Arc<dyn Upstream>,
    store: SessionStore,
    vault: PasswordVault,
    settings: SessionSettings,
    state: Mutex<ManagerState>,
    events: mpsc::Sender<SessionEvent>,
    /// Woken whenever an in-flight renewal is settled.
    renewal_done: Notify,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(timer) = self.state.get_mut().timer.take() {
            timer.abort();
        }
    }
}

/// Clone is cheap - clones share one session.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    /// Restore the persisted session (if still usable) and start its
    /// renewal timer. Must be called inside a Tokio runtime.
    pub async fn start(
        upstream: Arc<dyn Upstream>,
        store: SessionStore,
        vault: PasswordVault,
        mut settings: SessionSettings,
    ) -> (Self, mpsc::Receiver<SessionEvent>) {
        if settings.check_interval.is_zero() {
            warn!(
                fallback_secs = MIN_CHECK_INTERVAL.as_secs(),
                "Renewal check interval must be positive"
            );
            settings.check_interval = MIN_CHECK_INTERVAL;
        }

        let (tx, rx) = mpsc::channel(EVENT_BUFFER_SIZE);
        let session = Self::restore(&store);

        let manager = Self {
            inner: Arc::new(Inner {
                upstream,
                store,
                vault,
                settings,
                state: Mutex::new(ManagerState {
                    session,
                    ..ManagerState::default()
                }),
                events: tx,
                renewal_done: Notify::new(),
            }),
        };

        {
            let mut state = manager.inner.state.lock().await;
            if state.session.is_some() {
                manager.ensure_timer(&mut state);
            }
        }

        (manager, rx)
    }

    fn restore(store: &SessionStore) -> Option<SessionData> {
        let record = match store.load() {
            Ok(Some(record)) => record,
            Ok(None) => return None,
            Err(e) => {
                warn!(error = %e, "Discarding unreadable session");
                Self::clear_store(store);
                return None;
            }
        };

        let Some(data) = record.into_session() else {
            debug!("Persisted session is not authenticated");
            Self::clear_store(store);
            return None;
        };

        if data.is_expired(now_secs()) && !data.can_renew() {
            info!(username = %data.username, "Stored session expired");
            Self::clear_store(store);
            return None;
        }

        debug!(
            username = %data.username,
            expires_at = data.token_expires_at,
            remember = data.remember_credential,
            "Session restored"
        );
        Some(data)
    }

    fn clear_store(store: &SessionStore) {
        if let Err(e) = store.clear() {
            warn!(error = %e, "Failed to remove session file");
        }
    }

    fn persist(&self, state: &ManagerState) {
        let result = match state.session.as_ref() {
            Some(data) => self.inner.store.save(&PersistedSession::from(data)),
            None => self.inner.store.clear(),
        };
        if let Err(e) = result {
            warn!(error = %e, "Failed to persist session");
        }
    }

    // =========================================================================
    // Timer
    // =========================================================================

    fn ensure_timer(&self, state: &mut ManagerState) {
        if state.timer.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        state.timer_id += 1;
        state.timer = Some(Self::spawn_timer(
            Arc::downgrade(&self.inner),
            self.inner.settings.check_interval,
            state.timer_id,
        ));
    }

    /// Retire the current timer. `abort` cancels it outright; otherwise it is
    /// detached and exits on its next tick.
    fn stop_timer(state: &mut ManagerState, abort: bool) {
        state.timer_id += 1;
        if let Some(timer) = state.timer.take() {
            if abort {
                timer.abort();
            }
        }
    }

    fn spawn_timer(inner: Weak<Inner>, period: Duration, id: u64) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                let manager = SessionManager { inner };

                if manager.inner.state.lock().await.timer_id != id {
                    break;
                }

                match manager.check_now().await {
                    RenewalOutcome::Unauthenticated | RenewalOutcome::LoggedOut { .. } => break,
                    outcome => debug!(?outcome, "Renewal check"),
                }
            }
            debug!(id, "Renewal timer stopped");
        })
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Authenticate interactively. On failure nothing changes and the
    /// upstream's message is returned.
    pub async fn login(
        &self,
        username: &str,
        password: &str,
        remember: bool,
    ) -> Result<LoginResult, ApiError> {
        if username.trim().is_empty() || password.is_empty() {
            return Err(ApiError::Validation(
                "Username and password are required".to_string(),
            ));
        }

        let grant = match self.inner.upstream.authenticate(username, password).await {
            Ok(grant) => grant,
            Err(e) => {
                warn!(username = %username, error = %e, "Login failed");
                return Err(e);
            }
        };

        let sealed = if remember {
            match self.inner.vault.seal(password) {
                Ok(sealed) => Some(sealed),
                Err(e) => {
                    warn!(error = %e, "Could not protect password; it will not be remembered");
                    None
                }
            }
        } else {
            None
        };

        let data = SessionData {
            username: username.to_string(),
            token: grant.token,
            token_expires_at: grant.expires_at,
            remember_credential: sealed.is_some(),
            password: sealed,
        };

        let mut state = self.inner.state.lock().await;
        state.session = Some(data);
        state.generation += 1;
        state.renewing = None;
        self.persist(&state);
        self.ensure_timer(&mut state);

        info!(username = %username, expires_at = grant.expires_at, remember, "Login successful");

        Ok(LoginResult {
            session: SessionSnapshot::of(
                state.session.as_ref(),
                now_secs(),
                self.inner.settings.renewal_threshold,
            ),
            documents_to_accept: grant.documents_to_accept,
        })
    }

    /// Drop the session and everything persisted for it. Idempotent.
    pub async fn logout(&self) {
        let mut state = self.inner.state.lock().await;
        let was_authenticated = state.session.is_some();
        self.clear(&mut state, true);
        if was_authenticated {
            info!("Logged out");
        }
    }

    fn clear(&self, state: &mut ManagerState, abort_timer: bool) {
        state.session = None;
        state.generation += 1;
        state.renewing = None;
        Self::stop_timer(state, abort_timer);
        self.persist(state);
        self.inner.renewal_done.notify_waiters();
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        let state = self.inner.state.lock().await;
        SessionSnapshot::of(
            state.session.as_ref(),
            now_secs(),
            self.inner.settings.renewal_threshold,
        )
    }

    /// Username and token for an upstream call, if the token is unexpired.
    pub async fn credentials(&self) -> Result<(String, String), ApiError> {
        let state = self.inner.state.lock().await;
        match state.session.as_ref() {
            Some(data) if !data.is_expired(now_secs()) => {
                Ok((data.username.clone(), data.token.clone()))
            }
            _ => Err(ApiError::Unauthorized),
        }
    }

    /// Like `credentials`, but reconciles an expired token first, waiting
    /// out a renewal that is already running.
    async fn usable_credentials(&self) -> Result<(String, String), ApiError> {
        if let Ok(credentials) = self.credentials().await {
            return Ok(credentials);
        }

        let settled = self.inner.renewal_done.notified();
        tokio::pin!(settled);
        settled.as_mut().enable();

        if self.check_now().await == RenewalOutcome::InFlight {
            debug!("Waiting for the renewal in flight");
            settled.await;
        }
        self.credentials().await
    }

    pub async fn list_tickets(&self) -> Result<Vec<TicketRecord>, ApiError> {
        let (username, token) = self.usable_credentials().await?;
        self.inner.upstream.list_orders(&username, &token).await
    }

    pub async fn fetch_ticket_image(&self, document_id: &str) -> Result<TicketImage, ApiError> {
        let (username, token) = self.usable_credentials().await?;
        self.inner
            .upstream
            .fetch_ticket_image(&username, &token, document_id)
            .await
    }

    /// Run one renewal check now. This is what the timer does on every tick.
    pub async fn check_now(&self) -> RenewalOutcome {
        let now = now_secs();
        let threshold = self.inner.settings.renewal_threshold;

        let (generation, username, sealed) = {
            let mut state = self.inner.state.lock().await;
            let Some(data) = state.session.as_ref() else {
                return RenewalOutcome::Unauthenticated;
            };
            let freshness = data.freshness(now, threshold);
            let renewable = data.can_renew();
            let username = data.username.clone();
            let sealed = data.password.clone();

            let sealed = match (renewable, sealed, freshness) {
                (true, Some(sealed), Freshness::Stale | Freshness::Expired) => sealed,
                (false, _, Freshness::Expired) | (true, None, Freshness::Expired) => {
                    info!(username = %username, "Session expired and cannot be renewed");
                    self.clear(&mut state, false);
                    drop(state);
                    return self.force_login("Session expired");
                }
                _ => return RenewalOutcome::NotNeeded,
            };

            if state.renewing == Some(state.generation) {
                debug!("Renewal already in flight");
                return RenewalOutcome::InFlight;
            }
            state.renewing = Some(state.generation);
            (state.generation, username, sealed)
        };

        // Runs on its own task so a cancelled caller cannot strand `renewing`
        let renewal = tokio::spawn({
            let manager = self.clone();
            async move { manager.renew(generation, username, sealed).await }
        });

        match renewal.await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(error = %e, "Renewal task failed");
                let mut state = self.inner.state.lock().await;
                if state.renewing == Some(generation) {
                    state.renewing = None;
                }
                drop(state);
                self.inner.renewal_done.notify_waiters();
                RenewalOutcome::Discarded
            }
        }
    }

    async fn renew(&self, generation: u64, username: String, sealed: SealedSecret) -> RenewalOutcome {
        let outcome = self.settle_renewal(generation, &username, &sealed).await;
        self.inner.renewal_done.notify_waiters();
        outcome
    }

    async fn settle_renewal(
        &self,
        generation: u64,
        username: &str,
        sealed: &SealedSecret,
    ) -> RenewalOutcome {
        debug!(username = %username, "Renewing session");
        let result = match self.inner.vault.open(sealed) {
            Ok(password) => self.inner.upstream.authenticate(username, &password).await,
            Err(e) => Err(ApiError::Internal(format!("stored password unusable: {}", e))),
        };

        let mut state = self.inner.state.lock().await;
        if state.renewing == Some(generation) {
            state.renewing = None;
        }
        if state.generation != generation || state.session.is_none() {
            debug!("Discarding renewal result; session changed meanwhile");
            return RenewalOutcome::Discarded;
        }

        match result {
            Ok(grant) => {
                let expires_at = grant.expires_at;
                if let Some(data) = state.session.as_mut() {
                    data.token = grant.token;
                    data.token_expires_at = expires_at;
                }
                self.persist(&state);
                drop(state);
                info!(username = %username, expires_at, "Session renewed");
                self.emit(SessionEvent::Renewed { expires_at });
                RenewalOutcome::Renewed { expires_at }
            }
            Err(e) => {
                error!(username = %username, error = %e, "Silent renewal failed, logging out");
                self.clear(&mut state, false);
                drop(state);
                self.force_login(&format!("Session renewal failed: {}", e))
            }
        }
    }

    fn force_login(&self, reason: &str) -> RenewalOutcome {
        self.emit(SessionEvent::LoginRequired {
            reason: reason.to_string(),
        });
        RenewalOutcome::LoggedOut {
            reason: reason.to_string(),
        }
    }

    fn emit(&self, event: SessionEvent) {
        match self.inner.events.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(?event, "Session event dropped; listener is not keeping up");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("No session event listener");
            }
        }
    }
}
