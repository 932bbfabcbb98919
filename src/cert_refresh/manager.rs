//! Certificate refresh scheduling and execution
//!
//! The manager keeps exactly one timer armed for the next refresh. A fresh
//! certificate reschedules at its expiry minus a safety margin; failures back
//! off with a doubling interval; a throttling response reschedules at the
//! server-provided delay. An expired API session halts the manager until the
//! app renews the session.

use super::scheduler::ScheduledTask;
use super::{CertRefreshError, CertRefreshResult};
use crate::api::types::{ApiError, StoredCertificate, VpnCertificate};
use crate::api::ApiClient;
use crate::features::ConnectionFeatures;
use crate::storage::SessionStorage;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

/// Refresh this long before the certificate expires.
const REFRESH_MARGIN_SECS: i64 = 60;
const INITIAL_RETRY_INTERVAL: Duration = Duration::from_secs(10);
/// Used when a throttling response carries no Retry-After.
const DEFAULT_THROTTLE_SECS: i64 = 30;

fn refresh_point(certificate: &StoredCertificate) -> DateTime<Utc> {
    certificate.valid_until - chrono::Duration::seconds(REFRESH_MARGIN_SECS)
}

/// Delay until the next refresh should run. No certificate means refresh
/// immediately; a certificate already inside the margin clamps to zero.
fn refresh_delay(certificate: Option<&StoredCertificate>, now: DateTime<Utc>) -> Duration {
    let Some(certificate) = certificate else {
        return Duration::ZERO;
    };
    let due_at = refresh_point(certificate);
    if due_at <= now {
        Duration::ZERO
    } else {
        (due_at - now).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Whether a refresh is due right now: no certificate, a feature set other
/// than the one the certificate was issued for, or past the refresh point.
fn certificate_needs_refresh(
    certificate: Option<&StoredCertificate>,
    desired_features: Option<&ConnectionFeatures>,
    now: DateTime<Utc>,
) -> bool {
    let Some(certificate) = certificate else {
        return true;
    };
    if let Some(desired) = desired_features {
        if certificate.features.as_ref() != Some(desired) {
            return true;
        }
    }
    now >= refresh_point(certificate)
}

/// Next backoff interval: starts at [`INITIAL_RETRY_INTERVAL`] and doubles
/// on every consecutive failure. Unbounded on purpose; the interval resets
/// on success and on process restart.
fn next_retry_interval(previous: Option<Duration>) -> Duration {
    match previous {
        None => INITIAL_RETRY_INTERVAL,
        Some(interval) => interval.saturating_mul(2),
    }
}

struct RefreshInner {
    api: ApiClient,
    storage: Arc<dyn SessionStorage>,
    features: Mutex<Option<ConnectionFeatures>>,
    last_retry_interval: Mutex<Option<Duration>>,
    timer: Mutex<Option<ScheduledTask>>,
    session_expired: AtomicBool,
    stopped: AtomicBool,
    /// Serializes actual refresh runs; timer fires and provider messages may
    /// race.
    in_flight: tokio::sync::Mutex<()>,
}

/// Owns the refresh timer and runs certificate refreshes against the API.
/// Clones share one timer; dropping the last clone cancels it.
#[derive(Clone)]
pub struct CertificateRefreshManager {
    inner: Arc<RefreshInner>,
}

impl CertificateRefreshManager {
    pub fn new(api: ApiClient, storage: Arc<dyn SessionStorage>) -> Self {
        Self {
            inner: Arc::new(RefreshInner {
                api,
                storage,
                features: Mutex::new(None),
                last_retry_interval: Mutex::new(None),
                timer: Mutex::new(None),
                session_expired: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                in_flight: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Features the next certificate should be issued for. A change makes
    /// the current certificate stale regardless of its expiry.
    pub fn set_features(&self, features: Option<ConnectionFeatures>) {
        if let Ok(mut guard) = self.inner.features.lock() {
            *guard = features;
        }
    }

    fn features(&self) -> Option<ConnectionFeatures> {
        self.inner.features.lock().ok().and_then(|guard| guard.clone())
    }

    /// Arm the timer and keep refreshing until stopped.
    pub fn start(&self) {
        self.inner.stopped.store(false, Ordering::SeqCst);
        info!("Certificate refresh manager started");
        self.plan_next_refresh();
    }

    /// Disarm the timer. Refreshes stay off until [`start`] is called again.
    ///
    /// [`start`]: CertificateRefreshManager::start
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.cancel_timer();
        info!("Certificate refresh manager stopped");
    }

    /// The app renewed the API session (new credentials are already in
    /// storage): lift the halt and refresh on the regular schedule again.
    pub fn session_renewed(&self) {
        self.inner.session_expired.store(false, Ordering::SeqCst);
        self.reset_retry_interval();
        info!("API session renewed, resuming certificate refreshes");
        self.plan_next_refresh();
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    pub fn is_session_expired(&self) -> bool {
        self.inner.session_expired.load(Ordering::SeqCst)
    }

    /// True while a refresh is scheduled and has not fired yet.
    pub fn is_scheduled(&self) -> bool {
        self.inner
            .timer
            .lock()
            .map(|timer| {
                timer
                    .as_ref()
                    .map(|task| !task.is_finished())
                    .unwrap_or(false)
            })
            .unwrap_or(false)
    }

    /// Schedule the next refresh from the stored certificate. Replaces any
    /// previously armed timer. Must run within the tokio runtime.
    pub fn plan_next_refresh(&self) {
        if self.inner.stopped.load(Ordering::SeqCst)
            || self.inner.session_expired.load(Ordering::SeqCst)
        {
            return;
        }

        let certificate = self.inner.storage.fetch_certificate();
        let delay = refresh_delay(certificate.as_ref(), Utc::now());
        debug!("Next certificate refresh in {:?}", delay);
        self.schedule_refresh(delay);
    }

    /// Refresh if one is due. Re-validates due-ness first since another path
    /// (the app, an earlier timer) may have refreshed in the meantime; when
    /// nothing is due the timer is replanned instead.
    pub async fn refresh_if_needed(&self) -> CertRefreshResult<()> {
        let _guard = self.inner.in_flight.lock().await;

        if self.inner.stopped.load(Ordering::SeqCst) {
            return Err(CertRefreshError::Stopped);
        }
        if self.inner.session_expired.load(Ordering::SeqCst) {
            return Err(CertRefreshError::SessionExpired);
        }

        let certificate = self.inner.storage.fetch_certificate();
        let features = self.features();
        if !certificate_needs_refresh(certificate.as_ref(), features.as_ref(), Utc::now()) {
            debug!("Certificate still valid, replanning instead of refreshing");
            self.plan_next_refresh();
            return Ok(());
        }

        self.refresh_now(features).await
    }

    async fn refresh_now(&self, features: Option<ConnectionFeatures>) -> CertRefreshResult<()> {
        match self.request_certificate(features.clone()).await {
            Ok(certificate) => {
                let stored = StoredCertificate::from_response(&certificate, features);
                if let Err(e) = self.inner.storage.store_certificate(&stored) {
                    warn!("Failed to persist refreshed certificate: {}", e);
                }
                self.reset_retry_interval();
                info!("Certificate refreshed, valid until {}", stored.valid_until);
                self.plan_next_refresh();
                Ok(())
            }
            Err(CertRefreshError::NeedNewKeys) => {
                // Key generation is the app's job; a timer retry cannot fix it
                warn!("Certificate refresh requires new device keys");
                Err(CertRefreshError::NeedNewKeys)
            }
            Err(CertRefreshError::SessionExpired) => {
                warn!("API session expired, halting certificate refreshes");
                self.inner.session_expired.store(true, Ordering::SeqCst);
                self.cancel_timer();
                Err(CertRefreshError::SessionExpired)
            }
            Err(CertRefreshError::TooManyCertRequests { retry_after }) => {
                let secs = retry_after.unwrap_or(DEFAULT_THROTTLE_SECS).max(0) as u64;
                let delay = Duration::from_secs(secs);
                warn!("Certificate requests throttled, next attempt in {:?}", delay);
                // Server-directed delay; the doubling state is left untouched
                self.schedule_refresh(delay);
                Err(CertRefreshError::TooManyCertRequests { retry_after })
            }
            Err(err) => {
                let interval = self.advance_retry_interval();
                warn!(
                    "Certificate refresh failed ({}), retrying in {:?}",
                    err, interval
                );
                self.schedule_refresh(interval);
                Err(err)
            }
        }
    }

    async fn request_certificate(
        &self,
        features: Option<ConnectionFeatures>,
    ) -> CertRefreshResult<VpnCertificate> {
        let Some(keys) = self.inner.storage.fetch_keys() else {
            return Err(CertRefreshError::NeedNewKeys);
        };

        match self
            .inner
            .api
            .refresh_certificate(&keys.public_key, features)
            .await
        {
            Ok(certificate) => Ok(certificate),
            Err(ApiError::SessionExpired) | Err(ApiError::NoCredentials) => {
                Err(CertRefreshError::SessionExpired)
            }
            Err(ApiError::TooManyRequests { retry_after }) => {
                Err(CertRefreshError::TooManyCertRequests { retry_after })
            }
            Err(err) => Err(CertRefreshError::Api(err)),
        }
    }

    fn schedule_refresh(&self, delay: Duration) {
        // The callback keeps a weak handle so an armed timer never keeps the
        // manager alive
        let weak = Arc::downgrade(&self.inner);
        let task = ScheduledTask::schedule(delay, move || Self::on_timer_fired(weak));

        if let Ok(mut timer) = self.inner.timer.lock() {
            // Replacing drops, and thereby cancels, the previous task
            *timer = Some(task);
        }
    }

    async fn on_timer_fired(weak: Weak<RefreshInner>) {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        let manager = CertificateRefreshManager { inner };

        if manager.is_stopped() || manager.is_session_expired() {
            return;
        }
        if let Err(e) = manager.refresh_if_needed().await {
            debug!("Scheduled certificate refresh did not complete: {}", e);
        }
    }

    fn cancel_timer(&self) {
        if let Ok(mut timer) = self.inner.timer.lock() {
            *timer = None;
        }
    }

    fn advance_retry_interval(&self) -> Duration {
        let mut guard = match self.inner.last_retry_interval.lock() {
            Ok(guard) => guard,
            Err(_) => return INITIAL_RETRY_INTERVAL,
        };
        let next = next_retry_interval(*guard);
        *guard = Some(next);
        next
    }

    fn reset_retry_interval(&self) {
        if let Ok(mut guard) = self.inner.last_retry_interval.lock() {
            *guard = None;
        }
    }
}
