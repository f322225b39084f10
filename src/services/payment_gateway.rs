use crate::{config::GatewayConfig, errors::ServiceError};
use chrono::Utc;
use rust_decimal::{prelude::ToPrimitive, Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::{Validate, ValidationError};

fn validate_positive_decimal(value: &Decimal) -> Result<(), ValidationError> {
    if *value > Decimal::ZERO {
        Ok(())
    } else {
        let mut err = ValidationError::new("range");
        err.message = Some("Amount must be greater than 0".into());
        Err(err)
    }
}

/// Time source for the verification cache. Injectable so tests can drive
/// TTL expiry deterministically.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Wall-clock time, the production default.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock advanced by hand. Test support.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<Instant>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Mutex::new(Instant::now()),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock().unwrap()
    }
}

/// Result of verifying a gateway reference. `data` carries the raw gateway
/// payload for audit trails.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationOutcome {
    pub reference: String,
    pub verified: bool,
    pub data: Value,
}

struct CacheSlot {
    outcome: VerificationOutcome,
    cached_at: Instant,
}

/// Short-TTL memo of verification results, owned by the gateway service
/// instance rather than a module-level singleton.
///
/// Process-local with no cross-process invalidation: acceptable because a
/// reference the gateway marked successful is immutable afterwards. Expired
/// entries are retained for degraded-mode fallback when the gateway is
/// unreachable.
pub struct VerificationCache {
    slots: RwLock<HashMap<String, CacheSlot>>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl VerificationCache {
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            ttl,
            clock,
        }
    }

    /// Entry younger than the TTL, if any.
    fn fresh(&self, reference: &str) -> Option<VerificationOutcome> {
        let slots = self.slots.read().unwrap();
        slots.get(reference).and_then(|slot| {
            if self.clock.now().duration_since(slot.cached_at) < self.ttl {
                Some(slot.outcome.clone())
            } else {
                None
            }
        })
    }

    /// Any entry regardless of age. Used only as a fallback when the
    /// gateway cannot be reached.
    fn any(&self, reference: &str) -> Option<VerificationOutcome> {
        let slots = self.slots.read().unwrap();
        slots.get(reference).map(|slot| slot.outcome.clone())
    }

    fn put(&self, outcome: VerificationOutcome) {
        let mut slots = self.slots.write().unwrap();
        slots.insert(
            outcome.reference.clone(),
            CacheSlot {
                outcome,
                cached_at: self.clock.now(),
            },
        );
    }
}

/// Request to initiate a payment at the gateway
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct InitiateRequest {
    #[validate(email)]
    pub email: String,
    #[validate(custom = "validate_positive_decimal")]
    pub amount: Decimal,
    pub callback_url: String,
    #[serde(default)]
    pub metadata: Option<Value>,
}

/// A payment intent created at the gateway
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitiatedPayment {
    pub reference: String,
    pub authorization_url: String,
}

#[derive(Debug, Serialize)]
struct InitializeBody<'a> {
    email: &'a str,
    /// Amount in the gateway's minor unit (e.g. cents).
    amount: i64,
    reference: &'a str,
    callback_url: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    metadata: Option<&'a Value>,
}

#[derive(Debug, Deserialize)]
struct InitializeResponse {
    status: bool,
    #[serde(default)]
    message: String,
    data: Option<InitializeData>,
}

#[derive(Debug, Deserialize)]
struct InitializeData {
    authorization_url: String,
    reference: String,
}

/// Adapter for the external payment gateway REST API.
///
/// All calls are bounded by the configured HTTP timeout; `verify` consults
/// the per-instance [`VerificationCache`] before going to the network and
/// degrades to a stale cached result when the gateway is down.
pub struct PaymentGatewayService {
    http: reqwest::Client,
    base_url: String,
    secret_key: String,
    cache: VerificationCache,
}

impl PaymentGatewayService {
    pub fn new(config: &GatewayConfig) -> Result<Self, ServiceError> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: &GatewayConfig, clock: Arc<dyn Clock>) -> Result<Self, ServiceError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.verify_timeout_secs))
            .build()
            .map_err(|e| ServiceError::InternalError(format!("http client: {}", e)))?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            secret_key: config.secret_key.clone(),
            cache: VerificationCache::new(
                Duration::from_secs(config.verification_cache_ttl_secs),
                clock,
            ),
        })
    }

    /// Creates a payment intent at the gateway and returns the redirect URL
    /// the customer completes the charge at.
    ///
    /// Amounts are converted to the gateway's minor unit here and nowhere
    /// else; the rest of the system deals in major units only.
    #[instrument(skip(self, request), fields(email = %request.email, amount = %request.amount))]
    pub async fn initiate(
        &self,
        request: InitiateRequest,
    ) -> Result<InitiatedPayment, ServiceError> {
        request.validate()?;

        let amount_minor = to_minor_units(request.amount)?;
        let reference = generate_reference();

        let body = InitializeBody {
            email: &request.email,
            amount: amount_minor,
            reference: &reference,
            callback_url: &request.callback_url,
            metadata: request.metadata.as_ref(),
        };

        let response = self
            .http
            .post(format!("{}/transaction/initialize", self.base_url))
            .bearer_auth(&self.secret_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ServiceError::ExternalService(format!("gateway initialize: {}", e)))?;

        if !response.status().is_success() {
            return Err(ServiceError::ExternalService(format!(
                "gateway initialize returned {}",
                response.status()
            )));
        }

        let parsed: InitializeResponse = response
            .json()
            .await
            .map_err(|e| ServiceError::ExternalService(format!("gateway initialize body: {}", e)))?;

        let data = match (parsed.status, parsed.data) {
            (true, Some(data)) => data,
            _ => {
                return Err(ServiceError::PaymentVerification(format!(
                    "gateway rejected initialization: {}",
                    parsed.message
                )))
            }
        };

        info!(reference = %data.reference, "payment intent created");
        Ok(InitiatedPayment {
            reference: data.reference,
            authorization_url: data.authorization_url,
        })
    }

    /// Verifies a completed payment against the gateway.
    ///
    /// Cache-first: a fresh entry short-circuits the network call entirely.
    /// On a gateway failure a stale entry (even expired) is returned as a
    /// degraded-mode fallback — availability over freshness, since a
    /// confirmed reference cannot become unconfirmed. Only with no cached
    /// entry at all does the caller see a retryable error.
    #[instrument(skip(self))]
    pub async fn verify(&self, reference: &str) -> Result<VerificationOutcome, ServiceError> {
        if let Some(hit) = self.cache.fresh(reference) {
            return Ok(hit);
        }

        match self.fetch_verification(reference).await {
            Ok(outcome) => {
                self.cache.put(outcome.clone());
                Ok(outcome)
            }
            Err(err) => {
                if let Some(stale) = self.cache.any(reference) {
                    warn!(
                        reference = %reference,
                        error = %err,
                        "gateway verify failed, serving stale cached result"
                    );
                    return Ok(stale);
                }
                Err(err)
            }
        }
    }

    async fn fetch_verification(
        &self,
        reference: &str,
    ) -> Result<VerificationOutcome, ServiceError> {
        let response = self
            .http
            .get(format!("{}/transaction/verify/{}", self.base_url, reference))
            .bearer_auth(&self.secret_key)
            .send()
            .await
            .map_err(|e| ServiceError::ExternalService(format!("gateway verify: {}", e)))?;

        if !response.status().is_success() {
            return Err(ServiceError::ExternalService(format!(
                "gateway verify returned {}",
                response.status()
            )));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| ServiceError::ExternalService(format!("gateway verify body: {}", e)))?;

        if payload.get("status").and_then(Value::as_bool) != Some(true) {
            return Err(ServiceError::PaymentVerification(format!(
                "gateway could not verify reference {}",
                reference
            )));
        }

        let verified = payload
            .pointer("/data/status")
            .and_then(Value::as_str)
            .map(|s| s == "success")
            .unwrap_or(false);

        Ok(VerificationOutcome {
            reference: reference.to_string(),
            verified,
            data: payload,
        })
    }
}

/// Converts a major-unit amount to the gateway's integer minor unit,
/// rounding to the nearest minor unit. Zero and negative amounts are
/// rejected before any network traffic.
fn to_minor_units(amount: Decimal) -> Result<i64, ServiceError> {
    if amount <= Decimal::ZERO {
        return Err(ServiceError::ValidationError(
            "Amount must be greater than 0".to_string(),
        ));
    }

    // Half-up: midpoints round away from zero, never to the nearest even.
    (amount * Decimal::from(100))
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
        .ok_or_else(|| ServiceError::ValidationError("Amount out of range".to_string()))
}

fn generate_reference() -> String {
    let timestamp = Utc::now().format("%Y%m%d");
    let random = Uuid::new_v4()
        .simple()
        .to_string()
        .chars()
        .take(12)
        .collect::<String>()
        .to_uppercase();
    format!("TXN-{}-{}", timestamp, random)
}
