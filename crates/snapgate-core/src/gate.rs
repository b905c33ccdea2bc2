//! Admission gate.
//!
//! `Start -> KeyDerived -> CacheChecked{Hit|Miss}`; a hit ends in
//! [`Admission::AlreadyExists`] without any authorization. A miss goes through
//! expiry and signature checks (when a secret is configured), then claims the
//! object so at most one render per key is in flight, and ends in
//! [`Admission::Admitted`]. The store is checked again once the claim is held,
//! since another request may have finished the object in the meantime.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;

use crate::cache_key::{key_for_request, KeyScope, ObjectName};
use crate::canonical::canonicalize;
use crate::error::{GateError, GateResult};
use crate::expiry::{check_expiry_with_skew, Clock, ExpiryCheck, SystemClock};
use crate::render::{RenderError, RenderSpec, Renderer};
use crate::request::{RenderRequest, Viewport};
use crate::signature::verify;
use crate::store::{BlobStore, ClaimToken};

/// Read-only deployment settings handed to the gate at construction.
#[derive(Debug, Clone)]
pub struct GateConfig {
    pub secret: Option<String>,
    /// Refuse to run open mode: a missing secret becomes a configuration error.
    pub require_signature: bool,
    pub key_prefix: String,
    pub default_viewport: Viewport,
    pub key_scope: KeyScope,
    pub clock_skew_ms: u64,
    pub claim_ttl: Duration,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            secret: None,
            require_signature: false,
            key_prefix: "screenshots".to_string(),
            default_viewport: Viewport::default(),
            key_scope: KeyScope::default(),
            clock_skew_ms: 0,
            claim_ttl: Duration::from_secs(120),
        }
    }
}

impl GateConfig {
    fn signing_secret(&self) -> GateResult<Option<&str>> {
        match self.secret.as_deref().filter(|secret| !secret.is_empty()) {
            Some(secret) => Ok(Some(secret)),
            None if self.require_signature => Err(GateError::Config(
                "signed requests are required but no secret is configured".into(),
            )),
            None => Ok(None),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorizationDecision {
    NotRequired,
    Authorized,
    Expired,
    InvalidSignature,
    Malformed,
}

impl AuthorizationDecision {
    fn rejection(self) -> Option<GateError> {
        match self {
            AuthorizationDecision::NotRequired | AuthorizationDecision::Authorized => None,
            AuthorizationDecision::Expired => Some(GateError::Expired),
            AuthorizationDecision::InvalidSignature => Some(GateError::InvalidSignature),
            AuthorizationDecision::Malformed => Some(GateError::malformed(
                "`sig` and `expireAt` parameters are required and `expireAt` must be an integer (?sig=<>&expireAt=<timestamp>)",
            )),
        }
    }
}

#[derive(Debug)]
pub enum Admission {
    AlreadyExists(ObjectName),
    Admitted(AdmissionTicket),
}

/// Releases a render claim. Dropping a guard that was never released hands the
/// release to the runtime, so an abandoned render frees its object right away
/// instead of blocking it until the claim lapses.
struct ClaimGuard {
    store: Arc<dyn BlobStore>,
    object: ObjectName,
    token: Option<ClaimToken>,
}

impl ClaimGuard {
    async fn release(mut self) {
        if let Some(token) = self.token.take() {
            if let Err(err) = self.store.release(&self.object, &token).await {
                tracing::warn!("failed to release claim on {}: {}", self.object, err);
            }
        }
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        let Some(token) = self.token.take() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(
                "no runtime to release abandoned claim on {}; it lapses after its ttl",
                self.object
            );
            return;
        };

        tracing::info!("releasing abandoned claim on {}", self.object);
        let store = Arc::clone(&self.store);
        let object = self.object.clone();
        runtime.spawn(async move {
            if let Err(err) = store.release(&object, &token).await {
                tracing::warn!("failed to release abandoned claim on {}: {}", object, err);
            }
        });
    }
}

impl fmt::Debug for ClaimGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClaimGuard")
            .field("object", &self.object)
            .field("token", &self.token)
            .finish()
    }
}

/// Proof that a request passed the gate and holds the render claim for its
/// object. Consumed by [`AdmissionGate::fulfil`]; dropping it unfulfilled
/// releases the claim.
#[derive(Debug)]
pub struct AdmissionTicket {
    object: ObjectName,
    spec: RenderSpec,
    authorization: AuthorizationDecision,
    claim: ClaimGuard,
}

impl AdmissionTicket {
    pub fn object(&self) -> &ObjectName {
        &self.object
    }

    pub fn spec(&self) -> &RenderSpec {
        &self.spec
    }

    pub fn authorization(&self) -> AuthorizationDecision {
        self.authorization
    }
}

/// Wire-facing result: `{ "objectName": ..., "created": ... }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GateOutcome {
    pub object_name: ObjectName,
    pub created: bool,
}

#[derive(Clone)]
pub struct AdmissionGate {
    config: Arc<GateConfig>,
    store: Arc<dyn BlobStore>,
    clock: Arc<dyn Clock>,
}

impl AdmissionGate {
    pub fn new(config: GateConfig, store: Arc<dyn BlobStore>) -> Self {
        Self::with_clock(config, store, Arc::new(SystemClock))
    }

    pub fn with_clock(config: GateConfig, store: Arc<dyn BlobStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            config: Arc::new(config),
            store,
            clock,
        }
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    pub fn object_name(&self, request: &RenderRequest) -> ObjectName {
        let key = key_for_request(request, self.config.key_scope);
        ObjectName::new(&self.config.key_prefix, &key)
    }

    /// Authorization step alone. Only a configuration problem is an `Err`;
    /// every request-level outcome is a decision.
    pub fn authorize(&self, request: &RenderRequest) -> GateResult<AuthorizationDecision> {
        let Some(secret) = self.config.signing_secret()? else {
            return Ok(AuthorizationDecision::NotRequired);
        };

        let (Some(signature), Some(expire_at)) = (request.signature(), request.expire_at())
        else {
            return Ok(AuthorizationDecision::Malformed);
        };

        match check_expiry_with_skew(expire_at, self.clock.now_millis(), self.config.clock_skew_ms)
        {
            ExpiryCheck::Valid => {}
            ExpiryCheck::Malformed => return Ok(AuthorizationDecision::Malformed),
            ExpiryCheck::Expired => return Ok(AuthorizationDecision::Expired),
        }

        let canonical = canonicalize(request.params());
        if verify(&canonical, signature, secret) {
            Ok(AuthorizationDecision::Authorized)
        } else {
            Ok(AuthorizationDecision::InvalidSignature)
        }
    }

    pub async fn admit(&self, request: &RenderRequest) -> GateResult<Admission> {
        let object = self.object_name(request);

        if self.store.head(&object).await? {
            tracing::debug!("cache hit for {object}");
            return Ok(Admission::AlreadyExists(object));
        }
        tracing::debug!("cache miss for {object}");

        let authorization = self.authorize(request)?;
        if let Some(rejection) = authorization.rejection() {
            tracing::warn!(
                "rejected {} for {}: {:?}",
                object,
                request.target_url(),
                authorization
            );
            return Err(rejection);
        }

        let Some(token) = self.store.try_claim(&object, self.config.claim_ttl).await? else {
            tracing::info!("render already in flight for {object}");
            return Err(GateError::InFlight(object.to_string()));
        };
        let claim = ClaimGuard {
            store: Arc::clone(&self.store),
            object: object.clone(),
            token: Some(token),
        };

        if self.store.head(&object).await? {
            tracing::debug!("{object} was stored while waiting for its claim");
            claim.release().await;
            return Ok(Admission::AlreadyExists(object));
        }

        tracing::info!(
            "admitted {} for {} ({:?})",
            object,
            request.target_url(),
            authorization
        );

        Ok(Admission::Admitted(AdmissionTicket {
            object,
            spec: RenderSpec {
                url: request.target_url().clone(),
                viewport: request.viewport(),
                full_page: request.full_page(),
            },
            authorization,
            claim,
        }))
    }

    /// Render, store and release the claim. The claim is released on failure
    /// too so a later request can retry.
    pub async fn fulfil(
        &self,
        ticket: AdmissionTicket,
        renderer: &dyn Renderer,
    ) -> GateResult<GateOutcome> {
        let AdmissionTicket {
            object,
            spec,
            claim,
            ..
        } = ticket;

        let result = self.render_and_store(&object, &spec, renderer).await;
        claim.release().await;

        match result {
            Ok(size) => {
                tracing::info!("stored {} ({} bytes)", object, size);
                Ok(GateOutcome {
                    object_name: object,
                    created: true,
                })
            }
            Err(err) => {
                tracing::error!("render for {} failed: {}", object, err);
                Err(err)
            }
        }
    }

    /// Full request path: admit, then fulfil on a miss.
    pub async fn handle(
        &self,
        request: &RenderRequest,
        renderer: &dyn Renderer,
    ) -> GateResult<GateOutcome> {
        match self.admit(request).await? {
            Admission::AlreadyExists(object_name) => Ok(GateOutcome {
                object_name,
                created: false,
            }),
            Admission::Admitted(ticket) => self.fulfil(ticket, renderer).await,
        }
    }

    async fn render_and_store(
        &self,
        object: &ObjectName,
        spec: &RenderSpec,
        renderer: &dyn Renderer,
    ) -> GateResult<usize> {
        let image: Bytes = renderer.render(spec).await?;
        if image.is_empty() {
            return Err(RenderError::Empty.into());
        }
        let size = image.len();
        self.store.put(object, image).await?;
        Ok(size)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use tokio::sync::oneshot;

    use super::*;
    use crate::error::ErrorKind;
    use crate::expiry::FixedClock;
    use crate::signature::{sign, sign_query};
    use crate::store::{MemoryBlobStore, StoreResult};

    const SECRET: &str = "topsecret";
    const NOW: i64 = 1_760_000_000_000;

    #[derive(Default)]
    struct CountingRenderer {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Renderer for CountingRenderer {
        async fn render(&self, _spec: &RenderSpec) -> Result<Bytes, RenderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Bytes::from_static(b"RIFF....WEBP"))
        }
    }

    struct FailingRenderer;

    #[async_trait]
    impl Renderer for FailingRenderer {
        async fn render(&self, _spec: &RenderSpec) -> Result<Bytes, RenderError> {
            Err(RenderError::Unreachable("connection refused".into()))
        }
    }

    struct HangingRenderer;

    #[async_trait]
    impl Renderer for HangingRenderer {
        async fn render(&self, _spec: &RenderSpec) -> Result<Bytes, RenderError> {
            std::future::pending().await
        }
    }

    /// Holds the first `head` call after it has seen the store, until the test
    /// resumes it.
    struct PausingStore {
        inner: MemoryBlobStore,
        pause: Mutex<Option<(oneshot::Sender<()>, oneshot::Receiver<()>)>>,
    }

    impl PausingStore {
        fn new() -> (Arc<Self>, oneshot::Receiver<()>, oneshot::Sender<()>) {
            let (paused_tx, paused_rx) = oneshot::channel();
            let (resume_tx, resume_rx) = oneshot::channel();
            let store = Arc::new(Self {
                inner: MemoryBlobStore::new(),
                pause: Mutex::new(Some((paused_tx, resume_rx))),
            });
            (store, paused_rx, resume_tx)
        }
    }

    #[async_trait]
    impl BlobStore for PausingStore {
        async fn head(&self, object: &ObjectName) -> StoreResult<bool> {
            let found = self.inner.head(object).await?;
            let pause = self.pause.lock().expect("pause lock").take();
            if let Some((paused, resume)) = pause {
                let _ = paused.send(());
                let _ = resume.await;
            }
            Ok(found)
        }

        async fn put(&self, object: &ObjectName, bytes: Bytes) -> StoreResult<()> {
            self.inner.put(object, bytes).await
        }

        async fn try_claim(
            &self,
            object: &ObjectName,
            ttl: Duration,
        ) -> StoreResult<Option<ClaimToken>> {
            self.inner.try_claim(object, ttl).await
        }

        async fn release(&self, object: &ObjectName, claim: &ClaimToken) -> StoreResult<()> {
            self.inner.release(object, claim).await
        }
    }

    fn gate(secret: Option<&str>) -> (AdmissionGate, Arc<MemoryBlobStore>) {
        let store = Arc::new(MemoryBlobStore::new());
        let config = GateConfig {
            secret: secret.map(str::to_string),
            ..GateConfig::default()
        };
        let gate = AdmissionGate::with_clock(config, store.clone(), Arc::new(FixedClock(NOW)));
        (gate, store)
    }

    fn request(query: &str) -> RenderRequest {
        RenderRequest::from_query(query, Viewport::default()).expect("parse request")
    }

    fn signed(site: &str, expire_at: i64) -> RenderRequest {
        request(&sign_query(site, expire_at, &[], SECRET).expect("sign query"))
    }

    #[tokio::test]
    async fn open_mode_admits_unsigned_requests() {
        let (gate, store) = gate(None);
        let renderer = CountingRenderer::default();

        let outcome = gate
            .handle(&request("site=https://example.com"), &renderer)
            .await
            .expect("open mode admits");
        assert!(outcome.created);
        assert_eq!(renderer.calls.load(Ordering::SeqCst), 1);
        assert!(store.head(&outcome.object_name).await.expect("head"));
    }

    #[tokio::test]
    async fn second_request_is_a_cache_hit() {
        let (gate, _store) = gate(Some(SECRET));
        let renderer = CountingRenderer::default();

        let first = gate
            .handle(&signed("https://example.com", NOW + 60_000), &renderer)
            .await
            .expect("first request");
        let second = gate
            .handle(&signed("https://example.com", NOW + 120_000), &renderer)
            .await
            .expect("second request");

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.object_name, second.object_name);
        assert_eq!(renderer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cache_hit_skips_authorization() {
        let (gate, store) = gate(Some(SECRET));
        let unsigned = request("site=https://example.com");
        let object = gate.object_name(&unsigned);
        store
            .put(&object, Bytes::from_static(b"cached"))
            .await
            .expect("seed");

        match gate.admit(&unsigned).await.expect("hit needs no signature") {
            Admission::AlreadyExists(name) => assert_eq!(name, object),
            other => panic!("expected cache hit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_signature_parameters_are_malformed() {
        let (gate, _store) = gate(Some(SECRET));
        for query in [
            "site=https://example.com",
            "site=https://example.com&sig=abc",
            "site=https://example.com&expireAt=9999999999999",
        ] {
            let err = gate.admit(&request(query)).await.expect_err("must reject");
            assert_eq!(err.kind(), ErrorKind::Malformed, "query {query}");
            assert_eq!(err.http_status(), 400);
        }
    }

    #[tokio::test]
    async fn non_numeric_expiry_is_malformed_even_with_valid_signature() {
        let (gate, _store) = gate(Some(SECRET));
        let canonical = "expireAt=notanumber&site=https%3A%2F%2Fexample.com";
        let sig = sign(canonical, SECRET).expect("sign");
        let query = format!("{canonical}&sig={sig}");

        let err = gate.admit(&request(&query)).await.expect_err("malformed");
        assert_eq!(err.kind(), ErrorKind::Malformed);
    }

    #[tokio::test]
    async fn expired_requests_are_rejected() {
        let (gate, _store) = gate(Some(SECRET));
        for expire_at in [NOW - 1, NOW] {
            let err = gate
                .admit(&signed("https://example.com", expire_at))
                .await
                .expect_err("expired");
            assert_eq!(err.kind(), ErrorKind::Expired);
            assert_eq!(err.http_status(), 400);
        }
        assert!(gate
            .admit(&signed("https://example.com", NOW + 1))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn tampered_parameters_fail_signature() {
        let (gate, _store) = gate(Some(SECRET));
        let query = sign_query("https://example.com", NOW + 60_000, &[], SECRET)
            .expect("sign query")
            .replace("example.com", "example.org");

        let err = gate.admit(&request(&query)).await.expect_err("tampered");
        assert_eq!(err.kind(), ErrorKind::InvalidSignature);
        assert_eq!(err.http_status(), 403);

        let query = format!(
            "{}&width=1920",
            sign_query("https://example.com", NOW + 60_000, &[], SECRET).expect("sign query")
        );
        let err = gate.admit(&request(&query)).await.expect_err("extra param");
        assert_eq!(err.kind(), ErrorKind::InvalidSignature);
    }

    #[tokio::test]
    async fn signature_from_other_secret_is_rejected() {
        let (gate, _store) = gate(Some(SECRET));
        let query =
            sign_query("https://example.com", NOW + 60_000, &[], "other").expect("sign query");
        let err = gate.admit(&request(&query)).await.expect_err("wrong key");
        assert_eq!(err.kind(), ErrorKind::InvalidSignature);
    }

    #[tokio::test]
    async fn reserved_characters_round_trip() {
        let (gate, _store) = gate(Some(SECRET));
        let site = "https://example.com/a path/?q=1&r=%41+b";
        let query = sign_query(site, NOW + 60_000, &[("fullPage", "true")], SECRET)
            .expect("sign query");
        let ticket = match gate.admit(&request(&query)).await.expect("admitted") {
            Admission::Admitted(ticket) => ticket,
            other => panic!("expected admission, got {other:?}"),
        };
        assert_eq!(ticket.authorization(), AuthorizationDecision::Authorized);
        assert!(ticket.spec().full_page);
    }

    #[tokio::test]
    async fn required_signature_without_secret_is_config_error() {
        let store = Arc::new(MemoryBlobStore::new());
        let config = GateConfig {
            secret: None,
            require_signature: true,
            ..GateConfig::default()
        };
        let gate = AdmissionGate::with_clock(config, store, Arc::new(FixedClock(NOW)));
        let err = gate
            .admit(&request("site=https://example.com"))
            .await
            .expect_err("config error");
        assert_eq!(err.kind(), ErrorKind::Config);
        assert_eq!(err.http_status(), 500);
    }

    #[tokio::test]
    async fn concurrent_admission_is_claimed_once() {
        let (gate, store) = gate(None);
        let req = request("site=https://example.com");

        let ticket = match gate.admit(&req).await.expect("first admit") {
            Admission::Admitted(ticket) => ticket,
            other => panic!("expected admission, got {other:?}"),
        };
        let err = gate.admit(&req).await.expect_err("claim held");
        assert_eq!(err.kind(), ErrorKind::InFlight);

        let outcome = gate
            .fulfil(ticket, &CountingRenderer::default())
            .await
            .expect("fulfil");
        assert!(!store.is_claimed(&outcome.object_name).await);

        match gate.admit(&req).await.expect("after fulfil") {
            Admission::AlreadyExists(name) => assert_eq!(name, outcome.object_name),
            other => panic!("expected cache hit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn render_failure_releases_claim() {
        let (gate, store) = gate(None);
        let req = request("site=https://example.com");

        let err = gate
            .handle(&req, &FailingRenderer)
            .await
            .expect_err("render fails");
        assert_eq!(err.kind(), ErrorKind::Upstream);
        assert_eq!(err.http_status(), 502);
        assert_eq!(store.len().await, 0);

        let outcome = gate
            .handle(&req, &CountingRenderer::default())
            .await
            .expect("retry succeeds");
        assert!(outcome.created);
    }

    #[tokio::test]
    async fn miss_that_is_filled_while_waiting_is_not_rendered_again() {
        let (store, paused, resume) = PausingStore::new();
        let gate = AdmissionGate::with_clock(
            GateConfig::default(),
            store.clone(),
            Arc::new(FixedClock(NOW)),
        );
        let renderer = CountingRenderer::default();
        let req = request("site=https://example.com");

        let late = gate.handle(&req, &renderer);
        let early = async {
            paused.await.expect("late request saw the miss");
            let outcome = gate.handle(&req, &renderer).await;
            resume.send(()).expect("resume late request");
            outcome
        };
        let (late, early) = tokio::join!(late, early);

        let early = early.expect("early request");
        let late = late.expect("late request");
        assert!(early.created);
        assert!(!late.created);
        assert_eq!(late.object_name, early.object_name);
        assert_eq!(renderer.calls.load(Ordering::SeqCst), 1);
        assert!(!store.inner.is_claimed(&late.object_name).await);
    }

    #[tokio::test]
    async fn abandoned_render_releases_claim() {
        let (gate, store) = gate(None);
        let req = request("site=https://example.com");
        let object = gate.object_name(&req);

        let abandoned = tokio::time::timeout(
            Duration::from_millis(50),
            gate.handle(&req, &HangingRenderer),
        )
        .await;
        assert!(abandoned.is_err(), "render should still be pending");
        tokio::task::yield_now().await;
        assert!(!store.is_claimed(&object).await);

        let outcome = gate
            .handle(&req, &CountingRenderer::default())
            .await
            .expect("next request renders");
        assert!(outcome.created);
    }

    #[tokio::test]
    async fn dropped_ticket_releases_claim() {
        let (gate, store) = gate(None);
        let req = request("site=https://example.com");

        let ticket = match gate.admit(&req).await.expect("admit") {
            Admission::Admitted(ticket) => ticket,
            other => panic!("expected admission, got {other:?}"),
        };
        let object = ticket.object().clone();
        assert!(store.is_claimed(&object).await);

        drop(ticket);
        tokio::task::yield_now().await;
        assert!(!store.is_claimed(&object).await);
        assert!(matches!(
            gate.admit(&req).await.expect("admit again"),
            Admission::Admitted(_)
        ));
    }

    #[tokio::test]
    async fn rejected_requests_never_claim() {
        let (gate, store) = gate(Some(SECRET));
        let req = request("site=https://example.com&sig=AAAA&expireAt=9999999999999");
        let object = gate.object_name(&req);
        assert!(gate.admit(&req).await.is_err());
        assert!(!store.is_claimed(&object).await);
    }

    #[test]
    fn outcome_serializes_to_wire_shape() {
        let key = crate::cache_key::derive_key("https://example.com/");
        let outcome = GateOutcome {
            object_name: ObjectName::new("screenshots", &key),
            created: true,
        };
        let value = serde_json::to_value(&outcome).expect("serialize");
        assert_eq!(value["created"], serde_json::json!(true));
        assert_eq!(
            value["objectName"],
            serde_json::json!(format!("screenshots/{key}.webp"))
        );
    }
}
