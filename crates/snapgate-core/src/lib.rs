//! Snapgate core
//!
//! Admission control and content-addressed keys for an expensive screenshot
//! renderer. A request is either satisfied by an object already present in the
//! blob store, or it must carry a valid, unexpired HMAC-SHA256 signature over
//! its canonical parameter string before it is allowed to reach the renderer.

pub mod cache_key;
pub mod canonical;
pub mod error;
pub mod expiry;
pub mod gate;
pub mod render;
pub mod request;
pub mod signature;
pub mod store;

pub use cache_key::{derive_key, key_for_request, CacheKey, KeyScope, ObjectName};
pub use canonical::canonicalize;
pub use error::{ErrorKind, GateError, GateResult};
pub use expiry::{check_expiry, Clock, ExpiryCheck, FixedClock, SystemClock};
pub use gate::{
    Admission, AdmissionGate, AdmissionTicket, AuthorizationDecision, GateConfig, GateOutcome,
};
pub use render::{RenderError, RenderSpec, Renderer};
pub use request::{QueryParams, RenderRequest, Viewport};
pub use signature::{sign, sign_query, verify};
pub use store::{BlobStore, ClaimToken, MemoryBlobStore, StoreError, StoreResult};
