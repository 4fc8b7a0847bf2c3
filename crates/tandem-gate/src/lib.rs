//! Caller-facing boundaries for Tandem admission control.
//!
//! Both boundaries derive an identity for the caller, ask a
//! [`tandem_ratelimit::TokenBucket`] to admit the request, and translate the
//! [`tandem_ratelimit::Admission`] into their own protocol:
//!
//! - [`http`]: axum middleware answering `429`/`503` with JSON bodies
//! - [`realtime`]: per-event gate that notifies the sending connection and
//!   drops the event

pub mod http;
pub mod identity;
pub mod realtime;

pub use http::RATE_LIMIT_REMAINING_HEADER;
pub use http::RateLimitRejection;
pub use http::RateLimitState;
pub use http::RateRemaining;
pub use http::rate_limit;
pub use identity::FORWARDED_FOR_HEADER;
pub use identity::USER_ID_HEADER;
pub use identity::derive_identity;
pub use realtime::ChannelNotifier;
pub use realtime::ClientInfo;
pub use realtime::ConnectionNotifier;
pub use realtime::DropReason;
pub use realtime::GateDecision;
pub use realtime::NotifyError;
pub use realtime::RealtimeGate;
pub use realtime::RealtimeNotification;
