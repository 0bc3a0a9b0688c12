//! # Logging
//!
//! [`setup_tracing`] installs a compact `fmt` subscriber filtered by `RUST_LOG`.
//!
//! ```bash
//! RUST_LOG=info cargo run     # state changes, processed and forwarded messages
//! RUST_LOG=debug cargo run    # plus received bodies and lock renewals
//! ```
//!
//! Every stage logs inside a `stage` span, so a line reads like:
//!
//! ```text
//! INFO stage: Forwarded stage="assembly" message_id="…" outbound_message_id="…" queue="crazybike-shipper"
//! ```

/// Installs the global subscriber. Call once, at the start of `main`.
pub fn setup_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();
}
