// Prometheus counters exposed on GET /metrics

use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref SUBMISSIONS_ACCEPTED: IntCounterVec = IntCounterVec::new(
        Opts::new("sentinel_submissions_accepted_total", "Submissions queued for execution"),
        &["language"]
    )
    .expect("metric definition is valid");
    pub static ref SUBMISSIONS_REJECTED: IntCounterVec = IntCounterVec::new(
        Opts::new("sentinel_submissions_rejected_total", "Submissions refused at intake"),
        &["reason"]
    )
    .expect("metric definition is valid");
    pub static ref CANCELLATIONS: IntCounter =
        IntCounter::new("sentinel_cancellations_total", "Cancellation requests accepted")
            .expect("metric definition is valid");
}

pub fn register() -> prometheus::Result<()> {
    REGISTRY.register(Box::new(SUBMISSIONS_ACCEPTED.clone()))?;
    REGISTRY.register(Box::new(SUBMISSIONS_REJECTED.clone()))?;
    REGISTRY.register(Box::new(CANCELLATIONS.clone()))?;
    Ok(())
}

/// Text exposition format of every registered metric
pub fn render() -> prometheus::Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&REGISTRY.gather(), &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}
