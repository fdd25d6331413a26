use once_cell::sync::Lazy;
use prometheus::{
    register_histogram, register_int_counter, register_int_gauge, Histogram, IntCounter, IntGauge,
};

// --- Protocol Gate Metrics ---

pub static AUTH_FAILURES: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "beacon_gateway_auth_failures_total",
        "Total requests rejected at signature or device verification"
    )
    .expect("auth_failures counter")
});

pub static REPLAY_REJECTIONS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "beacon_gateway_replay_rejections_total",
        "Total requests rejected for nonce reuse or timestamp skew"
    )
    .expect("replay_rejections counter")
});

pub static TENANT_REJECTIONS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "beacon_gateway_tenant_rejections_total",
        "Total cross-tenant access attempts rejected"
    )
    .expect("tenant_rejections counter")
});

// --- Delivery Metrics ---

pub static POLLS_SERVED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "beacon_gateway_polls_served_total",
        "Total authenticated poll requests answered"
    )
    .expect("polls_served counter")
});

pub static SIGNALS_DELIVERED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "beacon_gateway_signals_delivered_total",
        "Total signal instructions delivered inside poll envelopes"
    )
    .expect("signals_delivered counter")
});

pub static POLL_LATENCY: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "beacon_gateway_poll_latency_seconds",
        "Poll handling latency (auth through envelope seal)",
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]
    )
    .expect("poll_latency histogram")
});

// --- Execution Metrics ---

pub static ACKS_RECORDED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "beacon_gateway_acks_recorded_total",
        "Total execution acknowledgments written"
    )
    .expect("acks_recorded counter")
});

pub static DUPLICATE_ACKS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "beacon_gateway_duplicate_acks_total",
        "Total acks for a pair that already had an execution record"
    )
    .expect("duplicate_acks counter")
});

pub static POSITIONS_OPENED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "beacon_gateway_positions_opened_total",
        "Total positions opened from placed acks"
    )
    .expect("positions_opened counter")
});

pub static POSITIONS_CLOSED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "beacon_gateway_positions_closed_total",
        "Total positions closed, including closed-with-error"
    )
    .expect("positions_closed counter")
});

pub static ACTIVE_POSITIONS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "beacon_gateway_active_positions",
        "Number of currently open positions"
    )
    .expect("active_positions gauge")
});

// --- Helpers ---

pub fn inc_auth_failures() {
    AUTH_FAILURES.inc();
}

pub fn inc_replay_rejections() {
    REPLAY_REJECTIONS.inc();
}

pub fn inc_tenant_rejections() {
    TENANT_REJECTIONS.inc();
}

pub fn inc_polls_served() {
    POLLS_SERVED.inc();
}

pub fn inc_signals_delivered(count: u64) {
    SIGNALS_DELIVERED.inc_by(count);
}

pub fn observe_poll_latency(duration_sec: f64) {
    POLL_LATENCY.observe(duration_sec);
}

pub fn inc_acks_recorded() {
    ACKS_RECORDED.inc();
}

pub fn inc_duplicate_acks() {
    DUPLICATE_ACKS.inc();
}

pub fn inc_positions_opened() {
    POSITIONS_OPENED.inc();
    ACTIVE_POSITIONS.inc();
}

pub fn inc_positions_closed() {
    POSITIONS_CLOSED.inc();
    ACTIVE_POSITIONS.dec();
}
