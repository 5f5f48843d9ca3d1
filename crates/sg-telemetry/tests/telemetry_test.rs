use sg_telemetry::metrics::{global_metrics, names, MetricsCollector};

// ---------------------------------------------------------------------------
// Counters
// ---------------------------------------------------------------------------

#[test]
fn test_counter_families_are_keyed_by_labels() {
    let m = MetricsCollector::new();
    m.increment_counter(names::CLAIMS, &[("outcome", "granted")]);
    m.increment_counter(names::CLAIMS, &[("outcome", "granted")]);
    m.increment_counter(names::CLAIMS, &[("outcome", "already_claimed")]);

    assert_eq!(m.get_counter(names::CLAIMS, &[("outcome", "granted")]), 2);
    assert_eq!(
        m.get_counter(names::CLAIMS, &[("outcome", "already_claimed")]),
        1
    );
    assert_eq!(m.get_counter(names::CLAIMS, &[("outcome", "throttled")]), 0);
}

#[test]
fn test_label_order_does_not_matter() {
    let m = MetricsCollector::new();
    m.increment_counter(
        names::GATE_DECISIONS,
        &[("mode", "guided"), ("verdict", "require_approval")],
    );
    m.increment_counter(
        names::GATE_DECISIONS,
        &[("verdict", "require_approval"), ("mode", "guided")],
    );
    assert_eq!(
        m.get_counter(
            names::GATE_DECISIONS,
            &[("mode", "guided"), ("verdict", "require_approval")]
        ),
        2
    );
}

#[test]
fn test_increment_by() {
    let m = MetricsCollector::new();
    m.increment_counter_by(names::CONFLICTS, &[("kind", "claim_contention")], 3);
    m.increment_counter_by(names::CONFLICTS, &[("kind", "claim_contention")], 0);
    assert_eq!(
        m.get_counter(names::CONFLICTS, &[("kind", "claim_contention")]),
        3
    );
}

// ---------------------------------------------------------------------------
// Gauges and histograms
// ---------------------------------------------------------------------------

#[test]
fn test_gauge_set_overwrites() {
    let m = MetricsCollector::new();
    assert_eq!(m.get_gauge(names::ACTIVE_RUNS), 0);
    m.set_gauge(names::ACTIVE_RUNS, 4);
    m.set_gauge(names::ACTIVE_RUNS, 2);
    assert_eq!(m.get_gauge(names::ACTIVE_RUNS), 2);
}

#[test]
fn test_unknown_histogram_gets_duration_buckets() {
    let m = MetricsCollector::new();
    m.record_histogram("content_call_seconds", 0.25);
    m.record_histogram("content_call_seconds", 3.0);
    assert_eq!(m.histogram_count("content_call_seconds"), 2);

    let out = m.export_prometheus();
    assert!(out.contains("content_call_seconds_bucket{le=\"0.25\"} 1"));
    assert!(out.contains("content_call_seconds_bucket{le=\"5\"} 2"));
    assert!(out.contains("content_call_seconds_sum 3.25"));
}

// ---------------------------------------------------------------------------
// Export
// ---------------------------------------------------------------------------

#[test]
fn test_prometheus_export_has_type_headers() {
    let m = MetricsCollector::with_defaults();
    m.increment_counter(names::ESCALATIONS, &[("level", "project_lead")]);
    m.set_gauge(names::ACTIVE_RUNS, 1);
    m.record_histogram(names::GATE_LATENCY, 42.0);

    let out = m.export_prometheus();
    assert!(out.contains("# TYPE stepgate_escalations_total counter"));
    assert!(out.contains("stepgate_escalations_total{level=\"project_lead\"} 1"));
    assert!(out.contains("# TYPE stepgate_active_runs gauge"));
    assert!(out.contains("stepgate_active_runs 1"));
    assert!(out.contains("# TYPE stepgate_gate_latency_seconds histogram"));
    assert!(out.contains("stepgate_gate_latency_seconds_count 1"));
}

#[test]
fn test_json_export() {
    let m = MetricsCollector::new();
    m.increment_counter(names::GATE_RESOLUTIONS, &[("decision", "approved")]);
    m.set_gauge(names::ACTIVE_RUNS, 3);

    let json = m.export_json();
    assert_eq!(json["gauges"]["stepgate_active_runs"], 3);
    assert_eq!(
        json["counters"]["stepgate_gate_resolutions_total{decision=\"approved\"}"],
        1
    );
}

#[test]
fn test_global_collector_accumulates_across_callers() {
    let before = global_metrics().get_counter("telemetry_test_marker", &[]);
    global_metrics().increment_counter("telemetry_test_marker", &[]);
    assert_eq!(
        global_metrics().get_counter("telemetry_test_marker", &[]),
        before + 1
    );
}
