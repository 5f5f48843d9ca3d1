use std::io::Write;

use sg_core::config::{Config, ConfigError};
use sg_core::types::{DefaultAction, EscalationTrigger, Mode, RecipientClass};

fn write_config(text: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(text.as_bytes()).unwrap();
    file
}

#[test]
fn test_defaults_validate_and_match_documented_values() {
    let cfg = Config::default();
    cfg.validate().unwrap();
    assert_eq!(cfg.gates.default_mode, Mode::Guided);
    assert!((cfg.gates.confidence_threshold - 0.8).abs() < 1e-9);
    assert!((cfg.gates.learning_rate - 0.2).abs() < 1e-9);
    assert_eq!(cfg.gates.decision_sla_secs, 1800);
    assert_eq!(cfg.gates.default_action, DefaultAction::Approve);
    assert_eq!(cfg.coordinator.max_adapter_attempts, 1);
    assert_eq!(cfg.content.retries, 1);
    assert_eq!(cfg.escalation.rules.len(), 6);
}

#[test]
fn test_default_escalation_table() {
    let cfg = Config::default();
    let conflict = cfg
        .escalation
        .rule_for(EscalationTrigger::UnresolvedConflict)
        .unwrap();
    assert_eq!(conflict.levels[0].recipient, RecipientClass::TechnicalLead);
    assert_eq!(conflict.levels[0].sla_secs, 30 * 60);
    assert_eq!(conflict.levels[1].recipient, RecipientClass::ProjectLead);

    let destructive = cfg
        .escalation
        .rule_for(EscalationTrigger::DestructiveGate)
        .unwrap();
    assert_eq!(destructive.levels[0].recipient, RecipientClass::ProjectLead);
    assert_eq!(destructive.levels[0].sla_secs, 15 * 60);
}

#[test]
fn test_partial_file_fills_defaults() {
    let file = write_config(
        r#"
[gates]
default_mode = "learning"
confidence_threshold = 0.9

[coordinator]
claim_grace_secs = 5
"#,
    );
    let cfg = Config::load_from(file.path()).unwrap();
    assert_eq!(cfg.gates.default_mode, Mode::Learning);
    assert!((cfg.gates.confidence_threshold - 0.9).abs() < 1e-9);
    assert!((cfg.gates.learning_rate - 0.2).abs() < 1e-9);
    assert_eq!(cfg.coordinator.claim_grace_secs, 5);
    assert_eq!(cfg.coordinator.default_estimate_secs, 900);
    assert_eq!(cfg.general.log_level, "info");
}

#[test]
fn test_custom_escalation_rules_replace_defaults() {
    let file = write_config(
        r#"
[[escalation.rules]]
trigger = "gate_timeout"
levels = [
    { recipient = "operator", sla_secs = 300 },
    { recipient = "executive", sla_secs = 600 },
]
"#,
    );
    let cfg = Config::load_from(file.path()).unwrap();
    assert_eq!(cfg.escalation.rules.len(), 1);
    let rule = cfg
        .escalation
        .rule_for(EscalationTrigger::GateTimeout)
        .unwrap();
    assert_eq!(rule.levels[1].recipient, RecipientClass::Executive);
    assert!(cfg
        .escalation
        .rule_for(EscalationTrigger::DestructiveGate)
        .is_none());
}

#[test]
fn test_weights_must_sum_to_one() {
    let file = write_config(
        r#"
[coordinator.weights]
task_priority = 0.5
capability_match = 0.5
dependency_readiness = 0.2
availability = 0.1
"#,
    );
    assert!(matches!(
        Config::load_from(file.path()),
        Err(ConfigError::Validation(_))
    ));
}

#[test]
fn test_out_of_range_learning_rate_is_rejected() {
    let mut cfg = Config::default();
    cfg.gates.learning_rate = 1.0;
    assert!(matches!(cfg.validate(), Err(ConfigError::Validation(_))));
    cfg.gates.learning_rate = 0.0;
    assert!(matches!(cfg.validate(), Err(ConfigError::Validation(_))));
}

#[test]
fn test_duplicate_and_empty_rules_are_rejected() {
    let mut cfg = Config::default();
    let dup = cfg.escalation.rules[0].clone();
    cfg.escalation.rules.push(dup);
    assert!(matches!(cfg.validate(), Err(ConfigError::Validation(_))));

    let mut cfg = Config::default();
    cfg.escalation.rules[2].levels.clear();
    assert!(matches!(cfg.validate(), Err(ConfigError::Validation(_))));
}

#[test]
fn test_malformed_toml_is_a_parse_error() {
    let file = write_config("[gates\nconfidence_threshold = ");
    assert!(matches!(
        Config::load_from(file.path()),
        Err(ConfigError::Parse(_))
    ));
}

#[test]
fn test_missing_file_is_an_io_error() {
    let dir = tempfile::tempdir().unwrap();
    assert!(matches!(
        Config::load_from(dir.path().join("absent.toml")),
        Err(ConfigError::Io(_))
    ));
}

#[test]
fn test_to_toml_roundtrips() {
    let mut cfg = Config::default();
    cfg.gates.default_mode = Mode::Autonomous;
    cfg.general.state_dir = "/var/lib/stepgate".into();
    let text = cfg.to_toml().unwrap();
    let file = write_config(&text);
    let back = Config::load_from(file.path()).unwrap();
    assert_eq!(back.gates.default_mode, Mode::Autonomous);
    assert_eq!(back.general.state_path(), std::path::PathBuf::from("/var/lib/stepgate"));
    assert_eq!(back.escalation.rules.len(), cfg.escalation.rules.len());
}
