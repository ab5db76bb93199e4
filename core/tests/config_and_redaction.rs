use std::sync::Arc;

use fleet_agent_core::config::{crypto, ConfigDictionary, ConfigValue, Decryptor};
use fleet_agent_core::environment::Params;
use fleet_agent_core::format::Formatter;
use fleet_agent_core::logging::{LogSink, RedactingMakeWriter, SecretRegistry, REDACTED};
use fleet_agent_core::AgentError;
use serde_json::json;

const KEY_ENV: &str = "FLEET_AGENT_IT_CONFIG_KEY";

fn dictionary(value: serde_json::Value, secrets: &Arc<SecretRegistry>) -> ConfigDictionary {
    std::env::set_var(KEY_ENV, "integration-passphrase");
    ConfigDictionary::new(value, Decryptor::new(KEY_ENV).with_secrets(Arc::clone(secrets)))
}

// --- Lazy lookups ---

#[test]
fn missing_key_fails_only_when_used() {
    let secrets = Arc::new(SecretRegistry::new());
    let config = dictionary(json!({"hdfs-site": {"dfs.replication": "3"}}), &secrets);

    let missing = config.get("yarn-site").unwrap();
    assert!(!missing.is_present());
    assert!(matches!(missing, ConfigValue::Unknown { .. }));

    let err = missing.get("yarn.nodemanager.address").unwrap_err();
    assert!(matches!(err, AgentError::UnknownConfiguration { ref key } if key == "yarn-site"));

    let replication = config.lookup("hdfs-site.dfs.replication").unwrap();
    assert_eq!(replication.as_i64().unwrap(), 3);
}

#[test]
fn dictionary_rejects_writes() {
    let secrets = Arc::new(SecretRegistry::new());
    let config = dictionary(json!({"a": 1}), &secrets);
    assert!(matches!(config.set("a", json!(2)), Err(AgentError::Immutability { .. })));
    assert!(matches!(config.remove("a"), Err(AgentError::Immutability { .. })));
}

// --- Encrypted values end to end ---

#[test]
fn decrypted_values_never_reach_the_log() {
    let secrets = Arc::new(SecretRegistry::new());
    let marker = crypto::encrypt("hunter2-db-password", "integration-passphrase").unwrap();
    let config = dictionary(json!({"db": {"password": marker}}), &secrets);

    let password = config.lookup("db.password").unwrap();
    assert_eq!(password.as_str().unwrap(), "hunter2-db-password");

    let (sink, buffer) = LogSink::memory();
    let subscriber = tracing_subscriber::fmt()
        .with_ansi(false)
        .with_writer(RedactingMakeWriter::new(Arc::clone(&secrets), sink))
        .finish();
    tracing::subscriber::with_default(subscriber, || {
        tracing::info!(value = %password.as_str().unwrap(), "connecting with hunter2-db-password");
    });

    let logged = String::from_utf8(buffer.lock().clone()).unwrap();
    assert!(!logged.contains("hunter2-db-password"), "{}", logged);
    assert!(logged.contains(REDACTED));
}

#[test]
fn password_flag_hides_value_in_later_log_lines() {
    let secrets = Arc::new(SecretRegistry::new());
    let params = Params::new(ConfigDictionary::empty()).with_value("password", "s3cr3t pass");
    let rendered = Formatter::new(&params, &secrets)
        .format("mysql -p{password!p} -e status", &[])
        .unwrap();
    assert_eq!(rendered.value, "mysql -p's3cr3t pass' -e status");
    assert!(!rendered.redacted.contains("s3cr3t"));

    let (sink, buffer) = LogSink::memory();
    let subscriber = tracing_subscriber::fmt()
        .with_ansi(false)
        .with_writer(RedactingMakeWriter::new(Arc::clone(&secrets), sink))
        .finish();
    tracing::subscriber::with_default(subscriber, || {
        tracing::warn!("unrelated line mentioning s3cr3t pass");
    });

    let logged = String::from_utf8(buffer.lock().clone()).unwrap();
    assert!(!logged.contains("s3cr3t pass"), "{}", logged);
}

#[test]
fn quoted_secret_is_hidden_in_json_logs() {
    let secrets = Arc::new(SecretRegistry::new());
    secrets.register(r#"db"pass\word"#);

    let (sink, buffer) = LogSink::memory();
    let subscriber = tracing_subscriber::fmt()
        .json()
        .with_writer(RedactingMakeWriter::new(Arc::clone(&secrets), sink))
        .finish();
    tracing::subscriber::with_default(subscriber, || {
        tracing::info!(value = r#"db"pass\word"#, "connecting");
    });

    let logged = String::from_utf8(buffer.lock().clone()).unwrap();
    assert!(!logged.contains("pass"), "{}", logged);
    assert!(logged.contains(REDACTED));
}
