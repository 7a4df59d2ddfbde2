use std::path::Path;

use super::*;

fn provider(name: &str, priority: u16) -> ProviderConfig {
    ProviderConfig {
        name: name.to_string(),
        service: "openai".to_string(),
        endpoint: format!("https://{name}.example.com/answer"),
        status_endpoint: None,
        priority,
        timeout_ms: 30_000,
        retry_count: 1,
        retry_backoff_ms: 0,
        fallback_on_failure: true,
        kind: ProviderKind::Sync,
        enabled: true,
    }
}

fn file_with(providers: Vec<ProviderConfig>) -> CollectorsFile {
    let mut collectors = BTreeMap::new();
    collectors.insert(CollectorType::ChatGpt, CollectorConfig { providers });
    CollectorsFile {
        collectors,
        brand_overrides: vec![],
    }
}

#[test]
fn resolve_sorts_by_ascending_priority() {
    let file = file_with(vec![
        provider("c", 30),
        provider("a", 10),
        provider("b", 20),
    ]);
    let plan = file.resolve();
    let names: Vec<String> = plan
        .chain_for(Uuid::new_v4(), CollectorType::ChatGpt)
        .into_iter()
        .map(|p| p.name)
        .collect();
    assert_eq!(names, vec!["a", "b", "c"]);
}

#[test]
fn resolve_drops_disabled_providers() {
    let mut off = provider("off", 1);
    off.enabled = false;
    let file = file_with(vec![off, provider("on", 2)]);
    let chain = file
        .resolve()
        .chain_for(Uuid::new_v4(), CollectorType::ChatGpt);
    assert_eq!(chain.len(), 1);
    assert_eq!(chain[0].name, "on");
}

#[test]
fn brand_override_removes_provider_for_that_brand_only() {
    let brand = Uuid::new_v4();
    let mut file = file_with(vec![provider("a", 1), provider("b", 2)]);
    file.brand_overrides.push(BrandOverride {
        brand_id: brand,
        disabled_providers: vec!["a".to_string()],
    });
    let plan = file.resolve();

    let overridden = plan.chain_for(brand, CollectorType::ChatGpt);
    assert_eq!(overridden.len(), 1);
    assert_eq!(overridden[0].name, "b");

    let other = plan.chain_for(Uuid::new_v4(), CollectorType::ChatGpt);
    assert_eq!(other.len(), 2);
}

#[test]
fn chain_for_unconfigured_collector_is_empty() {
    let plan = file_with(vec![provider("a", 1)]).resolve();
    assert!(plan
        .chain_for(Uuid::new_v4(), CollectorType::Grok)
        .is_empty());
}

#[test]
fn services_lists_distinct_operations() {
    let mut other = provider("b", 2);
    other.service = "serpapi".to_string();
    let plan = file_with(vec![provider("a", 1), other, provider("c", 3)]).resolve();
    let services: Vec<&str> = plan.services().into_iter().collect();
    assert_eq!(services, vec!["openai", "serpapi"]);
}

#[test]
fn validate_rejects_duplicate_priority() {
    let file = file_with(vec![provider("a", 1), provider("b", 1)]);
    let err = validate_collectors(&file).unwrap_err();
    assert!(err.to_string().contains("duplicate priority 1"));
}

#[test]
fn validate_rejects_duplicate_name() {
    let file = file_with(vec![provider("a", 1), provider("a", 2)]);
    let err = validate_collectors(&file).unwrap_err();
    assert!(err.to_string().contains("duplicate provider name"));
}

#[test]
fn validate_rejects_async_without_status_endpoint() {
    let mut p = provider("deferred", 1);
    p.kind = ProviderKind::Async;
    let err = validate_collectors(&file_with(vec![p])).unwrap_err();
    assert!(err.to_string().contains("status_endpoint"));
}

#[test]
fn validate_rejects_zero_timeout() {
    let mut p = provider("a", 1);
    p.timeout_ms = 0;
    let err = validate_collectors(&file_with(vec![p])).unwrap_err();
    assert!(err.to_string().contains("timeout_ms 0"));
}

#[test]
fn validate_rejects_empty_name() {
    let err = validate_collectors(&file_with(vec![provider("  ", 1)])).unwrap_err();
    assert!(err.to_string().contains("empty name"));
}

#[test]
fn yaml_defaults_apply() {
    let yaml = r"
collectors:
  perplexity:
    providers:
      - name: pplx-direct
        service: perplexity
        endpoint: https://api.example.com/answer
        priority: 1
";
    let file: CollectorsFile = serde_yaml::from_str(yaml).unwrap();
    let p = &file.collectors[&CollectorType::Perplexity].providers[0];
    assert_eq!(p.timeout_ms, 60_000);
    assert_eq!(p.retry_count, 0);
    assert!(p.fallback_on_failure);
    assert!(p.enabled);
    assert_eq!(p.kind, ProviderKind::Sync);
}

#[test]
fn service_names_match_credential_operations_case_insensitively() {
    let yaml = r"
collectors:
  chatgpt:
    providers:
      - name: openai-direct
        service: ' OpenAI '
        endpoint: https://api.example.com/answer
        priority: 1
";
    let mut file: CollectorsFile = serde_yaml::from_str(yaml).unwrap();
    normalize_services(&mut file);
    let plan = file.resolve();
    let services: Vec<&str> = plan.services().into_iter().collect();
    assert_eq!(services, vec!["openai"]);

    let credentials = crate::credentials::build_credentials(vec![(
        "AQO_KEYS_OPENAI".to_string(),
        "sk-1".to_string(),
    )])
    .unwrap();
    assert!(credentials.operations.contains_key(services[0]));
}

#[test]
fn load_collectors_from_real_file() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("..")
        .join("..")
        .join("config")
        .join("collectors.yaml");
    assert!(
        path.exists(),
        "collectors.yaml missing at {path:?}, required for this test"
    );
    let result = load_collectors(&path);
    assert!(result.is_ok(), "failed to load collectors.yaml: {result:?}");
    assert!(!result.unwrap().collectors.is_empty());
}
