// tests/config_load.rs
use std::{env, fs};

use site_aggregator::config::{AppConfig, CacheBackend, ENV_PATH};
use site_aggregator::{ConfigError, DateStrategy};

const SITES_TOML: &str = r#"
[worker]
timeout_secs = 30
max_retries = 0
pool_size = 4

[cache]
ttl_secs = 120
backend = "file"
dir = "cache/test"

[scoring]
recency = 1.0
rank = 0.0

[[sites]]
site_id = "news"
date_strategy = "yesterday"
providers = [
  { id = "site_a", url = "https://a.test/api" },
  { id = "site_b", url = "https://b.test/api" },
]

[[sites]]
site_id = "archive"
date_strategy = "custom"
custom_date = "2024-12-24"
enabled = false
providers = [{ id = "site_b", url = "https://b.test/archive" }]
"#;

fn clear_env() {
    for k in [ENV_PATH, "HTTP_TIMEOUT", "HTTP_RETRIES", "CACHE_TTL_SECS", "BIND_ADDR"] {
        env::remove_var(k);
    }
}

#[test]
fn toml_file_loads_and_clamps_worker_limits() {
    let dir = tempfile::tempdir().unwrap();
    let p = dir.path().join("sites.toml");
    fs::write(&p, SITES_TOML).unwrap();

    let cfg = AppConfig::load_from(&p).unwrap();
    assert_eq!(cfg.worker.timeout_secs, 10);
    assert_eq!(cfg.worker.max_retries, 1);
    assert_eq!(cfg.worker.pool_size, 4);
    assert_eq!(cfg.cache.backend, CacheBackend::File);
    assert_eq!(cfg.cache.ttl_secs, 120);
    assert_eq!(cfg.scoring.recency, 1.0);
    assert_eq!(cfg.scoring.quality, 0.2);
    assert_eq!(cfg.sites.len(), 2);
    assert_eq!(cfg.sites[0].date_strategy, DateStrategy::Yesterday);
    assert_eq!(cfg.sites[1].custom_date.unwrap().to_string(), "2024-12-24");
    assert_eq!(cfg.source.as_deref(), Some(p.as_path()));

    let tr = cfg.transformers().unwrap();
    let reg = cfg.site_registry(&tr).unwrap();
    assert_eq!(reg.list_enabled().len(), 1);
}

#[test]
fn json_file_loads() {
    let dir = tempfile::tempdir().unwrap();
    let p = dir.path().join("sites.json");
    fs::write(
        &p,
        r#"{"sites": [{"site_id": "news", "providers": [{"id": "site_a", "url": "http://a.com"}]}]}"#,
    )
    .unwrap();
    let cfg = AppConfig::load_from(&p).unwrap();
    assert_eq!(cfg.sites[0].date_strategy, DateStrategy::Today);
    assert_eq!(cfg.worker.timeout_secs, 5);
    assert_eq!(cfg.worker.max_retries, 3);
}

#[test]
fn schema_violations_fail_the_load() {
    let dir = tempfile::tempdir().unwrap();
    let p = dir.path().join("sites.toml");
    fs::write(
        &p,
        r#"
[[sites]]
site_id = "news"
providers = [{ id = "mystery", url = "https://m.test" }]
"#,
    )
    .unwrap();
    let cfg = AppConfig::load_from(&p).unwrap();
    let tr = cfg.transformers().unwrap();
    assert!(matches!(
        cfg.site_registry(&tr),
        Err(ConfigError::UnmappedProvider { .. })
    ));

    fs::write(&p, "[[sites]\nsite_id = ").unwrap();
    assert!(matches!(
        AppConfig::load_from(&p),
        Err(ConfigError::Parse { .. })
    ));
}

#[serial_test::serial]
#[test]
fn default_uses_env_then_fallbacks_then_builtin() {
    // Isolate CWD so the repo's own config/ is not picked up.
    let old = env::current_dir().unwrap();
    let tmp = tempfile::tempdir().unwrap();
    env::set_current_dir(tmp.path()).unwrap();
    clear_env();

    // 1) Nothing on disk → built-in news site
    let cfg = AppConfig::load_default().unwrap();
    assert!(cfg.source.is_none());
    assert_eq!(cfg.sites[0].site_id, "news");

    // 2) Fallback TOML in ./config/
    let cfg_dir = tmp.path().join("config");
    fs::create_dir_all(&cfg_dir).unwrap();
    fs::write(cfg_dir.join("sites.toml"), SITES_TOML).unwrap();
    let cfg = AppConfig::load_default().unwrap();
    assert_eq!(cfg.sites.len(), 2);

    // 3) Env path wins
    let p_env = tmp.path().join("other.json");
    fs::write(
        &p_env,
        r#"{"sites": [{"site_id": "env", "providers": [{"id": "site_b", "url": "http://b.com"}]}]}"#,
    )
    .unwrap();
    env::set_var(ENV_PATH, p_env.display().to_string());
    let cfg = AppConfig::load_default().unwrap();
    assert_eq!(cfg.sites[0].site_id, "env");

    // 4) Env path to nowhere is an error
    env::set_var(ENV_PATH, tmp.path().join("missing.toml").display().to_string());
    assert!(matches!(
        AppConfig::load_default(),
        Err(ConfigError::MissingPath(..))
    ));

    clear_env();
    env::set_current_dir(&old).unwrap();
}

#[serial_test::serial]
#[test]
fn env_overrides_apply_and_clamp() {
    let old = env::current_dir().unwrap();
    let tmp = tempfile::tempdir().unwrap();
    env::set_current_dir(tmp.path()).unwrap();
    clear_env();

    env::set_var("HTTP_TIMEOUT", "2");
    env::set_var("HTTP_RETRIES", "99");
    env::set_var("CACHE_TTL_SECS", "not-a-number");
    env::set_var("BIND_ADDR", "127.0.0.1:9999");
    let cfg = AppConfig::load_default().unwrap();
    assert_eq!(cfg.worker.timeout_secs, 2);
    assert_eq!(cfg.worker.max_retries, 10);
    assert_eq!(cfg.cache.ttl_secs, 300);
    assert_eq!(cfg.server.bind_addr, "127.0.0.1:9999");

    clear_env();
    env::set_current_dir(&old).unwrap();
}
