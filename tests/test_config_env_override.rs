//! Environment override for the endpoint URL
//!
//! Lives in its own test binary because it mutates process environment.

use resilink::config::{LinkConfig, URL_ENV_VAR};

#[test]
fn test_env_var_overrides_endpoint() {
    std::env::set_var(URL_ENV_VAR, "wss://override.example.com/stream");

    let config = LinkConfig::from_toml_str(
        r#"
[endpoint]
url = "wss://stream.example.com/feed"
"#,
    );

    std::env::remove_var(URL_ENV_VAR);
    assert_eq!(
        config.unwrap().endpoint.url,
        "wss://override.example.com/stream"
    );
}
