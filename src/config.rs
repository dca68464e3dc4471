//! Configuration file loading, defaulting and validation.
//!
//! A [`Config`] is deserialized from a JSON or YAML file (dispatched on file
//! extension) and then run through [`Config::apply_defaults`] and
//! [`Config::validate`] before the rest of the system ever sees it.

use std::{
    io::{self, Write},
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config file {0:?}: {1}")]
    Read(PathBuf, #[source] io::Error),

    #[error("invalid config file extension: {0:?}")]
    UnsupportedExtension(PathBuf),

    #[error("parsing JSON config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("parsing YAML config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("{0}")]
    Validation(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HookType {
    Polling,
    Webhook,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Hook {
    #[serde(rename = "type")]
    pub kind: HookType,
    /// Only meaningful for `kind == Polling`. Serialized/deserialized in
    /// seconds, as the original Go config does via `time.Duration`.
    #[serde(
        default,
        with = "duration_secs",
        skip_serializing_if = "Option::is_none"
    )]
    pub interval: Option<Duration>,
    /// Only meaningful for `kind == Webhook`; carried through for parity with
    /// the sample config, unused by this crate's webhook server (which always
    /// listens on the configured `webhook` address/port).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match v {
            Some(d) => s.serialize_u64(d.as_secs()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_secs))
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PrivateKey {
    #[serde(default)]
    pub key: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub skip_host_key_check: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Credentials {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password: String,
    #[serde(default)]
    pub private_key: PrivateKey,
}

impl Credentials {
    pub fn is_empty(&self) -> bool {
        self.username.is_empty() && self.password.is_empty() && self.private_key.key.is_empty()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Repo {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub branches: Vec<String>,
    #[serde(default)]
    pub hooks: Vec<Hook>,
    #[serde(default)]
    pub source_root: String,
    #[serde(default)]
    pub mount_point: String,
    #[serde(default)]
    pub skip_branch_name: bool,
    #[serde(default)]
    pub skip_repo_name: bool,
    #[serde(default)]
    pub credentials: Credentials,
}

impl Repo {
    pub fn has_webhook_trigger(&self) -> bool {
        self.hooks.iter().any(|h| h.kind == HookType::Webhook)
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct WebhookServerConfig {
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub port: u16,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ConsulTlsConfig {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub server_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ca_file: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cert_file: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub key_file: String,
    #[serde(default)]
    pub insecure_skip_verify: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ConsulConfig {
    #[serde(default)]
    pub address: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub token: String,
    #[serde(default)]
    pub ssl_enable: bool,
    #[serde(default)]
    pub tls_config: ConsulTlsConfig,
}

impl Default for ConsulConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            token: String::new(),
            ssl_enable: false,
            tls_config: ConsulTlsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct LogConfig {
    #[serde(default)]
    pub format: String,
    #[serde(default)]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: String::new(),
            level: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub local_store: String,
    #[serde(default)]
    pub webhook: WebhookServerConfig,
    pub repos: Vec<Repo>,
    #[serde(default)]
    pub consul: ConsulConfig,
    #[serde(default)]
    pub log: LogConfig,
}

/// Load a config from disk, apply defaults, and validate it.
pub fn load(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let content =
        std::fs::read_to_string(path).map_err(|e| ConfigError::Read(path.to_owned(), e))?;

    let mut config: Config = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => serde_json::from_str(&content)?,
        Some("yml") | Some("yaml") => serde_yaml::from_str(&content)?,
        _ => return Err(ConfigError::UnsupportedExtension(path.to_owned())),
    };

    config.apply_defaults();
    config.validate()?;
    Ok(config)
}

impl Config {
    fn apply_defaults(&mut self) {
        if self.local_store.is_empty() {
            self.local_store = std::env::temp_dir().to_string_lossy().into_owned();
        }
        if self.webhook.port == 0 {
            self.webhook.port = 9000;
        }
        if self.log.format.is_empty() {
            self.log.format = "text".to_owned();
        }
        if self.log.level.is_empty() {
            self.log.level = "info".to_owned();
        }
        if self.consul.address.is_empty() {
            self.consul.address = "127.0.0.1:8500".to_owned();
        }

        for repo in &mut self.repos {
            if repo.branches.is_empty() {
                repo.branches.push("main".to_owned());
            }
            if repo.hooks.is_empty() {
                repo.hooks.push(Hook {
                    kind: HookType::Polling,
                    interval: Some(Duration::from_secs(60)),
                    url: String::new(),
                });
            }
            if let Some(home) = repo.credentials.private_key.key.strip_prefix("~/") {
                if let Some(dir) = dirs::home_dir() {
                    repo.credentials.private_key.key =
                        dir.join(home).to_string_lossy().into_owned();
                }
            }
            if repo.credentials.private_key.key.is_empty() {
                // nothing to default
            } else if repo.credentials.private_key.username.is_empty() {
                repo.credentials.private_key.username = "git".to_owned();
            }
        }
    }

    /// Check every validation rule named in the spec. Returns the first
    /// violation found, naming the offending repository and field.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.repos.is_empty() {
            return Err(ConfigError::Validation(
                "at least one repository must be configured".to_owned(),
            ));
        }

        let mut seen_names = std::collections::HashSet::new();
        for repo in &self.repos {
            if repo.name.is_empty() {
                return Err(ConfigError::Validation(
                    "repository array object missing \"name\" value".to_owned(),
                ));
            }
            if !seen_names.insert(repo.name.clone()) {
                return Err(ConfigError::Validation(format!(
                    "duplicate repository name: {}",
                    repo.name
                )));
            }
            if repo.url.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "{} does not have a repository URL",
                    repo.name
                )));
            }
            for hook in &repo.hooks {
                if hook.kind == HookType::Polling {
                    match hook.interval {
                        Some(d) if !d.is_zero() => {}
                        _ => {
                            return Err(ConfigError::Validation(format!(
                                "invalid interval for repository {}: polling hook interval must be greater than zero",
                                repo.name
                            )))
                        }
                    }
                }
            }
            if !repo.mount_point.is_empty() {
                if repo.mount_point.starts_with('/') {
                    return Err(ConfigError::Validation(format!(
                        "invalid mount_point format for the {} repository - found \"/\" in the beginning of the path",
                        repo.name
                    )));
                }
                if !repo.mount_point.ends_with('/') {
                    return Err(ConfigError::Validation(format!(
                        "invalid mount_point format for the {} repository - missing trailing \"/\"",
                        repo.name
                    )));
                }
            }
            if !repo.source_root.is_empty() {
                if !repo.source_root.starts_with('/') {
                    return Err(ConfigError::Validation(format!(
                        "invalid source_root format for the {} repository - missing \"/\" in the beginning of the path",
                        repo.name
                    )));
                }
                if !repo.source_root.ends_with('/') {
                    return Err(ConfigError::Validation(format!(
                        "invalid source_root format for the {} repository - missing trailing \"/\"",
                        repo.name
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Write a fully-populated sample config, mirroring `DumpSampleConfig` from
/// the reference implementation: one SSH-authenticated repo with a webhook
/// trigger, `mount_point=""`, `skip_branch_name=true`.
pub fn dump_sample(w: &mut impl Write) -> Result<(), ConfigError> {
    let sample = Config {
        local_store: "/var/lib/git2kv".to_owned(),
        webhook: WebhookServerConfig {
            address: String::new(),
            port: 8484,
        },
        repos: vec![Repo {
            name: "consul-kv-config".to_owned(),
            url: "ssh://git@git.example.com:2222/example/consul-kv-config.git".to_owned(),
            branches: vec!["main".to_owned()],
            hooks: vec![Hook {
                kind: HookType::Webhook,
                interval: Some(Duration::from_secs(30)),
                url: String::new(),
            }],
            source_root: "/".to_owned(),
            mount_point: String::new(),
            skip_branch_name: true,
            skip_repo_name: false,
            credentials: Credentials {
                username: String::new(),
                password: String::new(),
                private_key: PrivateKey {
                    key: "~/.ssh/id_ed25519".to_owned(),
                    skip_host_key_check: true,
                    username: "git".to_owned(),
                    password: String::new(),
                },
            },
        }],
        consul: ConsulConfig {
            address: "127.0.0.1:8500".to_owned(),
            token: String::new(),
            ssl_enable: false,
            tls_config: ConsulTlsConfig::default(),
        },
        log: LogConfig {
            format: "text".to_owned(),
            level: "info".to_owned(),
        },
    };
    let out = serde_yaml::to_string(&sample)?;
    w.write_all(out.as_bytes())
        .map_err(|e| ConfigError::Read(PathBuf::from("<stdout>"), e))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    use super::*;

    fn write_temp(ext: &str, content: &str) -> tempfile::TempPath {
        let mut f = tempfile::Builder::new()
            .suffix(&format!(".{ext}"))
            .tempfile()
            .unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f.into_temp_path()
    }

    #[test]
    fn test_load_json_defaults() {
        let path = write_temp(
            "json",
            r#"{"repos": [{"name": "demo", "url": "https://example.com/demo.git"}]}"#,
        );
        let config = load(&path).unwrap();
        assert_eq!(config.repos[0].branches, vec!["main".to_owned()]);
        assert_eq!(config.webhook.port, 9000);
        assert_eq!(config.log.format, "text");
        assert_eq!(config.log.level, "info");
        assert_eq!(config.consul.address, "127.0.0.1:8500");
    }

    #[test]
    fn test_load_yaml() {
        let path = write_temp(
            "yaml",
            "repos:\n  - name: demo\n    url: https://example.com/demo.git\n",
        );
        let config = load(&path).unwrap();
        assert_eq!(config.repos.len(), 1);
    }

    #[test]
    fn test_unsupported_extension() {
        let path = write_temp("toml", "repos = []");
        assert!(matches!(
            load(&path),
            Err(ConfigError::UnsupportedExtension(_))
        ));
    }

    #[test]
    fn test_empty_repos_rejected() {
        let path = write_temp("json", r#"{"repos": []}"#);
        assert!(matches!(load(&path), Err(ConfigError::Validation(_))));
    }

    #[test_case("foo"; "missing trailing slash")]
    #[test_case("/foo/"; "leading slash")]
    fn test_mount_point_rejected(mount_point: &str) {
        let path = write_temp(
            "json",
            &format!(
                r#"{{"repos": [{{"name": "demo", "url": "https://example.com/demo.git", "mount_point": "{mount_point}"}}]}}"#
            ),
        );
        assert!(matches!(load(&path), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_source_root_requires_both_slashes() {
        let path = write_temp(
            "json",
            r#"{"repos": [{"name": "demo", "url": "https://example.com/demo.git", "source_root": "foo"}]}"#,
        );
        assert!(matches!(load(&path), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let path = write_temp(
            "json",
            r#"{"repos": [{"name": "demo", "url": "https://example.com/demo.git", "hooks": [{"type": "polling", "interval": 0}]}]}"#,
        );
        assert!(matches!(load(&path), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_dump_sample_round_trips_through_validate() {
        let mut buf = Vec::new();
        dump_sample(&mut buf).unwrap();
        let mut config: Config = serde_yaml::from_slice(&buf).unwrap();
        config.apply_defaults();
        config.validate().unwrap();
    }
}
