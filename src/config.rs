use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::portal::StepSelectors;

/// Upper bound for the minute-based cooldowns (one year).
const MAX_MINUTES: i64 = 366 * 24 * 60;
/// Upper bound for the second-based waits (one day).
const MAX_SECONDS: u64 = 24 * 60 * 60;

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Unable to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Address {
    pub postal_code: Option<String>,
    pub salutation: Option<String>,
    pub street: Option<String>,
    pub street_no: Option<String>,
    pub surname: Option<String>,
    pub name: Option<String>,
    pub city: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
}

impl Address {
    /// Form field names paired with their values, skipping blanks.
    pub fn form_fields(&self) -> Vec<(&'static str, &str)> {
        [
            ("salutation", &self.salutation),
            ("name", &self.name),
            ("surname", &self.surname),
            ("street", &self.street),
            ("street_no", &self.street_no),
            ("postal_code", &self.postal_code),
            ("city", &self.city),
            ("phone", &self.phone),
            ("email", &self.email),
        ]
        .into_iter()
        .filter_map(|(field, value)| value.as_deref().map(|v| (field, v)))
        .filter(|(_, v)| !v.trim().is_empty())
        .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.form_fields().is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartyConfig {
    pub name: String,
    pub recipient: String,
    pub url: Url,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub postal_code: Option<String>,
    #[serde(default)]
    pub age: Option<u32>,
    #[serde(default)]
    pub vaccine_code: Option<String>,
    #[serde(default)]
    pub address: Address,
    #[serde(default)]
    pub auto_book: bool,
}

impl PartyConfig {
    pub fn new(name: impl Into<String>, recipient: impl Into<String>, url: Url) -> Self {
        Self {
            name: name.into(),
            recipient: recipient.into(),
            url,
            code: None,
            postal_code: None,
            age: None,
            vaccine_code: None,
            address: Address::default(),
            auto_book: false,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_postal_code(mut self, postal_code: impl Into<String>) -> Self {
        self.postal_code = Some(postal_code.into());
        self
    }

    pub fn with_age(mut self, age: u32) -> Self {
        self.age = Some(age);
        self
    }

    pub fn with_auto_book(mut self, address: Address) -> Self {
        self.address = address;
        self.auto_book = true;
        self
    }

    fn validate(&mut self) -> ConfigResult<()> {
        for field in [&mut self.code, &mut self.vaccine_code] {
            if field.as_deref().is_some_and(|v| v.trim().is_empty()) {
                *field = None;
            }
        }

        let name = self.name.trim();
        if name.is_empty() {
            return Err(ConfigError::Invalid("party name must not be empty".into()));
        }
        if self.recipient.trim().is_empty() {
            return Err(ConfigError::Invalid(format!("party {name}: recipient is missing")));
        }
        if self.postal_code.as_deref().map_or(true, |p| p.trim().is_empty()) {
            return Err(ConfigError::Invalid(format!("party {name}: postal_code is missing")));
        }
        if self.code.is_none() && self.age.is_none() {
            return Err(ConfigError::Invalid(format!(
                "party {name}: age is required when no reservation code is given"
            )));
        }
        if self.auto_book && self.address.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "party {name}: auto_book needs an address"
            )));
        }
        if !self.url.path().ends_with('/') {
            let path = format!("{}/", self.url.path());
            self.url.set_path(&path);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    pub user_agent: String,
    pub request_timeout_secs: u64,
    pub selectors: StepSelectors,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            request_timeout_secs: 30,
            selectors: StepSelectors::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MailTransport {
    Outbox {
        dir: PathBuf,
    },
    Http {
        endpoint: Url,
        #[serde(default)]
        token: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MailConfig {
    pub sender: String,
    pub signature: String,
    pub transport: MailTransport,
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            sender: "slotwatch@localhost".to_string(),
            signature: "slotwatch".to_string(),
            transport: MailTransport::Outbox {
                dir: PathBuf::from("out/outbox"),
            },
        }
    }
}

/// Every wait and cooldown the monitor observes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub inter_party_delay_secs: u64,
    pub rate_limit_cooldown_secs: u64,
    pub pending_cooldown_mins: i64,
    pub scheduled_cooldown_mins: i64,
    pub escalation_after_mins: i64,
    pub settle_secs: u64,
    pub post_click_secs: u64,
    pub poll_interval_secs: u64,
    pub challenge_timeout_secs: u64,
    pub waiting_room_timeout_secs: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            inter_party_delay_secs: 10,
            rate_limit_cooldown_secs: 120,
            pending_cooldown_mins: 20,
            scheduled_cooldown_mins: 120,
            escalation_after_mins: 30,
            settle_secs: 1,
            post_click_secs: 5,
            poll_interval_secs: 3,
            challenge_timeout_secs: 60,
            waiting_room_timeout_secs: 600,
        }
    }
}

impl TimingConfig {
    pub fn inter_party_delay(&self) -> Duration {
        Duration::from_secs(self.inter_party_delay_secs)
    }

    pub fn rate_limit_cooldown(&self) -> Duration {
        Duration::from_secs(self.rate_limit_cooldown_secs)
    }

    pub fn escalation_after(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.escalation_after_mins)
    }

    fn validate(&self) -> ConfigResult<()> {
        let minutes = [
            ("pending_cooldown_mins", self.pending_cooldown_mins),
            ("scheduled_cooldown_mins", self.scheduled_cooldown_mins),
            ("escalation_after_mins", self.escalation_after_mins),
        ];
        for (field, value) in minutes {
            if !(0..=MAX_MINUTES).contains(&value) {
                return Err(ConfigError::Invalid(format!(
                    "timing.{field} must be between 0 and {MAX_MINUTES}, got {value}"
                )));
            }
        }

        let seconds = [
            ("inter_party_delay_secs", self.inter_party_delay_secs),
            ("rate_limit_cooldown_secs", self.rate_limit_cooldown_secs),
            ("settle_secs", self.settle_secs),
            ("post_click_secs", self.post_click_secs),
            ("poll_interval_secs", self.poll_interval_secs),
            ("challenge_timeout_secs", self.challenge_timeout_secs),
            ("waiting_room_timeout_secs", self.waiting_room_timeout_secs),
        ];
        for (field, value) in seconds {
            if value > MAX_SECONDS {
                return Err(ConfigError::Invalid(format!(
                    "timing.{field} must not exceed {MAX_SECONDS}, got {value}"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub admin_email: Option<String>,
    pub parties: Vec<PartyConfig>,
    #[serde(default = "default_out_dir")]
    pub out_dir: PathBuf,
    #[serde(default)]
    pub browser: BrowserConfig,
    #[serde(default)]
    pub mail: MailConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    /// How many error bundles and screenshots are kept in `out_dir`.
    #[serde(default = "default_keep_artifacts")]
    pub keep_artifacts: usize,
}

fn default_out_dir() -> PathBuf {
    PathBuf::from("out")
}

fn default_keep_artifacts() -> usize {
    20
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> ConfigResult<Self> {
        let mut config: Config = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&mut self) -> ConfigResult<()> {
        if self.parties.is_empty() {
            return Err(ConfigError::Invalid("no parties configured".into()));
        }

        let mut names = HashSet::new();
        for party in &mut self.parties {
            party.validate()?;
            if !names.insert(party.name.clone()) {
                return Err(ConfigError::Invalid(format!(
                    "party {} is configured twice",
                    party.name
                )));
            }
        }

        self.timing.validate()?;
        if self.keep_artifacts == 0 {
            return Err(ConfigError::Invalid("keep_artifacts must be at least 1".into()));
        }

        if self.admin_email.as_deref().is_some_and(|a| a.trim().is_empty()) {
            self.admin_email = None;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
admin_email: admin@example.org
parties:
  - name: Jane Doe
    recipient: jane@example.org
    url: https://001-iz.portal.test/app
    code: ABCD-EFGH-IJKL
    postal_code: "70173"
  - name: John
    recipient: john@example.org
    url: https://001-iz.portal.test/
    postal_code: "70174"
    age: 61
    auto_book: true
    address:
      name: John
      surname: Doe
      email: john@example.org
timing:
  inter_party_delay_secs: 2
mail:
  sender: watch@example.org
  transport:
    kind: http
    endpoint: https://relay.test/send
"#;

    #[test]
    fn test_load_sample_with_defaults() {
        let config = Config::from_yaml(SAMPLE).unwrap();

        assert_eq!(config.admin_email.as_deref(), Some("admin@example.org"));
        assert_eq!(config.parties.len(), 2);
        assert_eq!(config.out_dir, PathBuf::from("out"));
        assert_eq!(config.timing.inter_party_delay_secs, 2);
        assert_eq!(config.timing.rate_limit_cooldown_secs, 120);
        assert_eq!(config.timing.pending_cooldown_mins, 20);
        assert_eq!(config.mail.sender, "watch@example.org");
        assert_eq!(config.mail.signature, "slotwatch");
        assert!(matches!(config.mail.transport, MailTransport::Http { .. }));

        let john = &config.parties[1];
        assert!(john.auto_book);
        assert_eq!(john.address.surname.as_deref(), Some("Doe"));
        assert_eq!(john.address.form_fields().len(), 3);
    }

    #[test]
    fn test_base_url_gets_trailing_slash() {
        let config = Config::from_yaml(SAMPLE).unwrap();
        assert_eq!(config.parties[0].url.as_str(), "https://001-iz.portal.test/app/");
        assert_eq!(config.parties[1].url.as_str(), "https://001-iz.portal.test/");
    }

    #[test]
    fn test_waitlist_party_requires_age() {
        let raw = r#"
parties:
  - name: Anon
    recipient: anon@example.org
    url: https://portal.test/
    postal_code: "10115"
"#;
        let err = Config::from_yaml(raw).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(msg) if msg.contains("age is required")));
    }

    #[test]
    fn test_blank_code_counts_as_missing() {
        let raw = r#"
parties:
  - name: Anon
    recipient: anon@example.org
    url: https://portal.test/
    code: "  "
    postal_code: "10115"
"#;
        let err = Config::from_yaml(raw).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(msg) if msg.contains("age is required")));

        let with_age = format!("{raw}    age: 40\n    vaccine_code: \"\"\n");
        let config = Config::from_yaml(&with_age).unwrap();
        assert_eq!(config.parties[0].code, None);
        assert_eq!(config.parties[0].vaccine_code, None);
    }

    #[test]
    fn test_timing_out_of_range_rejected() {
        let party = r#"
parties:
  - { name: A, recipient: a@x.org, url: "https://p.test/", code: C, postal_code: "1" }
"#;
        for timing in [
            "timing: { pending_cooldown_mins: -5 }",
            "timing: { escalation_after_mins: -1 }",
            "timing: { scheduled_cooldown_mins: 9223372036854775807 }",
            "timing: { waiting_room_timeout_secs: 1000000 }",
        ] {
            let raw = format!("{party}{timing}\n");
            assert!(
                matches!(Config::from_yaml(&raw), Err(ConfigError::Invalid(msg)) if msg.contains("timing.")),
                "{timing} was accepted"
            );
        }

        let raw = format!("{party}timing: {{ escalation_after_mins: 0 }}\n");
        let config = Config::from_yaml(&raw).unwrap();
        assert_eq!(config.timing.escalation_after(), chrono::Duration::zero());
        assert_eq!(config.keep_artifacts, 20);
    }

    #[test]
    fn test_zero_artifact_retention_rejected() {
        let raw = r#"
parties:
  - { name: A, recipient: a@x.org, url: "https://p.test/", code: C, postal_code: "1" }
keep_artifacts: 0
"#;
        assert!(matches!(
            Config::from_yaml(raw),
            Err(ConfigError::Invalid(msg)) if msg.contains("keep_artifacts")
        ));
    }

    #[test]
    fn test_duplicate_party_names_rejected() {
        let raw = r#"
parties:
  - { name: A, recipient: a@x.org, url: "https://p.test/", code: C, postal_code: "1" }
  - { name: A, recipient: b@x.org, url: "https://p.test/", code: D, postal_code: "2" }
"#;
        assert!(matches!(
            Config::from_yaml(raw),
            Err(ConfigError::Invalid(msg)) if msg.contains("twice")
        ));
    }

    #[test]
    fn test_empty_party_list_rejected() {
        assert!(matches!(
            Config::from_yaml("parties: []"),
            Err(ConfigError::Invalid(_))
        ));
    }
}
