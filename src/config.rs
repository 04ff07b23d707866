// Конфигурация приложения
// Логирование можно отключить только в режиме разработки

use crate::error::ConfigError;
use crate::peer::types::ServerConfig;
use serde::Deserialize;
use std::time::Duration;

#[cfg(debug_assertions)]
pub const LOGGING_ENABLED: bool = true; // В режиме отладки логирование включено

#[cfg(not(debug_assertions))]
pub const LOGGING_ENABLED: bool = false; // В продакшене логирование отключено

pub const DEFAULT_CHANNEL_LABEL: &str = "sendChannel";
pub const DEFAULT_MAX_MESSAGE_LEN: usize = 120;
pub const DEFAULT_NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Сколько ждать, пока конечная точка сама закроется, прежде чем прервать её задачу
pub const DEFAULT_CLOSE_GRACE: Duration = Duration::from_secs(2);

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    pub channel_label: String,
    pub max_message_len: usize,
    /// `None` отключает таймаут согласования
    pub negotiation_timeout: Option<Duration>,
    pub close_grace: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            channel_label: DEFAULT_CHANNEL_LABEL.into(),
            max_message_len: DEFAULT_MAX_MESSAGE_LEN,
            negotiation_timeout: Some(DEFAULT_NEGOTIATION_TIMEOUT),
            close_grace: DEFAULT_CLOSE_GRACE,
        }
    }
}

impl SessionConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(label) = lookup("DCCHAT_CHANNEL_LABEL").filter(|v| !v.trim().is_empty()) {
            config.channel_label = label;
        }
        if let Some(raw) = lookup("DCCHAT_MAX_MESSAGE_LEN") {
            config.max_message_len = parse_number("DCCHAT_MAX_MESSAGE_LEN", &raw)?;
        }
        if let Some(raw) = lookup("DCCHAT_NEGOTIATION_TIMEOUT_SECS") {
            let secs = parse_number("DCCHAT_NEGOTIATION_TIMEOUT_SECS", &raw)?;
            config.negotiation_timeout = (secs > 0).then(|| Duration::from_secs(secs as u64));
        }
        if let Some(raw) = lookup("DCCHAT_CLOSE_GRACE_MS") {
            let ms = parse_number("DCCHAT_CLOSE_GRACE_MS", &raw)?;
            config.close_grace = Duration::from_millis(ms as u64);
        }
        Ok(config)
    }
}

fn parse_number(key: &'static str, raw: &str) -> Result<usize, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key,
        value: raw.to_string(),
    })
}

/// Набор ICE серверов для боевого транспорта
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct IceConfig {
    pub servers: Vec<ServerConfig>,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            servers: vec![
                ServerConfig {
                    id: "default-stun".into(),
                    r#type: "stun".into(),
                    url: "stun:stun.l.google.com:19302".into(),
                    username: None,
                    credential: None,
                },
                ServerConfig {
                    id: "default-stun-1".into(),
                    r#type: "stun".into(),
                    url: "stun:stun1.l.google.com:19302".into(),
                    username: None,
                    credential: None,
                },
            ],
        }
    }
}

impl IceConfig {
    /// Без серверов: только host-кандидаты, удобно для локального демо
    pub fn host_only() -> Self {
        Self { servers: Vec::new() }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for server in &self.servers {
            if server.url.is_empty() {
                return Err(ConfigError::EmptyServerUrl(server.id.clone()));
            }
            if server.r#type == "turn" && (server.username.is_none() || server.credential.is_none())
            {
                return Err(ConfigError::MissingTurnCredentials(server.id.clone()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn env_overrides_defaults() {
        let config = SessionConfig::from_lookup(lookup(&[
            ("DCCHAT_MAX_MESSAGE_LEN", "64"),
            ("DCCHAT_NEGOTIATION_TIMEOUT_SECS", "0"),
            ("DCCHAT_CHANNEL_LABEL", "chat"),
        ]))
        .unwrap();
        assert_eq!(config.max_message_len, 64);
        assert_eq!(config.negotiation_timeout, None);
        assert_eq!(config.channel_label, "chat");
        assert_eq!(config.close_grace, DEFAULT_CLOSE_GRACE);
    }

    #[test]
    fn bad_number_is_reported_with_its_key() {
        let err = SessionConfig::from_lookup(lookup(&[("DCCHAT_CLOSE_GRACE_MS", "soon")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue { key: "DCCHAT_CLOSE_GRACE_MS", .. }
        ));
    }

    #[test]
    fn turn_without_credentials_is_rejected() {
        let config = IceConfig {
            servers: vec![ServerConfig {
                id: "relay".into(),
                r#type: "turn".into(),
                url: "turn.example.org:3478".into(),
                username: Some("user".into()),
                credential: None,
            }],
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingTurnCredentials(id)) if id == "relay"
        ));
        assert!(IceConfig::default().validate().is_ok());
    }
}
