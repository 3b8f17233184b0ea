//! Configuração do cliente carregada a partir de `floorsync.toml`.
//!
//! A struct [`FloorConfig`] contém todos os parâmetros configuráveis.
//! Valores não presentes no arquivo usam defaults sensíveis.
//! A variável de ambiente `FLOORSYNC_SERVER_URL` tem precedência sobre o arquivo.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::sync::RetryPolicy;

/// Configuração de nível superior carregada de `floorsync.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct FloorConfig {
    /// URL base do servidor de registro.
    #[serde(default = "default_server_url")]
    pub server_url: String,

    /// Arquivo onde a fila de operações offline é persistida.
    #[serde(default = "default_queue_path")]
    pub queue_path: PathBuf,

    /// Tempo limite de cada requisição, em milissegundos.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Tempo limite para estabelecer conexão, em milissegundos.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Máximo de tentativas por operação antes de marcá-la como falha.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Atraso base em milissegundos para backoff exponencial.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Teto do atraso entre tentativas, em milissegundos.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Janela de estabilização das transições de conectividade.
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,

    /// Intervalo entre verificações de alcance do servidor.
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,
}

fn default_server_url() -> String {
    "http://localhost:8080/api".to_string()
}

fn default_queue_path() -> PathBuf {
    PathBuf::from("floorsync-queue.json")
}

fn default_request_timeout_ms() -> u64 {
    15_000
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

// Valor padrão para tentativas máximas: 5.
fn default_max_attempts() -> u32 {
    5
}

// Valor padrão para o atraso base: 2000ms.
fn default_base_delay_ms() -> u64 {
    2_000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_settle_ms() -> u64 {
    1_500
}

fn default_probe_interval_ms() -> u64 {
    10_000
}

impl Default for FloorConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            queue_path: default_queue_path(),
            request_timeout_ms: default_request_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            settle_ms: default_settle_ms(),
            probe_interval_ms: default_probe_interval_ms(),
        }
    }
}

impl FloorConfig {
    /// Carrega a configuração de `floorsync.toml` no diretório atual.
    /// Usa valores padrão se o arquivo não existir.
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new("floorsync.toml"))
    }

    /// Carrega a configuração de um arquivo específico.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            toml::from_str::<FloorConfig>(&contents)
                .with_context(|| format!("failed to parse {}", path.display()))?
        } else {
            Self::default()
        };

        // Variável de ambiente tem precedência sobre o arquivo para a URL do servidor.
        if let Ok(url) = std::env::var("FLOORSYNC_SERVER_URL")
            && !url.is_empty()
        {
            config.server_url = url;
        }

        Ok(config)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn settle_window(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            request_timeout: self.request_timeout(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn default_config_values() {
        let config = FloorConfig::default();
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.base_delay_ms, 2000);
        assert_eq!(config.settle_ms, 1500);
        assert_eq!(config.queue_path, PathBuf::from("floorsync-queue.json"));
    }

    #[test]
    fn deserialize_partial_toml() {
        let toml_str = r#"
            server_url = "http://mes.plant.local/api"
            max_attempts = 3
        "#;
        let config: FloorConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server_url, "http://mes.plant.local/api");
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.request_timeout_ms, 15_000);
        assert_eq!(config.max_delay_ms, 60_000);
    }

    #[test]
    fn retry_policy_from_config() {
        let config = FloorConfig {
            max_attempts: 0,
            base_delay_ms: 500,
            ..FloorConfig::default()
        };
        let policy = config.retry_policy();
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.base_delay, Duration::from_millis(500));
        assert_eq!(policy.request_timeout, Duration::from_secs(15));
    }

    #[test]
    fn load_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("floorsync.toml");
        std::fs::write(&path, "queue_path = \"/var/lib/floorsync/queue.json\"\n").unwrap();
        let config = FloorConfig::load_from(&path).unwrap();
        assert_eq!(
            config.queue_path,
            PathBuf::from("/var/lib/floorsync/queue.json")
        );
    }

    #[test]
    fn load_rejects_malformed_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("floorsync.toml");
        std::fs::write(&path, "max_attempts = \"many\"").unwrap();
        assert!(FloorConfig::load_from(&path).is_err());
    }

    #[test]
    fn load_falls_back_to_defaults() {
        // No ambiente de teste, tipicamente não há floorsync.toml no diretório de trabalho.
        let config = FloorConfig::load_from(Path::new("does-not-exist.toml")).unwrap();
        assert_eq!(config.max_attempts, 5);
    }
}
