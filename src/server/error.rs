//! Tipos de erro para o cliente do servidor de registro.
//!
//! Define [`ApiError`] com variantes para timeout, rate limiting, rejeições
//! de negócio, erros do servidor e erros de rede. O método
//! [`ApiError::kind`] separa o que vale a pena retentar do que é definitivo.

use thiserror::Error;

use crate::error::FailureKind;

/// Erros que podem ocorrer ao interagir com o servidor de registro.
#[derive(Debug, Error)]
pub enum ApiError {
    /// A requisição excedeu o tempo limite. O resultado no servidor é
    /// desconhecido, então o reenvio depende do `op_id` para idempotência.
    #[error("request timed out")]
    Timeout,

    /// O servidor retornou HTTP 429.
    /// O campo `retry_after_ms` indica quantos milissegundos esperar antes de retentar.
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    /// Rejeição definitiva (4xx): validação ou conflito de regra de negócio,
    /// ex.: processo já concluído no servidor.
    #[error("rejected by server (status {status}): {message}")]
    Rejected { status: u16, message: String },

    /// Erro do lado do servidor (5xx ou 408), considerado transitório.
    #[error("server error (status {status}): {message}")]
    Server { status: u16, message: String },

    /// Corpo de resposta que não pôde ser interpretado.
    #[error("failed to parse server response: {0}")]
    Decode(String),

    /// Falha de rede subjacente (DNS, conexão recusada, conexão perdida).
    #[error("network error: {0}")]
    Network(String),

    /// A URL base configurada não aceita segmentos de caminho.
    #[error("invalid server URL: {0}")]
    InvalidUrl(String),
}

impl ApiError {
    /// Classifica o erro para a política de retentativa.
    pub fn kind(&self) -> FailureKind {
        match self {
            ApiError::Rejected { .. } | ApiError::InvalidUrl(_) => FailureKind::Rejection,
            ApiError::Timeout
            | ApiError::RateLimited { .. }
            | ApiError::Server { .. }
            | ApiError::Decode(_)
            | ApiError::Network(_) => FailureKind::Transient,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == FailureKind::Transient
    }

    /// Atraso mínimo pedido pelo servidor, quando houver.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            ApiError::RateLimited { retry_after_ms } => Some(*retry_after_ms),
            _ => None,
        }
    }

    /// Mapeia um status HTTP não-2xx para a variante correspondente.
    pub fn from_status(status: u16, message: String) -> Self {
        match status {
            408 | 500..=599 => ApiError::Server { status, message },
            _ => ApiError::Rejected { status, message },
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ApiError::Timeout
        } else if err.is_decode() {
            ApiError::Decode(err.to_string())
        } else {
            ApiError::Network(err.to_string())
        }
    }
}
