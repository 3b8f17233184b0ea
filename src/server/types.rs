//! Tipos de dados para as requisições e respostas do servidor de registro.
//!
//! Todas as structs derivam `Serialize` e `Deserialize` para conversão JSON
//! conforme o formato esperado pelos endpoints `process/start` e
//! `process/complete`. O `op_id` não faz parte destas structs: o cliente o
//! anexa em cada envio como chave de idempotência.

use serde::{Deserialize, Serialize};

use crate::flow::ProcessResult;
use crate::queue::OpId;

/// Corpo da requisição para iniciar um processo em uma unidade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartRequest {
    /// Identificador da unidade (WIP) escaneada pelo operador.
    pub wip_id: String,
    /// Identificador do processo no catálogo do servidor.
    pub process_id: String,
    /// Operador que executa o processo.
    pub worker_id: String,
    /// Equipamento usado, quando aplicável.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub equipment_id: Option<String>,
    /// Linha de produção, quando aplicável.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_id: Option<String>,
}

/// Corpo da requisição para concluir o processo aberto de uma unidade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompleteRequest {
    pub wip_id: String,
    pub process_id: String,
    pub worker_id: String,
    /// Veredito do operador: PASS, FAIL ou REWORK.
    pub result: ProcessResult,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub measurements: Vec<Measurement>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub defect_data: Vec<DefectRecord>,
}

/// Uma medição registrada na conclusão de um processo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub name: String,
    pub value: MeasurementValue,
}

/// Valor tipado de uma medição.
///
/// O campo `type` no JSON distingue as variantes (`numeric`, `text`,
/// `enumerated`) via `serde(tag)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MeasurementValue {
    /// Valor numérico com unidade opcional (ex.: "mm", "N·m").
    Numeric {
        value: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        unit: Option<String>,
    },
    /// Texto livre.
    Text { value: String },
    /// Valor escolhido de uma lista fechada.
    Enumerated {
        value: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        options: Vec<String>,
    },
}

/// Defeito encontrado durante o processo.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefectRecord {
    pub defect_code: String,
    pub quantity: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Confirmação do servidor para uma requisição de início ou conclusão.
///
/// O corpo é opcional; uma resposta 2xx vazia equivale a `Ack::default()`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    #[serde(default)]
    pub op_id: Option<OpId>,
    /// `true` quando o servidor já havia aplicado este `op_id` antes.
    #[serde(default)]
    pub duplicate: bool,
}

/// Envelope que anexa o `op_id` ao corpo enviado ao servidor.
#[derive(Debug, Serialize)]
pub(crate) struct Envelope<'a, T: Serialize> {
    pub op_id: OpId,
    #[serde(flatten)]
    pub body: &'a T,
}
