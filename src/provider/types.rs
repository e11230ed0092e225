//! Wire types of the case-management provider.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Role a subject plays in a process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubjectRole {
    Plaintiff,
    Defendant,
}

impl SubjectRole {
    /// Accepts the provider's Spanish tags and the English names
    pub fn parse(tag: &str) -> Option<SubjectRole> {
        match tag.trim().to_uppercase().as_str() {
            "DEMANDANTE" | "PLAINTIFF" => Some(SubjectRole::Plaintiff),
            "DEMANDADO" | "DEFENDANT" => Some(SubjectRole::Defendant),
            _ => None,
        }
    }
}

/// One row of the report extract. Subjects arrive either as per-role columns
/// or as a single subject tagged with its role.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExtractItem {
    #[serde(rename = "ID Proceso", alias = "processId", alias = "id", default)]
    pub process_id: Option<Value>,
    #[serde(rename = "Numero Radicacion", alias = "caseNumber", default, deserialize_with = "lenient_string")]
    pub case_number: String,
    #[serde(rename = "Codigo Alterno", alias = "alternateCode", default, deserialize_with = "lenient_string")]
    pub alternate_code: String,
    #[serde(rename = "Clase Proceso", alias = "processClass", default, deserialize_with = "lenient_string")]
    pub process_class: String,
    #[serde(rename = "Etapa Procesal", alias = "stage", default, deserialize_with = "lenient_string")]
    pub stage: String,
    #[serde(rename = "Despacho", alias = "courtOffice", default, deserialize_with = "lenient_string")]
    pub court_office: String,
    #[serde(rename = "Calidad Sujeto", alias = "role", default, deserialize_with = "lenient_string")]
    pub role: String,
    #[serde(rename = "Sujeto Nombre", alias = "name", default, deserialize_with = "lenient_string")]
    pub subject_name: String,
    #[serde(rename = "Sujeto Identificacion", alias = "identifier", default, deserialize_with = "lenient_string")]
    pub subject_identifier: String,
    #[serde(rename = "Demandante - Nombre", alias = "plaintiffName", default, deserialize_with = "lenient_string")]
    pub plaintiff_name: String,
    #[serde(rename = "Demandante - Identificacion", alias = "plaintiffIdentifier", default, deserialize_with = "lenient_string")]
    pub plaintiff_identifier: String,
    #[serde(rename = "Demandado - Nombre", alias = "defendantName", default, deserialize_with = "lenient_string")]
    pub defendant_name: String,
    #[serde(rename = "Demandado - Identificacion", alias = "defendantIdentifier", default, deserialize_with = "lenient_string")]
    pub defendant_identifier: String,
}

impl ExtractItem {
    /// Positive process id; float ids are rounded, numeric strings parsed
    pub fn process_id(&self) -> Option<i64> {
        let id = match self.process_id.as_ref()? {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.round() as i64)),
            Value::String(s) => s.trim().parse::<f64>().ok().map(|f| f.round() as i64),
            _ => None,
        }?;
        (id > 0).then_some(id)
    }

    pub fn subject_role(&self) -> Option<SubjectRole> {
        SubjectRole::parse(&self.role)
    }
}

/// Envelope of the report endpoint; the rows arrive as a JSON string
#[derive(Debug, Deserialize)]
pub(crate) struct ReportEnvelope {
    #[serde(rename = "jsonString")]
    pub json_string: String,
}

/// Envelope of the process-detail endpoint
#[derive(Debug, Deserialize)]
pub(crate) struct DetailEnvelope {
    #[serde(rename = "proceso", default)]
    pub process: Option<ProcessDetail>,
}

/// Live view of a process as the provider reports it
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessDetail {
    #[serde(rename(deserialize = "ProcesoId"), default)]
    pub process_id: Option<i64>,
    #[serde(rename(deserialize = "Radicacion"), default)]
    pub case_number: Option<String>,
    #[serde(rename(deserialize = "CodigoAlterno"), default)]
    pub alternate_code: Option<String>,
    #[serde(rename(deserialize = "ClaseProceso"), default)]
    pub process_class: Option<String>,
    #[serde(rename(deserialize = "Etapa"), default)]
    pub stage: Option<String>,
    #[serde(rename(deserialize = "Estado"), default)]
    pub status: Option<String>,
    #[serde(rename(deserialize = "Regional"), default)]
    pub region: Option<String>,
    #[serde(rename(deserialize = "Tema"), default)]
    pub topic: Option<String>,
    #[serde(rename(deserialize = "DespachoConocimiento"), default)]
    pub court_office: Option<String>,
    #[serde(rename(deserialize = "DespachoOrigen"), default)]
    pub origin_court_office: Option<String>,
    #[serde(rename(deserialize = "FechaAdmisionDemanda"), default)]
    pub claim_admitted_on: Option<String>,
    #[serde(rename(deserialize = "SentenciaPrimeraInstancia"), default)]
    pub first_instance_ruling: Option<String>,
    #[serde(rename(deserialize = "ApoderadoPrincipal"), default)]
    pub lead_attorney: Option<String>,
    #[serde(rename(deserialize = "Sujetos"), default, deserialize_with = "nullable_vec")]
    pub subjects: Vec<Subject>,
    #[serde(rename(deserialize = "MedidasCautelares"), default, deserialize_with = "nullable_vec")]
    pub precautionary_measures: Vec<PrecautionaryMeasure>,
    #[serde(rename(deserialize = "Actuaciones"), default, deserialize_with = "nullable_vec")]
    pub docket_entries: Vec<DocketEntry>,
    #[serde(rename(deserialize = "CamposPersonalizados"), default, deserialize_with = "nullable_vec")]
    pub custom_fields: Vec<CustomField>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Subject {
    #[serde(rename(deserialize = "Tipo"), default, deserialize_with = "lenient_string")]
    pub kind: String,
    #[serde(rename(deserialize = "Nombre"), default, deserialize_with = "lenient_string")]
    pub name: String,
    #[serde(
        rename(deserialize = "NumeroIdentificacion"),
        alias = "Identificacion",
        default,
        deserialize_with = "lenient_string"
    )]
    pub identifier: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrecautionaryMeasure {
    #[serde(rename(deserialize = "Id"), default)]
    pub id: Option<i64>,
    #[serde(rename(deserialize = "Fecha"), default)]
    pub date: Option<String>,
    #[serde(rename(deserialize = "TipoMedida"), default)]
    pub measure_type: Option<String>,
    #[serde(rename(deserialize = "MedidaEfectiva"), default)]
    pub effective: Option<String>,
    #[serde(rename(deserialize = "Sujeto"), default)]
    pub subject_name: Option<String>,
    #[serde(rename(deserialize = "TipoBien"), default)]
    pub asset_type: Option<String>,
    #[serde(rename(deserialize = "Descripcion"), default)]
    pub address: Option<String>,
    #[serde(rename(deserialize = "AvaluoJudicial"), default)]
    pub judicial_appraisal: Option<f64>,
    #[serde(rename(deserialize = "Observaciones"), default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocketEntry {
    #[serde(rename(deserialize = "FechaActuacion"), default)]
    pub date: Option<String>,
    #[serde(rename(deserialize = "Tipo"), default)]
    pub kind: Option<String>,
    #[serde(rename(deserialize = "Observacion"), default)]
    pub note: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CustomField {
    #[serde(rename(deserialize = "Nombre"), default, deserialize_with = "lenient_string")]
    pub name: String,
    #[serde(rename(deserialize = "Valor"), default, deserialize_with = "lenient_string")]
    pub value: String,
}

impl ProcessDetail {
    /// Most recent docket entry by date; undated entries sort last
    pub fn latest_docket_entry(&self) -> Option<&DocketEntry> {
        self.docket_entries
            .iter()
            .max_by(|a, b| a.date.as_deref().unwrap_or("").cmp(b.date.as_deref().unwrap_or("")))
    }

    pub fn first_precautionary_measure(&self) -> Option<&PrecautionaryMeasure> {
        self.precautionary_measures.first()
    }

    /// Value of the contract-location custom field, if present
    pub fn contract_location(&self) -> Option<&str> {
        self.custom_fields
            .iter()
            .find(|f| f.name.to_uppercase().contains("UBICACION CONTRATO"))
            .map(|f| f.value.as_str())
            .filter(|v| !v.is_empty())
    }

    pub fn subject(&self, role: SubjectRole) -> Option<&Subject> {
        self.subjects
            .iter()
            .find(|s| SubjectRole::parse(&s.kind) == Some(role))
    }
}

/// Accept strings, numbers and null; numbers lose a trailing `.0`
fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Number(n)) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => i.to_string(),
            (None, Some(f)) if f.fract() == 0.0 => (f as i64).to_string(),
            _ => n.to_string(),
        },
        Some(Value::Bool(b)) => b.to_string(),
        _ => String::new(),
    })
}

fn nullable_vec<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}
