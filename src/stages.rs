//! Mapping from the provider's internal vocabulary to client-facing terms.
//!
//! Both mappers are pure. Matching ignores case, surrounding and repeated
//! whitespace, and Spanish accents. Anything unmatched passes through so a new
//! internal value is never silently dropped.

use std::fmt;

/// Client-facing stage of a process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientStage {
    /// No prior stage known (new process or blank stage)
    Unknown,
    DocumentCollection,
    ClaimFiled,
    ClaimAdmitted,
    PaymentOrder,
    Notification,
    Objections,
    Hearing,
    Ruling,
    Liquidation,
    Handover,
    Termination,
    /// Unmatched internal stage, uppercased with accents folded and spaces collapsed
    Other(String),
}

impl ClientStage {
    pub fn label(&self) -> &str {
        match self {
            ClientStage::Unknown => "UNKNOWN",
            ClientStage::DocumentCollection => "document collection and validation",
            ClientStage::ClaimFiled => "claim filed",
            ClientStage::ClaimAdmitted => "claim admitted",
            ClientStage::PaymentOrder => "payment order",
            ClientStage::Notification => "notification",
            ClientStage::Objections => "objections",
            ClientStage::Hearing => "hearing",
            ClientStage::Ruling => "ruling",
            ClientStage::Liquidation => "liquidation",
            ClientStage::Handover => "handover",
            ClientStage::Termination => "termination",
            ClientStage::Other(raw) => raw,
        }
    }

    /// The first stage every newly opened process lands in
    pub fn is_intake(&self) -> bool {
        matches!(self, ClientStage::DocumentCollection)
    }
}

impl fmt::Display for ClientStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Client-facing process category
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientClass {
    Collections,
    Eviction,
    /// Unmatched class, unchanged
    Other(String),
}

impl ClientClass {
    pub fn label(&self) -> &str {
        match self {
            ClientClass::Collections => "collections",
            ClientClass::Eviction => "eviction",
            ClientClass::Other(raw) => raw,
        }
    }
}

impl fmt::Display for ClientClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

const DOCUMENT_COLLECTION: &[&str] = &[
    "RECOLECCION Y VALIDACION DOCUMENTAL",
    "RECOLECCION DOCUMENTAL",
    "VALIDACION DOCUMENTAL",
    "DOCUMENTACION",
    "RECEPCION DE DOCUMENTOS",
    "ESTUDIO DE DOCUMENTOS",
    "ASIGNACION ABOGADO",
    "ENTREGA ABOGADO",
    "PENDIENTE DOCUMENTOS",
];

const CLAIM_FILED: &[&str] = &[
    "DEMANDA",
    "RADICACION DEMANDA",
    "PRESENTACION DEMANDA",
    "DEMANDA RADICADA",
    "ELABORACION DEMANDA",
];

const CLAIM_ADMITTED: &[&str] = &[
    "ADMISION",
    "ADMISION DEMANDA",
    "AUTO ADMISORIO",
    "ADMITE DEMANDA",
];

const PAYMENT_ORDER: &[&str] = &[
    "MANDAMIENTO",
    "MANDAMIENTO DE PAGO",
    "LIBRA MANDAMIENTO",
    "MANDAMIENTO EJECUTIVO",
];

const NOTIFICATION: &[&str] = &[
    "NOTIFICACION",
    "NOTIFICACION PERSONAL",
    "NOTIFICACION POR AVISO",
    "NOTIFICACION DEMANDADO",
    "CITACION",
    "EMPLAZAMIENTO",
    "CURADOR AD LITEM",
];

const OBJECTIONS: &[&str] = &[
    "EXCEPCIONES",
    "EXCEPCIONES DE MERITO",
    "TRASLADO EXCEPCIONES",
    "CONTESTACION",
    "CONTESTACION DEMANDA",
];

const HEARING: &[&str] = &[
    "AUDIENCIA",
    "AUDIENCIA INICIAL",
    "AUDIENCIA DE INSTRUCCION Y JUZGAMIENTO",
];

const RULING: &[&str] = &[
    "SENTENCIA",
    "FALLO",
    "SEGUIR ADELANTE LA EJECUCION",
    "ORDEN DE SEGUIR ADELANTE",
];

const LIQUIDATION: &[&str] = &[
    "LIQUIDACION",
    "LIQUIDACION DEL CREDITO",
    "LIQUIDACION DE COSTAS",
    "AVALUO",
    "SECUESTRO",
    "REMATE",
];

const HANDOVER: &[&str] = &[
    "LANZAMIENTO",
    "RESTITUCION",
    "ENTREGA",
    "ENTREGA DEL INMUEBLE",
    "DILIGENCIA DE ENTREGA",
];

const TERMINATION: &[&str] = &[
    "TERMINACION",
    "TERMINADO",
    "TERMINACION POR PAGO",
    "DESISTIMIENTO",
    "RETIRO DEMANDA",
    "ARCHIVO",
    "ARCHIVADO",
];

const COLLECTIONS: &[&str] = &[
    "EJECUTIVO",
    "EJECUTIVO SINGULAR",
    "EJECUTIVO DE MINIMA CUANTIA",
    "EJECUTIVO DE MENOR CUANTIA",
];

const EVICTION: &[&str] = &[
    "VERBAL",
    "VERBAL SUMARIO",
    "RESTITUCION DE INMUEBLE ARRENDADO",
    "RESTITUCION DE INMUEBLE",
];

/// Map an internal stage to its client-facing stage
pub fn translate_stage(internal: &str) -> ClientStage {
    let key = normalize(internal);
    if key.is_empty() {
        return ClientStage::Unknown;
    }

    let table: [(&[&str], ClientStage); 11] = [
        (DOCUMENT_COLLECTION, ClientStage::DocumentCollection),
        (CLAIM_FILED, ClientStage::ClaimFiled),
        (CLAIM_ADMITTED, ClientStage::ClaimAdmitted),
        (PAYMENT_ORDER, ClientStage::PaymentOrder),
        (NOTIFICATION, ClientStage::Notification),
        (OBJECTIONS, ClientStage::Objections),
        (HEARING, ClientStage::Hearing),
        (RULING, ClientStage::Ruling),
        (LIQUIDATION, ClientStage::Liquidation),
        (HANDOVER, ClientStage::Handover),
        (TERMINATION, ClientStage::Termination),
    ];

    table
        .into_iter()
        .find(|(values, _)| values.contains(&key.as_str()))
        .map(|(_, stage)| stage)
        .unwrap_or(ClientStage::Other(key))
}

/// Map an internal process class to its client category
pub fn translate_class(internal: &str) -> ClientClass {
    let key = normalize(internal);
    if COLLECTIONS.contains(&key.as_str()) {
        ClientClass::Collections
    } else if EVICTION.contains(&key.as_str()) {
        ClientClass::Eviction
    } else {
        ClientClass::Other(internal.to_string())
    }
}

/// Uppercase, fold accents, collapse whitespace
fn normalize(value: &str) -> String {
    value
        .split_whitespace()
        .map(|word| word.chars().map(fold_accent).collect::<String>().to_uppercase())
        .collect::<Vec<_>>()
        .join(" ")
}

fn fold_accent(c: char) -> char {
    match c {
        'á' | 'à' | 'ä' | 'Á' | 'À' | 'Ä' => 'A',
        'é' | 'è' | 'ë' | 'É' | 'È' | 'Ë' => 'E',
        'í' | 'ì' | 'ï' | 'Í' | 'Ì' | 'Ï' => 'I',
        'ó' | 'ò' | 'ö' | 'Ó' | 'Ò' | 'Ö' => 'O',
        'ú' | 'ù' | 'ü' | 'Ú' | 'Ù' | 'Ü' => 'U',
        'ñ' | 'Ñ' => 'N',
        other => other,
    }
}
