use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use time::format_description::well_known::Rfc3339;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};

/// Valeur textuelle hors de l'ensemble fermé attendu (catégorie, type de sonde...)
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown value '{0}'")]
pub struct UnknownVariant(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Up,
    #[default]
    Down,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Up => "up",
            Status::Down => "down",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "up" => Ok(Status::Up),
            "down" => Ok(Status::Down),
            _ => Err(UnknownVariant(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckKind {
    #[default]
    Icmp,
    Tcp,
}

impl FromStr for CheckKind {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "icmp" => Ok(CheckKind::Icmp),
            "tcp" => Ok(CheckKind::Tcp),
            _ => Err(UnknownVariant(s.to_string())),
        }
    }
}

/// Famille d'appareil affichée sur la carte (ensemble fermé)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    #[default]
    Global,
    Apple,
    Dzb,
    Brightsign,
}

impl Category {
    pub const ALL: [Category; 4] = [
        Category::Global,
        Category::Apple,
        Category::Dzb,
        Category::Brightsign,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Global => "global",
            Category::Apple => "apple",
            Category::Dzb => "dzb",
            Category::Brightsign => "brightsign",
        }
    }
}

impl FromStr for Category {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Category::ALL
            .into_iter()
            .find(|c| c.as_str() == wanted)
            .ok_or_else(|| UnknownVariant(s.to_string()))
    }
}

/// Désérialisation tolérante pour les documents déjà persistés :
/// une valeur inconnue (ou absente) retombe sur la valeur par défaut.
fn lenient<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr + Default,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw.and_then(|s| s.parse().ok()).unwrap_or_default())
}

impl<'de> Deserialize<'de> for Status {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        lenient(deserializer)
    }
}

impl<'de> Deserialize<'de> for CheckKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        lenient(deserializer)
    }
}

impl<'de> Deserialize<'de> for Category {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        lenient(deserializer)
    }
}

const NAIVE_FRACTION: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond]");
const NAIVE: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]");

/// RFC 3339 en priorité ; les horodatages ISO sans offset (anciens exports) sont lus comme UTC.
pub fn parse_timestamp(raw: &str) -> Option<OffsetDateTime> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    OffsetDateTime::parse(raw, &Rfc3339).ok().or_else(|| {
        PrimitiveDateTime::parse(raw, NAIVE_FRACTION)
            .or_else(|_| PrimitiveDateTime::parse(raw, NAIVE))
            .ok()
            .map(PrimitiveDateTime::assume_utc)
    })
}

pub fn format_timestamp(ts: OffsetDateTime) -> String {
    ts.format(&Rfc3339).unwrap_or_default()
}

pub(crate) mod timestamp {
    use super::{format_timestamp, parse_timestamp};
    use serde::{de::Error, Deserialize, Deserializer, Serializer};
    use time::OffsetDateTime;

    pub fn serialize<S: Serializer>(ts: &OffsetDateTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_timestamp(*ts))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<OffsetDateTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse_timestamp(&raw).ok_or_else(|| D::Error::custom(format!("invalid timestamp '{raw}'")))
    }
}

// last_seen vaut "" tant que la machine n'a jamais répondu
pub(crate) mod optional_timestamp {
    use super::{format_timestamp, parse_timestamp};
    use serde::{Deserialize, Deserializer, Serializer};
    use time::OffsetDateTime;

    pub fn serialize<S: Serializer>(ts: &Option<OffsetDateTime>, serializer: S) -> Result<S::Ok, S::Error> {
        match ts {
            Some(ts) => serializer.serialize_str(&format_timestamp(*ts)),
            None => serializer.serialize_str(""),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<OffsetDateTime>, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        Ok(raw.as_deref().and_then(parse_timestamp))
    }
}

fn default_true() -> bool {
    true
}

fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}

/// Machine surveillée : champs descriptifs + état de santé courant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Machine {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Adresse réseau (clé `ip` dans les documents persistés)
    #[serde(rename = "ip", alias = "address", default)]
    pub address: String,
    #[serde(default)]
    pub serial: String,
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub grid: String,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub floor_id: String,
    #[serde(default)]
    pub category: Category,
    #[serde(default)]
    pub check: CheckKind,
    #[serde(default)]
    pub tcp_port: u16,
    /// false = appareil en stock : absent de la carte, toujours présent au registre
    #[serde(default = "default_true")]
    pub operational: bool,
    #[serde(with = "timestamp", default = "now_utc")]
    pub created_at: OffsetDateTime,
    #[serde(with = "optional_timestamp", default)]
    pub last_seen: Option<OffsetDateTime>,
    #[serde(default)]
    pub last_status: Status,
    #[serde(default)]
    pub last_rtt_ms: u32,
    #[serde(default)]
    pub last_error: String,
    #[serde(default)]
    pub total_pings: u64,
    #[serde(default)]
    pub up_pings: u64,
    #[serde(default)]
    pub consec_down: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<f64>,
}

impl Machine {
    /// Nouvelle machine avec les champs d'état à leurs valeurs initiales (down, compteurs à zéro)
    pub fn new(id: impl Into<String>, address: impl Into<String>, created_at: OffsetDateTime) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            address: address.into(),
            serial: String::new(),
            os: String::new(),
            grid: String::new(),
            notes: String::new(),
            floor_id: String::new(),
            category: Category::default(),
            check: CheckKind::default(),
            tcp_port: 0,
            operational: true,
            created_at,
            last_seen: None,
            last_status: Status::Down,
            last_rtt_ms: 0,
            last_error: String::new(),
            total_pings: 0,
            up_pings: 0,
            consec_down: 0,
            x: None,
            y: None,
        }
    }

    pub fn position(&self) -> Option<(f64, f64)> {
        self.x.zip(self.y)
    }

    /// Applique le résultat d'une sonde aux compteurs et au statut.
    /// Un seul échec suffit à passer down (pas d'hystérésis).
    pub fn apply_probe(&mut self, outcome: &ProbeOutcome, now: OffsetDateTime) {
        self.total_pings += 1;
        if outcome.ok {
            self.up_pings += 1;
            self.last_seen = Some(now);
            self.last_status = Status::Up;
            self.consec_down = 0;
            self.last_rtt_ms = outcome.rtt_ms;
            self.last_error.clear();
        } else {
            self.consec_down += 1;
            self.last_status = Status::Down;
            self.last_rtt_ms = 0;
            self.last_error = outcome.error.clone();
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Floor {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub map_file: String,
    #[serde(default)]
    pub map_type: String,
    #[serde(default)]
    pub categories_enabled: bool,
}

impl Floor {
    pub fn main() -> Self {
        Self {
            id: "main".to_string(),
            name: "Floor 1".to_string(),
            map_file: String::new(),
            map_type: String::new(),
            categories_enabled: false,
        }
    }

    pub fn has_map(&self) -> bool {
        !self.map_file.is_empty()
    }
}

/// Résultat d'une sonde : un échec réseau est un résultat normal, pas une erreur
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeOutcome {
    pub ok: bool,
    pub rtt_ms: u32,
    pub error: String,
}

impl ProbeOutcome {
    pub fn up(rtt_ms: u32) -> Self {
        Self { ok: true, rtt_ms, error: String::new() }
    }

    pub fn down(error: impl Into<String>) -> Self {
        Self { ok: false, rtt_ms: 0, error: error.into() }
    }
}

/// Ligne d'historique, figée au moment de la sonde (nom/adresse/série dénormalisés)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryEntry {
    #[serde(with = "timestamp")]
    pub timestamp: OffsetDateTime,
    pub machine_id: String,
    pub name: String,
    pub address: String,
    pub serial: String,
    pub ok: bool,
    pub status: Status,
    pub rtt_ms: u32,
    pub error: String,
}

impl HistoryEntry {
    pub fn record(machine: &Machine, outcome: &ProbeOutcome, at: OffsetDateTime) -> Self {
        Self {
            timestamp: at,
            machine_id: machine.id.clone(),
            name: machine.name.clone(),
            address: machine.address.clone(),
            serial: machine.serial.clone(),
            ok: outcome.ok,
            status: machine.last_status,
            rtt_ms: outcome.rtt_ms,
            error: outcome.error.clone(),
        }
    }
}

/// Données d'enregistrement d'une machine (tous les champs descriptifs sont optionnels)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MachineSpec {
    pub id: Option<String>,
    pub name: Option<String>,
    #[serde(alias = "ip")]
    pub address: Option<String>,
    pub serial: Option<String>,
    pub os: Option<String>,
    pub grid: Option<String>,
    pub notes: Option<String>,
    pub floor_id: Option<String>,
    pub category: Option<String>,
    pub check: Option<String>,
    pub tcp_port: Option<u16>,
    pub operational: Option<bool>,
    pub x: Option<f64>,
    pub y: Option<f64>,
}

/// Modification partielle des champs descriptifs ; `None` = inchangé
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MachinePatch {
    pub name: Option<String>,
    #[serde(alias = "ip")]
    pub address: Option<String>,
    pub serial: Option<String>,
    pub os: Option<String>,
    pub grid: Option<String>,
    pub notes: Option<String>,
    pub floor_id: Option<String>,
    pub category: Option<String>,
    pub check: Option<String>,
    pub tcp_port: Option<u16>,
    pub operational: Option<bool>,
    pub x: Option<f64>,
    pub y: Option<f64>,
    #[serde(default)]
    pub clear_pos: bool,
}

/// Réponse d'une vérification immédiate
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckReport {
    pub id: String,
    pub ok: bool,
    pub rtt_ms: u32,
    pub status: Status,
    pub error: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepStats {
    pub up: usize,
    pub down: usize,
    pub total: usize,
}
