/**
 * HISTORIQUE DES SONDES - Journal append-only partitionné par jour UTC
 *
 * RÔLE : Chaque résultat de sonde devient une ligne CSV dans `logs/pings-YYYY-MM-DD.csv`.
 * Les partitions sont créées à la demande (en-tête écrit une seule fois), jamais réécrites.
 *
 * REQUÊTE : (id, fenêtre glissante) → lecture des seules partitions couvrant la fenêtre,
 * filtrage par id et horodatage, tri croissant. Lignes/partitions illisibles ignorées.
 */

use crate::models::{format_timestamp, parse_timestamp, HistoryEntry, Status};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use time::macros::format_description;
use time::{Date, Duration, OffsetDateTime, PrimitiveDateTime};
use tracing::{debug, warn};

pub const HEADER: [&str; 9] = [
    "timestamp", "id", "name", "ip", "serial", "ok", "status", "rtt_ms", "error",
];

#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct HistoryLog {
    dir: PathBuf,
}

impl HistoryLog {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn partition_path(&self, day: Date) -> PathBuf {
        let name = day
            .format(format_description!("[year]-[month]-[day]"))
            .unwrap_or_else(|_| day.to_string());
        self.dir.join(format!("pings-{name}.csv"))
    }

    /// Ajoute une ligne à la partition du jour de `entry.timestamp` (créée si besoin)
    pub fn append(&self, entry: &HistoryEntry) -> Result<(), HistoryError> {
        let path = self.partition_path(entry.timestamp.date());
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;

        let mut buf = String::new();
        if file.metadata()?.len() == 0 {
            push_row(&mut buf, HEADER.iter().copied());
        }
        let ok = if entry.ok { "1" } else { "0" };
        let rtt = entry.rtt_ms.to_string();
        let ts = format_timestamp(entry.timestamp);
        push_row(
            &mut buf,
            [
                ts.as_str(),
                entry.machine_id.as_str(),
                entry.name.as_str(),
                entry.address.as_str(),
                entry.serial.as_str(),
                ok,
                entry.status.as_str(),
                rtt.as_str(),
                entry.error.as_str(),
            ],
        );

        file.write_all(buf.as_bytes())?;
        file.sync_data()?;
        Ok(())
    }

    /// Fenêtre glissante depuis maintenant ; une fenêtre hors plage remonte au début des temps
    pub fn query(&self, machine_id: &str, window: Duration) -> Vec<HistoryEntry> {
        let now = OffsetDateTime::now_utc();
        let cutoff = now
            .checked_sub(window)
            .unwrap_or_else(|| PrimitiveDateTime::MIN.assume_utc());
        self.query_since(machine_id, cutoff, now)
    }

    /// Entrées de `machine_id` avec `cutoff <= timestamp`, partitions de cutoff.date() à now.date()
    pub fn query_since(
        &self,
        machine_id: &str,
        cutoff: OffsetDateTime,
        now: OffsetDateTime,
    ) -> Vec<HistoryEntry> {
        let mut entries = Vec::new();

        for path in self.partitions_between(cutoff.date(), now.date()) {
            match fs::read_to_string(&path) {
                Ok(content) => {
                    entries.extend(
                        parse_partition(&content)
                            .into_iter()
                            .filter(|e| e.machine_id == machine_id && e.timestamp >= cutoff),
                    );
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "[history] skipping unreadable partition"),
            }
        }

        entries.sort_by_key(|e| e.timestamp);
        entries
    }

    /// Partitions existantes dont la date tombe dans [first, last], un seul parcours du répertoire
    fn partitions_between(&self, first: Date, last: Date) -> Vec<PathBuf> {
        let dir = match fs::read_dir(&self.dir) {
            Ok(dir) => dir,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(dir = %self.dir.display(), error = %e, "[history] cannot list partitions");
                }
                return Vec::new();
            }
        };

        let mut found: Vec<(Date, PathBuf)> = dir
            .filter_map(Result::ok)
            .filter_map(|entry| {
                let name = entry.file_name();
                let day = partition_date(name.to_str()?)?;
                (first <= day && day <= last).then(|| (day, entry.path()))
            })
            .collect();
        found.sort_by_key(|(day, _)| *day);
        found.into_iter().map(|(_, path)| path).collect()
    }
}

fn partition_date(file_name: &str) -> Option<Date> {
    let stem = file_name.strip_prefix("pings-")?.strip_suffix(".csv")?;
    Date::parse(stem, format_description!("[year]-[month]-[day]")).ok()
}

fn push_row<'a>(buf: &mut String, fields: impl IntoIterator<Item = &'a str>) {
    for (i, field) in fields.into_iter().enumerate() {
        if i > 0 {
            buf.push(',');
        }
        if field.contains([',', '"', '\n', '\r']) {
            buf.push('"');
            buf.push_str(&field.replace('"', "\"\""));
            buf.push('"');
        } else {
            buf.push_str(field);
        }
    }
    buf.push('\n');
}

/// Découpe un contenu CSV en lignes de champs (guillemets doublés, sauts de ligne entre guillemets)
fn split_records(content: &str) -> Vec<Vec<String>> {
    let mut records = Vec::new();
    let mut record = Vec::new();
    let mut field = String::new();
    let mut quoted = false;
    let mut chars = content.chars().peekable();

    while let Some(c) = chars.next() {
        if quoted {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    chars.next();
                    field.push('"');
                }
                '"' => quoted = false,
                _ => field.push(c),
            }
            continue;
        }
        match c {
            '"' => quoted = true,
            ',' => record.push(std::mem::take(&mut field)),
            '\r' => {}
            '\n' => {
                record.push(std::mem::take(&mut field));
                records.push(std::mem::take(&mut record));
            }
            _ => field.push(c),
        }
    }
    if !field.is_empty() || !record.is_empty() {
        record.push(field);
        records.push(record);
    }
    records
}

fn parse_partition(content: &str) -> Vec<HistoryEntry> {
    let mut records = split_records(content).into_iter();
    let Some(header) = records.next() else {
        return Vec::new();
    };
    let column = |name: &str| header.iter().position(|h| h.trim() == name);
    let (Some(ts_col), Some(id_col)) = (column("timestamp"), column("id")) else {
        debug!("[history] partition without timestamp/id header");
        return Vec::new();
    };
    let cols = Columns {
        ts: ts_col,
        id: id_col,
        name: column("name"),
        ip: column("ip"),
        serial: column("serial"),
        ok: column("ok"),
        status: column("status"),
        rtt: column("rtt_ms"),
        error: column("error"),
    };

    records.filter_map(|row| cols.entry(&row)).collect()
}

struct Columns {
    ts: usize,
    id: usize,
    name: Option<usize>,
    ip: Option<usize>,
    serial: Option<usize>,
    ok: Option<usize>,
    status: Option<usize>,
    rtt: Option<usize>,
    error: Option<usize>,
}

impl Columns {
    fn entry(&self, row: &[String]) -> Option<HistoryEntry> {
        let text = |col: Option<usize>| col.and_then(|i| row.get(i)).cloned().unwrap_or_default();

        let timestamp = parse_timestamp(row.get(self.ts)?)?;
        let machine_id = row.get(self.id)?.clone();
        if machine_id.is_empty() {
            return None;
        }
        let ok = matches!(text(self.ok).trim(), "1" | "true" | "True");
        let status = text(self.status)
            .parse()
            .unwrap_or(if ok { Status::Up } else { Status::Down });
        let raw_rtt = text(self.rtt);
        let rtt_ms = raw_rtt
            .trim()
            .parse::<u32>()
            .ok()
            .or_else(|| raw_rtt.trim().parse::<f64>().ok().map(|v| v.max(0.0).round() as u32))
            .unwrap_or(0);

        Some(HistoryEntry {
            timestamp,
            machine_id,
            name: text(self.name),
            address: text(self.ip),
            serial: text(self.serial),
            ok,
            status,
            rtt_ms,
            error: text(self.error),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use time::macros::{date, datetime};

    fn entry(id: &str, at: OffsetDateTime, ok: bool) -> HistoryEntry {
        HistoryEntry {
            timestamp: at,
            machine_id: id.into(),
            name: format!("{id} name"),
            address: "10.0.0.1".into(),
            serial: "SN1".into(),
            ok,
            status: if ok { Status::Up } else { Status::Down },
            rtt_ms: if ok { 4 } else { 0 },
            error: if ok { String::new() } else { "timeout".into() },
        }
    }

    #[test]
    fn test_partition_naming() {
        let log = HistoryLog::new("/var/vigie/logs");
        assert_eq!(
            log.partition_path(date!(2025 - 03 - 07)),
            PathBuf::from("/var/vigie/logs/pings-2025-03-07.csv")
        );
    }

    #[test]
    fn test_header_written_once() {
        let dir = TempDir::new().unwrap();
        let log = HistoryLog::new(dir.path());
        let at = datetime!(2025-03-07 10:00 UTC);
        log.append(&entry("a", at, true)).unwrap();
        log.append(&entry("a", at + Duration::minutes(15), false)).unwrap();

        let content = fs::read_to_string(log.partition_path(at.date())).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "timestamp,id,name,ip,serial,ok,status,rtt_ms,error");
        assert!(lines[1].ends_with(",1,up,4,"));
        assert!(lines[2].ends_with(",0,down,0,timeout"));
    }

    #[test]
    fn test_query_filters_by_id_and_cutoff() {
        let dir = TempDir::new().unwrap();
        let log = HistoryLog::new(dir.path());
        let base = datetime!(2025-03-07 10:00 UTC);
        log.append(&entry("a", base, true)).unwrap();
        log.append(&entry("b", base + Duration::minutes(5), true)).unwrap();
        log.append(&entry("a", base + Duration::minutes(30), false)).unwrap();

        let now = base + Duration::hours(1);
        let got = log.query_since("a", base + Duration::minutes(1), now);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].timestamp, base + Duration::minutes(30));
        assert!(!got[0].ok);
        assert_eq!(got[0].error, "timeout");
    }

    #[test]
    fn test_query_merges_partitions_sorted() {
        let dir = TempDir::new().unwrap();
        let log = HistoryLog::new(dir.path());
        let late = datetime!(2025-03-06 23:50 UTC);
        let early = datetime!(2025-03-07 00:10 UTC);
        // ordre d'écriture inversé
        log.append(&entry("a", early, true)).unwrap();
        log.append(&entry("a", late, false)).unwrap();

        let got = log.query_since("a", late - Duration::hours(1), early + Duration::minutes(1));
        let stamps: Vec<_> = got.iter().map(|e| e.timestamp).collect();
        assert_eq!(stamps, vec![late, early]);
        assert!(log.partition_path(late.date()).exists());
        assert!(log.partition_path(early.date()).exists());
    }

    #[test]
    fn test_quoted_fields_survive() {
        let dir = TempDir::new().unwrap();
        let log = HistoryLog::new(dir.path());
        let at = datetime!(2025-03-07 12:00 UTC);
        let mut e = entry("a", at, false);
        e.name = "Desk, \"north\"".into();
        e.error = "ping failed (1): line one\nline two".into();
        log.append(&e).unwrap();

        let got = log.query_since("a", at, at);
        assert_eq!(got, vec![e]);
    }

    #[test]
    fn test_malformed_rows_are_skipped() {
        let dir = TempDir::new().unwrap();
        let log = HistoryLog::new(dir.path());
        let day = date!(2025 - 03 - 07);
        fs::write(
            log.partition_path(day),
            "timestamp,id,name,ip,serial,ok,status,rtt_ms,error\n\
             not-a-date,a,x,1.2.3.4,,1,up,3,\n\
             2025-03-07T08:00:00Z,a,x,1.2.3.4,,1,up,3.6,\n\
             2025-03-07T08:15:00\n",
        )
        .unwrap();

        let got = log.query_since("a", datetime!(2025-03-07 00:00 UTC), datetime!(2025-03-07 23:00 UTC));
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].rtt_ms, 4);
        assert_eq!(got[0].status, Status::Up);
    }

    #[test]
    fn test_huge_window_reads_every_partition() {
        let dir = TempDir::new().unwrap();
        let log = HistoryLog::new(dir.path());
        let now = OffsetDateTime::now_utc();
        log.append(&entry("a", now - Duration::days(3650), true)).unwrap();
        log.append(&entry("a", now - Duration::minutes(1), false)).unwrap();
        fs::write(dir.path().join("notes.txt"), "not a partition").unwrap();

        let got = log.query("a", Duration::days(5_000_000));
        assert_eq!(got.len(), 2);
        assert!(got[0].ok);
        assert!(!got[1].ok);
        assert_eq!(log.query("a", Duration::MAX).len(), 2);
    }

    #[test]
    fn test_partition_date_from_file_name() {
        assert_eq!(partition_date("pings-2025-03-07.csv"), Some(date!(2025 - 03 - 07)));
        assert_eq!(partition_date("pings-2025-3-7.csv"), None);
        assert_eq!(partition_date("state.json"), None);
    }

    #[test]
    fn test_missing_partitions_are_empty() {
        let dir = TempDir::new().unwrap();
        let log = HistoryLog::new(dir.path());
        assert!(log.query("a", Duration::days(3)).is_empty());
    }
}
