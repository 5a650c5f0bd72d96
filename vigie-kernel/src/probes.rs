/**
 * SONDES - Test de disponibilité d'une machine
 *
 * RÔLE : Deux stratégies sans état, (adresse, timeout) → ProbeOutcome.
 * - icmp : un seul `ping` système (sous-processus borné par timeout + marge)
 * - tcp  : connexion sur (adresse, port), relâchée immédiatement
 *
 * Aucune sonde ne renvoie d'erreur : toute panne réseau/processus devient
 * `ProbeOutcome { ok: false, rtt_ms: 0, error }`.
 */

use crate::config::ProbeConf;
use crate::models::{CheckKind, Machine, ProbeOutcome};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::process::Command;
use tracing::debug;

/// Longueur maximale d'un diagnostic d'échec
pub const MAX_ERROR_LEN: usize = 240;

#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, machine: &Machine) -> ProbeOutcome;
}

/// Sondes réseau réelles (ping système + connexion TCP)
#[derive(Debug, Clone)]
pub struct NetworkProber {
    pub timeout: Duration,
    pub grace: Duration,
}

impl Default for NetworkProber {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(2000),
            grace: Duration::from_millis(2000),
        }
    }
}

impl NetworkProber {
    pub fn from_config(conf: &ProbeConf) -> Self {
        Self {
            timeout: Duration::from_millis(conf.timeout_ms.max(1)),
            grace: Duration::from_millis(conf.grace_ms),
        }
    }
}

#[async_trait]
impl Prober for NetworkProber {
    async fn probe(&self, machine: &Machine) -> ProbeOutcome {
        let outcome = match machine.check {
            CheckKind::Tcp => tcp_probe(&machine.address, machine.tcp_port, self.timeout).await,
            CheckKind::Icmp => icmp_probe(&machine.address, self.timeout, self.grace).await,
        };
        debug!(
            machine_id = %machine.id,
            ok = outcome.ok,
            rtt_ms = outcome.rtt_ms,
            "[probes] {} check done",
            if machine.check == CheckKind::Tcp { "tcp" } else { "icmp" }
        );
        outcome
    }
}

fn ping_command(address: &str, timeout: Duration) -> Command {
    let ms = timeout.as_millis().max(1);
    let mut cmd = Command::new("ping");
    if cfg!(target_os = "windows") {
        let wait = ms.to_string();
        cmd.args(["-n", "1", "-w", wait.as_str()]);
    } else if cfg!(target_os = "macos") {
        let wait = ms.to_string();
        cmd.args(["-c", "1", "-W", wait.as_str()]);
    } else {
        // Linux/BSD : -W en secondes
        let wait = (ms / 1000).max(1).to_string();
        cmd.args(["-c", "1", "-W", wait.as_str()]);
    }
    cmd.arg(address);
    cmd
}

/// Un ping ; durée totale bornée par `timeout + grace`
pub async fn icmp_probe(address: &str, timeout: Duration, grace: Duration) -> ProbeOutcome {
    let address = address.trim();
    if address.is_empty() {
        return ProbeOutcome::down("empty address");
    }
    if address.starts_with('-') {
        return ProbeOutcome::down("invalid address");
    }

    let mut cmd = ping_command(address, timeout);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = match tokio::time::timeout(timeout + grace, cmd.output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => return ProbeOutcome::down(truncate(&format!("ping unavailable: {e}"))),
        Err(_) => return ProbeOutcome::down("ping timed out"),
    };

    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));

    if !output.status.success() {
        let code = output
            .status
            .code()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());
        let msg = format!("ping failed ({code}): {}", truncate(text.trim()));
        return ProbeOutcome::down(msg);
    }

    ProbeOutcome::up(parse_rtt_ms(&text))
}

/// Connexion TCP établie puis fermée ; rtt = durée de la connexion
pub async fn tcp_probe(address: &str, port: u16, timeout: Duration) -> ProbeOutcome {
    let address = address.trim();
    if address.is_empty() || port == 0 {
        return ProbeOutcome::down("tcp requires address and port");
    }

    let start = Instant::now();
    let result = tokio::time::timeout(timeout, TcpStream::connect((address, port))).await;
    let elapsed = start.elapsed();

    match result {
        Ok(Ok(stream)) => {
            drop(stream);
            ProbeOutcome::up(round_ms(elapsed))
        }
        Ok(Err(e)) => ProbeOutcome::down(truncate(&e.to_string())),
        Err(_) => ProbeOutcome::down("connection timed out"),
    }
}

fn round_ms(elapsed: Duration) -> u32 {
    let ms = (elapsed.as_secs_f64() * 1000.0).round();
    ms.min(u32::MAX as f64) as u32
}

/// Latence extraite de la sortie de `ping` (`time=12.3 ms`, `time=1,5 ms`, `time<1ms`,
/// `Average = 4ms`), insensible à la casse, 0 sinon
pub fn parse_rtt_ms(output: &str) -> u32 {
    let lower = output.to_ascii_lowercase();
    for (pos, marker) in lower.match_indices("time") {
        let rest = &lower[pos + marker.len()..];
        let Some(rest) = rest.strip_prefix(['=', '<']) else {
            continue;
        };
        if let Some(v) = leading_number(rest.trim_start()) {
            return v.round() as u32;
        }
    }
    if let Some(pos) = lower.find("average") {
        let rest = lower[pos + "average".len()..].trim_start();
        if let Some(rest) = rest.strip_prefix('=') {
            if let Some(v) = leading_number(rest.trim_start()) {
                return v.round() as u32;
            }
        }
    }
    0
}

/// Nombre en tête de `s` ; la virgule décimale est acceptée
fn leading_number(s: &str) -> Option<f64> {
    let end = s
        .char_indices()
        .find(|(_, c)| !(c.is_ascii_digit() || *c == '.' || *c == ','))
        .map(|(i, _)| i)
        .unwrap_or(s.len());
    s[..end].replace(',', ".").parse().ok()
}

fn truncate(msg: &str) -> String {
    msg.chars().take(MAX_ERROR_LEN).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_parse_rtt_linux() {
        let out = "64 bytes from 10.0.0.1: icmp_seq=1 ttl=64 time=12.6 ms";
        assert_eq!(parse_rtt_ms(out), 13);
    }

    #[test]
    fn test_parse_rtt_sub_millisecond() {
        assert_eq!(parse_rtt_ms("Reply from 10.0.0.1: bytes=32 time<1ms TTL=128"), 1);
    }

    #[test]
    fn test_parse_rtt_windows_average() {
        let out = "Minimum = 3ms, Maximum = 5ms, Average = 4ms";
        assert_eq!(parse_rtt_ms(out), 4);
    }

    #[test]
    fn test_parse_rtt_comma_decimal_and_case() {
        assert_eq!(parse_rtt_ms("64 bytes from 10.0.0.1: icmp_seq=1 TIME=1,5 ms"), 2);
        assert_eq!(parse_rtt_ms("Reply from 10.0.0.1: bytes=32 Time= 7,4 ms"), 7);
        assert_eq!(parse_rtt_ms("request timeout, time=0.4 ms"), 0);
    }

    #[test]
    fn test_parse_rtt_missing() {
        assert_eq!(parse_rtt_ms("no latency here"), 0);
    }

    #[test]
    fn test_truncate_bounds_message() {
        let long = "x".repeat(1000);
        assert_eq!(truncate(&long).len(), MAX_ERROR_LEN);
    }

    #[tokio::test]
    async fn test_icmp_rejects_empty_and_option_like_addresses() {
        let t = Duration::from_millis(100);
        assert_eq!(icmp_probe("", t, t).await, ProbeOutcome::down("empty address"));
        assert_eq!(icmp_probe("-f", t, t).await, ProbeOutcome::down("invalid address"));
    }

    #[tokio::test]
    async fn test_tcp_requires_port_and_address() {
        let t = Duration::from_millis(100);
        let expected = ProbeOutcome::down("tcp requires address and port");
        assert_eq!(tcp_probe("127.0.0.1", 0, t).await, expected);
        assert_eq!(tcp_probe("", 80, t).await, expected);
    }

    #[tokio::test]
    async fn test_tcp_connects_to_local_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let outcome = tcp_probe("127.0.0.1", port, Duration::from_secs(2)).await;
        assert!(outcome.ok, "unexpected failure: {}", outcome.error);
        assert!(outcome.error.is_empty());
    }

    #[tokio::test]
    async fn test_tcp_refused_is_a_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let outcome = tcp_probe("127.0.0.1", port, Duration::from_secs(2)).await;
        assert!(!outcome.ok);
        assert_eq!(outcome.rtt_ms, 0);
        assert!(!outcome.error.is_empty());
    }

    #[tokio::test]
    async fn test_prober_dispatches_on_check_kind() {
        let prober = NetworkProber {
            timeout: Duration::from_millis(200),
            grace: Duration::from_millis(200),
        };
        let mut m = Machine::new("m", "127.0.0.1", time::OffsetDateTime::now_utc());
        m.check = CheckKind::Tcp;
        m.tcp_port = 0;
        let outcome = prober.probe(&m).await;
        assert_eq!(outcome.error, "tcp requires address and port");
    }
}
