/**
 * NOTIFICATIONS - Annonce des transitions up/down vers un canal externe
 *
 * RÔLE : Un message par transition, best-effort : un échec est journalisé puis oublié
 * (pas de retry). L'envoi part dans une tâche séparée, après relâchement du verrou registre.
 *
 * FORMAT (webhook entrant type Slack) : POST {"text": "..."}
 */

use crate::config::KernelConfig;
use crate::health::HealthTracker;
use crate::models::{Machine, Status};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum SenderError {
    #[error("Failed to send notification: {0}")]
    SendFailed(String),
    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Annonce `old → new` ; renvoie true si le canal a accepté le message
    async fn notify(&self, machine: &Machine, old: Status, new: Status) -> bool;
}

/// `[<app>] <nom> is <NOUVEAU>` suivi de l'adresse, de l'OS et de la latence
pub fn transition_message(app_name: &str, machine: &Machine, new: Status) -> String {
    let name = if machine.name.is_empty() { "(unnamed)" } else { machine.name.as_str() };
    format!(
        "[{app_name}] {name} is {}\nIP: {}\nOS: {}\nRTT: {} ms",
        new.as_str().to_uppercase(),
        machine.address,
        machine.os,
        machine.last_rtt_ms
    )
}

pub struct WebhookNotifier {
    client: Client,
    url: String,
    app_name: String,
}

impl WebhookNotifier {
    pub fn new(app_name: impl Into<String>, url: impl Into<String>, timeout: Duration) -> Result<Self, SenderError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
            app_name: app_name.into(),
        })
    }

    async fn send(&self, text: &str) -> Result<(), SenderError> {
        let response = self
            .client
            .post(&self.url)
            .json(&json!({ "text": text }))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SenderError::SendFailed(format!("webhook returned {status}")));
        }
        Ok(())
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, machine: &Machine, old: Status, new: Status) -> bool {
        if old == new {
            return false;
        }
        let text = transition_message(&self.app_name, machine, new);
        match self.send(&text).await {
            Ok(()) => {
                info!(machine_id = %machine.id, "[notifier] sent {old} -> {new}");
                true
            }
            Err(e) => {
                warn!(machine_id = %machine.id, "[notifier] alert failed: {e}");
                false
            }
        }
    }
}

/// Aucun canal configuré
pub struct DisabledNotifier;

#[async_trait]
impl Notifier for DisabledNotifier {
    async fn notify(&self, machine: &Machine, old: Status, new: Status) -> bool {
        debug!(machine_id = %machine.id, "[notifier] disabled, dropping {old} -> {new}");
        false
    }
}

pub fn from_config(cfg: &KernelConfig) -> Arc<dyn Notifier> {
    let Some(url) = cfg.notifier.webhook_url.as_deref().filter(|u| !u.is_empty()) else {
        info!("[notifier] no webhook configured, transitions will only be logged");
        return Arc::new(DisabledNotifier);
    };
    let timeout = Duration::from_secs(cfg.notifier.timeout_secs.max(1));
    match WebhookNotifier::new(cfg.app_name.clone(), url, timeout) {
        Ok(notifier) => Arc::new(notifier),
        Err(e) => {
            warn!("[notifier] cannot build webhook client: {e}, notifications disabled");
            Arc::new(DisabledNotifier)
        }
    }
}

/// Livraison dans une tâche détachée ; le résultat est compté dans `health`
pub fn dispatch(
    notifier: Arc<dyn Notifier>,
    health: HealthTracker,
    machine: Machine,
    old: Status,
    new: Status,
) -> JoinHandle<bool> {
    tokio::spawn(async move {
        let delivered = notifier.notify(&machine, old, new).await;
        health.record_notification(delivered);
        delivered
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn machine() -> Machine {
        let mut m = Machine::new("pc-1", "10.0.0.7", time::OffsetDateTime::now_utc());
        m.name = "Reception".into();
        m.os = "macOS 14".into();
        m.last_rtt_ms = 9;
        m
    }

    /// Serveur HTTP minimal : accepte une requête, renvoie `status`, rend le corps reçu
    async fn one_shot_server(status: &'static str) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/hook", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 1024];
            loop {
                let n = socket.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
                let text = String::from_utf8_lossy(&buf).to_string();
                if let Some(end) = text.find("\r\n\r\n") {
                    let len = text[..end]
                        .lines()
                        .find_map(|l| {
                            let (k, v) = l.split_once(':')?;
                            k.eq_ignore_ascii_case("content-length").then(|| v.trim().parse::<usize>().ok())?
                        })
                        .unwrap_or(0);
                    if buf.len() >= end + 4 + len {
                        break;
                    }
                }
            }
            let reply = format!("HTTP/1.1 {status}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n");
            socket.write_all(reply.as_bytes()).await.unwrap();
            let text = String::from_utf8_lossy(&buf).to_string();
            text.split_once("\r\n\r\n").map(|(_, body)| body.to_string()).unwrap_or_default()
        });
        (url, handle)
    }

    #[test]
    fn test_transition_message_format() {
        let text = transition_message("Vigie", &machine(), Status::Down);
        assert_eq!(text, "[Vigie] Reception is DOWN\nIP: 10.0.0.7\nOS: macOS 14\nRTT: 9 ms");
    }

    #[test]
    fn test_unnamed_machine() {
        let mut m = machine();
        m.name.clear();
        assert!(transition_message("Vigie", &m, Status::Up).starts_with("[Vigie] (unnamed) is UP"));
    }

    #[tokio::test]
    async fn test_webhook_posts_text_payload() {
        let (url, server) = one_shot_server("200 OK").await;
        let notifier = WebhookNotifier::new("Vigie", url, Duration::from_secs(5)).unwrap();

        assert!(notifier.notify(&machine(), Status::Down, Status::Up).await);

        let body: serde_json::Value = serde_json::from_str(&server.await.unwrap()).unwrap();
        assert_eq!(body["text"], transition_message("Vigie", &machine(), Status::Up));
    }

    #[tokio::test]
    async fn test_webhook_error_status_is_not_delivered() {
        let (url, server) = one_shot_server("500 Internal Server Error").await;
        let notifier = WebhookNotifier::new("Vigie", url, Duration::from_secs(5)).unwrap();
        assert!(!notifier.notify(&machine(), Status::Up, Status::Down).await);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_same_status_is_never_sent() {
        let notifier = WebhookNotifier::new("Vigie", "http://127.0.0.1:9/never", Duration::from_secs(1)).unwrap();
        assert!(!notifier.notify(&machine(), Status::Up, Status::Up).await);
    }

    #[tokio::test]
    async fn test_dispatch_counts_result() {
        let health = HealthTracker::new();
        let delivered = dispatch(Arc::new(DisabledNotifier), health.clone(), machine(), Status::Down, Status::Up)
            .await
            .unwrap();
        assert!(!delivered);
        assert_eq!(health.notifications(), (0, 1));
    }

    #[tokio::test]
    async fn test_from_config_selects_channel() {
        let mut cfg = KernelConfig::default();
        assert!(!from_config(&cfg).notify(&machine(), Status::Down, Status::Up).await);

        cfg.notifier.webhook_url = Some(String::new());
        assert!(!from_config(&cfg).notify(&machine(), Status::Down, Status::Up).await);

        let (url, server) = one_shot_server("200 OK").await;
        cfg.notifier.webhook_url = Some(url);
        assert!(from_config(&cfg).notify(&machine(), Status::Down, Status::Up).await);
        let body: serde_json::Value = serde_json::from_str(&server.await.unwrap()).unwrap();
        assert_eq!(body["text"], transition_message(&cfg.app_name, &machine(), Status::Up));
    }
}
