//! QR code channel for pairing.
//!
//! When the server offers pairing refs, each ref becomes one code string
//! `ref,noise_pub,identity_pub,adv_secret` (base64 fields). Codes rotate
//! every ~20 seconds, at most six per attempt.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use log::debug;
use tokio::sync::mpsc;
use tokio::time::sleep;

use crate::client::Client;
use crate::error::ClientError;
use crate::store::Device;

pub const QR_ROTATION: Duration = Duration::from_secs(20);

/// Items delivered on the QR channel.
#[derive(Debug, Clone, PartialEq)]
pub enum QrEvent {
    /// Show this code now; it is valid for roughly `timeout`.
    Code { code: String, timeout: Duration },
    /// Pairing completed; the channel closes after this.
    Success,
    /// All codes expired without a scan.
    Timeout,
    /// Pairing failed.
    Error(String),
}

impl Client {
    /// Opens the QR channel. Must be called before `connect` on an unpaired
    /// client; the channel yields codes once the server offers them.
    pub async fn get_qr_channel(&self) -> Result<mpsc::Receiver<QrEvent>, ClientError> {
        if self.device.read().await.is_paired() {
            return Err(ClientError::AlreadyConnected);
        }
        let (tx, rx) = mpsc::channel(8);
        *self.qr_tx.lock().expect("qr lock") = Some(tx);
        Ok(rx)
    }

    pub(crate) fn qr_sender(&self) -> Option<mpsc::Sender<QrEvent>> {
        self.qr_tx.lock().expect("qr lock").clone()
    }

    /// Ends the QR session, delivering a final event.
    pub(crate) fn finish_qr(&self, event: QrEvent) {
        if let Some(tx) = self.qr_tx.lock().expect("qr lock").take() {
            let _ = tx.try_send(event);
        }
    }
}

/// Builds the display strings for one batch of server refs.
pub(crate) fn make_qr_codes(device: &Device, refs: &[String]) -> Vec<String> {
    let noise_pub = B64.encode(device.noise_key.public);
    let identity_pub = B64.encode(device.identity_key.public);
    let adv_secret = B64.encode(device.adv_secret_key);
    refs.iter()
        .map(|r| format!("{r},{noise_pub},{identity_pub},{adv_secret}"))
        .collect()
}

/// Emits codes on the QR channel, one per rotation period, until pairing
/// finishes or the refs run out.
pub(crate) fn start_qr_rotation(client: Arc<Client>, codes: Vec<String>) {
    tokio::spawn(async move {
        for code in codes.into_iter().take(6) {
            let Some(tx) = client.qr_sender() else {
                return;
            };
            if tx
                .send(QrEvent::Code {
                    code,
                    timeout: QR_ROTATION,
                })
                .await
                .is_err()
            {
                return;
            }
            sleep(QR_ROTATION).await;
        }
        debug!(target: "Pair", "QR refs exhausted without a scan");
        client.finish_qr(QrEvent::Timeout);
    });
}

/// Renders a code as a terminal-friendly unicode QR image.
pub fn render_qr_terminal(data: &str) -> Result<String, qrcode::types::QrError> {
    use qrcode::render::unicode;
    let code = qrcode::QrCode::new(data.as_bytes())?;
    Ok(code
        .render::<unicode::Dense1x2>()
        .dark_color(unicode::Dense1x2::Light)
        .light_color(unicode::Dense1x2::Dark)
        .build())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qr_codes_have_four_fields() {
        let device = Device::generate();
        let codes = make_qr_codes(&device, &["ref-one".into(), "ref-two".into()]);
        assert_eq!(codes.len(), 2);
        for (code, r) in codes.iter().zip(["ref-one", "ref-two"]) {
            let parts: Vec<&str> = code.split(',').collect();
            assert_eq!(parts.len(), 4);
            assert_eq!(parts[0], r);
            assert_eq!(
                B64.decode(parts[1]).unwrap(),
                device.noise_key.public.to_vec()
            );
        }
    }

    #[test]
    fn terminal_render_produces_output() {
        assert!(!render_qr_terminal("ref,aaa,bbb,ccc").unwrap().is_empty());
    }
}
