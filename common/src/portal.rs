use log::{info, warn};

use crate::{
    config::DeviceConfig,
    reset::{DoubleResetDetector, ResetMarker},
    store::{ConfigStore, Storage},
};

/// How long the portal waits for a submission before giving up.
pub const PORTAL_TIMEOUT_MS: u64 = 180_000;

/// A field as rendered in the captive-portal page, seeded with the
/// currently stored value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortalField {
    pub key: &'static str,
    pub label: &'static str,
    pub max_len: usize,
    pub value: String,
}

pub fn seed_fields<C: DeviceConfig>(config: &C) -> Vec<PortalField> {
    C::fields()
        .iter()
        .map(|spec| PortalField {
            key: spec.key,
            label: spec.label,
            max_len: spec.max_len,
            value: config.value(spec.key).unwrap_or_default().to_string(),
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortalEvent {
    /// User submitted the form; `(key, value)` pairs as entered.
    Submitted(Vec<(String, String)>),
    /// User asked to discard all stored configuration.
    ResetRequested,
    TimedOut,
}

/// The captive-portal collaborator: access point, DNS, and the HTTP
/// form itself live behind this seam.
pub trait PortalUi {
    /// Raises the portal and blocks until the user submits, requests a
    /// settings reset, or the window elapses.
    fn capture(&mut self, fields: &[PortalField], timeout_ms: u64) -> PortalEvent;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortalOutcome<C> {
    /// Validated submission, persisted (best effort) and ready to use.
    Committed(C),
    /// Stored configuration discarded; caller must restart immediately.
    ResetSettings,
    /// No submission in time; caller must restart and retry.
    Abandoned,
}

/// Runs one provisioning session against the current record.
pub fn run_portal<C, U, S, M>(
    current: &C,
    ui: &mut U,
    store: &mut ConfigStore<S>,
    detector: &mut DoubleResetDetector<M>,
    timeout_ms: u64,
) -> PortalOutcome<C>
where
    C: DeviceConfig,
    U: PortalUi,
    S: Storage,
    M: ResetMarker,
{
    // An accidental reset while the portal is open must not read as a
    // further deliberate double reset.
    detector.stop();

    let fields = seed_fields(current);
    info!("provisioning portal active ({} fields)", fields.len());

    match ui.capture(&fields, timeout_ms) {
        PortalEvent::Submitted(values) => {
            let mut updated = current.clone();
            for (key, value) in &values {
                updated.set_value(key, value);
            }
            updated.finalize();

            match store.save(&updated) {
                Ok(()) => info!("provisioning committed"),
                Err(err) => {
                    warn!("config save failed, continuing with in-memory values: {err}");
                }
            }
            PortalOutcome::Committed(updated)
        }
        PortalEvent::ResetRequested => {
            if let Err(err) = store.erase() {
                warn!("settings erase failed: {err}");
            }
            info!("stored settings discarded");
            PortalOutcome::ResetSettings
        }
        PortalEvent::TimedOut => {
            warn!("provisioning window elapsed without a submission");
            PortalOutcome::Abandoned
        }
    }
}

/// Splits an `application/x-www-form-urlencoded` body into decoded
/// `(key, value)` pairs.
pub fn parse_form(body: &[u8]) -> Vec<(String, String)> {
    let Ok(text) = core::str::from_utf8(body) else {
        return Vec::new();
    };

    text.split('&')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            Some((form_decode(key), form_decode(value)))
        })
        .collect()
}

// Decodes over raw bytes: a `%` escape can sit next to a multi-byte
// character, so slicing the `&str` by offset is not safe here.
fn form_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len() => {
                match (hex_digit(bytes[i + 1]), hex_digit(bytes[i + 2])) {
                    (Some(hi), Some(lo)) => {
                        out.push(hi << 4 | lo);
                        i += 3;
                    }
                    // Malformed escape: keep the literal `%`.
                    _ => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            byte => {
                out.push(byte);
                i += 1;
            }
        }
    }

    String::from_utf8_lossy(&out).into_owned()
}

fn hex_digit(byte: u8) -> Option<u8> {
    (byte as char).to_digit(16).map(|digit| digit as u8)
}

/// Escapes a stored value for interpolation into an HTML attribute.
pub fn html_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            ch => out.push(ch),
        }
    }
    out
}
