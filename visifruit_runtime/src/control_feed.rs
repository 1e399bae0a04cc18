//! Control-channel file shim (§4.J, §6 "Control-channel file
//! (persisted, optional)"): polls a single JSON file for a record with
//! a newer `updated_at` than the last one seen, parsing it into a
//! [`ControlMessage`] the orchestrator applies idempotently. Producing
//! this file is outside the core (§6); this is the thinnest possible
//! reader for it.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::warn;

use visifruit_common::types::Direction;
use visifruit_core::control_channel::{
    BeltCommand, ControlBody, ControlMessage, DedupCommand, DiverterCommand, LabelerCommand, SafetyCommand,
};

use crate::detections::parse_class;

#[derive(Debug, Deserialize)]
struct RawControlMessage {
    updated_at: u64,
    #[serde(flatten)]
    body: RawControlBody,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum RawControlBody {
    BeltStart { direction: String, speed_fraction: f64 },
    BeltStop,
    BeltEmergency,
    BeltSetSpeed { speed_fraction: f64 },
    LabelerSetIntensity { intensity: f64 },
    DedupSetIou { value: f64 },
    DedupSetCenterDist { value: f64 },
    DedupSetWindow { value: f64 },
    SafetySetBeltTimeout { seconds: f64 },
    DiverterEnable { class: String, enabled: bool },
}

fn parse_direction(s: &str) -> Direction {
    match s.to_ascii_lowercase().as_str() {
        "reverse" => Direction::Reverse,
        _ => Direction::Forward,
    }
}

impl From<RawControlMessage> for ControlMessage {
    fn from(raw: RawControlMessage) -> Self {
        let body = match raw.body {
            RawControlBody::BeltStart { direction, speed_fraction } => {
                ControlBody::Belt(BeltCommand::Start { direction: parse_direction(&direction), speed_fraction })
            }
            RawControlBody::BeltStop => ControlBody::Belt(BeltCommand::Stop),
            RawControlBody::BeltEmergency => ControlBody::Belt(BeltCommand::Emergency),
            RawControlBody::BeltSetSpeed { speed_fraction } => ControlBody::Belt(BeltCommand::SetSpeed(speed_fraction)),
            RawControlBody::LabelerSetIntensity { intensity } => {
                ControlBody::Labeler(LabelerCommand::SetIntensity(intensity))
            }
            RawControlBody::DedupSetIou { value } => ControlBody::Dedup(DedupCommand::SetIoU(value)),
            RawControlBody::DedupSetCenterDist { value } => ControlBody::Dedup(DedupCommand::SetCenterDist(value)),
            RawControlBody::DedupSetWindow { value } => ControlBody::Dedup(DedupCommand::SetWindow(value)),
            RawControlBody::SafetySetBeltTimeout { seconds } => {
                ControlBody::Safety(SafetyCommand::SetBeltTimeout(seconds))
            }
            RawControlBody::DiverterEnable { class, enabled } => {
                ControlBody::Diverter(DiverterCommand::Enable(parse_class(&class), enabled))
            }
        };
        ControlMessage { updated_at: raw.updated_at, body }
    }
}

/// Polls `path` every `period`, forwarding a new [`ControlMessage`]
/// whenever its `updated_at` exceeds the last one seen. Missing or
/// unparseable files are skipped, not treated as errors: the shim that
/// writes this file may not have started yet.
pub fn spawn_poller(path: PathBuf, period: Duration) -> mpsc::Receiver<ControlMessage> {
    let (tx, rx) = mpsc::channel(8);
    tokio::spawn(async move {
        let mut last_seen = 0u64;
        loop {
            tokio::time::sleep(period).await;
            let text = match std::fs::read_to_string(&path) {
                Ok(text) => text,
                Err(_) => continue,
            };
            match serde_json::from_str::<RawControlMessage>(&text) {
                Ok(raw) if raw.updated_at > last_seen => {
                    last_seen = raw.updated_at;
                    if tx.send(raw.into()).await.is_err() {
                        break;
                    }
                }
                Ok(_) => {}
                Err(error) => warn!(path = %path.display(), %error, "malformed control-channel file"),
            }
        }
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn belt_start_parses_into_control_message() {
        let raw: RawControlMessage = serde_json::from_str(
            r#"{"updated_at":3,"kind":"belt_start","direction":"forward","speed_fraction":0.5}"#,
        )
        .unwrap();
        let msg: ControlMessage = raw.into();
        assert_eq!(msg.updated_at, 3);
        assert!(matches!(
            msg.body,
            ControlBody::Belt(BeltCommand::Start { direction: Direction::Forward, speed_fraction })
                if speed_fraction == 0.5
        ));
    }

    #[test]
    fn diverter_enable_parses_class_by_name() {
        let raw: RawControlMessage =
            serde_json::from_str(r#"{"updated_at":1,"kind":"diverter_enable","class":"pear","enabled":false}"#)
                .unwrap();
        let msg: ControlMessage = raw.into();
        assert!(matches!(
            msg.body,
            ControlBody::Diverter(DiverterCommand::Enable(visifruit_common::types::FruitClass::Pear, false))
        ));
    }
}
