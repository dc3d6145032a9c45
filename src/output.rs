//! Detector event formatting: human prose, machine lines or JSON.
//!
//! Machine format is what the serial bridge parses from its child; the
//! other two are for people and scripts on the terminal.

use std::io::{self, Write};

use clap::ValueEnum;
use serde::Serialize;

use crate::detector::WakeWordPrediction;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Human,
    Machine,
    Json,
}

#[derive(Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
enum JsonEvent<'a> {
    Prediction { wakeword: &'a str, prob: f32, cnt: u32 },
    Status { ready: bool },
}

pub fn write_prediction<W: Write>(
    out: &mut W,
    format: OutputFormat,
    prediction: &WakeWordPrediction,
) -> io::Result<()> {
    match format {
        OutputFormat::Human => writeln!(
            out,
            "wake word '{}' detected (score {:.3}, {} consecutive windows)",
            prediction.name, prediction.score, prediction.count
        )?,
        OutputFormat::Machine => writeln!(
            out,
            "P:{}:{:.6}:{}",
            prediction.name, prediction.score, prediction.count
        )?,
        OutputFormat::Json => {
            let event = JsonEvent::Prediction {
                wakeword: &prediction.name,
                prob: prediction.score,
                cnt: prediction.count,
            };
            writeln!(out, "{}", serde_json::to_string(&event).map_err(io::Error::from)?)?
        }
    }
    out.flush()
}

pub fn write_ready<W: Write>(out: &mut W, format: OutputFormat, ready: bool) -> io::Result<()> {
    match format {
        OutputFormat::Human => {
            if ready {
                writeln!(out, "listening")?
            } else {
                writeln!(out, "stopped")?
            }
        }
        OutputFormat::Machine => writeln!(out, "R:{}", u8::from(ready))?,
        OutputFormat::Json => {
            writeln!(
                out,
                "{}",
                serde_json::to_string(&JsonEvent::Status { ready }).map_err(io::Error::from)?
            )?
        }
    }
    out.flush()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prediction() -> WakeWordPrediction {
        WakeWordPrediction { name: "mycroft".into(), score: 0.875, count: 2 }
    }

    #[test]
    fn machine_lines_match_the_child_protocol() {
        let mut buf = Vec::new();
        write_prediction(&mut buf, OutputFormat::Machine, &prediction()).unwrap();
        assert_eq!(String::from_utf8(buf).unwrap(), "P:mycroft:0.875000:2\n");

        let mut buf = Vec::new();
        write_ready(&mut buf, OutputFormat::Machine, true).unwrap();
        assert_eq!(String::from_utf8(buf).unwrap(), "R:1\n");
    }

    #[test]
    fn json_events_carry_the_documented_fields() {
        let mut buf = Vec::new();
        write_prediction(&mut buf, OutputFormat::Json, &prediction()).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&buf).unwrap();
        assert_eq!(value["event"], "prediction");
        assert_eq!(value["wakeword"], "mycroft");
        assert_eq!(value["cnt"], 2);

        let mut buf = Vec::new();
        write_ready(&mut buf, OutputFormat::Json, false).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&buf).unwrap();
        assert_eq!(value["event"], "status");
        assert_eq!(value["ready"], false);
    }
}
