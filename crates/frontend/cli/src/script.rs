//! Input scripts for `framestep play`.
//!
//! A script is a JSON list of entries, each holding an action for a number
//! of frames:
//!
//! ```json
//! [
//!   { "buttons": { "Right": true }, "frames": 30 },
//!   { "buttons": { "Right": true, "B": true }, "frames": 10 },
//!   { "frames": 20 }
//! ]
//! ```
//!
//! `buttons` takes either action form (name map or 12-entry list); a
//! missing or `null` value means no buttons.

use anyhow::{Context, Result};
use framestep_core::{Action, InputVector};
use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
struct Entry {
    #[serde(default)]
    buttons: Option<Action>,
    frames: u32,
}

/// One normalized script entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step {
    pub input: InputVector,
    pub frames: u32,
}

pub fn parse(json: &str) -> Result<Vec<Step>> {
    let entries: Vec<Entry> = serde_json::from_str(json).context("malformed script")?;
    entries
        .iter()
        .enumerate()
        .filter(|(_, entry)| entry.frames > 0)
        .map(|(i, entry)| {
            let input = framestep_core::normalize(entry.buttons.as_ref())
                .with_context(|| format!("script entry {}", i))?;
            Ok(Step {
                input,
                frames: entry.frames,
            })
        })
        .collect()
}

pub fn load(path: &Path) -> Result<Vec<Step>> {
    let json = fs::read_to_string(path)
        .with_context(|| format!("failed to read script {}", path.display()))?;
    parse(&json).with_context(|| format!("in {}", path.display()))
}

pub fn total_frames(steps: &[Step]) -> u64 {
    steps.iter().map(|s| u64::from(s.frames)).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use framestep_core::Button;

    #[test]
    fn parses_both_action_forms() {
        let steps = parse(
            r#"[
                { "buttons": { "Right": true, "B": null }, "frames": 30 },
                { "buttons": [false, true, false, false, false, false,
                              false, false, false, false, false, false], "frames": 5 },
                { "frames": 2 },
                { "buttons": null, "frames": 1 }
            ]"#,
        )
        .unwrap();

        assert_eq!(steps.len(), 4);
        assert_eq!(steps[0].input, InputVector::from(Button::Right));
        assert_eq!(steps[0].frames, 30);
        assert_eq!(steps[1].input, InputVector::from(Button::ALL[1]));
        assert!(steps[2].input.is_empty());
        assert!(steps[3].input.is_empty());
        assert_eq!(total_frames(&steps), 38);
    }

    #[test]
    fn zero_frame_entries_are_dropped() {
        let steps = parse(r#"[{ "frames": 0 }, { "buttons": {"A": true}, "frames": 3 }]"#).unwrap();
        assert_eq!(
            steps,
            vec![Step {
                input: Button::A.into(),
                frames: 3
            }]
        );
    }

    #[test]
    fn rejects_unknown_buttons_and_fields() {
        let err = parse(r#"[{ "buttons": {"Turbo": true}, "frames": 1 }]"#).unwrap_err();
        assert!(format!("{:#}", err).contains("Turbo"));

        assert!(parse(r#"[{ "button": {"A": true}, "frames": 1 }]"#).is_err());
        assert!(parse(r#"[{ "buttons": [true], "frames": 1 }]"#).is_err());
        assert!(parse(r#"{ "frames": 1 }"#).is_err());
    }
}
