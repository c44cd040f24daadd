use serde::{Deserialize, Serialize};

use crate::template::sha256_hex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairSide {
    Call,
    Result,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pair_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pair_side: Option<PairSide>,
}

#[derive(Debug, Clone)]
pub struct MaskingConfig {
    /// Masked observations keep at least this many characters.
    pub floor_chars: usize,
    /// Contents longer than this are masked down.
    pub ceiling_chars: usize,
    /// Append a short digest of the removed text.
    pub digest: bool,
}

#[derive(Debug, Clone)]
pub struct ReducerConfig {
    /// Character budget for the reduced history.
    pub max_chars: usize,
    /// Most recent raw turns always kept unmasked.
    pub keep_recent_turns: usize,
    pub masking: Option<MaskingConfig>,
}

impl Default for ReducerConfig {
    fn default() -> Self {
        Self {
            max_chars: 32_000,
            keep_recent_turns: 1,
            masking: None,
        }
    }
}

/// One reduction unit: either a lone message or a call/result pair that
/// must survive or drop together.
struct Unit {
    indices: Vec<usize>,
    chars: usize,
}

fn build_units(messages: &[Message]) -> Vec<Unit> {
    let mut units: Vec<Unit> = Vec::new();
    let mut pair_unit: std::collections::HashMap<&str, usize> = std::collections::HashMap::new();

    for (index, message) in messages.iter().enumerate() {
        match message.pair_id.as_deref() {
            Some(pair_id) => match pair_unit.get(pair_id) {
                Some(&unit_index) => {
                    units[unit_index].indices.push(index);
                    units[unit_index].chars += message.content.len();
                }
                None => {
                    pair_unit.insert(pair_id, units.len());
                    units.push(Unit {
                        indices: vec![index],
                        chars: message.content.len(),
                    });
                }
            },
            None => units.push(Unit {
                indices: vec![index],
                chars: message.content.len(),
            }),
        }
    }
    units
}

fn mask_content(content: &str, masking: &MaskingConfig) -> String {
    if content.len() <= masking.ceiling_chars {
        return content.to_string();
    }
    let keep = masking.floor_chars.min(masking.ceiling_chars).max(1);
    let mut cut = keep.min(content.len());
    while cut > 0 && !content.is_char_boundary(cut) {
        cut -= 1;
    }
    let kept = &content[..cut];
    if masking.digest {
        let digest = &sha256_hex(content)[..12];
        format!("{kept}…[masked {} chars, digest {digest}]", content.len() - cut)
    } else {
        format!("{kept}…[masked {} chars]", content.len() - cut)
    }
}

/// Compact a message history under a character budget.
///
/// Pairing invariant: a `call` message survives iff its `result` does.
/// The most recent `keep_recent_turns` units are always kept raw; older
/// units are kept newest-first while the budget allows, then dropped
/// whole. Kept non-recent observations may be masked.
pub fn reduce_history(messages: &[Message], config: &ReducerConfig) -> Vec<Message> {
    if messages.is_empty() {
        return Vec::new();
    }

    let units = build_units(messages);
    let keep_recent = config.keep_recent_turns.max(1).min(units.len());
    let recent_start = units.len() - keep_recent;

    let mut kept_units: Vec<bool> = vec![false; units.len()];
    let mut used_chars = 0usize;

    for unit in &units[recent_start..] {
        used_chars += unit.chars;
    }
    for flag in kept_units.iter_mut().skip(recent_start) {
        *flag = true;
    }

    // Older units, newest first, whole units only.
    for unit_index in (0..recent_start).rev() {
        let unit = &units[unit_index];
        if used_chars + unit.chars > config.max_chars {
            continue;
        }
        used_chars += unit.chars;
        kept_units[unit_index] = true;
    }

    let mut keep_message = vec![false; messages.len()];
    let mut recent_message = vec![false; messages.len()];
    for (unit_index, unit) in units.iter().enumerate() {
        if !kept_units[unit_index] {
            continue;
        }
        for &message_index in &unit.indices {
            keep_message[message_index] = true;
            if unit_index >= recent_start {
                recent_message[message_index] = true;
            }
        }
    }

    messages
        .iter()
        .enumerate()
        .filter(|(index, _)| keep_message[*index])
        .map(|(index, message)| {
            let mut out = message.clone();
            if !recent_message[index] {
                if let Some(masking) = &config.masking {
                    out.content = mask_content(&out.content, masking);
                }
            }
            out
        })
        .collect()
}
