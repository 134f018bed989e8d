//! Per-request LoRA resolution, including aLoRA (activated LoRA) invocation
//! scanning. See spec.md §4.3 "Idle -> Started".

use serde::{Deserialize, Serialize};

use crate::token_buf::TokenBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterInfo {
    pub id: String,
    pub scale: f32,
    /// Non-empty for aLoRA adapters: the token sequence whose presence in
    /// the prompt activates the adapter.
    #[serde(default)]
    pub invocation_tokens: Vec<i64>,
}

/// Resolve the set of adapters active for a request, scanning for aLoRA
/// invocation sequences. Returns the resolved list plus, if any aLoRA
/// adapter activated, the start index of its invocation span (spec.md §4.3:
/// "locate the last occurrence ... if absent, disable").
pub fn resolve_lora(
    available: &[AdapterInfo],
    requested: &[(String, f32)],
    prompt: &TokenBuf,
) -> Result<(Vec<AdapterInfo>, Option<usize>), String> {
    let mut resolved = Vec::new();
    let mut alora_start = None;
    let mut alora_count = 0usize;

    for (id, scale) in requested {
        let Some(base) = available.iter().find(|a| &a.id == id) else {
            return Err(format!("unknown lora adapter: {id}"));
        };
        let mut info = base.clone();
        info.scale = *scale;

        if !info.invocation_tokens.is_empty() {
            match find_last_occurrence(prompt, &info.invocation_tokens) {
                Some(start) => {
                    alora_start = Some(alora_start.map_or(start, |prev: usize| prev.max(start)));
                    alora_count += 1;
                }
                None => {
                    // Invocation sequence absent: disable this adapter for
                    // this request rather than failing it.
                    continue;
                }
            }
        }
        resolved.push(info);
    }

    if alora_count > 1 {
        return Err("multiple aLoRA adapters requested in one call".to_string());
    }

    Ok((resolved, alora_start))
}

fn find_last_occurrence(haystack: &TokenBuf, needle: &[i64]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    let raw = haystack.raw_tokens();
    (0..=raw.len() - needle.len()).rev().find(|&start| &raw[start..start + needle.len()] == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buf(ids: &[i64]) -> TokenBuf {
        let mut b = TokenBuf::new(false);
        for &id in ids {
            b.push_text(id);
        }
        b
    }

    #[test]
    fn finds_last_occurrence_not_first() {
        let prompt = buf(&[1, 9, 9, 2, 9, 9, 2]);
        assert_eq!(find_last_occurrence(&prompt, &[9, 9, 2]), Some(4));
    }

    #[test]
    fn missing_invocation_disables_adapter() {
        let available = vec![AdapterInfo {
            id: "a".into(),
            scale: 1.0,
            invocation_tokens: vec![42, 43],
        }];
        let prompt = buf(&[1, 2, 3]);
        let (resolved, start) = resolve_lora(&available, &[("a".into(), 1.0)], &prompt).unwrap();
        assert!(resolved.is_empty());
        assert!(start.is_none());
    }
}
