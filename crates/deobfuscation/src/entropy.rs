//! Shannon entropy and single-byte XOR recovery

use std::collections::HashMap;

/// Shannon entropy of a byte distribution, in bits per symbol
pub fn shannon_entropy(data: &[u8]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }

    let mut counts = [0u32; 256];
    for &b in data {
        counts[b as usize] += 1;
    }
    entropy_from_counts(counts.iter().copied().filter(|&c| c > 0), data.len())
}

/// Shannon entropy over the characters of a string
pub fn string_entropy(value: &str) -> f64 {
    let mut counts: HashMap<char, u32> = HashMap::new();
    let mut len = 0;
    for c in value.chars() {
        *counts.entry(c).or_default() += 1;
        len += 1;
    }
    if len == 0 {
        return 0.0;
    }
    entropy_from_counts(counts.into_values(), len)
}

fn entropy_from_counts(counts: impl Iterator<Item = u32>, total: usize) -> f64 {
    let total = total as f64;
    counts
        .map(|count| {
            let p = count as f64 / total;
            -p * p.log2()
        })
        .sum()
}

/// XOR every byte with `key`
pub fn xor_bytes(data: &[u8], key: u8) -> Vec<u8> {
    data.iter().map(|b| b ^ key).collect()
}

/// Rough measure of how much a string reads like text
fn plausibility(value: &str) -> usize {
    value
        .bytes()
        .map(|b| match b {
            b'e' | b't' | b'a' | b'o' | b'i' | b'n' | b's' | b'h' | b'r' | b'd' | b'l' | b'u' => 3,
            b'a'..=b'z' => 2,
            b'A'..=b'Z' | b'0'..=b'9' | b' ' => 1,
            _ => 0,
        })
        .sum()
}

/// Brute-force a single-byte XOR key over `data`
///
/// Candidates must be entirely printable ASCII and at least four characters
/// long. The most text-like candidate wins, the lowest key on ties.
pub fn decrypt_xor(data: &[u8]) -> Option<(u8, String)> {
    if data.len() < 4 {
        return None;
    }

    let mut best: Option<(usize, u8, String)> = None;
    for key in 1..=255u8 {
        let decoded = xor_bytes(data, key);
        if !decoded.iter().all(|b| (0x20..=0x7E).contains(b)) {
            continue;
        }
        let text = String::from_utf8_lossy(&decoded).into_owned();
        let score = plausibility(&text);
        if best.as_ref().map_or(true, |(s, _, _)| score > *s) {
            best = Some((score, key, text));
        }
    }
    best.map(|(_, key, text)| (key, text))
}

/// Decrypt a string only when some key yields clearly more readable text
pub fn decrypt_string(value: &str) -> Option<String> {
    let (_, text) = decrypt_xor(value.as_bytes())?;
    (plausibility(&text) > plausibility(value)).then_some(text)
}
