//! Fuzzy wake-phrase matching.
//!
//! The activation trigger feeds recognized speech through
//! [`matches_wake_phrase`], a pure decision function: recognition engines
//! mishear the phrase constantly, so matching layers exact variants, a
//! prefix heuristic, and a bounded edit distance over the trailing words
//! of the utterance.

/// Wake-phrase vocabulary and tolerance.
#[derive(Debug, Clone)]
pub struct WakeConfig {
    /// Canonical phrase, lowercase.
    pub phrase: String,
    /// Known misrecognitions accepted verbatim.
    pub variants: Vec<String>,
    /// Maximum Levenshtein distance for the fuzzy word-pair match.
    pub max_distance: usize,
}

impl Default for WakeConfig {
    fn default() -> Self {
        Self {
            phrase: "hey sully".into(),
            variants: [
                "hey sully",
                "heys ully",
                "ey sully",
                "oye sully",
                "sully",
                "sullivan",
                "hey sally",
                "hey soul",
                "hey souly",
                "hey solley",
                "hey sulley",
                "heyso lee",
                "hay sully",
                "hey silly",
                "hey solely",
                "a sully",
                "hey slowly",
                "hi sully",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            max_distance: 3,
        }
    }
}

/// Decide whether a recognized utterance contains the wake phrase.
/// Only the trailing five words are considered, so stale speech earlier
/// in the buffer cannot trigger.
pub fn matches_wake_phrase(config: &WakeConfig, utterance: &str) -> bool {
    let lowered = utterance.to_lowercase();
    let words: Vec<&str> = lowered.split_whitespace().collect();
    if words.is_empty() {
        return false;
    }
    let tail = &words[words.len().saturating_sub(5)..];
    let window = tail.join(" ");

    if config.variants.iter().any(|v| window.contains(v.as_str())) {
        return true;
    }

    // Greeting word followed by something sully-shaped.
    let greeting = tail
        .iter()
        .position(|w| matches!(*w, "hey" | "hi" | "hay"));
    if let Some(i) = greeting {
        if tail[i + 1..].iter().any(|w| looks_like_sully(w)) {
            return true;
        }
    }

    // Bounded edit distance over adjacent word pairs.
    tail.windows(2)
        .any(|pair| levenshtein(&pair.join(" "), &config.phrase) <= config.max_distance)
}

fn looks_like_sully(word: &str) -> bool {
    if ["sul", "sull", "sol", "soll", "sal"]
        .iter()
        .any(|p| word.starts_with(p))
    {
        return true;
    }
    // Short s-word with a y-ish ending, e.g. "suly", "soli", "sulee".
    let Some(rest) = word.strip_prefix('s') else {
        return false;
    };
    let ends = word.ends_with('y') || word.ends_with('i') || word.ends_with("ee") || word.ends_with("ey");
    (1..=5).contains(&rest.len()) && ends
}

fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0usize; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            current[j + 1] = (prev[j + 1] + 1).min(current[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut current);
    }
    prev[b.len()]
}

// ── Tests ──────────────────────────────────────────────────────────
