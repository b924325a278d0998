//! Rule-based text detectors that drive the protocol state machine.
//!
//! All detectors are pure, total functions over a text snippet: empty or
//! malformed input simply returns `false`. The pattern lists live in
//! [`DetectorConfig`] as data, so a session can run with an extended or
//! swapped vocabulary without touching dispatch logic.

use regex::Regex;

/// Compiled pattern lists for the four detectors.
///
/// Construct with [`DetectorConfig::default`] for the standard
/// English/Spanish clinical vocabulary, or build a custom set for tests.
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// Diacritics and function words marking Spanish text.
    pub spanish_markers: Vec<Regex>,
    /// "Please repeat" phrasings in Spanish.
    pub repeat_phrases: Vec<Regex>,
    /// English indicator words for the clinician-vs-patient vote.
    pub english_indicators: Vec<Regex>,
    /// Spanish indicator words for the clinician-vs-patient vote.
    pub spanish_indicators: Vec<Regex>,
    /// Closing phrasings in either language.
    pub ending_phrases: Vec<Regex>,
    /// Phrasings marking an assistant utterance as a summary.
    pub summary_markers: Vec<Regex>,
}

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .map(|p| Regex::new(p).unwrap_or_else(|e| panic!("invalid detector pattern {p:?}: {e}")))
        .collect()
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            spanish_markers: compile(&[
                r"[áéíóúüñ¿¡]",
                r"(?i)\b(el|la|los|las|un|una|unos|unas)\b",
                r"(?i)\b(es|está|son|están)\b",
                r"(?i)\b(y|o|pero|porque|como|cuando|donde|qué|quién|cómo|por qué)\b",
            ]),
            repeat_phrases: compile(&[
                r"(?i)repite eso",
                r"(?i)repítelo",
                r"(?i)dilo otra vez",
                r"(?i)puedes repetir",
                r"(?i)no entendí",
                r"(?i)no entiendo",
                r"(?i)repita",
                r"(?i)repetir",
            ]),
            english_indicators: compile(&[
                r"(?i)\b(the|a|an|is|are|have|has|was|were|will|would|can|could|should|may|might)\b",
                r"(?i)\b(I|you|he|she|it|we|they|my|your|his|her|its|our|their)\b",
                r"(?i)\b(this|that|these|those|here|there|now|then|today|tomorrow|yesterday)\b",
            ]),
            spanish_indicators: compile(&[
                r"(?i)\b(el|la|los|las|un|una|unos|unas|es|son|estar|tener|fue|fueron|será|sería)\b",
                r"(?i)\b(yo|tú|él|ella|eso|nosotros|ellos|mi|tu|su|nuestro|sus)\b",
                r"(?i)\b(este|esta|estos|estas|aquí|allí|ahora|entonces|hoy|mañana|ayer)\b",
            ]),
            ending_phrases: compile(&[
                r"(?i)thank you for (the|your) time",
                r"(?i)have a (good|great|nice) day",
                r"(?i)that('s| is) all for today",
                r"(?i)appointment (is|has been) scheduled",
                r"(?i)we('| a)re done",
                r"(?i)conversation (is|has) ended",
                r"(?i)end of (the|our) (session|appointment|visit)",
                r"(?i)gracias por (su|tu) tiempo",
                r"(?i)que (tenga|tengas) un buen día",
                r"(?i)eso es todo por hoy",
                r"(?i)hemos terminado",
                r"(?i)(here is|here's|I have prepared) (a|the) summary",
                r"(?i)summary of (our|the|today's) (conversation|visit|appointment)",
            ]),
            summary_markers: compile(&[
                r"(?i)summary",
                r"(?i)resumen",
                r"(?i)^(here is |here's )?a summary",
            ]),
        }
    }
}

impl DetectorConfig {
    /// True when the text reads as Spanish (the patient-side language).
    pub fn is_spanish(&self, text: &str) -> bool {
        self.spanish_markers.iter().any(|p| p.is_match(text))
    }

    /// True when the text is a Spanish "repeat that" request.
    pub fn is_repeat_request(&self, text: &str) -> bool {
        self.repeat_phrases.iter().any(|p| p.is_match(text))
    }

    /// Majority vote between the English and Spanish indicator sets.
    /// Ties favor the patient side: a clinician verdict requires a strict
    /// English majority.
    pub fn is_clinician_message(&self, text: &str) -> bool {
        let english = self
            .english_indicators
            .iter()
            .filter(|p| p.is_match(text))
            .count();
        let spanish = self
            .spanish_indicators
            .iter()
            .filter(|p| p.is_match(text))
            .count();
        english > spanish
    }

    /// True when the text signals the conversation is wrapping up.
    pub fn is_conversation_ending(&self, text: &str) -> bool {
        self.ending_phrases.iter().any(|p| p.is_match(text))
    }

    /// True when an assistant utterance looks like a generated summary.
    pub fn is_summary_message(&self, text: &str) -> bool {
        self.summary_markers.iter().any(|p| p.is_match(text))
    }
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spanish_diacritics_detected() {
        let d = DetectorConfig::default();
        assert!(d.is_spanish("¿Cómo está usted?"));
        assert!(d.is_spanish("este año"));
    }

    #[test]
    fn plain_english_is_not_spanish() {
        let d = DetectorConfig::default();
        assert!(!d.is_spanish("What time is it?"));
    }

    #[test]
    fn empty_string_matches_nothing() {
        let d = DetectorConfig::default();
        assert!(!d.is_spanish(""));
        assert!(!d.is_repeat_request(""));
        assert!(!d.is_clinician_message(""));
        assert!(!d.is_conversation_ending(""));
        assert!(!d.is_summary_message(""));
    }

    #[test]
    fn repeat_request_variants() {
        let d = DetectorConfig::default();
        assert!(d.is_repeat_request("Repite eso por favor"));
        assert!(d.is_repeat_request("no entendí"));
        assert!(d.is_repeat_request("¿Puedes repetir?"));
        assert!(!d.is_repeat_request("say that again")); // English phrasing is out of scope
    }

    #[test]
    fn clinician_vote_requires_strict_majority() {
        let d = DetectorConfig::default();
        assert!(d.is_clinician_message("The patient should come back tomorrow"));
        assert!(!d.is_clinician_message("el paciente está aquí ahora"));
        // A tie (zero matches on both sides) goes to the patient side.
        assert!(!d.is_clinician_message("okay"));
    }

    #[test]
    fn ending_phrases_both_languages() {
        let d = DetectorConfig::default();
        assert!(d.is_conversation_ending("Thank you for your time, have a great day"));
        assert!(d.is_conversation_ending("Gracias por su tiempo"));
        assert!(d.is_conversation_ending("Here is a summary of our visit"));
        assert!(!d.is_conversation_ending("My knee hurts when I walk"));
    }

    #[test]
    fn summary_markers_match_both_languages() {
        let d = DetectorConfig::default();
        assert!(d.is_summary_message("SUMMARY: patient reports knee pain"));
        assert!(d.is_summary_message("RESUMEN: dolor de rodilla"));
        assert!(d.is_summary_message("Here's a summary of the visit"));
        assert!(!d.is_summary_message("Please describe your symptoms"));
    }
}
