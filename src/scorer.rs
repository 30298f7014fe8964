//! Heuristic complexity scoring.
//!
//! Scores a request between 0.0 (trivial) and 1.0 (very complex) from cheap textual signals.
//! Scores at either extreme decide the tier on their own; anything in between is left to the
//! classifier.
use crate::inventory::Tier;
use crate::models::ChatRequest;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

/// Scores at or below `low` are SMALL, at or above `high` LARGE.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreThresholds {
    pub low: f64,
    pub high: f64,
}

impl Default for ScoreThresholds {
    fn default() -> Self {
        Self {
            low: 0.3,
            high: 0.7,
        }
    }
}

impl ScoreThresholds {
    pub fn tier_for(&self, value: f64) -> Option<Tier> {
        if value <= self.low {
            Some(Tier::Small)
        } else if value >= self.high {
            Some(Tier::Large)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ComplexityScore {
    /// In `[0.0, 1.0]`, rounded to three decimals.
    pub value: f64,
    pub confident: bool,
    /// Set exactly when `confident`; never MEDIUM.
    pub tier: Option<Tier>,
    pub reasons: Vec<String>,
}

struct KeywordRule {
    weight: f64,
    pattern: Regex,
}

fn keyword_pattern(alternatives: &str) -> Regex {
    Regex::new(&format!(r"(?i)\b(?:{alternatives})\b")).expect("keyword pattern is valid")
}

/// English and German markers of demanding requests. The strongest match counts, matches are
/// not summed.
static COMPLEX_KEYWORDS: LazyLock<Vec<KeywordRule>> = LazyLock::new(|| {
    vec![
        KeywordRule {
            weight: 0.6,
            pattern: keyword_pattern(concat!(
                r"explain\s+in\s+detail|in\s+detail|step[- ]by[- ]step|multi[- ]step|",
                r"comprehensive|thorough(?:ly)?|in[- ]depth|architect(?:ure)?|",
                r"write\s+(?:a\s+)?(?:complete|full|entire)|",
                r"Schritt\s+f[üu]r\s+Schritt|im\s+Detail|umfassend\w*|gr[üu]ndlich\w*|",
                r"ausf[üu]hrlich\w*|detailliert\w*|tiefgehend\w*|mehrschrittig\w*|mehrstufig\w*|",
                r"Architektur|Konzept\s+erstell\w*|schreib[e ].*(?:komplett|vollst[äa]ndig|ganz)"
            )),
        },
        KeywordRule {
            weight: 0.45,
            pattern: keyword_pattern(concat!(
                r"implement\w*|design|refactor\w*|optimi[sz]e|debug|",
                r"implementiere|entwirf|entwerfe|optimiere|debugge"
            )),
        },
        KeywordRule {
            weight: 0.35,
            pattern: keyword_pattern(concat!(
                r"analy[sz]e|compare|contrast|explain|evaluate|discuss|review|",
                r"trade[- ]?offs?|pros?\s+and\s+cons?|advantages?\s+and\s+disadvantages?|",
                r"analysiere|vergleiche|erkl[äa]re|bewerte|diskutiere|[üu]berpr[üu]fe|",
                r"Vor-?\s*und\s+Nachteile|Abw[äa]gung|Pro\s+und\s+Contra"
            )),
        },
    ]
});

/// English and German markers of simple requests.
static SIMPLE_KEYWORDS: LazyLock<Regex> = LazyLock::new(|| {
    keyword_pattern(concat!(
        r"translate|summari[sz]e|tldr|tl;dr|yes\s+or\s+no|true\s+or\s+false|",
        r"what\s+is|who\s+is|when\s+did|where\s+is|define|list|name|count|",
        r"fix\s+(?:this|the)\s+(?:typo|spelling|grammar)|convert|format|reformat|",
        r"[üu]bersetz[e ]|zusammenfass\w*|fass[e ].*zusammen|ja\s+oder\s+nein|richtig\s+oder\s+falsch|",
        r"was\s+ist|wer\s+ist|wann\s+war|wo\s+ist|wie\s+hei[ßs]t|definiere|z[äa]hl[e ]|nenne|auflisten|",
        r"korrigiere\s+(?:den|die|das)\s+(?:Tippfehler|Rechtschreibung|Grammatik)|",
        r"konvertiere|formatiere|umwandeln"
    ))
});

static CODE_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```.*?```").expect("code block pattern is valid"));

const IMAGE_PLACEHOLDER: &str = "[IMAGE]";

/// Roughly four characters per token.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count() / 4
}

/// Number of complete fenced code blocks in `text`.
pub fn count_code_blocks(text: &str) -> usize {
    CODE_BLOCK.find_iter(text).count()
}

/// Distinct matches in order of appearance, at most `limit`.
fn distinct_matches<'t>(matches: impl IntoIterator<Item = (usize, &'t str)>, limit: usize) -> Vec<&'t str> {
    let mut matches: Vec<(usize, &str)> = matches.into_iter().collect();
    matches.sort_by_key(|(start, _)| *start);

    let mut seen: Vec<&str> = Vec::new();
    for (_, m) in matches {
        if !seen.iter().any(|s| s.eq_ignore_ascii_case(m)) {
            seen.push(m);
        }
    }
    seen.truncate(limit);
    seen
}

fn join_messages<'a>(messages: impl Iterator<Item = &'a crate::models::Message>) -> String {
    messages
        .map(|m| m.render(IMAGE_PLACEHOLDER, "\n"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Score a request. Pure: the same request and thresholds always give the same score.
pub fn score(request: &ChatRequest, thresholds: &ScoreThresholds) -> ComplexityScore {
    let mut reasons = Vec::new();
    let mut value = 0.0;

    let full_text = join_messages(request.messages.iter());
    let tokens = estimate_tokens(&full_text);
    let (length_score, length_label) = match tokens {
        0..50 => (0.0, "very short"),
        50..200 => (0.1, "short"),
        200..800 => (0.25, "medium length"),
        800..2000 => (0.4, "long"),
        _ => (0.5, "very long"),
    };
    value += length_score;
    reasons.push(format!("{length_label} ({tokens} est. tokens)"));

    let turns = request.messages.len();
    if turns >= 10 {
        value += 0.15;
        reasons.push(format!("deep conversation ({turns} turns)"));
    } else if turns > 4 {
        value += 0.08;
        reasons.push(format!("multi-turn ({turns} turns)"));
    }

    let tools = request.tool_count();
    if tools > 3 {
        value += 0.2;
        reasons.push(format!("many tools ({tools})"));
    } else if tools > 0 {
        value += 0.1;
        reasons.push(format!("tool use ({tools} tools)"));
    }

    if request.messages.iter().any(|m| m.is_system()) {
        let system_tokens =
            estimate_tokens(&join_messages(request.messages.iter().filter(|m| m.is_system())));
        if system_tokens > 500 {
            value += 0.15;
            reasons.push(format!("complex system prompt ({system_tokens} est. tokens)"));
        } else if system_tokens > 100 {
            value += 0.05;
            reasons.push(format!("system prompt ({system_tokens} est. tokens)"));
        }
    }

    let code_blocks = count_code_blocks(&full_text);
    if code_blocks > 2 {
        value += 0.15;
        reasons.push(format!("multiple code blocks ({code_blocks})"));
    } else if code_blocks > 0 {
        value += 0.05;
        reasons.push(format!("code blocks ({code_blocks})"));
    }

    if request.messages.iter().any(|m| m.has_image()) {
        value += 0.1;
        reasons.push("contains images".to_string());
    }

    let last_user = join_messages(request.last_user_messages(1));

    let mut complex_weight: Option<f64> = None;
    let mut complex_matches = Vec::new();
    for rule in COMPLEX_KEYWORDS.iter() {
        let found: Vec<_> = rule
            .pattern
            .find_iter(&last_user)
            .map(|m| (m.start(), m.as_str()))
            .collect();
        if !found.is_empty() {
            complex_weight = Some(complex_weight.map_or(rule.weight, |w: f64| w.max(rule.weight)));
            complex_matches.extend(found);
        }
    }

    if let Some(weight) = complex_weight {
        value += weight;
        reasons.push(format!(
            "complex keywords: {}",
            distinct_matches(complex_matches, 3).join(", ")
        ));
    } else {
        let simple = distinct_matches(
            SIMPLE_KEYWORDS
                .find_iter(&last_user)
                .map(|m| (m.start(), m.as_str())),
            3,
        );
        if !simple.is_empty() {
            value -= 0.15;
            reasons.push(format!("simple keywords: {}", simple.join(", ")));
        }
    }

    let value = (value.clamp(0.0, 1.0) * 1000.0).round() / 1000.0;
    let tier = thresholds.tier_for(value);

    ComplexityScore {
        value,
        confident: tier.is_some(),
        tier,
        reasons,
    }
}
