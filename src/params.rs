//! Parameter-count extraction from model names
//!
//! Backends advertise models by name only, so the size of a model has to be read out of
//! conventions like `gemma-3-27b`, `Qwen3-30B-A3B` or `mixtral-8x7b`. The grammar is applied
//! per name segment (segments are separated by `-`, `_`, `:`, `/`, `@` or whitespace):
//!
//! ```text
//! segment  := experts | active | plain
//! experts  := INT "x" NUMBER UNIT        8x7b   -> 56 total
//! active   := "a" NUMBER UNIT            a3b    -> 3 active (MoE)
//! plain    := LETTERS? NUMBER UNIT       30b, oss20b
//! UNIT     := "b" | "m"                  billions, millions
//! ```
//!
//! Anything the grammar cannot read is an error; callers exclude such models instead of guessing.
use regex::Regex;
use std::sync::LazyLock;

static SEGMENT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^(?:(?P<experts>\d+)x|(?P<active>a)|[a-z]*)(?P<num>\d+(?:\.\d+)?)(?P<unit>[bm])$",
    )
    .expect("segment pattern is valid")
});

const SEGMENT_SEPARATORS: &[char] = &['-', '_', ':', '/', '@', ' ', '\t'];

/// Parameter counts in billions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParamCount {
    pub total: f64,
    /// Equal to `total` unless the name carries a mixture-of-experts active-parameter segment.
    pub active: f64,
}

impl ParamCount {
    pub fn dense(total: f64) -> Self {
        Self {
            total,
            active: total,
        }
    }

    pub fn is_moe(&self) -> bool {
        self.active < self.total
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParamParseError {
    #[error("no parameter count in model name '{0}'")]
    NoSizeSignature(String),

    #[error("model name '{name}' only names {active}B active parameters")]
    ActiveOnly { name: String, active: f64 },
}

/// Parse the parameter count out of a model name.
pub fn parse_param_count(name: &str) -> Result<ParamCount, ParamParseError> {
    let mut total: Option<f64> = None;
    let mut active: Option<f64> = None;

    for segment in name.split(SEGMENT_SEPARATORS).filter(|s| !s.is_empty()) {
        let Some(caps) = SEGMENT_PATTERN.captures(segment) else {
            continue;
        };
        // The pattern guarantees `num` is a well-formed decimal.
        let Ok(mut value) = caps["num"].parse::<f64>() else {
            continue;
        };
        if caps["unit"].eq_ignore_ascii_case("m") {
            value /= 1000.0;
        }

        if caps.name("active").is_some() {
            active.get_or_insert(value);
            continue;
        }
        if let Some(experts) = caps.name("experts") {
            let Ok(experts) = experts.as_str().parse::<f64>() else {
                continue;
            };
            value *= experts;
        }
        total = Some(total.map_or(value, |t: f64| t.max(value)));
    }

    match (total, active) {
        (Some(total), Some(active)) if active < total => Ok(ParamCount { total, active }),
        (Some(total), _) => Ok(ParamCount::dense(total)),
        (None, Some(active)) => Err(ParamParseError::ActiveOnly {
            name: name.to_string(),
            active,
        }),
        (None, None) => Err(ParamParseError::NoSizeSignature(name.to_string())),
    }
}

const NON_TEXT_MARKERS: &[&str] = &["embed", "ocr", "whisper", "tts", "speech", "rerank"];

/// Returns the marker that identifies a name as a non-chat modality (embeddings, OCR, speech,
/// reranking), if any.
pub fn non_text_marker(name: &str) -> Option<&'static str> {
    let lower = name.to_ascii_lowercase();
    NON_TEXT_MARKERS
        .iter()
        .find(|marker| lower.contains(*marker))
        .copied()
}

/// Code-specialised models are recognised by name.
pub fn is_coder_name(name: &str) -> bool {
    name.to_ascii_lowercase().contains("code")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("gemma-3-27b", 27.0, 27.0)]
    #[case("qwen-3-4b", 4.0, 4.0)]
    #[case("qwen2.5-coder-7b", 7.0, 7.0)]
    #[case("qwen2.5-coder-32b", 32.0, 32.0)]
    #[case("Mistral-Small-3.2-24B", 24.0, 24.0)]
    #[case("Qwen3-30B-A3B", 30.0, 3.0)]
    #[case("qwen3-next-80b-a3b", 80.0, 3.0)]
    #[case("Qwen3-30B-A3B-Instruct-2507-FP8", 30.0, 3.0)]
    #[case("granite-vision-3.3-2b", 2.0, 2.0)]
    #[case("gpt-oss20b", 20.0, 20.0)]
    #[case("llama3.1:8b", 8.0, 8.0)]
    #[case("deepseek-r1:671b", 671.0, 671.0)]
    #[case("mixtral-8x7b-instruct", 56.0, 56.0)]
    #[case("smollm2-360m", 0.36, 0.36)]
    #[case("meta/Llama-3.3-70B-Instruct", 70.0, 70.0)]
    #[case("phi-3.5-mini 3.8b", 3.8, 3.8)]
    fn test_parse_param_count(#[case] name: &str, #[case] total: f64, #[case] active: f64) {
        let params = parse_param_count(name).unwrap();
        assert!((params.total - total).abs() < 1e-9, "{name}: total {}", params.total);
        assert!((params.active - active).abs() < 1e-9, "{name}: active {}", params.active);
    }

    #[rstest]
    #[case("gpt-4o")]
    #[case("deepseek-v3")]
    #[case("qwen3")]
    #[case("llama-4bit")]
    #[case("context-128k")]
    #[case("")]
    fn test_unparsable_names(#[case] name: &str) {
        assert_eq!(
            parse_param_count(name),
            Err(ParamParseError::NoSizeSignature(name.to_string()))
        );
    }

    #[test]
    fn test_active_only_name_is_rejected() {
        let err = parse_param_count("mystery-a3b").unwrap_err();
        assert!(matches!(err, ParamParseError::ActiveOnly { active, .. } if active == 3.0));
    }

    #[test]
    fn test_moe_flag() {
        assert!(parse_param_count("Qwen3-30B-A3B").unwrap().is_moe());
        assert!(!parse_param_count("gemma-3-27b").unwrap().is_moe());
    }

    #[test]
    fn test_active_not_smaller_than_total_is_dense() {
        let params = parse_param_count("odd-4b-a8b").unwrap();
        assert_eq!(params, ParamCount::dense(4.0));
    }

    #[rstest]
    #[case("nomic-embed-text:latest", Some("embed"))]
    #[case("snowflake-arctic-embed2:latest", Some("embed"))]
    #[case("qwen3-embedding:8b", Some("embed"))]
    #[case("vllm-deepseek-ocr", Some("ocr"))]
    #[case("whisper-large-v3", Some("whisper"))]
    #[case("kokoro-tts", Some("tts"))]
    #[case("bge-reranker-v2", Some("rerank"))]
    #[case("gemma-3-27b", None)]
    #[case("qwen2.5-coder-32b", None)]
    fn test_non_text_marker(#[case] name: &str, #[case] expected: Option<&str>) {
        assert_eq!(non_text_marker(name), expected);
    }

    #[test]
    fn test_coder_names() {
        assert!(is_coder_name("qwen2.5-coder-32b"));
        assert!(is_coder_name("Codestral-22B"));
        assert!(!is_coder_name("gemma-3-27b"));
    }
}
