//! Fenced code block extraction from free-form generation output.

use std::sync::LazyLock;

use regex::Regex;

static GENERIC_BLOCK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```\s*(.*?)\s*```").unwrap());

/// Pulls a code block of one declared kind out of generated text.
#[derive(Debug, Clone)]
pub struct BlockExtractor {
    kind: String,
    kind_re: Regex,
    vocabulary: Vec<String>,
}

impl BlockExtractor {
    /// `kind` is the fence tag (e.g. `cpp`); `vocabulary` lists words that make
    /// an untagged block acceptable as a fallback.
    pub fn new(kind: &str, vocabulary: &[String]) -> Self {
        let kind_re = Regex::new(&format!(r"(?s)```{}\s+(.*?)\s*```", regex::escape(kind)))
            .expect("escaped fence kind forms a valid pattern");
        Self {
            kind: kind.to_string(),
            kind_re,
            vocabulary: vocabulary.to_vec(),
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// First block tagged with the declared kind; otherwise the first generic
    /// block that mentions a vocabulary word. Empty blocks are ignored.
    pub fn extract(&self, text: &str) -> Option<String> {
        if let Some(code) = first_capture(&self.kind_re, text) {
            return Some(code);
        }
        GENERIC_BLOCK_RE
            .captures_iter(text)
            .filter_map(|caps| caps.get(1))
            .map(|m| m.as_str().trim())
            .find(|code| {
                !code.is_empty() && self.vocabulary.iter().any(|word| code.contains(word.as_str()))
            })
            .map(str::to_string)
    }
}

/// First fenced `json` block that parses, re-rendered as pretty JSON.
pub fn json_block(text: &str) -> Option<Result<String, serde_json::Error>> {
    static JSON_BLOCK_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?s)```json\s+(.*?)\s*```").unwrap());
    let raw = first_capture(&JSON_BLOCK_RE, text)?;
    Some(
        serde_json::from_str::<serde_json::Value>(&raw)
            .and_then(|value| serde_json::to_string_pretty(&value)),
    )
}

fn first_capture(re: &Regex, text: &str) -> Option<String> {
    let code = re.captures(text)?.get(1)?.as_str().trim();
    if code.is_empty() {
        return None;
    }
    Some(code.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extractor() -> BlockExtractor {
        BlockExtractor::new(
            "cpp",
            &["EvalMult".to_string(), "Ciphertext".to_string()],
        )
    }

    #[test]
    fn prefers_tagged_block() {
        let text = "plan\n```\nnot this EvalMult\n```\n```cpp\nm_OutputC = m_InputC;\n```\n";
        assert_eq!(
            extractor().extract(text).as_deref(),
            Some("m_OutputC = m_InputC;")
        );
    }

    #[test]
    fn falls_back_to_generic_block_with_vocabulary() {
        let text = "```\nprint('hi')\n```\nthen\n```\nauto x = m_cc->EvalMult(a, b);\n```";
        assert_eq!(
            extractor().extract(text).as_deref(),
            Some("auto x = m_cc->EvalMult(a, b);")
        );
    }

    #[test]
    fn rejects_generic_block_without_vocabulary() {
        let text = "```\nreturn 42;\n```";
        assert_eq!(extractor().extract(text), None);
    }

    #[test]
    fn no_block_yields_none() {
        assert_eq!(extractor().extract("I would multiply the input by two."), None);
        assert_eq!(extractor().extract("```cpp\n```"), None);
    }

    #[test]
    fn json_block_is_pretty_printed() {
        let text = "```json\n{\"indexes\": [1,2]}\n```";
        let rendered = json_block(text).expect("block").expect("valid json");
        assert_eq!(rendered, "{\n  \"indexes\": [\n    1,\n    2\n  ]\n}");
    }

    #[test]
    fn invalid_json_block_is_reported() {
        let text = "```json\n{not json}\n```";
        assert!(json_block(text).expect("block").is_err());
        assert!(json_block("no json here").is_none());
    }
}
