//! Structural patching of a single method body inside a source template.
//!
//! The method is located by its signature marker `void <Class>::<method>() {`
//! and its body is bounded by counting brace depth from the opening brace. A
//! plain regex replacement cannot bound a body that contains nested scopes.

use regex::Regex;
use thiserror::Error;

/// Template/body mismatch attributable to generated code or the template.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatchError {
    #[error("cannot find `void <Class>::{method}() {{` in template")]
    MarkerNotFound { method: String },
    #[error("unbalanced braces in body of `{method}()` opened at byte {offset}")]
    UnbalancedBraces { method: String, offset: usize },
}

/// Locates and rewrites the body of `void <Class>::<method>()`.
#[derive(Debug, Clone)]
pub struct BodyPatcher {
    method: String,
    marker: Regex,
}

impl BodyPatcher {
    pub fn new(method: &str) -> Self {
        let pattern = format!(r"void\s+\w+::{}\s*\(\s*\)\s*\{{", regex::escape(method));
        let marker = Regex::new(&pattern).expect("escaped method name forms a valid pattern");
        Self {
            method: method.to_string(),
            marker,
        }
    }

    /// Exact text between the method's opening and matching closing brace.
    pub fn extract_body<'a>(&self, text: &'a str) -> Result<&'a str, PatchError> {
        let (start, end) = self.body_span(text)?;
        Ok(&text[start..end])
    }

    /// Replace the method body with `new_body`, preserving everything outside
    /// the braces. `template` is left untouched on error.
    pub fn inject_body(&self, template: &str, new_body: &str) -> Result<String, PatchError> {
        let (start, end) = self.body_span(template)?;
        let mut patched = String::with_capacity(template.len() - (end - start) + new_body.len());
        patched.push_str(&template[..start]);
        patched.push_str(new_body);
        patched.push_str(&template[end..]);
        Ok(patched)
    }

    /// Drop an accidental `void <Class>::<method>() { ... }` wrapper around
    /// generated code, keeping only the trimmed inner body. Code without the
    /// marker (or with a wrapper that never closes) is returned unchanged.
    pub fn strip_wrapper(&self, code: &str) -> String {
        match self.extract_body(code) {
            Ok(body) => body.trim().to_string(),
            Err(_) => code.to_string(),
        }
    }

    /// Byte range of the body: from just after `{` up to (excluding) `}`.
    fn body_span(&self, text: &str) -> Result<(usize, usize), PatchError> {
        let found = self
            .marker
            .find(text)
            .ok_or_else(|| PatchError::MarkerNotFound {
                method: self.method.clone(),
            })?;
        let start = found.end();
        let close = matching_close(&text[start..]).ok_or_else(|| PatchError::UnbalancedBraces {
            method: self.method.clone(),
            offset: start - 1,
        })?;
        Ok((start, start + close))
    }
}

/// Offset of the brace that closes an already-open scope (depth starts at 1).
fn matching_close(body: &str) -> Option<usize> {
    let mut depth = 1usize;
    for (idx, byte) in body.bytes().enumerate() {
        match byte {
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(idx);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEMPLATE: &str = r#"#include "yourSolution.h"

CKKSTaskSolver::CKKSTaskSolver(CryptoContext<DCRTPoly> cc) : m_cc(cc) {}

void CKKSTaskSolver::eval() {
    // TODO: implement
}

void CKKSTaskSolver::serializeOutput() {
    std::ofstream out("out.bin");
}
"#;

    #[test]
    fn inject_then_extract_round_trips_nested_body() {
        let patcher = BodyPatcher::new("eval");
        let body = "\n    if (x) {\n        for (;;) { m_OutputC = m_InputC; }\n    }\n";
        let patched = patcher.inject_body(TEMPLATE, body).expect("inject");
        assert_eq!(patcher.extract_body(&patched).expect("extract"), body);
    }

    #[test]
    fn inject_preserves_surrounding_functions() {
        let patcher = BodyPatcher::new("eval");
        let patched = patcher
            .inject_body(TEMPLATE, "\n    m_OutputC = m_InputC;\n")
            .expect("inject");
        assert!(patched.starts_with("#include \"yourSolution.h\""));
        assert!(patched.contains("void CKKSTaskSolver::serializeOutput() {\n    std::ofstream"));
        assert!(!patched.contains("TODO: implement"));
    }

    #[test]
    fn tolerates_whitespace_in_signature() {
        let patcher = BodyPatcher::new("eval");
        let template = "void  Solver::eval ( )\n{\n  old();\n}\n";
        let patched = patcher.inject_body(template, " new(); ").expect("inject");
        assert_eq!(patched, "void  Solver::eval ( )\n{ new(); }\n");
    }

    #[test]
    fn missing_marker_is_patch_error() {
        let patcher = BodyPatcher::new("eval");
        let template = "int main() { return 0; }";
        let err = patcher.inject_body(template, "x").unwrap_err();
        assert_eq!(
            err,
            PatchError::MarkerNotFound {
                method: "eval".to_string()
            }
        );
        assert_eq!(template, "int main() { return 0; }");
    }

    #[test]
    fn other_method_names_do_not_match() {
        let patcher = BodyPatcher::new("eval");
        assert!(patcher.extract_body("void Solver::evaluate() {}").is_err());
        assert_eq!(
            BodyPatcher::new("evaluate").extract_body("void Solver::evaluate() { x(); }"),
            Ok(" x(); ")
        );
    }

    #[test]
    fn unbalanced_body_is_patch_error() {
        let patcher = BodyPatcher::new("eval");
        let err = patcher
            .inject_body("void S::eval() { if (x) { y(); }", "z")
            .unwrap_err();
        assert!(matches!(err, PatchError::UnbalancedBraces { offset: 15, .. }));
    }

    #[test]
    fn strip_wrapper_extracts_inner_body() {
        let patcher = BodyPatcher::new("eval");
        let code = "void CKKSTaskSolver::eval() {\n    auto t = m_cc->EvalMult(m_InputC, 2.0);\n    if (t) { m_OutputC = t; }\n}";
        assert_eq!(
            patcher.strip_wrapper(code),
            "auto t = m_cc->EvalMult(m_InputC, 2.0);\n    if (t) { m_OutputC = t; }"
        );
    }

    #[test]
    fn strip_wrapper_is_idempotent() {
        let patcher = BodyPatcher::new("eval");
        for code in [
            "void S::eval() {\n  a();\n  { b(); }\n}",
            "m_OutputC = m_InputC;",
            "void S::eval() { never_closed(",
            "",
        ] {
            let once = patcher.strip_wrapper(code);
            assert_eq!(patcher.strip_wrapper(&once), once, "input: {code:?}");
        }
    }

    #[test]
    fn strip_wrapper_without_marker_is_identity() {
        let patcher = BodyPatcher::new("eval");
        let code = "  m_OutputC = m_cc->EvalAdd(m_InputC, m_InputC);\n";
        assert_eq!(patcher.strip_wrapper(code), code);
    }
}
