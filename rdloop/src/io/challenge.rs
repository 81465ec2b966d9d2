//! Challenge directory loading.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, instrument};

use crate::core::types::ChallengeVariant;
use crate::io::config::LoopConfig;

pub const DESCRIPTION_FILE: &str = "challenge.md";
pub const FIXTURES_DIR: &str = "tests";

static SELF_CONTAINED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)Challenge type:\s*Black Box").unwrap());
static CONTEXT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"CryptoContext<DCRTPoly>\s+(\w+)").unwrap());
static PUBLIC_KEY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"PublicKey<DCRTPoly>\s+(\w+)").unwrap());
static CIPHERTEXT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Ciphertext<DCRTPoly>\s+(\w+)").unwrap());

/// Member names the generated body must refer to, scraped from the header.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Identifiers {
    pub cc: Option<String>,
    pub pk: Option<String>,
    pub input: Option<String>,
    pub output: Option<String>,
}

impl Identifiers {
    pub fn from_header(header: &str) -> Self {
        let first = |re: &Regex| {
            re.captures(header)
                .and_then(|caps| caps.get(1))
                .map(|m| m.as_str().to_string())
        };
        let ciphertexts: Vec<&str> = CIPHERTEXT_RE
            .captures_iter(header)
            .filter_map(|caps| caps.get(1))
            .map(|m| m.as_str())
            .collect();
        Self {
            cc: first(&CONTEXT_RE),
            pk: first(&PUBLIC_KEY_RE),
            input: ciphertexts.first().map(|s| s.to_string()),
            output: match ciphertexts.as_slice() {
                [_, .., last] => Some(last.to_string()),
                _ => None,
            },
        }
    }

    /// `(identifier, role)` rows in a fixed order, skipping unknown roles.
    pub fn rows(&self) -> Vec<(String, &'static str)> {
        [
            (&self.cc, "CryptoContext<DCRTPoly>"),
            (&self.input, "input Ciphertext<DCRTPoly>"),
            (&self.output, "output Ciphertext<DCRTPoly> (assign here, eval() returns void)"),
            (&self.pk, "PublicKey<DCRTPoly>"),
        ]
        .into_iter()
        .filter_map(|(name, role)| name.clone().map(|name| (name, role)))
        .collect()
    }
}

/// Immutable description of the challenge being solved.
#[derive(Debug, Clone, Serialize)]
pub struct Challenge {
    pub name: String,
    pub root: PathBuf,
    pub description: String,
    pub variant: ChallengeVariant,
    /// Template files by name, sorted.
    pub templates: BTreeMap<String, String>,
    pub identifiers: Identifiers,
    /// SHA-256 over the description and template files.
    pub fingerprint: String,
}

impl Challenge {
    #[instrument(skip_all, fields(dir = %dir.display()))]
    pub fn load(dir: &Path, config: &LoopConfig) -> Result<Self> {
        if !dir.is_dir() {
            return Err(anyhow!("challenge directory does not exist: {}", dir.display()));
        }
        let root = dir
            .canonicalize()
            .with_context(|| format!("resolve {}", dir.display()))?;
        let description_path = root.join(DESCRIPTION_FILE);
        if !description_path.is_file() {
            return Err(anyhow!("{DESCRIPTION_FILE} not found in {}", root.display()));
        }
        let description = fs::read_to_string(&description_path)
            .with_context(|| format!("read {}", description_path.display()))?;

        let variant = detect_variant(&description);
        let templates = load_templates(&root.join(&config.sandbox.template_subdir))?;
        let identifiers = templates
            .get(&config.patch.header_file)
            .map(|header| Identifiers::from_header(header))
            .unwrap_or_default();
        let fingerprint = fingerprint(&description, &templates);
        let name = root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "challenge".to_string());

        debug!(
            name,
            variant = variant.as_str(),
            templates = templates.len(),
            "challenge loaded"
        );
        Ok(Self {
            name,
            root,
            description,
            variant,
            templates,
            identifiers,
            fingerprint,
        })
    }

    pub fn fixtures_dir(&self) -> PathBuf {
        self.root.join(FIXTURES_DIR)
    }
}

pub fn detect_variant(description: &str) -> ChallengeVariant {
    if SELF_CONTAINED_RE.is_match(description) {
        ChallengeVariant::SelfContained
    } else {
        ChallengeVariant::ExternallyValidated
    }
}

fn load_templates(dir: &Path) -> Result<BTreeMap<String, String>> {
    let mut templates = BTreeMap::new();
    if !dir.is_dir() {
        return Ok(templates);
    }
    for entry in fs::read_dir(dir).with_context(|| format!("read {}", dir.display()))? {
        let entry = entry.with_context(|| format!("read entry in {}", dir.display()))?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let contents =
            fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
        templates.insert(entry.file_name().to_string_lossy().into_owned(), contents);
    }
    Ok(templates)
}

fn fingerprint(description: &str, templates: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(description.as_bytes());
    for (name, contents) in templates {
        hasher.update([0u8]);
        hasher.update(name.as_bytes());
        hasher.update([0u8]);
        hasher.update(contents.as_bytes());
    }
    hex::encode(hasher.finalize())
}
