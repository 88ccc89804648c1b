//! Line-oriented update of `image: <name>:<tag>` references in a deployment manifest.
//!
//! The same rewrite exists in two forms: a `sed` expression sent to the remote host, and
//! [ImagePatch::apply] used when the manifest is local. Every matching line is rewritten.
use anyhow::Result;
use regex::Regex;

use crate::error::CiError;


/// Rewrites `image: <name>:<anything>` into `image: <name>:<tag>`
#[derive(Debug, Clone)]
pub struct ImagePatch {
    image: String,
    tag: String,
    pattern: Regex,
}

fn valid_reference_part(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '/' | ':'))
}

impl ImagePatch {
    pub fn new(image: &str, tag: &str) -> Result<Self> {
        if !valid_reference_part(image) || !valid_reference_part(tag) {
            return Err(CiError::InvalidConfig(format!(
                "\"{}:{}\" is not a valid image reference",
                image, tag
            ))
            .into());
        }
        let pattern = Regex::new(&format!(r"image: {}:[^\n]*", regex::escape(image)))?;
        Ok(ImagePatch {
            image: image.to_string(),
            tag: tag.to_string(),
            pattern,
        })
    }

    pub fn replacement(&self) -> String {
        format!("image: {}:{}", self.image, self.tag)
    }

    /// Returns the patched document and the number of rewritten references
    pub fn apply(&self, content: &str) -> (String, usize) {
        let n = self.pattern.find_iter(content).count();
        let replacement = self.replacement();
        let out = self
            .pattern
            .replace_all(content, regex::NoExpand(&replacement))
            .to_string();
        (out, n)
    }

    /// Like [apply](Self::apply), but a manifest without any reference is an error
    pub fn apply_checked(&self, content: &str, manifest: &str) -> Result<String> {
        let (out, n) = self.apply(content);
        if n == 0 {
            return Err(CiError::ManifestUnchanged {
                image: self.image.clone(),
                manifest: manifest.to_string(),
            }
            .into());
        }
        Ok(out)
    }

    /// The equivalent `sed` substitution, `|`-delimited
    pub fn sed_expression(&self) -> String {
        format!(
            "s|image: {}:.*|{}|g",
            sed_escape(&self.image),
            self.replacement()
        )
    }
}

/// Escapes basic-regex metacharacters. `|` never reaches here, see [valid_reference_part].
fn sed_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '.' | '[' | ']' | '*' | '^' | '$' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
