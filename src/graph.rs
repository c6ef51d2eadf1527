//! Minimal contract with the host editor's serialized graph document, plus
//! the reference rewrite that runs after a download completes.
//!
//! The core only assumes a node has a type string and a list of widgets with
//! string values; everything else in the document is the host's business.
//! Quantized or renamed variants are common, so a completed download is
//! matched against existing references with an ordered fallback: exact path,
//! case-insensitive basename, then a canonical basename with precision tags
//! stripped. The first strategy with a hit wins and rewrites every match of
//! that strategy in one pass.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

static PRECISION_TAGS: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![
        "fp32", "fp16", "bf16", "f32", "f16", "fp8", "e4m3fn", "e5m2", "int8", "int4",
    ]
});

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct GraphDocument {
    #[serde(default)]
    pub nodes: Vec<GraphNode>,
    /// Model metadata some workflows embed alongside the graph itself.
    #[serde(default, rename = "models")]
    pub embedded_models: Vec<EmbeddedModel>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct GraphNode {
    pub id: u64,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default)]
    pub widgets: Vec<Widget>,
    #[serde(default)]
    pub subgraph: Option<GraphDocument>,
    /// Host redraw flag; set whenever a widget value is rewritten.
    #[serde(skip)]
    pub dirty: bool,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Widget {
    pub name: String,
    pub value: String,
}

/// One entry of a workflow's embedded model list.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct EmbeddedModel {
    pub name: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub directory: Option<String>,
}

impl GraphDocument {
    /// Embedded models whose files are not installed locally, per the
    /// injected predicate. Drives the guard's pre-check.
    pub fn missing_embedded<F>(&self, is_installed: F) -> Vec<EmbeddedModel>
    where
        F: Fn(&EmbeddedModel) -> bool,
    {
        self.embedded_models
            .iter()
            .filter(|model| !is_installed(model))
            .cloned()
            .collect()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum MatchStrategy {
    ExactPath,
    Basename,
    CanonicalBasename,
}

/// Rewrites every widget value referencing `requested` to point at
/// `installed`, trying exact path, then basename, then canonical basename.
/// Matched nodes (including those inside subgraphs) are marked dirty.
/// Returns the number of widget values updated.
pub fn rewrite_references(doc: &mut GraphDocument, requested: &str, installed: &str) -> usize {
    for strategy in [
        MatchStrategy::ExactPath,
        MatchStrategy::Basename,
        MatchStrategy::CanonicalBasename,
    ] {
        let rewritten = rewrite_with(doc, requested, installed, strategy);
        if rewritten > 0 {
            return rewritten;
        }
    }
    0
}

fn rewrite_with(
    doc: &mut GraphDocument,
    requested: &str,
    installed: &str,
    strategy: MatchStrategy,
) -> usize {
    let mut rewritten = 0;
    for node in &mut doc.nodes {
        for widget in &mut node.widgets {
            if !matches(&widget.value, requested, strategy) {
                continue;
            }
            widget.value = replacement_value(&widget.value, installed, strategy);
            node.dirty = true;
            rewritten += 1;
        }
        if let Some(subgraph) = &mut node.subgraph {
            let inner = rewrite_with(subgraph, requested, installed, strategy);
            if inner > 0 {
                node.dirty = true;
                rewritten += inner;
            }
        }
    }
    rewritten
}

fn matches(value: &str, requested: &str, strategy: MatchStrategy) -> bool {
    match strategy {
        MatchStrategy::ExactPath => value == requested,
        MatchStrategy::Basename => basename(value).eq_ignore_ascii_case(basename(requested)),
        MatchStrategy::CanonicalBasename => {
            canonical_basename(value) == canonical_basename(requested)
        }
    }
}

/// An exact-path match replaces the whole value; basename matches keep any
/// directory prefix the widget already carried.
fn replacement_value(current: &str, installed: &str, strategy: MatchStrategy) -> String {
    match strategy {
        MatchStrategy::ExactPath => installed.to_string(),
        MatchStrategy::Basename | MatchStrategy::CanonicalBasename => {
            match current.rfind(['/', '\\']) {
                Some(split) => format!("{}{}", &current[..split + 1], basename(installed)),
                None => basename(installed).to_string(),
            }
        }
    }
}

pub(crate) fn basename(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

/// Lowercased basename with known quantization/precision tags stripped from
/// the stem, so `model-fp16.safetensors` and `model.safetensors` compare
/// equal. GGUF-style tags like `Q4_K_M` are matched structurally.
pub(crate) fn canonical_basename(path: &str) -> String {
    let name = basename(path).to_ascii_lowercase();
    let (stem, extension) = match name.rsplit_once('.') {
        Some((stem, ext)) => (stem, Some(ext)),
        None => (name.as_str(), None),
    };

    let kept: Vec<&str> = stem
        .split(['-', '_', '.'])
        .filter(|token| !token.is_empty() && !is_precision_tag(token))
        .collect();
    let canonical_stem = kept.join("-");

    match extension {
        Some(ext) => format!("{canonical_stem}.{ext}"),
        None => canonical_stem,
    }
}

fn is_precision_tag(token: &str) -> bool {
    if PRECISION_TAGS.contains(&token) {
        return true;
    }
    // q2..q8 quant tags; their k/s/m/l qualifiers are separate tokens after
    // the split, so they reduce to q<digit> followed by single letters.
    let mut chars = token.chars();
    if chars.next() == Some('q') {
        if let Some(digit) = chars.next() {
            return digit.is_ascii_digit() && chars.next().is_none();
        }
    }
    if matches!(token, "k" | "s" | "m" | "l") {
        return true;
    }
    // Lone digit qualifier, as in q8_0.
    token.len() == 1 && token.chars().all(|c| c.is_ascii_digit())
}
