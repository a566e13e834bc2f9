//! Bundle manifests — the versioned asset set of one deployed bundle.
//!
//! A manifest is immutable once constructed; a new bundle is a new value.
//! The swap procedure derives the manifest from the static markup the
//! server sends with an `update-bundle` event: script tags with a `src`,
//! stylesheet links, and an optional worker prefetch link.

use serde::{Deserialize, Serialize};

/// One versioned set of executable and style assets served together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleManifest {
    pub bundle_id: String,
    pub assets: Vec<Asset>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    pub kind: AssetKind,
    pub url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetKind {
    Script,
    Style,
    Worker,
}

impl BundleManifest {
    pub fn new(bundle_id: impl Into<String>, assets: Vec<Asset>) -> Self {
        Self {
            bundle_id: bundle_id.into(),
            assets,
        }
    }

    /// Scan static markup for the bundle's assets.
    ///
    /// Recognized tags: `<script src=...>`, `<link rel="stylesheet"
    /// href=...>`, `<link rel="prefetch" as="worker" href=...>`. This is a
    /// tag-level scan, not an HTML parser; the server emits markup it
    /// rendered itself, so tags are well-formed.
    pub fn from_markup(bundle_id: impl Into<String>, markup: &str) -> Self {
        let mut assets = Vec::new();
        for tag in tags(markup) {
            if tag.name.eq_ignore_ascii_case("script") {
                if let Some(src) = tag.attr("src") {
                    assets.push(Asset {
                        kind: AssetKind::Script,
                        url: src,
                    });
                }
            } else if tag.name.eq_ignore_ascii_case("link") {
                let rel = tag.attr("rel").unwrap_or_default();
                if rel.eq_ignore_ascii_case("stylesheet") {
                    if let Some(href) = tag.attr("href") {
                        assets.push(Asset {
                            kind: AssetKind::Style,
                            url: href,
                        });
                    }
                } else if rel.eq_ignore_ascii_case("prefetch")
                    && tag
                        .attr("as")
                        .is_some_and(|a| a.eq_ignore_ascii_case("worker"))
                {
                    if let Some(href) = tag.attr("href") {
                        assets.push(Asset {
                            kind: AssetKind::Worker,
                            url: href,
                        });
                    }
                }
            }
        }
        Self {
            bundle_id: bundle_id.into(),
            assets,
        }
    }

    pub fn asset(&self, kind: AssetKind) -> Option<&Asset> {
        self.assets.iter().find(|a| a.kind == kind)
    }
}

// ── Tag scanning ─────────────────────────────────────────────────────────────

/// One opening tag's name and raw attribute text.
pub struct Tag<'a> {
    pub name: &'a str,
    attrs: &'a str,
}

impl<'a> Tag<'a> {
    /// Value of a double-quoted attribute, if present.
    pub fn attr(&self, name: &str) -> Option<String> {
        attr_value(self.attrs, name)
    }
}

/// Iterate over the opening tags of a markup string.
pub fn tags(markup: &str) -> impl Iterator<Item = Tag<'_>> {
    let mut rest = markup;
    std::iter::from_fn(move || loop {
        let open = rest.find('<')?;
        let after = &rest[open + 1..];
        let close = match after.find('>') {
            Some(c) => c,
            None => {
                rest = "";
                return None;
            }
        };
        let inner = &after[..close];
        rest = &after[close + 1..];
        if inner.starts_with('/') || inner.starts_with('!') {
            continue;
        }
        let name_end = inner
            .find(|c: char| c.is_whitespace() || c == '/')
            .unwrap_or(inner.len());
        let (name, attrs) = inner.split_at(name_end);
        if name.is_empty() {
            continue;
        }
        return Some(Tag { name, attrs });
    })
}

/// Extract `name="value"` from raw attribute text.
pub fn attr_value(attrs: &str, name: &str) -> Option<String> {
    let mut search = attrs;
    loop {
        let pos = search.find(name)?;
        let after = &search[pos + name.len()..];
        // Must be a whole attribute name followed by ="
        let boundary_ok = pos == 0
            || search[..pos]
                .chars()
                .next_back()
                .is_some_and(|c| c.is_whitespace());
        if boundary_ok {
            if let Some(quoted) = after.trim_start().strip_prefix('=') {
                let quoted = quoted.trim_start();
                if let Some(body) = quoted.strip_prefix('"') {
                    let end = body.find('"')?;
                    return Some(body[..end].to_string());
                }
            }
        }
        search = &search[pos + name.len()..];
        if search.is_empty() {
            return None;
        }
    }
}
