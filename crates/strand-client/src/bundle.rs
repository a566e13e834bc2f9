//! Bundle hot-swap — atomic replacement of the client's executable surface.
//!
//! Triggered only by an `update-bundle` event. The swap is all-or-nothing:
//! every asset download completes before the first observable mutation, so
//! a failed download leaves the document byte-identical to its pre-swap
//! state. Order after downloads is fixed: tear down the live render root,
//! replace the document's children with the new markup, copy the new root
//! element's attributes onto the existing root (the root element identity
//! itself cannot be replaced), then re-create every injected executable
//! tag as a fresh node — relocating an existing node does not re-execute
//! it. Only after that is the new runtime active.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;

use strand_core::manifest::{AssetKind, BundleManifest};
use strand_core::Value;

use crate::registry::{ModuleRegistry, RegistrySlot};

// ── Host seams ───────────────────────────────────────────────────────────────

/// The live render root. Torn down explicitly during a swap, never left
/// to garbage collection.
pub trait RenderRoot: Send + Sync {
    /// Hand one resolved tree to the renderer.
    fn apply(&self, tree: Value);
    /// Discard the live tree and stop applying updates.
    fn teardown(&self);
}

/// One executable asset tag. Equality of attrs is identity for removal.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptTag {
    pub attrs: Vec<(String, String)>,
}

/// The host document. The transport mutates it only through this seam so
/// the swap procedure can be driven against any host.
pub trait Document: Send + Sync {
    fn root_attributes(&self) -> Vec<(String, String)>;
    fn set_root_attributes(&self, attrs: Vec<(String, String)>);
    /// Replace the root element's children with parsed markup.
    fn replace_children(&self, markup: &str);
    /// Every executable tag currently injected, in document order.
    fn injected_scripts(&self) -> Vec<ScriptTag>;
    fn remove_script(&self, tag: &ScriptTag);
    /// Attach a freshly constructed tag. A fresh node re-executes; this is
    /// the only way to re-run an asset.
    fn inject_script(&self, tag: ScriptTag);
    /// Serialized document state, for atomicity checks.
    fn snapshot(&self) -> String;
}

/// Downloads bundle assets. Implementations must not cache failures.
pub trait AssetLoader: Send + Sync {
    fn fetch(
        &self,
        kind: AssetKind,
        url: &str,
    ) -> BoxFuture<'_, Result<Bytes, Box<dyn std::error::Error + Send + Sync>>>;
}

/// Asset loader over plain HTTP GET.
pub struct HttpAssetLoader {
    client: reqwest::Client,
    base_url: String,
}

impl HttpAssetLoader {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    fn absolute(&self, url: &str) -> String {
        if url.starts_with("http://") || url.starts_with("https://") {
            url.to_string()
        } else {
            format!("{}{}", self.base_url.trim_end_matches('/'), url)
        }
    }
}

impl AssetLoader for HttpAssetLoader {
    fn fetch(
        &self,
        kind: AssetKind,
        url: &str,
    ) -> BoxFuture<'_, Result<Bytes, Box<dyn std::error::Error + Send + Sync>>> {
        let url = self.absolute(url);
        async move {
            tracing::debug!(kind = ?kind, url = %url, "downloading bundle asset");
            let response = self.client.get(&url).send().await?.error_for_status()?;
            Ok(response.bytes().await?)
        }
        .boxed()
    }
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum SwapError {
    #[error("failed to download {kind:?} asset {url}: {source}")]
    AssetDownload {
        kind: AssetKind,
        url: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("bundle markup names no {0:?} asset")]
    MissingAsset(AssetKind),

    #[error("bundle markup has no root element")]
    NoRootElement,
}

// ── Swapper ──────────────────────────────────────────────────────────────────

pub struct BundleSwapper {
    doc: Arc<dyn Document>,
    loader: Arc<dyn AssetLoader>,
    registry: RegistrySlot,
    root: Mutex<Option<Arc<dyn RenderRoot>>>,
    active_bundle: Mutex<String>,
}

impl BundleSwapper {
    pub fn new(
        doc: Arc<dyn Document>,
        loader: Arc<dyn AssetLoader>,
        registry: RegistrySlot,
        initial_bundle: impl Into<String>,
    ) -> Self {
        Self {
            doc,
            loader,
            registry,
            root: Mutex::new(None),
            active_bundle: Mutex::new(initial_bundle.into()),
        }
    }

    /// Install the live render root the current runtime produced.
    pub fn install_root(&self, root: Arc<dyn RenderRoot>) {
        *self.root.lock().expect("swapper poisoned") = Some(root);
    }

    pub fn active_bundle(&self) -> String {
        self.active_bundle.lock().expect("swapper poisoned").clone()
    }

    /// Run the swap procedure for one `update-bundle` event.
    ///
    /// Steps 2-4 (teardown, content replacement, re-execution) do not
    /// begin until every download from step 1 has succeeded.
    pub async fn swap(&self, bundle_id: &str, markup: &str) -> Result<(), SwapError> {
        let manifest = BundleManifest::from_markup(bundle_id, markup);
        manifest
            .asset(AssetKind::Script)
            .ok_or(SwapError::MissingAsset(AssetKind::Script))?;
        manifest
            .asset(AssetKind::Style)
            .ok_or(SwapError::MissingAsset(AssetKind::Style))?;

        // Step 1: start every download at once; the worker prefetch, when
        // present, rides along under the same all-or-nothing rule.
        let downloads = manifest.assets.iter().map(|asset| {
            let kind = asset.kind;
            let url = asset.url.clone();
            async move {
                self.loader
                    .fetch(kind, &url)
                    .await
                    .map_err(|source| SwapError::AssetDownload { kind, url, source })
            }
        });
        let fetched = futures::future::try_join_all(downloads).await?;
        tracing::info!(
            bundle = bundle_id,
            assets = fetched.len(),
            bytes = fetched.iter().map(Bytes::len).sum::<usize>(),
            "bundle assets downloaded"
        );

        let (attrs, inner) = split_root(markup)?;

        // Step 2: explicit teardown of the old runtime.
        if let Some(root) = self.root.lock().expect("swapper poisoned").take() {
            root.teardown();
        }

        // Step 3: new children, then the new root's attributes copied onto
        // the existing root element.
        self.doc.replace_children(inner);
        self.doc.set_root_attributes(attrs);

        // Step 4: fresh nodes for every executable tag.
        for tag in self.doc.injected_scripts() {
            self.doc.remove_script(&tag);
            self.doc.inject_script(ScriptTag {
                attrs: tag.attrs.clone(),
            });
        }

        // Step 5: the new runtime is active from here on.
        self.registry.replace(Arc::new(ModuleRegistry::new()));
        *self.active_bundle.lock().expect("swapper poisoned") = bundle_id.to_string();
        tracing::info!(bundle = bundle_id, "bundle swap complete");
        Ok(())
    }
}

// ── Markup helpers ───────────────────────────────────────────────────────────

/// Split markup into the root element's attributes and its inner content.
/// Leading doctype and comment nodes are skipped.
fn split_root(markup: &str) -> Result<(Vec<(String, String)>, &str), SwapError> {
    let mut rest = markup.trim_start();
    loop {
        if !rest.starts_with('<') {
            return Err(SwapError::NoRootElement);
        }
        if rest.starts_with("<!") {
            let end = rest.find('>').ok_or(SwapError::NoRootElement)?;
            rest = rest[end + 1..].trim_start();
            continue;
        }
        break;
    }
    let tag_end = rest.find('>').ok_or(SwapError::NoRootElement)?;
    let tag_text = &rest[1..tag_end];
    let name_end = tag_text
        .find(|c: char| c.is_whitespace())
        .unwrap_or(tag_text.len());
    let (name, attr_text) = tag_text.split_at(name_end);

    let closing = format!("</{name}>");
    let body = &rest[tag_end + 1..];
    let inner_end = body.rfind(&closing).ok_or(SwapError::NoRootElement)?;
    Ok((parse_attrs(attr_text), &body[..inner_end]))
}

/// Parse `name="value"` pairs (and bare attributes) from tag text.
fn parse_attrs(text: &str) -> Vec<(String, String)> {
    let mut attrs = Vec::new();
    let mut rest = text.trim_start();
    while !rest.is_empty() {
        let name_end = rest
            .find(|c: char| c.is_whitespace() || c == '=')
            .unwrap_or(rest.len());
        let name = &rest[..name_end];
        rest = rest[name_end..].trim_start();
        if let Some(after_eq) = rest.strip_prefix('=') {
            let after_eq = after_eq.trim_start();
            if let Some(body) = after_eq.strip_prefix('"') {
                let end = body.find('"').unwrap_or(body.len());
                if !name.is_empty() {
                    attrs.push((name.to_string(), body[..end].to_string()));
                }
                rest = body.get(end + 1..).unwrap_or("").trim_start();
            } else {
                let value_end = after_eq
                    .find(|c: char| c.is_whitespace())
                    .unwrap_or(after_eq.len());
                if !name.is_empty() {
                    attrs.push((name.to_string(), after_eq[..value_end].to_string()));
                }
                rest = after_eq[value_end..].trim_start();
            }
        } else if !name.is_empty() {
            // Bare attribute. A self-closing slash scans as a bare "/".
            if name != "/" {
                attrs.push((name.to_string(), String::new()));
            }
        } else {
            break;
        }
    }
    attrs
}

// ── In-memory document ───────────────────────────────────────────────────────

/// Reference `Document` for hosts without a DOM, and the fixture the swap
/// tests drive. Scripts record an execution count so tests can tell a
/// fresh node from a relocated one.
#[derive(Default)]
pub struct MemoryDocument {
    state: Mutex<MemoryDocumentState>,
}

#[derive(Default)]
struct MemoryDocumentState {
    root_attrs: Vec<(String, String)>,
    children: String,
    scripts: Vec<ScriptTag>,
    executions: usize,
}

impl MemoryDocument {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of script executions (each fresh injection counts once).
    pub fn executions(&self) -> usize {
        self.state.lock().expect("document poisoned").executions
    }
}

impl Document for MemoryDocument {
    fn root_attributes(&self) -> Vec<(String, String)> {
        self.state.lock().expect("document poisoned").root_attrs.clone()
    }

    fn set_root_attributes(&self, attrs: Vec<(String, String)>) {
        self.state.lock().expect("document poisoned").root_attrs = attrs;
    }

    fn replace_children(&self, markup: &str) {
        let mut state = self.state.lock().expect("document poisoned");
        state.children = markup.to_string();
        // Script tags present in the new markup become injected tags.
        state.scripts = strand_core::manifest::tags(markup)
            .filter(|t| t.name.eq_ignore_ascii_case("script"))
            .filter_map(|t| {
                t.attr("src").map(|src| ScriptTag {
                    attrs: vec![("src".to_string(), src)],
                })
            })
            .collect();
    }

    fn injected_scripts(&self) -> Vec<ScriptTag> {
        self.state.lock().expect("document poisoned").scripts.clone()
    }

    fn remove_script(&self, tag: &ScriptTag) {
        let mut state = self.state.lock().expect("document poisoned");
        if let Some(pos) = state.scripts.iter().position(|t| t == tag) {
            state.scripts.remove(pos);
        }
    }

    fn inject_script(&self, tag: ScriptTag) {
        let mut state = self.state.lock().expect("document poisoned");
        state.scripts.push(tag);
        state.executions += 1;
    }

    fn snapshot(&self) -> String {
        let state = self.state.lock().expect("document poisoned");
        let attrs = state
            .root_attrs
            .iter()
            .map(|(k, v)| format!(" {k}=\"{v}\""))
            .collect::<String>();
        format!("<html{attrs}>{}</html>", state.children)
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
