//! Harvest page shown to sandboxed webviews: tries the app, then falls back.

use anyhow::{Context as _, Result};
use rust_embed::RustEmbed;
use tera::{Context, Tera};

#[derive(RustEmbed)]
#[folder = "templates/"]
struct Templates;

const PAGE: &str = "interstitial.html";
const SCRIPT: &str = "deeplink.js";

pub struct InterstitialRenderer {
    tera: Tera,
    timeout_ms: u64,
}

impl InterstitialRenderer {
    pub fn new(timeout_ms: u64) -> Result<Self> {
        let mut tera = Tera::default();
        for name in [PAGE, SCRIPT] {
            let file = Templates::get(name)
                .with_context(|| format!("template {name} is not embedded"))?;
            let source = std::str::from_utf8(&file.data)
                .with_context(|| format!("template {name} is not UTF-8"))?;
            tera.add_raw_template(name, source)
                .with_context(|| format!("failed to parse template {name}"))?;
        }
        Ok(Self { tera, timeout_ms })
    }

    fn context(&self, deeplink: &str, fallback: &str) -> Context {
        let mut context = Context::new();
        context.insert("deeplink", deeplink);
        context.insert("fallback", fallback);
        context.insert("timeout_ms", &self.timeout_ms);
        context
    }

    pub fn page(&self, deeplink: &str, fallback: &str) -> tera::Result<String> {
        self.tera.render(PAGE, &self.context(deeplink, fallback))
    }

    pub fn script(&self, deeplink: &str, fallback: &str) -> tera::Result<String> {
        self.tera.render(SCRIPT, &self.context(deeplink, fallback))
    }
}
