//! Decides what a short-link visit resolves to.

use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use super::linking::{is_fresh, LinkingEngine};
use crate::events::EventPublisher;
use crate::matching::{MatchedRule, RuleMatcher};
use crate::models::{
    AttributionEvent, Campaign, DecodeEvent, Fingerprint, FingerprintedVisit, ShortUrl,
};
use crate::storage::{AttributionStore, StorageError};
use crate::visitor::VisitorAttributes;

pub const CONTEXT_PARAM: &str = "tether_context";
pub const SCHEME_PARAM: &str = "tether_scheme";
pub const CODE_PARAM: &str = "tether_code";
pub const NO_APP_PARAM: &str = "tether_noapp";

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("failed to load short url: {0}")]
    Store(#[from] StorageError),
}

/// Visitor state carried in cookies.
#[derive(Debug, Clone, Default)]
pub struct CookieState {
    pub context: Option<String>,
    /// Visits to this short code seen before this one
    pub visits: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectKind {
    /// Same answer for every visitor
    Permanent,
    /// Visitor-specific, must not be cached
    Temporary,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Redirect {
        location: String,
        kind: RedirectKind,
    },
    /// Fetch `source_url` and serve its body; redirect to `fallback` if that fails
    RenderInline { source_url: String, fallback: String },
}

#[derive(Debug, Clone)]
pub struct Resolution {
    pub short_url: ShortUrl,
    pub context: String,
    /// True when the context was minted for this visit
    pub cookied: bool,
    pub visit_count: u64,
    pub action: Action,
    pub matched_rule: Option<String>,
    pub app_url_scheme: Option<String>,
    pub deeplink: Option<String>,
    pub fresh: bool,
}

impl Resolution {
    pub fn destination(&self) -> &str {
        match &self.action {
            Action::Redirect { location, .. } => location,
            Action::RenderInline { source_url, .. } => source_url,
        }
    }

    pub fn renders_inline(&self) -> bool {
        matches!(self.action, Action::RenderInline { .. })
    }
}

/// What the harvest page needs to try the app and fall back.
#[derive(Debug, Clone)]
pub struct Harvest {
    pub short_url: ShortUrl,
    pub deeplink: String,
    pub fallback: String,
}

pub struct RedirectResolver {
    store: Arc<dyn AttributionStore>,
    linking: Arc<LinkingEngine>,
    publisher: EventPublisher,
    matcher: RuleMatcher,
}

impl RedirectResolver {
    pub fn new(
        store: Arc<dyn AttributionStore>,
        linking: Arc<LinkingEngine>,
        publisher: EventPublisher,
        matcher: RuleMatcher,
    ) -> Self {
        Self {
            store,
            linking,
            publisher,
            matcher,
        }
    }

    /// `Ok(None)` when the short code does not exist.
    pub async fn resolve(
        &self,
        code: &str,
        mut visitor: VisitorAttributes,
        cookies: CookieState,
        now: i64,
    ) -> Result<Option<Resolution>, ResolveError> {
        let Some(short_url) = self.store.find_short_url(code).await? else {
            return Ok(None);
        };

        let (context, cookied) = match cookies.context.filter(|c| !c.is_empty()) {
            Some(context) => (context, false),
            None => (mint_context(), true),
        };
        let visit_count = cookies.visits + 1;

        self.load_install_state(&short_url, &context, cookied, &mut visitor, now)
            .await;

        let Some(MatchedRule { id, rule }) = self.matcher.select_rule(&short_url.rules, &visitor)
        else {
            let location = short_url.destination.clone();
            return Ok(Some(Resolution {
                short_url,
                context,
                cookied,
                visit_count,
                action: Action::Redirect {
                    location,
                    kind: RedirectKind::Permanent,
                },
                matched_rule: None,
                app_url_scheme: None,
                deeplink: None,
                fresh: false,
            }));
        };

        let scheme = rule.app_scheme().map(str::to_string);
        let deeplink = rule.deep_link();
        let landing = deeplink
            .clone()
            .unwrap_or_else(|| short_url.destination.clone());

        let fresh = match scheme.as_deref() {
            Some(scheme) if !cookied => match self.linking.find_app_open(scheme, &context).await {
                Ok(open) => is_fresh(open.as_ref(), rule.app_open_ttl_secs(), now),
                Err(err) => {
                    warn!(short_code = %code, error = %err, "app open lookup failed");
                    false
                }
            },
            _ => false,
        };

        let mut no_app = false;
        let action = if fresh {
            Action::Redirect {
                location: landing,
                kind: RedirectKind::Temporary,
            }
        } else if let (true, Some(scheme)) = (rule.sends_to_interstitial(), scheme.as_deref()) {
            let fallback = rule
                .content_source()
                .or(rule.app_store())
                .unwrap_or(&short_url.destination);
            Action::Redirect {
                location: interstitial_path(scheme, &context, code, fallback),
                kind: RedirectKind::Temporary,
            }
        } else if let Some(source) = rule.content_source() {
            Action::RenderInline {
                source_url: source.to_string(),
                fallback: rule
                    .app_store()
                    .unwrap_or(&short_url.destination)
                    .to_string(),
            }
        } else if let (false, Some(store_url)) = (rule.skips_app_store(), rule.app_store()) {
            Action::Redirect {
                location: store_url.to_string(),
                kind: RedirectKind::Temporary,
            }
        } else {
            no_app = true;
            Action::Redirect {
                location: landing,
                kind: RedirectKind::Temporary,
            }
        };

        let action = match action {
            Action::Redirect { location, kind } => {
                let targets_app = scheme
                    .as_deref()
                    .is_some_and(|scheme| url_scheme(&location) == Some(scheme));
                let location = if (targets_app || rule.is_intent_filter())
                    && !location.starts_with('/')
                {
                    inject_context_params(
                        &location,
                        &context,
                        scheme.as_deref(),
                        code,
                        no_app,
                    )
                } else {
                    location
                };
                Action::Redirect { location, kind }
            }
            inline => inline,
        };

        Ok(Some(Resolution {
            short_url,
            context,
            cookied,
            visit_count,
            action,
            matched_rule: Some(id),
            app_url_scheme: scheme,
            deeplink,
            fresh,
        }))
    }

    /// Record in `visitor.installed` whether `context` has a live install for each scheme
    /// the rules of `short_url` check. Failed lookups leave the state unknown.
    async fn load_install_state(
        &self,
        short_url: &ShortUrl,
        context: &str,
        minted: bool,
        visitor: &mut VisitorAttributes,
        now: i64,
    ) {
        for scheme in short_url.installed_schemes() {
            if minted {
                // A context minted just now cannot have installs
                visitor.installed.set(&scheme, false);
                continue;
            }
            match self.linking.find_install(&scheme, context, now).await {
                Ok(install) => visitor.installed.set(&scheme, install.is_some()),
                Err(err) => {
                    warn!(short_code = %short_url.id, scheme = %scheme, error = %err, "install lookup failed")
                }
            }
        }
    }

    /// Deep link and default fallback for the harvest page of `code`.
    ///
    /// The deep link comes from the rule this visitor matches when that rule targets
    /// `scheme`, else it is the bare `{scheme}://`. Either way it carries the context
    /// embedded in the harvest URL.
    pub async fn harvest(
        &self,
        code: &str,
        scheme: &str,
        context: &str,
        mut visitor: VisitorAttributes,
        now: i64,
    ) -> Result<Option<Harvest>, ResolveError> {
        let Some(short_url) = self.store.find_short_url(code).await? else {
            return Ok(None);
        };

        self.load_install_state(&short_url, context, false, &mut visitor, now)
            .await;
        let matched = self
            .matcher
            .select_rule(&short_url.rules, &visitor)
            .filter(|m| m.rule.app_scheme() == Some(scheme));
        let deeplink = matched
            .as_ref()
            .and_then(|m| m.rule.deep_link())
            .unwrap_or_else(|| format!("{scheme}://"));
        let fallback = matched
            .as_ref()
            .and_then(|m| m.rule.app_store().map(str::to_string))
            .unwrap_or_else(|| short_url.destination.clone());

        Ok(Some(Harvest {
            deeplink: inject_context_params(&deeplink, context, Some(scheme), code, false),
            fallback,
            short_url,
        }))
    }

    /// Post-response bookkeeping: publish the decode event and remember the click for
    /// fingerprint matching unless a crawler made it.
    pub async fn record_visit(
        &self,
        resolution: &Resolution,
        fingerprint: Fingerprint,
        visitor: &VisitorAttributes,
        now: i64,
    ) -> Result<(), StorageError> {
        let country_code = fingerprint.country_code.clone();

        self.publisher.publish(AttributionEvent::Decode(DecodeEvent {
            short_code: resolution.short_url.id.clone(),
            context: resolution.context.clone(),
            cookied: resolution.cookied,
            visit_count: resolution.visit_count,
            destination: resolution.destination().to_string(),
            render_inline: resolution.renders_inline(),
            matched_rule: resolution.matched_rule.clone(),
            deeplink: resolution.deeplink.clone(),
            campaign: Campaign::from(&resolution.short_url),
            user_agent: visitor.user_agent.clone(),
            referrer: visitor.referrer.clone(),
            country_code,
            timestamp: now,
        }));

        if visitor.is_bot {
            debug!(short_code = %resolution.short_url.id, "not keeping crawler visit");
            return Ok(());
        }

        self.store
            .save_fingerprinted_visit(&FingerprintedVisit {
                fingerprint,
                context: resolution.context.clone(),
                short_code: resolution.short_url.id.clone(),
                deeplink: resolution.deeplink.clone(),
                referrer: visitor.referrer.clone(),
                app_url_scheme: resolution.app_url_scheme.clone(),
                timestamp: now,
            })
            .await
    }
}

pub fn mint_context() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Harvest page path; `fallback` is where the page goes when the app does not open.
pub fn interstitial_path(scheme: &str, context: &str, code: &str, fallback: &str) -> String {
    format!(
        "/m/{}/{}/{}/?f={}",
        urlencoding::encode(scheme),
        urlencoding::encode(context),
        urlencoding::encode(code),
        urlencoding::encode(fallback)
    )
}

fn url_scheme(location: &str) -> Option<&str> {
    location
        .split_once(':')
        .map(|(scheme, _)| scheme)
        .filter(|scheme| {
            !scheme.is_empty()
                && scheme
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
        })
}

/// Append the attribution query parameters to `location`.
pub fn inject_context_params(
    location: &str,
    context: &str,
    scheme: Option<&str>,
    code: &str,
    no_app: bool,
) -> String {
    let mut params: Vec<(&str, &str)> = vec![(CONTEXT_PARAM, context)];
    if let Some(scheme) = scheme {
        params.push((SCHEME_PARAM, scheme));
    }
    params.push((CODE_PARAM, code));
    if no_app {
        params.push((NO_APP_PARAM, "1"));
    }

    match Url::parse(location) {
        Ok(mut url) => {
            url.query_pairs_mut().extend_pairs(params);
            url.to_string()
        }
        Err(_) => {
            let query = params
                .iter()
                .map(|(k, v)| format!("{k}={}", urlencoding::encode(v)))
                .collect::<Vec<_>>()
                .join("&");
            let (base, fragment) = match location.split_once('#') {
                Some((base, fragment)) => (base, Some(fragment)),
                None => (location, None),
            };
            let separator = if base.contains('?') { '&' } else { '?' };
            match fragment {
                Some(fragment) => format!("{base}{separator}{query}#{fragment}"),
                None => format!("{base}{separator}{query}"),
            }
        }
    }
}
