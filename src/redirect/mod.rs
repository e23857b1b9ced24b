pub mod content;
pub mod cookies;
pub mod handlers;
pub mod interstitial;
pub mod middleware;
pub mod routes;

pub use content::{ContentError, ContentSource, FetchedContent, HttpContentSource};
pub use cookies::{CookieWriter, RequestCookies};
pub use handlers::RedirectState;
pub use interstitial::InterstitialRenderer;
pub use routes::create_redirect_router;
