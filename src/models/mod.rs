pub mod attribution;
pub mod events;
pub mod short_url;

pub use attribution::{AppOpen, Fingerprint, FingerprintedVisit, Install, Link};
pub use events::{
    AttributionEvent, AttributionPath, Campaign, DecodeEvent, LaunchEvent, LinkEvent,
};
pub use short_url::{RoutingRule, ShortUrl};
