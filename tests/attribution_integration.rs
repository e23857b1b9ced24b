//! End-to-end attribution flows across the redirect and events surfaces.

mod common;

use axum::http::StatusCode;
use common::*;
use tether::models::{AppOpen, AttributionEvent, AttributionPath, RoutingRule, ShortUrl};

const PHONE: [u8; 4] = [203, 0, 113, 7];
const OTHER_PHONE: [u8; 4] = [192, 0, 2, 99];

fn promo() -> ShortUrl {
    ShortUrl {
        campaign_key: Some("spring".to_string()),
        ..ShortUrl::new("promo", "https://example.com/promo")
    }
    .with_rule(RoutingRule {
        id: Some("ios".to_string()),
        match_os: Some("iOS".to_string()),
        app_url_scheme: Some("myapp".to_string()),
        app_store_url: Some("https://apps.apple.com/app/id1".to_string()),
        destination: Some("myapp://promo/42".to_string()),
        app_open_ttl_days: Some(7),
        ..Default::default()
    })
}

fn query_of(location: &str) -> Vec<(String, String)> {
    url::Url::parse(location)
        .unwrap()
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}

#[tokio::test]
async fn test_first_ios_visit_goes_to_app_store() {
    let app = TestApp::new().await;
    app.save(promo()).await;

    let response = app.visit(peer(PHONE), get("/promo", IPHONE_SAFARI, None)).await;

    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
    assert_eq!(location(&response), "https://apps.apple.com/app/id1");
    assert_eq!(response.headers()["x-tether-context-cookied"], "true");

    // Other platforms fall through to the destination
    let response = app.visit(peer(PHONE), get("/promo", PIXEL_CHROME, None)).await;
    assert_eq!(response.status(), StatusCode::PERMANENT_REDIRECT);
    assert_eq!(location(&response), "https://example.com/promo");
}

#[tokio::test]
async fn test_recent_app_open_sends_visitor_into_the_app() {
    let app = TestApp::new().await;
    app.save(promo()).await;

    let an_hour_ago = chrono::Utc::now().timestamp() - 3_600;
    app.store
        .track_app_open(&AppOpen {
            app_url_scheme: "myapp".to_string(),
            context: "ctx-browser".to_string(),
            app_context: "app-ctx-1".to_string(),
            source_context: Some("ctx-browser".to_string()),
            source_application: None,
            short_code: Some("promo".to_string()),
            deeplink: None,
            timestamp: an_hour_ago,
        })
        .await
        .unwrap();

    let response = app
        .visit(
            peer(PHONE),
            get("/promo", IPHONE_SAFARI, Some("uuid=ctx-browser")),
        )
        .await;

    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
    let location = location(&response);
    assert!(location.starts_with("myapp://promo/42?"), "{location}");
    assert_eq!(
        query_of(&location),
        vec![
            ("tether_context".to_string(), "ctx-browser".to_string()),
            ("tether_scheme".to_string(), "myapp".to_string()),
            ("tether_code".to_string(), "promo".to_string()),
        ]
    );
}

#[tokio::test]
async fn test_stale_app_open_falls_back_to_app_store() {
    let app = TestApp::new().await;
    app.save(promo()).await;

    let eight_days_ago = chrono::Utc::now().timestamp() - 8 * 86_400;
    app.store
        .track_app_open(&AppOpen {
            app_url_scheme: "myapp".to_string(),
            context: "ctx-browser".to_string(),
            app_context: "app-ctx-1".to_string(),
            source_context: None,
            source_application: None,
            short_code: None,
            deeplink: None,
            timestamp: eight_days_ago,
        })
        .await
        .unwrap();

    let response = app
        .visit(
            peer(PHONE),
            get("/promo", IPHONE_SAFARI, Some("uuid=ctx-browser")),
        )
        .await;

    assert_eq!(location(&response), "https://apps.apple.com/app/id1");
}

#[tokio::test]
async fn test_referred_install_then_deep_link() {
    let app = TestApp::new().await;
    app.save(promo()).await;

    let response = app
        .call_api(
            peer(PHONE),
            post(
                "/api/v1/events/install/myapp/app-ctx-1",
                "MyApp/2.1 (iPhone; iOS 16.5.1; Scale/3.00)",
                r#"{"source_context":"ctx-browser","short_code":"promo"}"#,
            ),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let events = app.sink.wait_for(3).await;
    let AttributionEvent::Install(install) = &events[1] else {
        panic!("expected an install event, got {:?}", events[1]);
    };
    assert_eq!(install.path, AttributionPath::Referred);
    assert_eq!(install.campaign.campaign_key.as_deref(), Some("spring"));

    let response = app
        .visit(
            peer(PHONE),
            get("/promo", IPHONE_SAFARI, Some("uuid=ctx-browser")),
        )
        .await;
    assert!(location(&response).starts_with("myapp://promo/42?tether_context=ctx-browser"));
}

#[tokio::test]
async fn test_open_url_report_records_app_open_only() {
    let app = TestApp::new().await;
    app.save(promo()).await;

    let response = app
        .call_api(
            peer(PHONE),
            post(
                "/api/v1/events/openurl/myapp/app-ctx-1",
                "MyApp/2.1",
                r#"{"source_context":"ctx-browser","short_code":"promo","deeplink":"myapp://promo/42"}"#,
            ),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let events = app.sink.wait_for(2).await;
    let kinds: Vec<_> = events.iter().map(AttributionEvent::kind).collect();
    assert_eq!(kinds, vec!["link", "app_open"]);
    assert!(app
        .store
        .find_install("myapp", "app-ctx-1")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_fingerprint_match_after_click() {
    let app = TestApp::new().await;
    app.save(promo()).await;

    let response = app.visit(peer(PHONE), get("/promo", IPHONE_SAFARI, None)).await;
    let browser_context = set_cookies(&response)["uuid"].clone();
    app.wait_for_visits(1).await;
    app.sink.wait_for(1).await;

    let response = app
        .call_api(
            peer(PHONE),
            post("/api/v1/events/try/myapp/app-ctx-1", IPHONE_SAFARI, ""),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let body: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
    assert_eq!(body["source_context"], browser_context.as_str());
    assert_eq!(body["short_code"], "promo");
    assert_eq!(body["deeplink"], "myapp://promo/42");
    assert!(body["score"].as_f64().unwrap() > 0.8);

    let events = app.sink.wait_for(4).await;
    let kinds: Vec<_> = events.iter().map(AttributionEvent::kind).collect();
    assert_eq!(kinds, vec!["decode", "link", "install", "app_open"]);
    let AttributionEvent::Install(install) = &events[2] else {
        unreachable!();
    };
    assert_eq!(install.path, AttributionPath::Fingerprint);
    assert!(app
        .store
        .find_link(&browser_context, "app-ctx-1")
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn test_fingerprint_from_another_network_is_rejected() {
    let app = TestApp::new().await;
    app.save(promo()).await;

    app.visit(peer(PHONE), get("/promo", IPHONE_SAFARI, None)).await;
    app.wait_for_visits(1).await;

    let response = app
        .call_api(
            peer(OTHER_PHONE),
            post("/api/v1/events/try/myapp/app-ctx-2", PIXEL_CHROME, ""),
        )
        .await;

    assert_eq!(response.status(), StatusCode::NOT_ACCEPTABLE);
    let body: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
    assert!(body.get("source_context").is_none());
}

#[tokio::test]
async fn test_fingerprint_without_any_visits() {
    let app = TestApp::new().await;

    let response = app
        .call_api(
            peer(PHONE),
            post("/api/v1/events/try/myapp/app-ctx-1", IPHONE_SAFARI, ""),
        )
        .await;

    assert_eq!(response.status(), StatusCode::NOT_ACCEPTABLE);
    let body: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
    assert_eq!(body["score"], 0.0);
}

#[tokio::test]
async fn test_malformed_launch_report_is_rejected() {
    let app = TestApp::new().await;

    let response = app
        .call_api(
            peer(PHONE),
            post("/api/v1/events/install/myapp/app-ctx-1", "MyApp/2.1", "{not json"),
        )
        .await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_text(response).await;
    assert!(body.contains("Invalid launch report"));
    assert!(app.sink.events().is_empty());
}

#[tokio::test]
async fn test_events_api_allows_cross_origin_calls() {
    let app = TestApp::new().await;

    let request = axum::http::Request::builder()
        .method("OPTIONS")
        .uri("/api/v1/events/install/myapp/app-ctx-1")
        .header("origin", "https://webview.example")
        .header("access-control-request-method", "POST")
        .body(axum::body::Body::empty())
        .unwrap();
    let response = app.call_api(peer(PHONE), request).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response
        .headers()
        .contains_key("access-control-allow-origin"));
}
