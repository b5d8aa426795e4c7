//! Rejection page shown to turned-away visitors.
//!
//! The page is chosen by reject reason and retries on its own after
//! [`RETRY_AFTER_SECS`] seconds.

use axum::{
    http::{HeaderValue, header},
    response::{Html, IntoResponse, Response},
};

use crate::model::RejectReason;
use crate::policy::{RETRY_AFTER_SECS, reject_status};

/// Title and body text for each reason.
fn message(reason: RejectReason) -> (&'static str, &'static str) {
    match reason {
        RejectReason::HardOverload => (
            "We're very busy right now",
            "The site is seeing an unusually large surge of visitors. \
             Please wait a moment before trying again.",
        ),
        RejectReason::MaxConcurrent => (
            "Too many visitors",
            "Too many people are using the site at the same time. \
             Please try again shortly.",
        ),
        RejectReason::Blocked => (
            "Access temporarily unavailable",
            "Requests from your network are currently not being accepted.",
        ),
    }
}

/// Render the HTML page for `reason`.
pub fn render(reason: RejectReason) -> String {
    let (title, body) = message(reason);
    let retry = RETRY_AFTER_SECS;

    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="UTF-8">
<meta name="viewport" content="width=device-width, initial-scale=1.0">
<meta name="surgegate-reason" content="{code}">
<title>{title}</title>
<style>
body {{ font-family: system-ui, sans-serif; background: #16213e; color: #e4e4e7;
       min-height: 100vh; margin: 0; display: flex; align-items: center; justify-content: center; }}
main {{ max-width: 480px; padding: 20px; text-align: center; }}
p {{ color: #a1a1aa; line-height: 1.6; }}
button {{ padding: 12px 24px; border: 0; border-radius: 8px; background: #3b82f6; color: #fff; cursor: pointer; }}
</style>
</head>
<body>
<main>
<h1>{title}</h1>
<p>{body}</p>
<button onclick="window.location.reload()">Try again</button>
<p>Retrying in <span id="timer">{retry}</span> seconds...</p>
</main>
<script>
let seconds = {retry};
const timer = document.getElementById('timer');
const interval = setInterval(() => {{
    seconds--;
    timer.textContent = seconds;
    if (seconds <= 0) {{
        clearInterval(interval);
        window.location.reload();
    }}
}}, 1000);
</script>
</body>
</html>"#,
        code = reason.as_str(),
    )
}

/// Full HTTP response for a rejected request.
pub fn rejection_response(reason: RejectReason) -> Response {
    let mut response = (reject_status(reason), Html(render(reason))).into_response();

    let headers = response.headers_mut();
    headers.insert(header::RETRY_AFTER, HeaderValue::from(RETRY_AFTER_SECS));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/html; charset=utf-8"),
    );

    response
}
