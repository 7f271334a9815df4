//! Scripts evaluated inside captured pages

use crate::utils::registrable_domain;

/// Interaction scripts keyed by registrable domain.
///
/// They dismiss overlays and consent walls that would otherwise cover the
/// screenshot.
static SITE_SCRIPTS: &[(&str, &str)] = &[
    (
        "substack.com",
        r#"let maybeLater = document.querySelector('button.maybe-later');
if (maybeLater !== null) {
    maybeLater.click();
}"#,
    ),
    (
        "archiveofourown.org",
        r#"let tosAgree = document.querySelector('#tos_agree');
if (tosAgree !== null) {
    tosAgree.click();
}
let tosAccept = document.querySelector('#accept_tos');
if (tosAccept !== null) {
    tosAccept.click();
}"#,
    ),
    (
        "douban.com",
        r#"let noteMask = document.querySelector('.ui-overlay-mask');
let noteDial = document.querySelector('iframe[src*="login"]');
if (noteDial !== null && noteMask !== null) {
    if (noteMask.style.display === '') {
        document.elementFromPoint(1, 1).click();
    }
}
let noteReadMore = document.querySelector('#link-report .taboola-open');
if (noteReadMore !== null) {
    noteReadMore.click();
}"#,
    ),
];

/// Hides the usual automation fingerprints from page scripts.
pub const STEALTH_SCRIPT: &str = r#"(function(w, n, wn) {
  Object.defineProperty(n, 'webdriver', {
    get: () => false,
  });

  Object.defineProperty(n, 'plugins', {
    get: () => [1, 2, 3, 4, 5],
  });

  Object.defineProperty(n, 'languages', {
    get: () => ['en-US', 'en'],
  });

  w.chrome = {
    runtime: {},
  };

  const originalQuery = wn.permissions.query;
  return wn.permissions.query = (parameters) => (
    parameters.name === 'notifications' ?
      Promise.resolve({ state: Notification.permission }) :
      originalQuery(parameters)
  );
})(window, navigator, window.navigator);"#;

/// Scrolls one step down and reports whether the bottom was reached.
pub const SCROLL_STEP_SCRIPT: &str = r#"(() => {
    let distance = 150;
    let scrollHeight = document.documentElement.scrollHeight || document.body.scrollHeight;
    let currentHeight = window.innerHeight + window.pageYOffset;
    window.scrollBy(0, distance);
    return currentHeight >= scrollHeight;
})()"#;

/// Raw interaction script for pages under `host`, if any.
pub fn site_script(host: &str) -> Option<&'static str> {
    let domain = registrable_domain(host)?;
    SITE_SCRIPTS
        .iter()
        .find(|(site, _)| *site == domain)
        .map(|(_, script)| *script)
}

/// Interaction script for `host`, wrapped so that exceptions are swallowed.
pub fn site_expression(host: &str) -> Option<String> {
    site_script(host).map(|script| {
        format!("(() => {{\n try {{\n{script}\n }} catch (_) {{}}\n return true;\n}})()")
    })
}

/// Script that stores one local storage item in documents served from `host`.
///
/// Installed before navigation, so it runs against the target origin rather
/// than the blank page the session starts on.
pub fn local_storage_script(host: &str, key: &str, value: &str) -> String {
    // JSON string literals are valid JavaScript string literals.
    let host = serde_json::Value::from(host).to_string();
    let key = serde_json::Value::from(key).to_string();
    let value = serde_json::Value::from(value).to_string();
    format!("if (window.location.host === {host}) {{ window.localStorage.setItem({key}, {value}); }}")
}
