const INTERSTITIAL_TITLES: &[&str] = &["just a moment", "attention required! | cloudflare"];

// Only markers of the interstitial itself. Analytics beacons and
// `/cdn-cgi/challenge-platform/scripts/` loaders appear on ordinary pages too.
const CHALLENGE_MARKERS: &[&str] = &[
    "cf-browser-verification",
    "cf-challenge-running",
    "cf_chl_opt",
    "cf-turnstile",
    "<div id=\"challenge-error-title\"",
];

/// True when `markup`/`title` look like a bot-defense challenge page.
pub fn is_challenge_page(markup: &str, title: &str) -> bool {
    let title = title.to_lowercase();
    if INTERSTITIAL_TITLES.iter().any(|t| title.contains(t)) {
        return true;
    }
    let markup = markup.to_lowercase();
    CHALLENGE_MARKERS.iter().any(|m| markup.contains(m))
}
