use std::fmt;

/// Marker glyph the integration prefixes App Store redirects with
const APPLE: &str = "🍎";
/// Marker glyph the integration prefixes Play Store redirects with
const ROBOT: &str = "🤖";

/// Which store a redirect message points at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RedirectKind {
    AppStore,
    PlayStore,
}

impl fmt::Display for RedirectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RedirectKind::AppStore => write!(f, "appstore"),
            RedirectKind::PlayStore => write!(f, "playstore"),
        }
    }
}

/// Classify a redirect notification by its text.
///
/// Keywords are matched case-insensitively, marker glyphs exactly. The first
/// matching rule wins, so a message carrying both markers counts as App Store.
/// Both the live listener and the history backfill go through this function.
pub fn classify(text: &str) -> Option<RedirectKind> {
    let upper = text.to_uppercase();
    if text.contains(APPLE) && upper.contains("APP STORE") {
        Some(RedirectKind::AppStore)
    } else if text.contains(ROBOT) && (upper.contains("PLAY STORE") || upper.contains("GOOGLE PLAY"))
    {
        Some(RedirectKind::PlayStore)
    } else {
        None
    }
}
