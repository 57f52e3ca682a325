//! Content-addressed local names for remote URLs

use sha2::{Digest, Sha256};

use crate::slack::is_slack_url;

/// Longest escaped name kept verbatim
pub const MAX_NAME_LEN: usize = 190;

/// Characters kept on each side of the digest in a collapsed name
const KEEP: usize = 50;

/// Local file name for `url`
///
/// The URL is percent-escaped in full (including `/`). Names longer than
/// [`MAX_NAME_LEN`] become `first 50 + "+" + sha256 + "+" + last 50` of the
/// escaped form. A trailing `?t=` token on Slack URLs rotates between
/// sessions and is dropped first.
pub fn url_to_filename(url: &str) -> String {
    let url = if is_slack_url(url) {
        strip_session_token(url)
    } else {
        url
    };

    // Escape everything outside [A-Za-z0-9_.-]
    let escaped = urlencoding::encode(url).replace('~', "%7E");
    if escaped.len() <= MAX_NAME_LEN {
        return escaped;
    }

    let digest = hex::encode(Sha256::digest(escaped.as_bytes()));
    format!(
        "{}+{}+{}",
        &escaped[..KEEP],
        digest,
        &escaped[escaped.len() - KEEP..]
    )
}

/// Local name for `url`, discriminated by `hint` when given
///
/// The hint changes the name but not the fetched URL, so a new avatar hash
/// yields a new file for the same avatar URL.
pub fn name_for(url: &str, hint: Option<&str>) -> String {
    match hint {
        Some(hint) => url_to_filename(&format!("{}#{}", url, hint)),
        None => url_to_filename(url),
    }
}

fn strip_session_token(url: &str) -> &str {
    match url.rfind("?t=") {
        Some(idx) if !url[idx..].contains('&') => &url[..idx],
        _ => url,
    }
}
