//! Grammar of the client-mode `main` field: `[func]@url` or a bare `url`.

use url::Url;

/// Where a client-mode runtime forwards its requests, parsed from the init
/// body's `main` field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyTarget {
    /// Entry-point name forwarded to the server; empty keeps the default.
    pub main_func: String,
    /// Base URL of the server runtime.
    pub url: Url,
}

/// Error parsing a forwarding target.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TargetError {
    /// The field contained more than one `@`.
    #[error("invalid proxy target: must be in the form of <main>@<proxy> or @<proxy>")]
    Shape,
    /// The URL part did not parse.
    #[error("invalid proxy URL: {0}")]
    Url(#[from] url::ParseError),
}

/// Parses `[func]@url | url`, defaulting the scheme to `https` when the
/// URL part carries none. More than one `@` is an error.
pub fn parse_main(main: &str) -> Result<ProxyTarget, TargetError> {
    let parts: Vec<&str> = main.split('@').collect();
    let (main_func, raw_url) = match parts.as_slice() {
        [url] => ("", *url),
        [func, url] => (*func, *url),
        _ => return Err(TargetError::Shape),
    };

    let url = parse_target_url(raw_url)?;
    Ok(ProxyTarget {
        main_func: main_func.to_owned(),
        url,
    })
}

/// Parses the URL part, prepending `https://` when no scheme is present.
fn parse_target_url(raw: &str) -> Result<Url, url::ParseError> {
    if raw.contains("://") {
        Url::parse(raw)
    } else {
        Url::parse(&format!("https://{raw}"))
    }
}
