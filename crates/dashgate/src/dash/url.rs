use url::Url;

use crate::error::GatewayResult;

/// Resolves `reference` against `base` using RFC 3986 rules.
///
/// The query of `base` carries over when `reference` has none, which keeps
/// signed manifest URLs working for relative segment paths:
///
/// * `https://cdn/a/manifest.mpd?token=1` + `seg-1.m4s` => `https://cdn/a/seg-1.m4s?token=1`
/// * `https://cdn/a/manifest.mpd?token=1` + `seg-1.m4s?token=2` => `https://cdn/a/seg-1.m4s?token=2`
pub(crate) fn resolve_url(base: &Url, reference: &str) -> GatewayResult<Url> {
    let reference = reference.trim();
    if has_scheme(reference) {
        return Ok(Url::parse(reference)?);
    }

    let mut resolved = base.join(reference)?;
    if resolved.query().is_none() {
        resolved.set_query(base.query());
    }
    Ok(resolved)
}

fn has_scheme(s: &str) -> bool {
    ["http://", "https://", "file://", "ftp://"]
        .iter()
        .any(|scheme| s.starts_with(scheme))
}
