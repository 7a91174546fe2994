use std::sync::Mutex;

const MAX_ERROR_BODY_LEN: usize = 2048;

pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// First matching header value, looked up case-insensitively. Storage
/// preserves the caller's casing; lookup must not depend on it.
pub(crate) fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(candidate, _)| candidate.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

pub(crate) fn has_header(headers: &[(String, String)], name: &str) -> bool {
    header_value(headers, name).is_some()
}

/// Appends `params` to a path-and-query string. With `encode` the pairs
/// go through form-urlencoding (space becomes `+`); without it the pairs
/// are joined verbatim, for callers whose values are already serialized.
pub(crate) fn append_params(target: &str, params: &[(String, String)], encode: bool) -> String {
    if params.is_empty() {
        return target.to_owned();
    }

    let appended = if encode {
        form_encode(params)
    } else {
        params
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join("&")
    };

    let separator = if target.contains('?') { '&' } else { '?' };
    format!("{target}{separator}{appended}")
}

pub(crate) fn form_encode(params: &[(String, String)]) -> String {
    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (name, value) in params {
        serializer.append_pair(name, value);
    }
    serializer.finish()
}

/// Strips the query, fragment, and userinfo for log fields so tokens
/// passed as parameters never reach log output.
pub(crate) fn redact_url_for_logs(url_text: &str) -> String {
    match url::Url::parse(url_text) {
        Ok(mut parsed) => {
            parsed.set_query(None);
            parsed.set_fragment(None);
            let _ = parsed.set_username("");
            let _ = parsed.set_password(None);
            parsed.to_string()
        }
        Err(_) => url_text.split('?').next().unwrap_or(url_text).to_owned(),
    }
}

pub(crate) fn truncate_body(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    if text.chars().count() <= MAX_ERROR_BODY_LEN {
        return text.into_owned();
    }

    let truncated: String = text.chars().take(MAX_ERROR_BODY_LEN).collect();
    format!("{truncated}...(truncated)")
}

/// Decodes response bytes using the declared charset. UTF-8 and
/// Latin-1 are handled; anything else falls back to lossy UTF-8.
pub(crate) fn decode_charset(body: &[u8], charset: &str) -> String {
    let normalized = charset.trim().to_ascii_lowercase();
    match normalized.as_str() {
        "iso-8859-1" | "latin1" | "latin-1" => body.iter().map(|&byte| byte as char).collect(),
        _ => String::from_utf8_lossy(body).into_owned(),
    }
}

/// Extracts the `charset=` parameter from a Content-Type header value.
pub(crate) fn content_type_charset(content_type: &str) -> Option<String> {
    content_type.split(';').skip(1).find_map(|part| {
        let (name, value) = part.split_once('=')?;
        if name.trim().eq_ignore_ascii_case("charset") {
            Some(value.trim().trim_matches('"').to_owned())
        } else {
            None
        }
    })
}
