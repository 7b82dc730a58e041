use chrono::{DateTime, Utc};

// strip everything but [A-Za-z0-9._-] and any leading dots
pub fn sanitize_filename(filename: &str) -> String {
    let cleaned: String = filename
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
        .collect();
    cleaned.trim_start_matches('.').to_string()
}

/// extension (with leading dot) of a client supplied file name, if it has a sane one
pub fn file_extension(filename: &str) -> Option<String> {
    let sanitized = sanitize_filename(filename);
    let (stem, ext) = sanitized.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() || ext.len() > 16 {
        return None;
    }
    Some(format!(".{}", ext.to_ascii_lowercase()))
}

/// RFC 7231 date as used by `Upload-Expires`
pub fn http_date(at: DateTime<Utc>) -> String {
    at.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// strict non-negative integer header value (no sign, no whitespace)
pub fn parse_u64_header(value: &str) -> Option<u64> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    value.parse().ok()
}

/// Resolve a single `bytes=` range against a body of `len` bytes into a
/// half-open `[start, end)`. `Ok(None)` means the header should be ignored.
pub fn parse_range(header: &str, len: u64) -> Result<Option<(u64, u64)>, ()> {
    let Some(spec) = header.trim().strip_prefix("bytes=") else {
        return Ok(None);
    };
    if spec.contains(',') {
        // multipart ranges are not served; fall back to the full body
        return Ok(None);
    }
    let (first, last) = spec.split_once('-').ok_or(())?;

    let range = match (first.trim(), last.trim()) {
        ("", suffix) => {
            let n = parse_u64_header(suffix).ok_or(())?;
            if n == 0 {
                return Err(());
            }
            (len.saturating_sub(n), len)
        }
        (start, "") => {
            let start = parse_u64_header(start).ok_or(())?;
            (start, len)
        }
        (start, end) => {
            let start = parse_u64_header(start).ok_or(())?;
            let end = parse_u64_header(end).ok_or(())?;
            if end < start {
                return Err(());
            }
            (start, end.saturating_add(1).min(len))
        }
    };

    if range.0 >= len {
        return Err(());
    }
    Ok(Some(range))
}

/// wait for ctrl-c or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, draining connections");
}
