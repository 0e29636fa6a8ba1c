use std::time::Duration;

/// Return the current UTC timestamp in ISO 8601 format.
pub fn utc_now() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// RFC 2822 timestamp `ttl` from now, for "expires" log fields.
///
/// `None` when the result falls outside the representable date range.
pub fn expires_in(ttl: Duration) -> Option<String> {
    let ttl = chrono::Duration::from_std(ttl).ok()?;
    chrono::Utc::now()
        .checked_add_signed(ttl)
        .map(|t| t.to_rfc2822())
}
