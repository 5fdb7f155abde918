//! Accept-header negotiation for the compile endpoint
//!
//! The media type selects the translation target: UCAST JSON (optionally a
//! dialect variant), a SQL WHERE fragment per dialect, the multi-target
//! envelope, or the raw residual for plain `application/json`.

use axum::http::HeaderMap;

use gatehouse_core::filter::{SqlDialect, UcastVariant};

use crate::error::{ServerError, ServerResult};

/// The negotiated response encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseTarget {
    /// Raw residual queries (plain JSON)
    Raw,
    /// UCAST tree
    Ucast(UcastVariant),
    /// SQL WHERE fragment; `None` defers to the request's `dialect` option
    Sql(Option<SqlDialect>),
    /// All SQL dialects plus UCAST in one envelope
    Multitarget,
}

/// Pick the response target from the `Accept` header. Unrecognized media
/// types fall back to the raw residual form.
///
/// # Errors
/// `ServerError::InvalidParameter` on a recognized-but-invalid variant,
/// e.g. `vnd.styra.sql.oracle+json`.
pub fn response_target(headers: &HeaderMap) -> ServerResult<ResponseTarget> {
    let Some(accept) = headers.get("accept").and_then(|v| v.to_str().ok()) else {
        return Ok(ResponseTarget::Raw);
    };

    for media_range in accept.split(',') {
        let media_type = media_range.split(';').next().unwrap_or("").trim();
        match parse_media_type(media_type)? {
            Some(target) => return Ok(target),
            None => continue,
        }
    }
    Ok(ResponseTarget::Raw)
}

fn parse_media_type(media_type: &str) -> ServerResult<Option<ResponseTarget>> {
    let Some(rest) = media_type.strip_prefix("application/vnd.styra.") else {
        return Ok(None);
    };
    let Some(rest) = rest.strip_suffix("+json") else {
        return Ok(None);
    };

    if rest == "multitarget" {
        return Ok(Some(ResponseTarget::Multitarget));
    }
    if rest == "ucast" {
        return Ok(Some(ResponseTarget::Ucast(UcastVariant::All)));
    }
    if let Some(variant) = rest.strip_prefix("ucast.") {
        let variant = match variant {
            "prisma" => UcastVariant::Prisma,
            "linq" => UcastVariant::Linq,
            "all" => UcastVariant::All,
            other => {
                return Err(ServerError::InvalidParameter(format!(
                    "unknown UCAST variant: {other}"
                )));
            }
        };
        return Ok(Some(ResponseTarget::Ucast(variant)));
    }
    if rest == "sql" {
        return Ok(Some(ResponseTarget::Sql(None)));
    }
    if let Some(dialect) = rest.strip_prefix("sql.") {
        let dialect = dialect
            .parse::<SqlDialect>()
            .map_err(ServerError::InvalidParameter)?;
        return Ok(Some(ResponseTarget::Sql(Some(dialect))));
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(accept: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("accept", accept.parse().unwrap());
        headers
    }

    #[test]
    fn test_plain_json_is_raw() {
        assert_eq!(
            response_target(&headers("application/json")).unwrap(),
            ResponseTarget::Raw
        );
        assert_eq!(response_target(&HeaderMap::new()).unwrap(), ResponseTarget::Raw);
    }

    #[test]
    fn test_sql_dialects() {
        assert_eq!(
            response_target(&headers("application/vnd.styra.sql.postgresql+json")).unwrap(),
            ResponseTarget::Sql(Some(SqlDialect::Postgresql))
        );
        assert_eq!(
            response_target(&headers("application/vnd.styra.sql+json")).unwrap(),
            ResponseTarget::Sql(None)
        );
        assert!(response_target(&headers("application/vnd.styra.sql.oracle+json")).is_err());
    }

    #[test]
    fn test_ucast_variants() {
        assert_eq!(
            response_target(&headers("application/vnd.styra.ucast+json")).unwrap(),
            ResponseTarget::Ucast(UcastVariant::All)
        );
        assert_eq!(
            response_target(&headers("application/vnd.styra.ucast.prisma+json")).unwrap(),
            ResponseTarget::Ucast(UcastVariant::Prisma)
        );
    }

    #[test]
    fn test_multitarget_and_quality_params() {
        assert_eq!(
            response_target(&headers("application/vnd.styra.multitarget+json;q=0.9")).unwrap(),
            ResponseTarget::Multitarget
        );
    }
}
