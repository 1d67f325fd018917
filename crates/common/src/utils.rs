use crate::error::{Error, Result};

/// Split `SYMBOL.MARKET` at the last dot, so `BRK.B.us` yields `("BRK.B", "us")`.
pub fn parse_symbol_market(input: &str) -> Result<(String, String)> {
    let input = input.trim();
    if input.is_empty() {
        return Err(invalid("empty symbol.market"));
    }

    match input.rfind('.') {
        Some(dot) if dot > 0 && dot < input.len() - 1 => {
            let symbol = &input[..dot];
            let market = &input[dot + 1..];
            validate_segment("symbol", symbol)?;
            validate_segment("market", market)?;
            Ok((symbol.to_string(), market.to_string()))
        }
        _ => Err(invalid(format!(
            "invalid symbol.market format: {:?}",
            input
        ))),
    }
}

/// Symbol as the chart site expects it. Hong Kong tickers carry a `.HK` suffix.
pub fn format_symbol_for_market(symbol: &str, market: &str) -> String {
    match market {
        "hk" if !symbol.ends_with(".HK") => format!("{}.HK", symbol),
        _ => symbol.to_string(),
    }
}

/// `{base}/apps/quote/folder/{market}/{symbol}/{timeframe}`
pub fn chart_url(base_url: &str, symbol: &str, market: &str, timeframe: &str) -> Result<String> {
    validate_segment("symbol", symbol)?;
    validate_segment("market", market)?;
    validate_segment("timeframe", timeframe)?;

    let url = format!(
        "{}/apps/quote/folder/{}/{}/{}",
        base_url.trim_end_matches('/'),
        market,
        format_symbol_for_market(symbol, market),
        timeframe
    );

    url::Url::parse(&url).map_err(|e| invalid(format!("bad chart url {}: {}", url, e)))?;
    Ok(url)
}

/// Rejects values that are empty or would escape their path segment.
pub fn validate_segment(field: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(invalid(format!("{} must not be empty", field)));
    }
    let unsafe_char = value
        .chars()
        .find(|c| matches!(c, '/' | '\\' | '?' | '#' | '%') || c.is_whitespace() || c.is_control());
    if let Some(c) = unsafe_char {
        return Err(invalid(format!("{} contains {:?}: {:?}", field, c, value)));
    }
    if value == "." || value == ".." {
        return Err(invalid(format!("{} must not be {:?}", field, value)));
    }
    Ok(())
}

fn invalid(message: impl Into<String>) -> Error {
    Error::InvalidRequest {
        message: message.into(),
    }
}
